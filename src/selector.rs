/// The single "what is running now" cell and the guard that serializes changes to it.
///
/// Every read-modify-write of the active miner goes through one async mutex:
/// startup, remote-driven switches, crash restarts and shutdown. The guard is
/// held across the whole stop+start sequence, so two miners never run at once.
use crate::catalog::{MinerCatalog, MinerDescriptor};
use crate::supervisor::{Crash, ExitReport, ProcessHandle, ProcessSupervisor, SupervisorError};
use std::sync::Arc;
use tokio::sync::Mutex;

/// The active miner and its process, if one is running.
#[derive(Debug, Default)]
pub struct ActiveMinerState {
    pub descriptor: Option<MinerDescriptor>,
    pub handle: Option<ProcessHandle>,
    /// Set by `halt`; no process is started afterwards.
    pub halted: bool,
}

/// Owns the active miner slot.
pub struct MinerSelector {
    supervisor: ProcessSupervisor,
    catalog: Arc<dyn MinerCatalog>,
    client_name: String,
    active: Mutex<ActiveMinerState>,
}

impl MinerSelector {
    pub fn new(
        supervisor: ProcessSupervisor,
        catalog: Arc<dyn MinerCatalog>,
        client_name: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            catalog,
            client_name: client_name.into(),
            active: Mutex::new(ActiveMinerState::default()),
        }
    }

    /// Select the miner named by the configured client name.
    ///
    /// Does not start it; see `start_active`.
    pub async fn load_initial(&self) -> Result<MinerDescriptor, SelectorError> {
        let miner = self
            .catalog
            .find(&self.client_name)
            .ok_or_else(|| SelectorError::NoMinerConfigured {
                client_name: self.client_name.clone(),
            })?;

        let mut active = self.active.lock().await;
        active.descriptor = Some(miner.clone());
        tracing::info!(miner = %miner.name, path = %miner.path.display(), "loaded configured miner");
        Ok(miner)
    }

    /// Start the selected miner unless it is already running.
    pub async fn start_active(&self) -> Result<ProcessHandle, SelectorError> {
        let mut active = self.active.lock().await;
        if active.halted {
            return Err(SelectorError::Halted);
        }
        if let Some(handle) = active.handle.as_ref().filter(|h| !h.is_ended()) {
            return Ok(handle.clone());
        }
        let Some(descriptor) = active.descriptor.clone() else {
            tracing::warn!("can't start a miner before one is loaded");
            return Err(SelectorError::NothingLoaded);
        };
        let handle = self.supervisor.spawn(&descriptor).await?;
        active.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Stop the running miner, make `next` active, and start it.
    pub async fn switch(&self, next: MinerDescriptor) -> Result<ProcessHandle, SelectorError> {
        let mut active = self.active.lock().await;
        if active.halted {
            return Err(SelectorError::Halted);
        }

        tracing::info!(
            from = active.descriptor.as_ref().map(|d| d.name.as_str()).unwrap_or("none"),
            to = %next.name,
            "switching miner"
        );

        if let Some(old) = active.handle.take() {
            self.supervisor.stop(&old).await;
        }
        active.descriptor = Some(next.clone());
        let handle = self.supervisor.spawn(&next).await?;
        active.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Restart the miner that crashed, if it is still the active one.
    ///
    /// Returns `None` when the crash is stale: the handle was replaced by a
    /// switch, or the selector was halted.
    pub async fn restart_crashed(
        &self,
        crash: &Crash,
    ) -> Result<Option<ProcessHandle>, SelectorError> {
        let mut active = self.active.lock().await;
        if active.halted {
            return Ok(None);
        }
        let current = match active.handle.as_ref() {
            Some(handle) if handle.id() == crash.handle_id && handle.is_ended() => handle,
            _ => {
                tracing::debug!(miner = %crash.descriptor.name, "crash superseded, not restarting");
                return Ok(None);
            }
        };
        let descriptor = current.descriptor().clone();
        let handle = self.supervisor.spawn(&descriptor).await?;
        tracing::info!(miner = %descriptor.name, pid = handle.pid(), "restarted miner");
        active.handle = Some(handle.clone());
        Ok(Some(handle))
    }

    /// Stop the running miner for good.
    pub async fn halt(&self) -> Option<ExitReport> {
        let mut active = self.active.lock().await;
        active.halted = true;
        match active.handle.take() {
            Some(handle) => Some(self.supervisor.stop(&handle).await),
            None => None,
        }
    }

    /// The active descriptor.
    pub async fn current(&self) -> Option<MinerDescriptor> {
        self.active.lock().await.descriptor.clone()
    }

    /// The miner whose process is alive right now.
    ///
    /// `None` after a failed switch or restart, even though `current` still
    /// names the miner that was meant to run.
    pub async fn running(&self) -> Option<MinerDescriptor> {
        let active = self.active.lock().await;
        active
            .handle
            .as_ref()
            .filter(|h| !h.is_ended())
            .map(|h| h.descriptor().clone())
    }

    /// The active process handle.
    #[cfg(test)]
    pub async fn active_handle(&self) -> Option<ProcessHandle> {
        self.active.lock().await.handle.clone()
    }
}

/// Errors from changing the active miner.
#[derive(Debug)]
pub enum SelectorError {
    /// No catalog entry matches the configured client name.
    NoMinerConfigured { client_name: String },
    /// `start_active` was called before `load_initial`.
    NothingLoaded,
    /// The rig is shutting down.
    Halted,
    Supervisor(SupervisorError),
}

impl std::fmt::Display for SelectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectorError::NoMinerConfigured { client_name } => {
                write!(f, "no miner configured: nothing in the catalog is named {client_name:?}")
            }
            SelectorError::NothingLoaded => write!(f, "no miner has been loaded"),
            SelectorError::Halted => write!(f, "miner selector is halted"),
            SelectorError::Supervisor(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SelectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SelectorError::Supervisor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SupervisorError> for SelectorError {
    fn from(e: SupervisorError) -> Self {
        SelectorError::Supervisor(e)
    }
}
