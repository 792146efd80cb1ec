/// Composition root: wires the supervisor, selector, remote client and control
/// loop together and exposes `start`/`stop` to the CLI.
use crate::catalog::MinerCatalog;
use crate::config::RigConfig;
use crate::control::ControlLoop;
use crate::lock::{LockError, RigLock};
use crate::remote::RemoteClient;
use crate::selector::{MinerSelector, SelectorError};
use crate::status::{RigState, StatusTracker};
use crate::supervisor::{Crash, ProcessHandle, ProcessSupervisor};
use crate::telemetry::OutputBuffer;
use crate::watchdog::{NoopWatchdog, Watchdog};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Background work that exists between `start` and `stop`.
struct Running {
    shutdown: watch::Sender<bool>,
    control: JoinHandle<()>,
    restarts: JoinHandle<()>,
    _lock: RigLock,
}

pub struct Rig<R: RemoteClient> {
    selector: Arc<MinerSelector>,
    remote: Arc<R>,
    output: OutputBuffer,
    watchdog: Arc<dyn Watchdog>,
    status: StatusTracker,
    crash_rx: Option<mpsc::UnboundedReceiver<Crash>>,
    running: Option<Running>,
    worker_id: String,
    client_name: String,
    tick_interval: Duration,
    restart_delay: Duration,
    check_algorithms: bool,
    lock_file: PathBuf,
}

impl<R: RemoteClient> Rig<R> {
    pub fn new(config: &RigConfig, catalog: Arc<dyn MinerCatalog>, remote: R) -> Self {
        let identity = &config.identity;
        let output = OutputBuffer::new(config.telemetry.max_lines);
        let (supervisor, crash_rx) = ProcessSupervisor::new(&identity.client_name, output.clone());
        let selector = MinerSelector::new(supervisor, catalog, &identity.client_name);

        Self {
            selector: Arc::new(selector),
            remote: Arc::new(remote),
            output,
            watchdog: Arc::new(NoopWatchdog),
            status: StatusTracker::new(config.runtime.status_file.clone()),
            crash_rx: Some(crash_rx),
            running: None,
            worker_id: identity.worker_id.clone(),
            client_name: identity.client_name.clone(),
            tick_interval: config.control.tick_interval(),
            restart_delay: config.supervisor.restart_delay(),
            check_algorithms: config.control.check_algorithms,
            lock_file: config.runtime.lock_file.clone(),
        }
    }

    /// Replace the per-tick watchdog hook.
    #[cfg(test)]
    pub fn with_watchdog(mut self, watchdog: Arc<dyn Watchdog>) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn selector(&self) -> &Arc<MinerSelector> {
        &self.selector
    }

    #[cfg(test)]
    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    /// Start the configured miner, then the restart watcher and the control loop.
    ///
    /// Returns once the miner is running and the first tick is scheduled.
    pub async fn start(&mut self) -> Result<(), RigError> {
        if self.running.is_some() || self.crash_rx.is_none() {
            return Err(RigError::AlreadyStarted);
        }

        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            worker = %self.worker_id,
            client = %self.client_name,
            "minerstat rig starting"
        );
        let lock = RigLock::acquire(&self.lock_file)?;
        self.status.set_state(RigState::Starting);

        let handle = match self.launch_configured().await {
            Ok(handle) => handle,
            Err(e) => {
                self.status.remove();
                return Err(e);
            }
        };
        self.status.set_miner(&handle.descriptor().name, handle.pid());

        let crash_rx = self.crash_rx.take().ok_or(RigError::AlreadyStarted)?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let restarts = tokio::spawn(restart_crashed_miners(
            Arc::clone(&self.selector),
            crash_rx,
            self.restart_delay,
            self.status.clone(),
            shutdown_rx.clone(),
        ));

        let control = ControlLoop::new(
            Arc::clone(&self.remote),
            Arc::clone(&self.selector),
            self.output.clone(),
            Arc::clone(&self.watchdog),
            self.status.clone(),
            self.tick_interval,
        )
        .with_algorithm_checks(self.check_algorithms)
        .spawn(shutdown_rx);

        self.status.set_state(RigState::Running);
        self.running = Some(Running {
            shutdown,
            control,
            restarts,
            _lock: lock,
        });
        tracing::info!(miner = %handle.descriptor().name, pid = handle.pid(), "rig running");
        Ok(())
    }

    async fn launch_configured(&self) -> Result<ProcessHandle, RigError> {
        self.selector.load_initial().await?;
        Ok(self.selector.start_active().await?)
    }

    /// Stop ticking, then stop the miner and wait for it to end.
    ///
    /// A tick in progress is allowed to finish first. No-op if not started.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        tracing::info!("stopping rig");
        self.status.set_state(RigState::ShuttingDown);
        running.shutdown.send_replace(true);

        if let Err(e) = running.control.await {
            tracing::warn!(error = %e, "control loop task failed");
        }
        if let Err(e) = running.restarts.await {
            tracing::warn!(error = %e, "restart task failed");
        }

        if let Some(report) = self.selector.halt().await {
            tracing::info!(status = %report, "miner stopped");
        }
        self.status.remove();
        tracing::info!("rig stopped");
    }
}

/// Restart each crashed miner after `delay`, unless shutdown comes first.
async fn restart_crashed_miners(
    selector: Arc<MinerSelector>,
    mut crashes: mpsc::UnboundedReceiver<Crash>,
    delay: Duration,
    status: StatusTracker,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let crash = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            crash = crashes.recv() => match crash {
                Some(crash) => crash,
                None => break,
            },
        };

        tracing::info!(
            miner = %crash.descriptor.name,
            status = %crash.report,
            delay_ms = delay.as_millis() as u64,
            "scheduling miner restart"
        );
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = tokio::time::sleep(delay) => {}
        }

        status.set_state(RigState::Restarting);
        match selector.restart_crashed(&crash).await {
            Ok(Some(handle)) => {
                status.record_restart();
                status.set_miner(&handle.descriptor().name, handle.pid());
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(miner = %crash.descriptor.name, error = %e, "failed to restart miner");
            }
        }
        status.settle(RigState::Restarting);
    }
}

/// Errors that abort `Rig::start`.
#[derive(Debug)]
pub enum RigError {
    AlreadyStarted,
    Lock(LockError),
    Selector(SelectorError),
}

impl std::fmt::Display for RigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RigError::AlreadyStarted => write!(f, "rig was already started"),
            RigError::Lock(e) => write!(f, "{e}"),
            RigError::Selector(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RigError::AlreadyStarted => None,
            RigError::Lock(e) => Some(e),
            RigError::Selector(e) => Some(e),
        }
    }
}

impl From<LockError> for RigError {
    fn from(e: LockError) -> Self {
        RigError::Lock(e)
    }
}

impl From<SelectorError> for RigError {
    fn from(e: SelectorError) -> Self {
        RigError::Selector(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MinerDescriptor, StaticCatalog};
    use crate::status::StatusFile;
    use crate::supervisor::HandleState;
    use crate::testutil::{calls, write_miner, CallLog, FakeRemote, RecordingWatchdog};
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(dir: &Path, client: &str) -> RigConfig {
        let mut config = RigConfig::default();
        config.identity.worker_id = "rig-test".to_string();
        config.identity.client_name = client.to_string();
        config.control.tick_interval_ms = 20;
        config.supervisor.restart_delay_ms = 300;
        config.runtime.status_file = dir.join("rig.status");
        config.runtime.lock_file = dir.join("rig.lock");
        config
    }

    fn rig(
        dir: &Path,
        client: &str,
        miners: Vec<MinerDescriptor>,
    ) -> (Rig<FakeRemote>, CallLog) {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let catalog = Arc::new(StaticCatalog::new(miners).unwrap());
        let rig = Rig::new(&config(dir, client), catalog, FakeRemote::new(Arc::clone(&log)))
            .with_watchdog(Arc::new(RecordingWatchdog {
                log: Arc::clone(&log),
            }));
        (rig, log)
    }

    /// Poll until the active handle differs from `old_id`.
    async fn wait_for_new_handle(rig: &Rig<FakeRemote>, old_id: u64) -> ProcessHandle {
        timeout(WAIT, async {
            loop {
                if let Some(handle) = rig.selector().active_handle().await {
                    if handle.id() != old_id && !handle.is_ended() {
                        return handle;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_runs_configured_miner_and_ticks() {
        let dir = tempdir().unwrap();
        let x11 = write_miner(dir.path(), "x11", "exec sleep 30");
        let (mut rig, log) = rig(dir.path(), "x11", vec![x11.clone()]);

        timeout(WAIT, rig.start()).await.unwrap().unwrap();
        let handle = rig.selector().active_handle().await.unwrap();
        assert_eq!(handle.descriptor(), &x11);
        assert_eq!(handle.state(), HandleState::Running);

        let status = StatusFile::read(&dir.path().join("rig.status")).unwrap();
        assert_eq!(status.miner.as_deref(), Some("x11"));
        assert_eq!(status.miner_pid, Some(handle.pid()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(calls(&log).iter().any(|c| c.starts_with("watchdog")));

        timeout(WAIT, rig.stop()).await.unwrap();
        assert!(matches!(handle.state(), HandleState::Exited(_)));
        assert!(!dir.path().join("rig.status").exists());
    }

    #[tokio::test]
    async fn test_stop_does_not_restart() {
        let dir = tempdir().unwrap();
        let x11 = write_miner(dir.path(), "x11", "exec sleep 30");
        let (mut rig, _log) = rig(dir.path(), "x11", vec![x11]);

        rig.start().await.unwrap();
        let handle = rig.selector().active_handle().await.unwrap();
        timeout(WAIT, rig.stop()).await.unwrap();

        // Well past the restart delay
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(handle.is_ended());
        assert!(rig.selector().active_handle().await.is_none());
        assert_eq!(rig.status().snapshot().restarts, 0);
    }

    #[tokio::test]
    async fn test_crash_restarts_same_miner_after_delay() {
        let dir = tempdir().unwrap();
        let x11 = write_miner(dir.path(), "x11", "exec sleep 30");
        let (mut rig, _log) = rig(dir.path(), "x11", vec![x11.clone()]);

        rig.start().await.unwrap();
        let first = rig.selector().active_handle().await.unwrap();

        kill(Pid::from_raw(first.pid() as i32), Signal::SIGKILL).unwrap();
        timeout(WAIT, first.wait_ended()).await.unwrap();
        assert!(matches!(first.state(), HandleState::Crashed(_)));

        // Nothing is restarted before the delay has passed
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.selector().active_handle().await.unwrap().id(), first.id());

        let second = wait_for_new_handle(&rig, first.id()).await;
        assert_ne!(second.pid(), first.pid());
        assert_eq!(second.descriptor(), &x11);
        assert_eq!(rig.status().snapshot().restarts, 1);

        // Exactly one restart for one crash
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rig.selector().active_handle().await.unwrap().id(), second.id());
        assert_eq!(rig.status().snapshot().restarts, 1);

        timeout(WAIT, rig.stop()).await.unwrap();
        assert!(second.is_ended());
    }

    #[tokio::test]
    async fn test_stop_during_restart_delay_cancels_restart() {
        let dir = tempdir().unwrap();
        let x11 = write_miner(dir.path(), "x11", "exec sleep 30");
        let (mut rig, _log) = rig(dir.path(), "x11", vec![x11]);

        rig.start().await.unwrap();
        let first = rig.selector().active_handle().await.unwrap();
        kill(Pid::from_raw(first.pid() as i32), Signal::SIGKILL).unwrap();
        timeout(WAIT, first.wait_ended()).await.unwrap();

        timeout(WAIT, rig.stop()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rig.selector().active_handle().await.is_none());
        assert_eq!(rig.status().snapshot().restarts, 0);
    }

    #[tokio::test]
    async fn test_remote_command_switches_miner() {
        let dir = tempdir().unwrap();
        let x11 = write_miner(dir.path(), "x11", "exec sleep 30");
        let eth = write_miner(dir.path(), "eth", "exec sleep 30");
        let (mut rig, _log) = rig(dir.path(), "x11", vec![x11, eth.clone()]);

        rig.start().await.unwrap();
        let first = rig.selector().active_handle().await.unwrap();
        rig.remote.command_coin(Some(eth.clone()));

        let switched = wait_for_new_handle(&rig, first.id()).await;
        assert_eq!(switched.descriptor(), &eth);
        assert!(first.is_ended());
        // A stopped-by-switch miner is not treated as a crash
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rig.status().snapshot().restarts, 0);
        assert_eq!(rig.selector().active_handle().await.unwrap().id(), switched.id());

        timeout(WAIT, rig.stop()).await.unwrap();
        assert!(switched.is_ended());
    }

    #[tokio::test]
    async fn test_start_without_matching_miner_fails() {
        let dir = tempdir().unwrap();
        let eth = write_miner(dir.path(), "eth", "exec sleep 30");
        let (mut rig, log) = rig(dir.path(), "x11", vec![eth]);

        let err = rig.start().await.unwrap_err();
        assert!(matches!(
            err,
            RigError::Selector(SelectorError::NoMinerConfigured { .. })
        ));
        assert!(rig.selector().active_handle().await.is_none());
        assert!(calls(&log).is_empty());

        // The lock was released with the failed start
        assert!(RigLock::acquire(&dir.path().join("rig.lock")).is_ok());
    }

    #[tokio::test]
    async fn test_second_rig_is_locked_out() {
        let dir = tempdir().unwrap();
        let x11 = write_miner(dir.path(), "x11", "exec sleep 30");
        let (mut first, _) = rig(dir.path(), "x11", vec![x11.clone()]);
        let (mut second, _) = rig(dir.path(), "x11", vec![x11]);

        first.start().await.unwrap();
        let err = second.start().await.unwrap_err();
        assert!(matches!(err, RigError::Lock(LockError::Held { .. })));

        first.stop().await;
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let dir = tempdir().unwrap();
        let (mut rig, log) = rig(dir.path(), "x11", vec![]);
        timeout(Duration::from_secs(1), rig.stop()).await.unwrap();
        assert!(calls(&log).is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_is_refused() {
        let dir = tempdir().unwrap();
        let x11 = write_miner(dir.path(), "x11", "exec sleep 30");
        let (mut rig, _) = rig(dir.path(), "x11", vec![x11]);

        rig.start().await.unwrap();
        assert!(matches!(rig.start().await, Err(RigError::AlreadyStarted)));
        rig.stop().await;
    }
}
