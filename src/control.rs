/// The periodic driver: collect, report, poll, react, watchdog.
///
/// One tick runs the steps strictly in that order. The next tick is not
/// awaited until the current one has returned, so ticks never overlap. A
/// failing tick is logged and the loop carries on at the next interval.
use crate::dispatch::command_target;
use crate::remote::{RemoteClient, RemoteError};
use crate::selector::{MinerSelector, SelectorError};
use crate::status::{RigState, StatusTracker};
use crate::telemetry::OutputBuffer;
use crate::watchdog::Watchdog;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What a completed tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    /// Miner switched to during this tick, if any.
    pub switched_to: Option<String>,
}

pub struct ControlLoop<R: RemoteClient> {
    remote: Arc<R>,
    selector: Arc<MinerSelector>,
    output: OutputBuffer,
    watchdog: Arc<dyn Watchdog>,
    status: StatusTracker,
    interval: Duration,
    check_algorithms: bool,
}

impl<R: RemoteClient> ControlLoop<R> {
    pub fn new(
        remote: Arc<R>,
        selector: Arc<MinerSelector>,
        output: OutputBuffer,
        watchdog: Arc<dyn Watchdog>,
        status: StatusTracker,
        interval: Duration,
    ) -> Self {
        Self {
            remote,
            selector,
            output,
            watchdog,
            status,
            interval,
            check_algorithms: false,
        }
    }

    /// Also query the algorithm endpoints every tick.
    pub fn with_algorithm_checks(mut self, enabled: bool) -> Self {
        self.check_algorithms = enabled;
        self
    }

    /// Run one tick.
    pub async fn tick(&self, tick: u64) -> Result<TickReport, TickError> {
        let data = self.output.drain();
        self.remote.send_telemetry(&data).await;

        if self.check_algorithms {
            if let Err(e) = self.remote.check_algorithms().await {
                tracing::warn!(tick, error = %e, "algorithm check failed");
            }
        }

        let command = self
            .remote
            .fetch_remote_command()
            .await
            .map_err(TickError::Poll)?;

        let mut switched_to = None;
        if let Some(command) = command {
            // A miner that failed to start does not count as active
            let running = self.selector.running().await;
            if let Some(target) = command_target(&command, running.as_ref()) {
                self.status.set_state(RigState::Switching);
                let result = self.selector.switch(target.clone()).await;
                self.status.settle(RigState::Switching);
                let handle = result.map_err(TickError::Switch)?;
                self.status.set_miner(&handle.descriptor().name, handle.pid());
                switched_to = Some(handle.descriptor().name.clone());
            }
        }

        let active = self.selector.current().await;
        self.watchdog.check(tick, active.as_ref());

        Ok(TickReport { tick, switched_to })
    }

    /// Tick every interval until `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {}
            }

            tick += 1;
            match self.tick(tick).await {
                Ok(report) => {
                    tracing::debug!(tick = report.tick, switched_to = ?report.switched_to, "tick complete");
                }
                Err(e) => tracing::warn!(tick, error = %e, "tick failed"),
            }
            self.status.record_tick();
        }

        tracing::debug!(ticks = tick, "control loop stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

/// A tick that ended early.
#[derive(Debug)]
pub enum TickError {
    Poll(RemoteError),
    Switch(SelectorError),
}

impl std::fmt::Display for TickError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TickError::Poll(e) => write!(f, "polling for remote commands failed: {e}"),
            TickError::Switch(e) => write!(f, "switching miner failed: {e}"),
        }
    }
}

impl std::error::Error for TickError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TickError::Poll(e) => Some(e),
            TickError::Switch(e) => Some(e),
        }
    }
}
