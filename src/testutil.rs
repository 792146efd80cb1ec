//! Helpers shared by the async test suites.
use crate::catalog::MinerDescriptor;
use crate::remote::{RemoteClient, RemoteCommand, RemoteError};
use crate::watchdog::Watchdog;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Write an executable `/bin/sh` miner script named `<name>.sh` into `dir`.
pub fn write_miner(dir: &Path, name: &str, body: &str) -> MinerDescriptor {
    let path = dir.join(format!("{name}.sh"));
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    MinerDescriptor::new(name, path)
}

/// Ordered record of remote and watchdog calls.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Scripted `RemoteClient` that records every call.
pub struct FakeRemote {
    log: CallLog,
    pub fail_send: AtomicBool,
    pub fail_fetch: AtomicBool,
    pub command: Mutex<Option<RemoteCommand>>,
    /// Time each fetch takes, to widen any overlap window.
    pub fetch_delay: Duration,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeRemote {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            fail_send: AtomicBool::new(false),
            fail_fetch: AtomicBool::new(false),
            command: Mutex::new(None),
            fetch_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn command_coin(&self, coin: Option<MinerDescriptor>) {
        *self.command.lock().unwrap() = Some(RemoteCommand { coin });
    }

    fn record(&self, call: String) {
        self.log.lock().unwrap().push(call);
    }
}

impl RemoteClient for FakeRemote {
    async fn send_telemetry(&self, data: &str) {
        self.record(format!("send:{data}"));
        if self.fail_send.load(Ordering::SeqCst) {
            tracing::warn!("failed to send telemetry: simulated network error");
        }
    }

    async fn fetch_remote_command(&self) -> Result<Option<RemoteCommand>, RemoteError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.record("fetch".to_string());
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(RemoteError::Status {
                resource: "control".to_string(),
                status: 502,
            });
        }
        Ok(self.command.lock().unwrap().clone())
    }

    async fn check_algorithms(&self) -> Result<(), RemoteError> {
        self.record("algorithms".to_string());
        Ok(())
    }
}

/// Watchdog that logs `watchdog:<tick>` into the shared call log.
pub struct RecordingWatchdog {
    pub log: CallLog,
}

impl Watchdog for RecordingWatchdog {
    fn check(&self, tick: u64, _active: Option<&MinerDescriptor>) {
        self.log.lock().unwrap().push(format!("watchdog:{tick}"));
    }
}
