/// Miner process lifecycle: spawn one miner, watch it, stop it.
///
/// Each spawned process gets a `ProcessHandle`. A reaper task owns the child,
/// captures its output, and publishes the handle state through a watch
/// channel:
///
/// `Starting -> Running -> Stopping -> Exited`
/// `Starting -> Running -> Crashed`
///
/// `Exited`/`Crashed` are written exactly once. A process that ends without a
/// stop request is reported on the crash channel so the owner can restart it.
use crate::catalog::MinerDescriptor;
use crate::telemetry::OutputBuffer;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// How long the reaper waits for output readers to drain after exit.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How a miner process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code (None if killed by signal).
    pub code: Option<i32>,
    /// Terminating signal number, if any.
    pub signal: Option<i32>,
}

impl ExitReport {
    fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Lifecycle state of a single handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleState {
    Starting,
    Running,
    Stopping,
    /// Ended after a stop request.
    Exited(ExitReport),
    /// Ended on its own.
    Crashed(ExitReport),
}

impl HandleState {
    pub fn is_ended(&self) -> bool {
        matches!(self, HandleState::Exited(_) | HandleState::Crashed(_))
    }

    pub fn exit_report(&self) -> Option<ExitReport> {
        match self {
            HandleState::Exited(report) | HandleState::Crashed(report) => Some(*report),
            _ => None,
        }
    }
}

/// Notification that a miner ended without anyone asking it to.
#[derive(Debug, Clone)]
pub struct Crash {
    pub handle_id: u64,
    pub descriptor: MinerDescriptor,
    pub report: ExitReport,
}

/// Live reference to one spawned miner process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: u64,
    pid: u32,
    descriptor: MinerDescriptor,
    stop_requested: Arc<AtomicBool>,
    kill_tx: mpsc::Sender<()>,
    state: Arc<watch::Sender<HandleState>>,
}

impl ProcessHandle {
    /// Supervisor-unique id, never reused (unlike pids).
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn descriptor(&self) -> &MinerDescriptor {
        &self.descriptor
    }

    #[cfg(test)]
    pub fn state(&self) -> HandleState {
        self.state.borrow().clone()
    }

    pub fn is_ended(&self) -> bool {
        self.state.borrow().is_ended()
    }

    #[cfg(test)]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Wait until the process has left `Starting`.
    async fn wait_started(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|s| *s != HandleState::Starting).await;
    }

    /// Wait for the `ended` signal and return how the process ended.
    pub async fn wait_ended(&self) -> ExitReport {
        let mut rx = self.state.subscribe();
        let report = match rx.wait_for(HandleState::is_ended).await {
            Ok(state) => state.exit_report().unwrap_or_default(),
            Err(_) => ExitReport::default(),
        };
        report
    }
}

/// Spawns and stops miner processes.
pub struct ProcessSupervisor {
    client_name: String,
    output: OutputBuffer,
    crash_tx: mpsc::UnboundedSender<Crash>,
    next_id: AtomicU64,
}

impl ProcessSupervisor {
    /// Create a supervisor. Unexpected exits are delivered on the returned receiver.
    pub fn new(
        client_name: impl Into<String>,
        output: OutputBuffer,
    ) -> (Self, mpsc::UnboundedReceiver<Crash>) {
        let (crash_tx, crash_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            client_name: client_name.into(),
            output,
            crash_tx,
            next_id: AtomicU64::new(1),
        };
        (supervisor, crash_rx)
    }

    /// Launch the miner and return once it is running.
    ///
    /// The executable at `descriptor.path` is started in its own process group
    /// with the client name as its argument, the rig's environment, and the
    /// executable's directory as working directory.
    pub async fn spawn(&self, descriptor: &MinerDescriptor) -> Result<ProcessHandle, SupervisorError> {
        tracing::info!(
            miner = %descriptor.name,
            path = %descriptor.path.display(),
            "spawning miner"
        );

        let mut child = Command::new(&descriptor.path)
            .arg(&self.client_name)
            .current_dir(descriptor.working_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group so stop takes the whole miner down
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                path: descriptor.path.clone(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (state_tx, _) = watch::channel(HandleState::Starting);
        let state = Arc::new(state_tx);
        let stop_requested = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = mpsc::channel(1);

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, descriptor.name.clone(), self.output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, descriptor.name.clone(), self.output.clone()));
        }

        let reaper = Reaper {
            handle_id: id,
            pid,
            descriptor: descriptor.clone(),
            state: Arc::clone(&state),
            stop_requested: Arc::clone(&stop_requested),
            crash_tx: self.crash_tx.clone(),
            readers,
        };
        tokio::spawn(reaper.run(child, kill_rx));

        let handle = ProcessHandle {
            id,
            pid,
            descriptor: descriptor.clone(),
            stop_requested,
            kill_tx,
            state,
        };
        handle.wait_started().await;
        tracing::info!(miner = %descriptor.name, pid, "miner started");
        Ok(handle)
    }

    /// Kill the miner and wait until it has ended.
    ///
    /// Returns immediately if the process is already gone. Safe to call any
    /// number of times on the same handle.
    pub async fn stop(&self, handle: &ProcessHandle) -> ExitReport {
        handle.stop_requested.store(true, Ordering::SeqCst);
        let requested = handle.state.send_if_modified(|s| {
            if matches!(s, HandleState::Starting | HandleState::Running) {
                *s = HandleState::Stopping;
                true
            } else {
                false
            }
        });

        if requested {
            tracing::debug!(miner = %handle.descriptor.name, pid = handle.pid, "stopping miner");
            // A full or closed channel means the reaper is already on its way out.
            let _ = handle.kill_tx.try_send(());
        } else if handle.is_ended() {
            tracing::info!(miner = %handle.descriptor.name, "miner process is already gone");
        }

        handle.wait_ended().await
    }
}

struct Reaper {
    handle_id: u64,
    pid: u32,
    descriptor: MinerDescriptor,
    state: Arc<watch::Sender<HandleState>>,
    stop_requested: Arc<AtomicBool>,
    crash_tx: mpsc::UnboundedSender<Crash>,
    readers: Vec<JoinHandle<()>>,
}

impl Reaper {
    async fn run(mut self, mut child: Child, mut kill_rx: mpsc::Receiver<()>) {
        self.state.send_if_modified(|s| {
            if *s == HandleState::Starting {
                *s = HandleState::Running;
                true
            } else {
                false
            }
        });

        let status = tokio::select! {
            status = child.wait() => {
                // The group id stays reserved while any member is left, so this
                // only reaches processes the launcher started.
                self.kill_leftovers();
                status
            }
            Some(()) = kill_rx.recv() => {
                // Still unreaped here, so the pid cannot have been recycled.
                self.kill_group(&mut child);
                child.wait().await
            }
        };

        let report = match status {
            Ok(status) => ExitReport::from_status(status),
            Err(e) => {
                tracing::warn!(miner = %self.descriptor.name, error = %e, "failed to wait for miner");
                ExitReport::default()
            }
        };

        for mut reader in std::mem::take(&mut self.readers) {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader).await.is_err() {
                reader.abort();
            }
        }

        let stop_requested = &self.stop_requested;
        let mut crashed = false;
        self.state.send_modify(|s| {
            if *s == HandleState::Stopping || stop_requested.load(Ordering::SeqCst) {
                *s = HandleState::Exited(report);
            } else {
                crashed = true;
                *s = HandleState::Crashed(report);
            }
        });

        if crashed {
            tracing::warn!(
                miner = %self.descriptor.name,
                pid = self.pid,
                status = %report,
                "miner exited unexpectedly"
            );
            let crash = Crash {
                handle_id: self.handle_id,
                descriptor: self.descriptor.clone(),
                report,
            };
            if self.crash_tx.send(crash).is_err() {
                tracing::debug!(miner = %self.descriptor.name, "nobody listening for crashes");
            }
        } else {
            tracing::info!(miner = %self.descriptor.name, pid = self.pid, status = %report, "miner stopped");
        }
    }

    fn group(&self) -> Option<Pid> {
        i32::try_from(self.pid)
            .ok()
            .filter(|pid| *pid > 0)
            .map(Pid::from_raw)
    }

    /// Kill whatever the miner left running in its process group after exiting.
    fn kill_leftovers(&self) {
        let Some(group) = self.group() else {
            return;
        };
        match killpg(group, Signal::SIGKILL) {
            Ok(()) => {
                tracing::info!(miner = %self.descriptor.name, pid = self.pid, "killed processes left behind by miner");
            }
            Err(Errno::ESRCH) => {}
            Err(e) => {
                tracing::warn!(miner = %self.descriptor.name, pid = self.pid, error = %e, "failed to kill miner process group");
            }
        }
    }

    fn kill_group(&self, child: &mut Child) {
        let result = self.group().map(|group| killpg(group, Signal::SIGKILL));
        match result {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                tracing::debug!(pid = self.pid, error = %e, "killpg failed, killing leader only");
                let _ = child.start_kill();
            }
            None => {
                let _ = child.start_kill();
            }
        }
    }
}

/// Forward each output line to the log and the telemetry buffer.
fn spawn_reader<R>(stream: R, miner: String, output: OutputBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    tracing::debug!(miner = %miner, "{line}");
                    output.push(line);
                }
                Err(e) => {
                    tracing::debug!(miner = %miner, error = %e, "miner output closed");
                    break;
                }
            }
        }
    })
}

/// Errors from process supervision.
#[derive(Debug)]
pub enum SupervisorError {
    /// The miner executable could not be launched.
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Spawn { path, source } => {
                write!(f, "failed to spawn miner {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Spawn { source, .. } => Some(source),
        }
    }
}
