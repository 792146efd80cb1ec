/// Status file: writes `rig.status` as JSON whenever the rig changes state.
///
/// Uses atomic write pattern: write to temp file then rename.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Rig states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RigState {
    Starting,
    Running,
    Switching,
    Restarting,
    ShuttingDown,
}

/// The JSON payload written to `rig.status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: RigState,
    pub miner: Option<String>,
    pub miner_pid: Option<u32>,
    pub ticks: u64,
    pub restarts: u64,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file on disk.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".rig.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Read back a status file written by a running rig.
    pub fn read(path: &Path) -> Result<StatusData, StatusError> {
        let contents = std::fs::read_to_string(path).map_err(|e| StatusError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&contents).map_err(|e| StatusError::Serialize { source: e })
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

struct Tracked {
    file: Option<StatusFile>,
    data: StatusData,
}

/// Shared, cloneable status recorder. Every update rewrites the file.
#[derive(Clone)]
pub struct StatusTracker {
    inner: Arc<Mutex<Tracked>>,
}

impl StatusTracker {
    pub fn new(path: PathBuf) -> Self {
        Self::with_file(Some(StatusFile::new(path)))
    }

    /// Tracker that keeps counters in memory only.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::with_file(None)
    }

    fn with_file(file: Option<StatusFile>) -> Self {
        let now = Utc::now();
        let data = StatusData {
            pid: std::process::id(),
            state: RigState::Starting,
            miner: None,
            miner_pid: None,
            ticks: 0,
            restarts: 0,
            started_at: now,
            last_update: now,
        };
        Self {
            inner: Arc::new(Mutex::new(Tracked { file, data })),
        }
    }

    fn update(&self, change: impl FnOnce(&mut StatusData)) {
        let mut tracked = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        change(&mut tracked.data);
        tracked.data.last_update = Utc::now();
        if let Some(file) = &tracked.file {
            if let Err(e) = file.write(&tracked.data) {
                tracing::warn!(error = %e, "failed to write status file");
            }
        }
    }

    pub fn set_state(&self, state: RigState) {
        self.update(|data| data.state = state);
    }

    /// End a transient state: back to `Running`, unless the state has moved
    /// on from `during` in the meantime (e.g. to `ShuttingDown`).
    pub fn settle(&self, during: RigState) {
        self.update(|data| {
            if data.state == during {
                data.state = RigState::Running;
            }
        });
    }

    /// Record the miner process now running.
    pub fn set_miner(&self, name: &str, pid: u32) {
        self.update(|data| {
            data.miner = Some(name.to_string());
            data.miner_pid = Some(pid);
        });
    }

    pub fn record_tick(&self) {
        self.update(|data| data.ticks += 1);
    }

    pub fn record_restart(&self) {
        self.update(|data| data.restarts += 1);
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> StatusData {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .data
            .clone()
    }

    /// Remove the status file.
    pub fn remove(&self) {
        let tracked = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = &tracked.file {
            file.remove();
        }
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to (de)serialize status: {source}"),
            StatusError::Read { path, source } => {
                write!(f, "failed to read status file {}: {source}", path.display())
            }
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Read { source, .. } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(state: RigState) -> StatusData {
        StatusData {
            pid: 12345,
            state,
            miner: Some("x11".to_string()),
            miner_pid: Some(4242),
            ticks: 17,
            restarts: 1,
            started_at: Utc::now(),
            last_update: Utc::now(),
        }
    }

    #[test]
    fn test_status_file_atomic_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rig.status");
        let sf = StatusFile::new(path.clone());

        sf.write(&sample(RigState::Running)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["pid"], 12345);
        assert_eq!(parsed["state"], "running");
        assert_eq!(parsed["miner"], "x11");
        assert_eq!(parsed["miner_pid"], 4242);
        assert_eq!(parsed["ticks"], 17);
        assert_eq!(parsed["restarts"], 1);

        let tmp_path = dir
            .path()
            .join(format!(".rig.status.tmp.{}", std::process::id()));
        assert!(!tmp_path.exists(), "temp file should be cleaned up by rename");
    }

    #[test]
    fn test_status_file_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rig.status");
        StatusFile::new(path.clone())
            .write(&sample(RigState::Switching))
            .unwrap();

        let data = StatusFile::read(&path).unwrap();
        assert_eq!(data.state, RigState::Switching);
        assert_eq!(data.miner.as_deref(), Some("x11"));
    }

    #[test]
    fn test_status_file_read_missing() {
        let err = StatusFile::read(Path::new("/nonexistent/rig.status")).unwrap_err();
        assert!(matches!(err, StatusError::Read { .. }));
    }

    #[test]
    fn test_all_rig_states_serialize() {
        let states = vec![
            (RigState::Starting, "starting"),
            (RigState::Running, "running"),
            (RigState::Switching, "switching"),
            (RigState::Restarting, "restarting"),
            (RigState::ShuttingDown, "shutting_down"),
        ];

        for (state, expected_str) in states {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", expected_str));
        }
    }

    #[test]
    fn test_status_tracker_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rig.status");
        let tracker = StatusTracker::new(path.clone());

        tracker.set_state(RigState::Starting);
        let data = StatusFile::read(&path).unwrap();
        assert_eq!(data.state, RigState::Starting);
        assert_eq!(data.miner, None);

        tracker.set_miner("x11", 100);
        tracker.set_state(RigState::Running);
        tracker.record_tick();
        tracker.record_tick();
        tracker.record_restart();

        let data = StatusFile::read(&path).unwrap();
        assert_eq!(data.state, RigState::Running);
        assert_eq!(data.miner.as_deref(), Some("x11"));
        assert_eq!(data.miner_pid, Some(100));
        assert_eq!(data.ticks, 2);
        assert_eq!(data.restarts, 1);

        tracker.remove();
        assert!(!path.exists());
    }

    #[test]
    fn test_settle_returns_to_running() {
        let tracker = StatusTracker::in_memory();
        tracker.set_state(RigState::Switching);
        tracker.settle(RigState::Switching);
        assert_eq!(tracker.snapshot().state, RigState::Running);
    }

    #[test]
    fn test_settle_keeps_shutting_down() {
        let tracker = StatusTracker::in_memory();
        tracker.set_state(RigState::Restarting);
        tracker.set_state(RigState::ShuttingDown);
        tracker.settle(RigState::Restarting);
        assert_eq!(tracker.snapshot().state, RigState::ShuttingDown);
    }

    #[test]
    fn test_overlapping_transitions_settle_to_running() {
        let tracker = StatusTracker::in_memory();
        tracker.set_state(RigState::Switching);
        tracker.set_state(RigState::Restarting);
        tracker.settle(RigState::Switching);
        assert_eq!(tracker.snapshot().state, RigState::Restarting);
        tracker.settle(RigState::Restarting);
        assert_eq!(tracker.snapshot().state, RigState::Running);
    }

    #[test]
    fn test_clones_share_counters() {
        let tracker = StatusTracker::in_memory();
        let other = tracker.clone();
        other.record_tick();
        tracker.record_tick();
        assert_eq!(tracker.snapshot().ticks, 2);
    }

    #[test]
    fn test_status_file_write_to_nonexistent_dir_fails() {
        let sf = StatusFile::new(PathBuf::from("/nonexistent/dir/rig.status"));
        assert!(sf.write(&sample(RigState::Starting)).is_err());
    }

    #[test]
    fn test_tracker_survives_unwritable_path() {
        let tracker = StatusTracker::new(PathBuf::from("/nonexistent/dir/rig.status"));
        tracker.record_tick();
        assert_eq!(tracker.snapshot().ticks, 1);
    }
}
