/// Singleton lock: only one rig may drive miners on a host at a time.
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Held exclusive lock on the lock file. Released on drop.
#[derive(Debug)]
pub struct RigLock {
    file: File,
    path: PathBuf,
}

impl RigLock {
    /// Take the lock without blocking and record our pid in the file.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| LockError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                let holder = std::fs::read_to_string(path).unwrap_or_default();
                return Err(LockError::Held {
                    path: path.to_path_buf(),
                    holder: holder.trim().to_string(),
                });
            }
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }

        let stamp = |file: &mut File| -> std::io::Result<()> {
            file.set_len(0)?;
            write!(file, "{}", std::process::id())?;
            file.flush()
        };
        stamp(&mut file).map_err(|e| LockError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        tracing::debug!(path = %path.display(), "acquired rig lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RigLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), error = %e, "failed to release rig lock");
        }
    }
}

/// Errors from taking the singleton lock.
#[derive(Debug)]
pub enum LockError {
    /// Another rig holds the lock.
    Held { path: PathBuf, holder: String },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Held { path, holder } if !holder.is_empty() => write!(
                f,
                "another rig (pid {holder}) holds {}",
                path.display()
            ),
            LockError::Held { path, .. } => write!(f, "another rig holds {}", path.display()),
            LockError::Io { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Held { .. } => None,
            LockError::Io { source, .. } => Some(source),
        }
    }
}
