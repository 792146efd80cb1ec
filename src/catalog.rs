/// Miner catalog: the read-only set of miner configurations this rig can run.
///
/// Entries come from two places: explicit `[[catalog.miners]]` entries in the
/// config file, and every `<dir>/<name>/<launcher>` found under the miners
/// directory. Names are unique across both.
use crate::config::CatalogConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A named, runnable miner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerDescriptor {
    pub name: String,
    /// Executable launched for this miner.
    pub path: PathBuf,
}

impl MinerDescriptor {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Directory the miner process runs in: the one holding its executable.
    pub fn working_dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }
}

/// Read-only registry of available miners.
pub trait MinerCatalog: Send + Sync {
    /// All known miners, each with a unique name.
    fn list(&self) -> Vec<MinerDescriptor>;

    /// Look up a miner by exact name.
    fn find(&self, name: &str) -> Option<MinerDescriptor> {
        self.list().into_iter().find(|miner| miner.name == name)
    }
}

/// Catalog fixed at construction time.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    miners: Vec<MinerDescriptor>,
}

impl StaticCatalog {
    /// Build a catalog from explicit entries, rejecting duplicate names.
    pub fn new(miners: Vec<MinerDescriptor>) -> Result<Self, CatalogError> {
        let mut by_name = BTreeMap::new();
        for miner in miners {
            if by_name.contains_key(&miner.name) {
                return Err(CatalogError::Duplicate { name: miner.name });
            }
            by_name.insert(miner.name.clone(), miner);
        }
        Ok(Self {
            miners: by_name.into_values().collect(),
        })
    }

    /// Merge the configured entries with the miners found on disk.
    pub fn from_config(config: &CatalogConfig, launcher: &str) -> Result<Self, CatalogError> {
        let mut miners = config.miners.clone();
        miners.extend(scan_dir(&config.dir, launcher)?);
        Self::new(miners)
    }
}

impl MinerCatalog for StaticCatalog {
    fn list(&self) -> Vec<MinerDescriptor> {
        self.miners.clone()
    }
}

/// Find `<dir>/<name>/<launcher>` entries. A missing directory yields nothing.
pub fn scan_dir(dir: &Path, launcher: &str) -> Result<Vec<MinerDescriptor>, CatalogError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "miners directory not found, skipping scan");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(CatalogError::Scan {
                dir: dir.to_path_buf(),
                source: e,
            })
        }
    };

    let mut miners = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CatalogError::Scan {
            dir: dir.to_path_buf(),
            source: e,
        })?;
        let miner_dir = entry.path();
        if !miner_dir.is_dir() {
            continue;
        }
        let script = miner_dir.join(launcher);
        if !script.is_file() {
            tracing::debug!(dir = %miner_dir.display(), launcher, "no launcher, skipping");
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        miners.push(MinerDescriptor::new(name, script));
    }
    miners.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(miners)
}

/// Errors from building a catalog.
#[derive(Debug)]
pub enum CatalogError {
    Duplicate { name: String },
    Scan { dir: PathBuf, source: std::io::Error },
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Duplicate { name } => write!(f, "miner {name:?} is defined twice"),
            CatalogError::Scan { dir, source } => {
                write!(f, "failed to scan miners directory {}: {source}", dir.display())
            }
        }
    }
}

impl std::error::Error for CatalogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CatalogError::Duplicate { .. } => None,
            CatalogError::Scan { source, .. } => Some(source),
        }
    }
}
