use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::MinerDescriptor;

/// Top-level configuration loaded from rig.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct RigConfig {
    pub identity: IdentityConfig,
    pub supervisor: SupervisorConfig,
    pub control: ControlConfig,
    pub remote: RemoteConfig,
    pub telemetry: TelemetryConfig,
    pub runtime: RuntimeConfig,
    pub catalog: CatalogConfig,
}

/// Who this rig is, as far as the remote service is concerned.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub worker_id: String,
    pub access_key: String,
    /// Name of the miner loaded at startup.
    pub client_name: String,
    pub api_base: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub restart_delay_ms: u64,
    pub launcher: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub tick_interval_ms: u64,
    pub check_algorithms: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub max_lines: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub status_file: PathBuf,
    pub lock_file: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Directory scanned for `<name>/<launcher>` miner entries.
    pub dir: PathBuf,
    pub miners: Vec<MinerDescriptor>,
}

// --- Default implementations ---

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            access_key: String::new(),
            client_name: String::new(),
            api_base: "https://api.minerstat.com/".to_string(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: 1000,
            launcher: "start.bash".to_string(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            check_algorithms: false,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { max_lines: 500 }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            status_file: PathBuf::from("rig.status"),
            lock_file: PathBuf::from("rig.lock"),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("miners"),
            miners: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl ControlConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl RigConfig {
    /// Read and parse a config file. Does not validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply CLI overrides on top of the file values.
    pub fn apply_overrides(&mut self, client: Option<&str>, worker: Option<&str>) {
        if let Some(client) = client {
            self.identity.client_name = client.to_string();
        }
        if let Some(worker) = worker {
            self.identity.worker_id = worker.to_string();
        }
    }

    /// Check the settings the rig cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.worker_id.trim().is_empty() {
            return Err(ConfigError::Invalid("identity.worker_id is empty".to_string()));
        }
        if self.identity.client_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "identity.client_name is empty".to_string(),
            ));
        }
        if let Err(e) = reqwest::Url::parse(&self.identity.api_base) {
            return Err(ConfigError::Invalid(format!(
                "identity.api_base {:?} is not a valid URL: {e}",
                self.identity.api_base
            )));
        }
        if self.control.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "control.tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.supervisor.launcher.trim().is_empty() {
            return Err(ConfigError::Invalid("supervisor.launcher is empty".to_string()));
        }
        Ok(())
    }
}

/// Errors from loading or validating the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}
