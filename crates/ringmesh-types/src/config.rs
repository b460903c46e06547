//! Configuration loading from `ringmesh.toml` with defaults.
//!
//! Every section is optional; missing keys take their default values. A file
//! that cannot be read or parsed is reported and the defaults are used, so a
//! registry or node can always start from command-line flags alone.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// File name looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "ringmesh.toml";

/// Largest id space whose member list still fits the one-byte manifest count.
pub const MAX_ID_SPACE: u32 = 256;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("id_space must be between 1 and {MAX_ID_SPACE}, got {0}")]
    IdSpace(u32),
    #[error("max_finger_count must be between 1 and 31, got {0}")]
    FingerCount(u8),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Top-level configuration shared by both binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub registry: RegistryConfig,
    pub node: NodeConfig,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            registry: RegistryConfig::default(),
            node: NodeConfig::default(),
        }
    }
}

impl RingConfig {
    /// Reject values the overlay cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry.validate()
    }
}

/// Registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Address the registry listens on.
    pub listen_addr: SocketAddr,
    /// Ids are drawn from `0..id_space`.
    pub id_space: u32,
    /// Random draws before the allocator falls back to a scan.
    pub id_retry_limit: u32,
    /// Upper bound accepted by `setup-overlay`.
    pub max_finger_count: u8,
    /// Pause between the last task-finished report and the summary request.
    pub settle_delay_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            id_space: 128,
            id_retry_limit: 128,
            max_finger_count: 5,
            settle_delay_ms: 20_000,
        }
    }
}

impl RegistryConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id_space == 0 || self.id_space > MAX_ID_SPACE {
            return Err(ConfigError::IdSpace(self.id_space));
        }
        if self.max_finger_count == 0 || self.max_finger_count > 31 {
            return Err(ConfigError::FingerCount(self.max_finger_count));
        }
        Ok(())
    }
}

/// Messaging node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// `host:port` of the registry.
    pub registry_addr: String,
    /// Address of the node's own peer listener (port 0 picks a free port).
    pub listen_addr: SocketAddr,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            registry_addr: "127.0.0.1:5000".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

fn config_path(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Read and parse the config file without logging.
///
/// Returns `Ok(None)` when the file does not exist. Callers that install a
/// tracing subscriber from the loaded config use this and report the outcome
/// once logging is up.
pub fn read_config(path: Option<&Path>) -> Result<Option<RingConfig>, ConfigError> {
    let path = config_path(path);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigError::Parse { path, source })
}

/// Log how the config file was resolved, falling back to defaults on error.
pub fn resolve_config(
    path: Option<&Path>,
    loaded: Result<Option<RingConfig>, ConfigError>,
) -> RingConfig {
    let shown = config_path(path);
    match loaded {
        Ok(Some(config)) => {
            info!(path = %shown.display(), "Loaded configuration");
            config
        }
        Ok(None) => {
            info!(
                path = %shown.display(),
                "Config file not found, using defaults"
            );
            RingConfig::default()
        }
        Err(e) => {
            warn!(error = %e, "Invalid config file, using defaults");
            RingConfig::default()
        }
    }
}

/// Load configuration from a TOML file, with defaults.
pub fn load_config(path: Option<&Path>) -> RingConfig {
    resolve_config(path, read_config(path))
}
