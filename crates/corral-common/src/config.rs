//! Global configuration model for the Corral runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{CorralError, Result};

/// Bounds of a numeric pool cut into equally sized blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeConfig {
    /// First value of the pool.
    pub start: u32,
    /// Number of values in the pool.
    pub size: u32,
    /// Number of consecutive values handed to one container.
    #[serde(default = "default_block")]
    pub block: u32,
}

const fn default_block() -> u32 {
    1
}

impl RangeConfig {
    /// Creates a range handing out one value per container.
    #[must_use]
    pub const fn new(start: u32, size: u32) -> Self {
        Self {
            start,
            size,
            block: 1,
        }
    }
}

/// Configuration of the resource pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Per-container user ids.
    pub uids: RangeConfig,
    /// Network CIDR, subdivided into `/30` subnets.
    pub network: String,
    /// Host ports for mapped container ports.
    pub ports: RangeConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            uids: RangeConfig::new(
                constants::DEFAULT_UID_POOL_START,
                constants::DEFAULT_UID_POOL_SIZE,
            ),
            network: constants::DEFAULT_NETWORK_POOL.to_string(),
            ports: RangeConfig::new(
                constants::DEFAULT_PORT_POOL_START,
                constants::DEFAULT_PORT_POOL_SIZE,
            ),
        }
    }
}

/// Namespaces unshared for every container.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSet {
    /// Isolate the PID namespace.
    pub pid: bool,
    /// Isolate the mount namespace.
    pub mount: bool,
    /// Isolate the network namespace.
    pub network: bool,
    /// Isolate the user namespace.
    pub user: bool,
    /// Isolate the IPC namespace.
    pub ipc: bool,
    /// Isolate the UTS (hostname) namespace.
    pub uts: bool,
}

impl Default for NamespaceSet {
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            network: true,
            user: false,
            ipc: true,
            uts: true,
        }
    }
}

/// Root configuration for the Corral host process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorralConfig {
    /// Directory holding one subdirectory per container.
    pub depot_dir: PathBuf,
    /// Directory for per-container snapshots. `None` disables snapshots.
    pub snapshots_dir: Option<PathBuf>,
    /// Path of the init binary executed inside each container.
    pub init_binary: PathBuf,
    /// Resource pool bounds.
    pub pool: PoolConfig,
    /// Namespaces unshared for each container.
    pub namespaces: NamespaceSet,
    /// Default grace time for containers, in seconds. Zero disables it.
    pub container_grace_time_secs: u64,
    /// Deadline for the init process to report readiness, in seconds.
    pub rendezvous_timeout_secs: u64,
    /// Delay between `SIGTERM` and `SIGKILL` on stop, in seconds.
    pub stop_timeout_secs: u64,
}

impl Default for CorralConfig {
    fn default() -> Self {
        Self {
            depot_dir: PathBuf::from(constants::DEFAULT_DEPOT_DIR),
            snapshots_dir: None,
            init_binary: PathBuf::from(constants::DEFAULT_INIT_BINARY),
            pool: PoolConfig::default(),
            namespaces: NamespaceSet::default(),
            container_grace_time_secs: 0,
            rendezvous_timeout_secs: constants::DEFAULT_RENDEZVOUS_TIMEOUT_SECS,
            stop_timeout_secs: constants::DEFAULT_STOP_TIMEOUT_SECS,
        }
    }
}

impl CorralConfig {
    /// Loads a configuration file, filling unspecified fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CorralError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Returns the configured rendezvous deadline.
    #[must_use]
    pub const fn rendezvous_timeout(&self) -> Duration {
        Duration::from_secs(self.rendezvous_timeout_secs)
    }

    /// Returns the configured stop grace period.
    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Returns the default container grace time, if enabled.
    #[must_use]
    pub const fn container_grace_time(&self) -> Option<Duration> {
        if self.container_grace_time_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.container_grace_time_secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_constants() {
        let cfg = CorralConfig::default();
        assert_eq!(cfg.pool.network, "10.254.0.0/22");
        assert_eq!(cfg.pool.uids.start, 10_000);
        assert_eq!(cfg.pool.ports.size, 5_000);
        assert!(cfg.snapshots_dir.is_none());
        assert!(cfg.container_grace_time().is_none());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let json = r#"{ "pool": { "uids": { "start": 20000, "size": 8 }, "network": "10.0.0.0/29", "ports": { "start": 7000, "size": 2 } } }"#;
        let cfg: CorralConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.pool.uids.start, 20_000);
        assert_eq!(cfg.pool.uids.block, 1);
        assert_eq!(cfg.depot_dir, PathBuf::from(constants::DEFAULT_DEPOT_DIR));
        assert_eq!(cfg.rendezvous_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn load_reports_missing_file_path() {
        let err = CorralConfig::load(Path::new("/nonexistent/corral.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/corral.json"));
    }
}
