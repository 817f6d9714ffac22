//! Configuration via `trellis.toml` or a programmatic builder.
//!
//! A standalone engine needs nothing but a directory. A replicated engine
//! additionally needs a machine id, the coordination service addresses, and
//! the address it serves followers on. Validation is eager: `validate_ha`
//! rejects a config before any store file is touched.

use crate::error::{Result, TrellisError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the store directory.
pub const CONFIG_FILE_NAME: &str = "trellis.toml";

/// Default cluster name when none is configured.
pub const DEFAULT_CLUSTER_NAME: &str = "trellis.ha";

/// Database configuration.
///
/// # Example
///
/// ```toml
/// machine_id = 1
/// coordination_servers = ["127.0.0.1:2181"]
/// ha_server = "127.0.0.1:6361"
/// cluster_name = "trellis.ha"
/// pull_interval = 500
/// allow_init_cluster = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unique integer identifying this member within the cluster.
    /// Required for replicated operation.
    #[serde(default)]
    pub machine_id: Option<u32>,

    /// Addresses of the coordination service members.
    #[serde(default)]
    pub coordination_servers: Vec<String>,

    /// `host:port` this node serves followers on. Required for replicated
    /// operation.
    #[serde(default)]
    pub ha_server: Option<String>,

    /// Name of the cluster this node joins.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Interval for the follower's background update puller, in
    /// milliseconds. `None` disables background pulling (the follower still
    /// catches up on every commit round-trip).
    #[serde(default)]
    pub pull_interval: Option<u64>,

    /// May this node mint a new store and bootstrap the cluster when its
    /// directory is empty and no primary exists yet.
    #[serde(default = "default_true")]
    pub allow_init_cluster: bool,

    /// Force the paging backend: `Some(true)` memory-mapped, `Some(false)`
    /// positional I/O, `None` auto-configured from available address space.
    #[serde(default)]
    pub use_memory_mapped_buffers: Option<bool>,

    /// Retain rotated logical logs instead of deleting them. Forced on in
    /// replicated mode, where history is needed to serve lagging followers.
    #[serde(default)]
    pub keep_logical_logs: bool,

    /// Open the store read-only; every write surfaces `ReadOnly`.
    #[serde(default)]
    pub read_only: bool,

    /// This node only replicates for backup purposes and never stands for
    /// election.
    #[serde(default)]
    pub backup_slave: bool,
}

fn default_cluster_name() -> String {
    DEFAULT_CLUSTER_NAME.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Config {
            machine_id: None,
            coordination_servers: Vec::new(),
            ha_server: None,
            cluster_name: default_cluster_name(),
            pull_interval: None,
            allow_init_cluster: true,
            use_memory_mapped_buffers: None,
            keep_logical_logs: false,
            read_only: false,
            backup_slave: false,
        }
    }
}

impl Config {
    /// Read and parse `trellis.toml` from the given path.
    pub fn from_file(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrellisError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            TrellisError::Config(format!("failed to parse '{}': {}", path.display(), e))
        })
    }

    /// Load `trellis.toml` from a store directory if present, defaults
    /// otherwise.
    pub fn load_or_default(dir: &Path) -> Result<Config> {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Config::from_file(&path)
        } else {
            Ok(Config::default())
        }
    }

    /// Pull interval as a duration, if background pulling is enabled.
    pub fn pull_interval_duration(&self) -> Option<Duration> {
        self.pull_interval.map(Duration::from_millis)
    }

    /// Validate the fields replicated operation requires.
    ///
    /// Replicated mode also forces `keep_logical_logs`: a primary must be
    /// able to stream history that predates its current log file.
    pub fn validate_ha(&self) -> Result<(u32, String)> {
        let machine_id = self
            .machine_id
            .ok_or_else(|| TrellisError::Config("machine_id is required".to_string()))?;
        let ha_server = self
            .ha_server
            .clone()
            .ok_or_else(|| TrellisError::Config("ha_server is required".to_string()))?;
        if !ha_server.contains(':') {
            return Err(TrellisError::Config(format!(
                "ha_server '{}' is not host:port",
                ha_server
            )));
        }
        if self.read_only && !self.backup_slave {
            return Err(TrellisError::Config(
                "read_only cluster members must be backup slaves".to_string(),
            ));
        }
        Ok((machine_id, ha_server))
    }

    /// Effective log retention: forced on in replicated mode.
    pub fn effective_keep_logical_logs(&self, ha_mode: bool) -> bool {
        self.keep_logical_logs || ha_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.cluster_name, DEFAULT_CLUSTER_NAME);
        assert!(config.allow_init_cluster);
        assert!(!config.keep_logical_logs);
        assert!(config.pull_interval_duration().is_none());
    }

    #[test]
    fn parse_full_config() {
        let config: Config = toml::from_str(
            r#"
machine_id = 3
coordination_servers = ["10.0.0.1:2181", "10.0.0.2:2181"]
ha_server = "10.0.0.3:6361"
cluster_name = "prod"
pull_interval = 250
allow_init_cluster = false
use_memory_mapped_buffers = false
keep_logical_logs = true
"#,
        )
        .unwrap();

        assert_eq!(config.machine_id, Some(3));
        assert_eq!(config.coordination_servers.len(), 2);
        assert_eq!(config.cluster_name, "prod");
        assert_eq!(
            config.pull_interval_duration(),
            Some(Duration::from_millis(250))
        );
        assert!(!config.allow_init_cluster);
        assert_eq!(config.use_memory_mapped_buffers, Some(false));

        let (machine_id, ha_server) = config.validate_ha().unwrap();
        assert_eq!(machine_id, 3);
        assert_eq!(ha_server, "10.0.0.3:6361");
    }

    #[test]
    fn validate_ha_requires_machine_id() {
        let config = Config {
            ha_server: Some("127.0.0.1:6361".to_string()),
            ..Config::default()
        };
        assert!(config.validate_ha().is_err());
    }

    #[test]
    fn validate_ha_rejects_bad_address() {
        let config = Config {
            machine_id: Some(1),
            ha_server: Some("nocolon".to_string()),
            ..Config::default()
        };
        assert!(config.validate_ha().is_err());
    }

    #[test]
    fn keep_logical_logs_forced_in_ha() {
        let config = Config::default();
        assert!(!config.effective_keep_logical_logs(false));
        assert!(config.effective_keep_logical_logs(true));
    }

    #[test]
    fn load_or_default_reads_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "machine_id = 9\n").unwrap();

        let config = Config::load_or_default(dir.path()).unwrap();
        assert_eq!(config.machine_id, Some(9));
    }

    #[test]
    fn load_or_default_on_empty_dir() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_or_default(dir.path()).unwrap();
        assert!(config.machine_id.is_none());
    }
}
