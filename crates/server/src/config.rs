//! Server configuration
//!
//! YAML file with one section per concern; every field has a default so a
//! bare config file (or none at all) still yields a runnable server.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use storage::StorageConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub replication: ReplicationConfig,
    pub storage: StorageConfig,
    pub backup: BackupConfig,
    pub slowlog: SlowLogConfig,
    pub profiling: ProfilingConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.profiling.sample_ratio > 100 {
            return Err(ConfigError::Invalid(
                "profiling sample_ratio must be between 0 and 100".into(),
            ));
        }
        for namespace in self.security.tokens.values() {
            if namespace.is_empty() || namespace.len() > u8::MAX as usize {
                return Err(ConfigError::Invalid(format!(
                    "namespace length must be between 1 and 255: {namespace}"
                )));
            }
            // the last byte is bumped to bound prefix scans, so stay in ASCII
            if namespace.bytes().any(|b| b >= 0x80) {
                return Err(ConfigError::Invalid(format!(
                    "namespace must be plain ASCII: {namespace}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 6666,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Admin password; empty disables authentication.
    pub requirepass: String,
    /// token -> namespace. AUTH with a token binds the connection to that
    /// namespace instead of granting admin access.
    pub tokens: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub slave_readonly: bool,
    pub master_host: Option<String>,
    pub master_port: u16,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            slave_readonly: true,
            master_host: None,
            master_port: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub num_backups_to_keep: u32,
    /// Zero disables the age-based purge.
    pub backup_max_keep_hours: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            num_backups_to_keep: 1,
            backup_max_keep_hours: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlowLogConfig {
    /// Microseconds; negative disables the log, zero records everything.
    pub log_slower_than_us: i64,
    pub max_len: usize,
}

impl Default for SlowLogConfig {
    fn default() -> Self {
        Self {
            log_slower_than_us: 200_000,
            max_len: 128,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingConfig {
    /// Percentage of sampled calls, 0-100.
    pub sample_ratio: u32,
    /// Only samples at least this slow are recorded; zero records all.
    pub sample_record_threshold_ms: u64,
    pub sample_record_max_len: usize,
    pub sample_commands: HashSet<String>,
    pub sample_all_commands: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 6666);
        assert!(config.replication.slave_readonly);
        assert!(config.security.requirepass.is_empty());
    }

    #[test]
    fn test_partial_yaml() {
        let config = Config::from_yaml(
            "server:\n  port: 7000\nsecurity:\n  requirepass: secret\nstorage:\n  codis_enabled: true\n",
        )
        .unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.security.requirepass, "secret");
        assert!(config.storage.codis_enabled);
        // untouched sections keep defaults
        assert_eq!(config.slowlog.log_slower_than_us, 200_000);
    }

    #[test]
    fn test_validation() {
        let yaml = "profiling:\n  sample_ratio: 101\n";
        assert!(Config::from_yaml(yaml).is_err());

        let yaml = "security:\n  tokens:\n    t1: \"\"\n";
        assert!(Config::from_yaml(yaml).is_err());

        let yaml = "security:\n  tokens:\n    t1: ns1\n";
        assert!(Config::from_yaml(yaml).is_ok());
    }
}
