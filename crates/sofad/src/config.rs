//! Daemon configuration file
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! tcp_port = 6380
//! http_port = 5984
//!
//! [storage]
//! backend = "sqlite"
//! path = "/var/lib/sofa/sofa.db"
//! name = "sofa"
//!
//! [replication]
//! poll_interval_secs = 5
//! timeout_secs = 30
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub tcp_port: u16,
    pub http_port: u16,
    pub tcp: bool,
    pub http: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            tcp_port: 6380,
            http_port: 5984,
            tcp: true,
            http: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// SQLite database file; required for the sqlite backend
    pub path: Option<PathBuf>,
    /// Store name, used as the collection prefix
    pub name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            path: None,
            name: "sofa".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            timeout_secs: 30,
        }
    }
}

impl ReplicationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.tcp_port, 6380);
        assert_eq!(config.storage.backend, BackendKind::Memory);
        assert_eq!(config.replication.poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
            [storage]
            backend = "sqlite"
            path = "/tmp/sofa.db"

            [replication]
            timeout_secs = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.backend, BackendKind::Sqlite);
        assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/sofa.db")));
        assert_eq!(config.storage.name, "sofa");
        assert_eq!(config.replication.timeout(), Duration::from_secs(2));
        assert_eq!(config.replication.poll_interval_secs, 5);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(Config::parse("[storage]\nbackend = \"postgres\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nhttp_port = 9000\nhttp = false").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.http_port, 9000);
        assert!(!config.server.http);
        assert!(config.server.tcp);
    }
}
