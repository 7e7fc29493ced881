//! Persistent defaults for the `deliver` binary.
//!
//! Read from `<config dir>/deliver/config.json` unless `--config` names
//! another file. Command-line flags override every value here. Secrets are
//! never stored in this file.

use anyhow::{Context, Result};
use deliver_scp::delivery::{ConnectionOptions, DeliveryOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_port() -> u16 {
    22
}
fn default_base_dir() -> String {
    "/".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    /// Built-in libssh2 session.
    #[default]
    Ssh2,
    /// System `ssh` / `scp` binaries.
    #[serde(rename = "openssh")]
    #[value(name = "openssh")]
    OpenSsh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    /// Private key used when no password is supplied.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub connection: ConnectionOptions,
    /// Exit 0 even when some items failed.
    #[serde(default)]
    pub allow_partial: bool,
    #[serde(default = "default_true")]
    pub reject_traversal: bool,
}

impl Default for DeliverConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            username: None,
            base_dir: default_base_dir(),
            identity_file: None,
            transport: TransportKind::default(),
            connection: ConnectionOptions::default(),
            allow_partial: false,
            reject_traversal: true,
        }
    }
}

impl DeliverConfig {
    pub fn delivery_options(&self) -> DeliveryOptions {
        DeliveryOptions {
            reject_traversal: self.reject_traversal,
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("deliver").join("config.json"))
}

/// Load the configuration.
///
/// An explicit path must exist. The default path is optional and falls back
/// to built-in defaults when absent.
pub fn load_config(explicit: Option<&Path>) -> Result<DeliverConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.exists() => path,
            _ => {
                log::debug!("No configuration file found, using defaults");
                return Ok(DeliverConfig::default());
            }
        },
    };

    log::info!("Loading configuration from {}", path.display());
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: DeliverConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use deliver_scp::delivery::HostKeyPolicy;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config: DeliverConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.base_dir, "/");
        assert_eq!(config.transport, TransportKind::Ssh2);
        assert!(config.reject_traversal);
        assert!(!config.allow_partial);
        assert_eq!(config.connection.connect_timeout_secs, 20);
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "host": "files.example.org",
                "username": "deploy",
                "baseDir": "/data/",
                "transport": "openssh",
                "allowPartial": true,
                "connection": { "hostKeyPolicy": "strict", "connectTimeoutSecs": 5 }
            }"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.host.as_deref(), Some("files.example.org"));
        assert_eq!(config.base_dir, "/data/");
        assert_eq!(config.transport, TransportKind::OpenSsh);
        assert!(config.allow_partial);
        assert_eq!(config.connection.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(config.connection.connect_timeout_secs, 5);
        assert_eq!(config.connection.keepalive_interval_secs, 60);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.json"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("Invalid config file"));
    }

    #[test]
    fn test_traversal_check_can_be_disabled() {
        let config: DeliverConfig = serde_json::from_str(r#"{"rejectTraversal": false}"#).unwrap();
        assert!(!config.delivery_options().reject_traversal);
    }
}
