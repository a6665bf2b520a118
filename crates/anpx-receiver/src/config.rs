//! Receiver configuration: TOML file + CLI overrides.

use crate::error::{ReceiverError, ReceiverResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// `[gateway]` section: where to open the tunnel.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_gateway_url")]
    pub url: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

/// `[identity]` section: the DID this receiver authenticates as.
///
/// `key_file` holds the hex-encoded 32-byte ed25519 signing seed whose
/// public half is published in the DID document.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySection {
    #[serde(default)]
    pub did: String,
    #[serde(default = "default_verification_method")]
    pub verification_method: String,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            did: String::new(),
            verification_method: default_verification_method(),
            key_file: None,
        }
    }
}

/// `[dispatch]` section: local application dispatch limits.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            queue_depth: default_queue_depth(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// `[reconnect]` section: exponential backoff parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_backoff")]
    pub initial_secs: u64,
    #[serde(default = "default_backoff_factor")]
    pub factor: u32,
    #[serde(default = "default_max_backoff")]
    pub max_secs: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_secs: default_initial_backoff(),
            factor: default_backoff_factor(),
            max_secs: default_max_backoff(),
        }
    }
}

fn default_gateway_url() -> String {
    "ws://127.0.0.1:8765".to_string()
}
fn default_ping_interval() -> u64 {
    10
}
fn default_verification_method() -> String {
    "key-1".to_string()
}
fn default_max_pending() -> usize {
    100
}
fn default_queue_depth() -> usize {
    32
}
fn default_chunk_size() -> usize {
    64 * 1024
}
fn default_initial_backoff() -> u64 {
    5
}
fn default_backoff_factor() -> u32 {
    2
}
fn default_max_backoff() -> u64 {
    300
}

/// Resolved receiver configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub gateway_url: String,
    pub ping_interval: Duration,
    pub did: String,
    pub verification_method: String,
    pub key_file: Option<PathBuf>,
    pub max_pending: usize,
    pub queue_depth: usize,
    pub chunk_size: usize,
    pub initial_backoff: Duration,
    pub backoff_factor: u32,
    pub max_backoff: Duration,
}

impl ReceiverConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_gateway_url: Option<&str>,
        cli_did: Option<&str>,
        cli_key_file: Option<&Path>,
    ) -> ReceiverResult<Self> {
        let file = match config_path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| ReceiverError::Config(format!("config parse error: {e}")))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        let config = Self {
            gateway_url: cli_gateway_url
                .map(str::to_string)
                .unwrap_or(file.gateway.url),
            ping_interval: Duration::from_secs(file.gateway.ping_interval_secs),
            did: cli_did.map(str::to_string).unwrap_or(file.identity.did),
            verification_method: file.identity.verification_method,
            key_file: cli_key_file
                .map(Path::to_path_buf)
                .or(file.identity.key_file),
            max_pending: file.dispatch.max_pending,
            queue_depth: file.dispatch.queue_depth,
            chunk_size: file.dispatch.chunk_size,
            initial_backoff: Duration::from_secs(file.reconnect.initial_secs),
            backoff_factor: file.reconnect.factor,
            max_backoff: Duration::from_secs(file.reconnect.max_secs),
        };

        if config.did.is_empty() {
            return Err(ReceiverError::Config("identity.did is required".into()));
        }
        if config.key_file.is_none() {
            return Err(ReceiverError::Config("identity.key_file is required".into()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let file = ConfigFile::default();
        assert_eq!(file.reconnect.initial_secs, 5);
        assert_eq!(file.reconnect.factor, 2);
        assert_eq!(file.reconnect.max_secs, 300);
        assert_eq!(file.dispatch.max_pending, 100);
        assert_eq!(file.dispatch.chunk_size, 65536);
        assert_eq!(file.gateway.ping_interval_secs, 10);
    }

    #[test]
    fn missing_identity_is_config_error() {
        let err = ReceiverConfig::load(None, Some("ws://gw:8765"), None, None);
        assert!(matches!(err, Err(ReceiverError::Config(_))));
    }

    #[test]
    fn parse_full_file() {
        let toml_text = r#"
            [gateway]
            url = "wss://gw.example.test:8765"

            [identity]
            did = "did:wba:example.com:r1"
            key_file = "/etc/anpx/receiver.key"

            [dispatch]
            max_pending = 8
            queue_depth = 4
        "#;
        let file: ConfigFile = toml::from_str(toml_text).unwrap();
        assert_eq!(file.gateway.url, "wss://gw.example.test:8765");
        assert_eq!(file.identity.did, "did:wba:example.com:r1");
        assert_eq!(file.dispatch.max_pending, 8);
        assert_eq!(file.dispatch.queue_depth, 4);
    }
}
