//! Gateway configuration: TOML file + CLI overrides.

use crate::error::{GatewayError, GatewayResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub ws: WsSection,
    #[serde(default)]
    pub tls: Option<TlsSection>,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub keepalive: KeepaliveSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub jwt: Option<JwtSection>,
    #[serde(default)]
    pub receivers: Vec<ReceiverEntry>,
}

/// `[http]` section: public HTTP ingress bind address.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_host")]
    pub bind_host: String,
    #[serde(default = "default_http_port")]
    pub bind_port: u16,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind_host: default_host(),
            bind_port: default_http_port(),
        }
    }
}

/// `[ws]` section: tunnel endpoint bind address.
#[derive(Debug, Clone, Deserialize)]
pub struct WsSection {
    #[serde(default = "default_host")]
    pub bind_host: String,
    #[serde(default = "default_ws_port")]
    pub bind_port: u16,
}

impl Default for WsSection {
    fn default() -> Self {
        Self {
            bind_host: default_host(),
            bind_port: default_ws_port(),
        }
    }
}

/// Client certificate verification policy for the WSS endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    None,
    Optional,
    Required,
}

/// `[tls]` section. When absent the tunnel endpoint runs plain `ws://`
/// (development only).
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSection {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default = "default_verify_mode")]
    pub verify_mode: VerifyMode,
}

/// `[limits]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_pending")]
    pub max_pending_per_connection: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_body_max")]
    pub body_max_bytes: usize,
    #[serde(default = "default_reassembly_ttl")]
    pub reassembly_idle_ttl_secs: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_pending_per_connection: default_max_pending(),
            request_timeout_secs: default_request_timeout(),
            chunk_size: default_chunk_size(),
            body_max_bytes: default_body_max(),
            reassembly_idle_ttl_secs: default_reassembly_ttl(),
        }
    }
}

/// `[keepalive]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct KeepaliveSection {
    #[serde(default = "default_keepalive_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_keepalive_timeout")]
    pub timeout_secs: u64,
}

impl Default for KeepaliveSection {
    fn default() -> Self {
        Self {
            interval_secs: default_keepalive_interval(),
            timeout_secs: default_keepalive_timeout(),
        }
    }
}

/// `[auth]` section: DID-WBA admission windows.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_window")]
    pub nonce_window_secs: u64,
    #[serde(default = "default_window")]
    pub timestamp_window_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            nonce_window_secs: default_window(),
            timestamp_window_secs: default_window(),
        }
    }
}

/// `[jwt]` section: optional RS256 token issuance after admission.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtSection {
    pub private_key_file: PathBuf,
    pub public_key_file: PathBuf,
    #[serde(default = "default_jwt_ttl")]
    pub ttl_secs: u64,
}

/// `[[receivers]]` entry: one authorized receiver identity.
///
/// `public_key` is the hex-encoded 32-byte ed25519 verification key
/// published by the receiver's DID document; `services` are the service
/// URLs this DID may serve.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverEntry {
    pub did: String,
    #[serde(default = "default_verification_method")]
    pub verification_method: String,
    pub public_key: String,
    pub services: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_ws_port() -> u16 {
    8765
}
fn default_verify_mode() -> VerifyMode {
    VerifyMode::None
}
fn default_max_connections() -> usize {
    100
}
fn default_max_pending() -> usize {
    100
}
fn default_request_timeout() -> u64 {
    30
}
fn default_chunk_size() -> usize {
    64 * 1024
}
fn default_body_max() -> usize {
    16 * 1024 * 1024
}
fn default_reassembly_ttl() -> u64 {
    300
}
fn default_keepalive_interval() -> u64 {
    10
}
fn default_keepalive_timeout() -> u64 {
    120
}
fn default_window() -> u64 {
    300
}
fn default_jwt_ttl() -> u64 {
    3600
}
fn default_verification_method() -> String {
    "key-1".to_string()
}

/// Resolved gateway configuration (file values + CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_bind: (String, u16),
    pub ws_bind: (String, u16),
    pub tls: Option<TlsSection>,
    pub max_connections: usize,
    pub max_pending_per_connection: usize,
    pub request_timeout: Duration,
    pub chunk_size: usize,
    pub body_max_bytes: usize,
    pub reassembly_idle_ttl: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub nonce_window: Duration,
    pub timestamp_window: Duration,
    pub jwt: Option<JwtSection>,
    pub receivers: Vec<ReceiverEntry>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults apply. A file that exists
    /// but fails to parse is a `Config` error.
    pub fn load(
        config_path: Option<&Path>,
        cli_http_port: Option<u16>,
        cli_ws_port: Option<u16>,
    ) -> GatewayResult<Self> {
        let file = match config_path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)
                    .map_err(|e| GatewayError::Config(format!("cannot read config: {e}")))?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| GatewayError::Config(format!("config parse error: {e}")))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        let config = Self {
            http_bind: (
                file.http.bind_host,
                cli_http_port.unwrap_or(file.http.bind_port),
            ),
            ws_bind: (file.ws.bind_host, cli_ws_port.unwrap_or(file.ws.bind_port)),
            tls: file.tls,
            max_connections: file.limits.max_connections,
            max_pending_per_connection: file.limits.max_pending_per_connection,
            request_timeout: Duration::from_secs(file.limits.request_timeout_secs),
            chunk_size: file.limits.chunk_size,
            body_max_bytes: file.limits.body_max_bytes,
            reassembly_idle_ttl: Duration::from_secs(file.limits.reassembly_idle_ttl_secs),
            keepalive_interval: Duration::from_secs(file.keepalive.interval_secs),
            keepalive_timeout: Duration::from_secs(file.keepalive.timeout_secs),
            nonce_window: Duration::from_secs(file.auth.nonce_window_secs),
            timestamp_window: Duration::from_secs(file.auth.timestamp_window_secs),
            jwt: file.jwt,
            receivers: file.receivers,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> GatewayResult<()> {
        if self.chunk_size == 0 {
            return Err(GatewayError::Config("chunk_size must be non-zero".into()));
        }
        if self.max_pending_per_connection == 0 {
            return Err(GatewayError::Config(
                "max_pending_per_connection must be non-zero".into(),
            ));
        }
        for entry in &self.receivers {
            let key = hex::decode(&entry.public_key)
                .map_err(|e| GatewayError::Config(format!("receiver {}: bad public_key: {e}", entry.did)))?;
            if key.len() != 32 {
                return Err(GatewayError::Config(format!(
                    "receiver {}: public_key must be 32 bytes, got {}",
                    entry.did,
                    key.len()
                )));
            }
            if entry.services.is_empty() {
                return Err(GatewayError::Config(format!(
                    "receiver {}: empty services list",
                    entry.did
                )));
            }
        }
        Ok(())
    }
}
