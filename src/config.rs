//! Proxy configuration
//!
//! Loaded from a TOML file; every key is optional and falls back to the
//! defaults below.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Proxy server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Bind address for the proxy listener
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Loopback port for the admin endpoint; disabled when unset
    #[serde(default)]
    pub admin_port: Option<u16>,
    /// Hosts-file formatted blocklist
    #[serde(default = "default_blocklist_path")]
    pub blocklist_path: PathBuf,
    /// Append-only visit log
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,
    /// Initial value of the blocking toggle
    #[serde(default = "default_blocking_enabled")]
    pub blocking_enabled: bool,
    /// Initial value of the private mode toggle
    #[serde(default)]
    pub private_mode: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_keep_alive_timeout_secs")]
    pub keep_alive_timeout_secs: u64,
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn, error. `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Write daily rolling log files here instead of stderr
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("quietproxy"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9090
}
fn default_blocklist_path() -> PathBuf {
    data_dir().join("hosts")
}
fn default_history_path() -> PathBuf {
    data_dir().join("history")
}
fn default_blocking_enabled() -> bool {
    true
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_response_timeout_ms() -> u64 {
    30_000
}
fn default_keep_alive_timeout_secs() -> u64 {
    30
}
fn default_max_request_body_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            admin_port: None,
            blocklist_path: default_blocklist_path(),
            history_path: default_history_path(),
            blocking_enabled: default_blocking_enabled(),
            private_mode: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            keep_alive_timeout_secs: default_keep_alive_timeout_secs(),
            max_request_body_bytes: default_max_request_body_bytes(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

impl ProxyConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("parsing config TOML")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }
}
