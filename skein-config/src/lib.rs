//! Layered configuration loading utilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

const LIVE_PRIVATE_URL: &str = "wss://ws.okx.com:8443/ws/v5/private";
const SANDBOX_PRIVATE_URL: &str = "wss://wspap.okx.com:8443/ws/v5/private";

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub journal: JournalConfig,
}

/// API credential triple for the venue's private endpoints.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub passphrase: String,
}

/// Venue endpoint selection.
#[derive(Clone, Debug, Deserialize)]
pub struct ExchangeConfig {
    /// Route all traffic to the venue's paper-trading environment.
    #[serde(default = "default_sandbox")]
    pub sandbox: bool,
    #[serde(default)]
    pub rest_url: Option<String>,
}

/// Settings for the private streaming session.
#[derive(Clone, Debug, Deserialize)]
pub struct StreamConfig {
    /// Explicit endpoint override; otherwise derived from the sandbox switch.
    #[serde(default)]
    pub private_url: Option<String>,
    /// Silence threshold before a ping is sent.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// How long to wait for a pong before declaring the connection dead.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_subscribe_timeout_secs")]
    pub subscribe_timeout_secs: u64,
    /// Bounded queue depth for close events awaiting reconciliation.
    #[serde(default = "default_close_queue_depth")]
    pub close_queue_depth: usize,
    /// Bounded queue depth for raw position payloads.
    #[serde(default = "default_position_queue_depth")]
    pub position_queue_depth: usize,
    /// Bounded queue depth for order payloads.
    #[serde(default = "default_order_queue_depth")]
    pub order_queue_depth: usize,
    #[serde(default = "default_ssl_verify")]
    pub ssl_verify: bool,
}

/// REST client pacing and resilience settings.
#[derive(Clone, Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Durable storage location for the trade journal.
#[derive(Clone, Debug, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_journal_path")]
    pub path: PathBuf,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            sandbox: default_sandbox(),
            rest_url: None,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            private_url: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            subscribe_timeout_secs: default_subscribe_timeout_secs(),
            close_queue_depth: default_close_queue_depth(),
            position_queue_depth: default_position_queue_depth(),
            order_queue_depth: default_order_queue_depth(),
            ssl_verify: default_ssl_verify(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            rate_window_ms: default_rate_window_ms(),
            min_interval_ms: default_min_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: default_journal_path(),
        }
    }
}

impl StreamConfig {
    /// Resolve the private endpoint, honoring explicit overrides first.
    #[must_use]
    pub fn resolve_private_url(&self, sandbox: bool) -> String {
        if let Some(url) = &self.private_url {
            return url.clone();
        }
        if sandbox {
            SANDBOX_PRIVATE_URL.to_string()
        } else {
            LIVE_PRIVATE_URL.to_string()
        }
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs)
    }
}

impl ApiConfig {
    #[must_use]
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sandbox() -> bool {
    true
}

fn default_heartbeat_interval_secs() -> u64 {
    20
}

fn default_ping_timeout_secs() -> u64 {
    5
}

fn default_reconnect_interval_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_subscribe_timeout_secs() -> u64 {
    30
}

fn default_close_queue_depth() -> usize {
    100
}

fn default_position_queue_depth() -> usize {
    200
}

fn default_order_queue_depth() -> usize {
    500
}

fn default_ssl_verify() -> bool {
    true
}

fn default_rate_limit() -> u32 {
    10
}

fn default_rate_window_ms() -> u64 {
    2_000
}

fn default_min_interval_ms() -> u64 {
    200
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("./data/skein.db")
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `SKEIN__`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("SKEIN")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.stream.heartbeat_interval_secs, 20);
        assert_eq!(config.stream.ping_timeout_secs, 5);
        assert_eq!(config.stream.reconnect_interval_secs, 5);
        assert_eq!(config.stream.connect_timeout_secs, 30);
        assert_eq!(config.stream.close_queue_depth, 100);
        assert_eq!(config.stream.position_queue_depth, 200);
        assert_eq!(config.stream.order_queue_depth, 500);
        assert!(config.stream.ssl_verify);
        assert_eq!(config.api.rate_limit, 10);
        assert_eq!(config.api.rate_window_ms, 2_000);
        assert_eq!(config.api.min_interval_ms, 200);
        assert_eq!(config.api.max_retries, 3);
    }

    #[test]
    fn sandbox_switch_selects_paper_endpoint() {
        let stream = StreamConfig::default();
        assert!(stream.resolve_private_url(true).contains("wspap"));
        assert!(!stream.resolve_private_url(false).contains("wspap"));

        let pinned = StreamConfig {
            private_url: Some("wss://example.test/ws/v5/private".into()),
            ..StreamConfig::default()
        };
        assert_eq!(
            pinned.resolve_private_url(true),
            "wss://example.test/ws/v5/private"
        );
    }

    #[test]
    fn empty_sources_fall_back_to_defaults() {
        let config: AppConfig = Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.log_level, "info");
        assert!(config.exchange.sandbox);
    }
}
