//! Configuration loading, presets and validation.
//!
//! [`Config`] collects every tunable of the crate: broker endpoint, session
//! behaviour, reconnect policy, token lifecycle, request/response and the
//! offline queue. Sections are `#[serde(default)]`, so a TOML file only needs
//! the keys it changes.
//!
//! A `preset` names a bundle of values tuned for a class of network. When a
//! file sets both a preset and explicit keys, the explicit keys win:
//!
//! ```toml
//! preset = "mobile"
//! host = "broker.example.com"
//! resubscribe_delay_ms = 250   # overrides the mobile bundle
//!
//! [token]
//! service_url = "https://tokens.example.com"
//! ```

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    correlation::IdFormat,
    transport::{qos_from_u8, ConnectOptions, ProtocolVersion},
};

pub mod logger;
mod tls;

pub use logger::{ConsoleConfig, JournaldConfig, LogFormat, LoggerConfig};
pub use tls::TlsConfig;

/// Prints a timestamped line before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        $crate::config::early_print($crate::config::EarlyLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        $crate::config::early_print($crate::config::EarlyLevel::Warn, format_args!($($arg)*))
    };
}

#[doc(hidden)]
#[derive(Debug, Clone, Copy)]
pub enum EarlyLevel {
    Info,
    Warn,
}

#[doc(hidden)]
pub fn early_print(level: EarlyLevel, args: fmt::Arguments<'_>) {
    let timestamp = time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    let label = match level {
        EarlyLevel::Info => console::style("INFO").green(),
        EarlyLevel::Warn => console::style("WARN").yellow(),
    };
    println!("{}  {} {}", console::style(timestamp).dim(), label, args);
}

/// Errors raised while locating, parsing or validating a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Named bundles of connection tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// The plain defaults.
    Default,
    /// Short timeouts and a small reconnect budget, for LAN brokers.
    Fast,
    /// Long timeouts, unlimited reconnects and a large offline queue.
    Reliable,
    /// Staggered resubscribe and a settling delay, for cellular links.
    Mobile,
    /// Mobile tuning with longer delays, for links that drop constantly.
    Unstable,
}

/// Credential lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TokenConfig {
    /// Base URL of the token service; required by `TokenManager::new`.
    #[validate(length(min = 1, max = 2048))]
    pub service_url: Option<String>,

    /// Refresh on schedule instead of only on demand.
    pub auto_refresh: bool,

    /// How long before expiry to refresh when the service gives no hint.
    #[validate(range(max = 86_400))]
    pub refresh_buffer_seconds: u64,

    /// Total refresh attempts before giving up.
    #[validate(range(min = 1, max = 20))]
    pub max_refresh_retries: u32,

    pub refresh_retry_delay_ms: u64,

    #[validate(range(min = 100))]
    pub http_timeout_ms: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            service_url: None,
            auto_refresh: true,
            refresh_buffer_seconds: 300,
            max_refresh_retries: 3,
            refresh_retry_delay_ms: 5_000,
            http_timeout_ms: 10_000,
        }
    }
}

impl TokenConfig {
    pub fn refresh_retry_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_retry_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

/// Request/response settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RequestConfig {
    /// Subscribe to the reply topic on every (re)connect.
    pub enabled: bool,

    /// Default per-request timeout.
    #[validate(range(min = 1))]
    pub timeout_ms: u64,

    /// Reply topic; `{client_id}` is replaced by the session's client id.
    #[validate(length(min = 1, max = 1024))]
    pub response_topic_pattern: String,

    pub correlation_id_prefix: Option<String>,

    pub id_format: IdFormat,

    /// Add a `timestamp` (epoch ms) field to object payloads.
    pub include_timestamps: bool,

    /// Add a `senderId` field to object payloads.
    pub include_sender_id: bool,

    /// MQTT 5 message expiry for requests, in seconds.
    pub message_expiry_interval: Option<u32>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 30_000,
            response_topic_pattern: "responses/{client_id}".to_string(),
            correlation_id_prefix: Some("req".to_string()),
            id_format: IdFormat::Sequential,
            include_timestamps: true,
            include_sender_id: true,
            message_expiry_interval: None,
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn response_topic(&self, client_id: &str) -> String {
        self.response_topic_pattern.replace("{client_id}", client_id)
    }
}

/// Buffering of publishes made while disconnected.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OfflineQueueConfig {
    pub enabled: bool,

    #[validate(range(min = 1, max = 1_000_000))]
    pub max_size: usize,

    /// At capacity: evict the oldest entry (`true`) or reject the new one.
    pub drop_oldest: bool,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100,
            drop_oldest: true,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Applied underneath explicit keys by [`Config::load`] and [`Config::from_toml_str`].
    pub preset: Option<Preset>,

    #[validate(length(min = 1, max = 255))]
    pub host: String,

    #[validate(range(min = 1))]
    pub port: u16,

    /// TLS with platform roots when no `[tls]` section is given.
    pub use_tls: bool,

    /// Empty means a random id is generated per supervisor.
    #[validate(length(max = 256))]
    pub client_id: String,

    /// Keep-alive interval in seconds.
    #[validate(range(min = 5, max = 65_535))]
    pub keep_alive: u64,

    #[validate(range(min = 100))]
    pub connect_timeout_ms: u64,

    /// Delay before the first reconnect attempt.
    #[validate(range(min = 10))]
    pub reconnect_period_ms: u64,

    #[validate(range(min = 10))]
    pub max_reconnect_delay_ms: u64,

    #[validate(range(min = 1.0, max = 10.0))]
    pub reconnect_backoff_multiplier: f64,

    /// 0 means unlimited.
    pub max_reconnect_attempts: u32,

    pub protocol_version: ProtocolVersion,

    pub clean_session: bool,

    #[validate(range(max = 2))]
    pub default_qos: u8,

    #[validate(range(min = 1024, max = 268_435_455))]
    pub max_packet_size: usize,

    #[validate(range(min = 1, max = 10_000))]
    pub request_channel_capacity: usize,

    #[validate(range(min = 1))]
    pub max_inflight: u16,

    /// Keep retrying after the broker rejects credentials.
    pub reconnect_on_auth_error: bool,

    /// Auth rejections tolerated when `reconnect_on_auth_error` is set.
    pub max_auth_retries: u32,

    /// Settling delay between the connect acknowledgment and the flush.
    pub post_connect_delay_ms: u64,

    pub resubscribe_delay_ms: u64,

    pub staggered_resubscribe: bool,

    #[validate(nested)]
    pub token: TokenConfig,

    #[validate(nested)]
    pub request: RequestConfig,

    #[validate(nested)]
    pub offline_queue: OfflineQueueConfig,

    #[validate(nested)]
    pub tls: Option<TlsConfig>,

    #[validate(nested)]
    pub logger: LoggerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preset: None,
            host: "localhost".to_string(),
            port: 1883,
            use_tls: false,
            client_id: String::new(),
            keep_alive: 60,
            connect_timeout_ms: 30_000,
            reconnect_period_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            reconnect_backoff_multiplier: 2.0,
            max_reconnect_attempts: 10,
            protocol_version: ProtocolVersion::V5,
            clean_session: true,
            default_qos: 1,
            max_packet_size: 256 * 1024,
            request_channel_capacity: 64,
            max_inflight: 100,
            reconnect_on_auth_error: false,
            max_auth_retries: 0,
            post_connect_delay_ms: 0,
            resubscribe_delay_ms: 100,
            staggered_resubscribe: false,
            token: TokenConfig::default(),
            request: RequestConfig::default(),
            offline_queue: OfflineQueueConfig::default(),
            tls: None,
            logger: LoggerConfig::default(),
        }
    }
}

impl Config {
    /// Defaults with `preset` applied.
    pub fn from_preset(preset: Preset) -> Self {
        let mut config = Self {
            preset: Some(preset),
            ..Self::default()
        };
        match preset {
            Preset::Default => {}
            Preset::Fast => {
                config.keep_alive = 30;
                config.connect_timeout_ms = 10_000;
                config.reconnect_period_ms = 500;
                config.max_reconnect_delay_ms = 5_000;
                config.max_reconnect_attempts = 5;
                config.token.refresh_retry_delay_ms = 1_000;
                config.request.timeout_ms = 10_000;
            }
            Preset::Reliable => {
                config.connect_timeout_ms = 60_000;
                config.reconnect_period_ms = 2_000;
                config.max_reconnect_delay_ms = 120_000;
                config.max_reconnect_attempts = 0;
                config.offline_queue.max_size = 1_000;
                config.token.max_refresh_retries = 5;
            }
            Preset::Mobile => {
                config.keep_alive = 120;
                config.connect_timeout_ms = 45_000;
                config.reconnect_period_ms = 3_000;
                config.max_reconnect_delay_ms = 60_000;
                config.max_reconnect_attempts = 0;
                config.post_connect_delay_ms = 500;
                config.staggered_resubscribe = true;
                config.resubscribe_delay_ms = 200;
                config.offline_queue.max_size = 500;
            }
            Preset::Unstable => {
                config.keep_alive = 120;
                config.connect_timeout_ms = 60_000;
                config.reconnect_period_ms = 5_000;
                config.max_reconnect_delay_ms = 120_000;
                config.max_reconnect_attempts = 0;
                config.post_connect_delay_ms = 1_000;
                config.staggered_resubscribe = true;
                config.resubscribe_delay_ms = 500;
                config.offline_queue.max_size = 1_000;
                config.token.max_refresh_retries = 5;
            }
        }
        config
    }

    /// Locates and loads the configuration file.
    ///
    /// Priority: `TETHER_CONFIG`, then `/etc/tether/config.toml`.
    pub fn new() -> Result<Self, ConfigError> {
        let path = Self::get_config_path()?;
        Self::load(&path)
    }

    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var("TETHER_CONFIG") {
            let path = PathBuf::from(path);
            print_info!("Using config from TETHER_CONFIG: {}", path.display());
            return Ok(path);
        }

        let fallback = Path::new("/etc/tether/config.toml");
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config("No configuration file found.".to_string()))
    }

    /// Reads, merges over the preset, and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());
        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses TOML text; keys present in `raw` override the preset bundle.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let overrides: toml::Table =
            toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let preset = match overrides.get("preset") {
            Some(value) => Some(
                value
                    .clone()
                    .try_into::<Preset>()
                    .map_err(|e| ConfigError::ParseError(format!("preset: {e}")))?,
            ),
            None => None,
        };

        let config = match preset {
            Some(preset) => {
                let base = match toml::Value::try_from(Self::from_preset(preset)) {
                    Ok(toml::Value::Table(table)) => table,
                    Ok(_) => toml::Table::new(),
                    Err(e) => return Err(ConfigError::ParseError(e.to_string())),
                };
                let merged = merge_tables(base, overrides);
                toml::Value::Table(merged)
                    .try_into::<Config>()
                    .map_err(|e| ConfigError::ParseError(e.to_string()))?
            }
            None => toml::Value::Table(overrides)
                .try_into::<Config>()
                .map_err(|e| ConfigError::ParseError(e.to_string()))?,
        };

        config.validate_all()?;
        Ok(config)
    }

    /// `validator` checks plus the cross-field rules.
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        if self.max_reconnect_delay_ms < self.reconnect_period_ms {
            return Err(ConfigError::ValidationError(
                "max_reconnect_delay_ms must not be below reconnect_period_ms".into(),
            ));
        }
        if let Some(tls) = &self.tls {
            tls.validate_config()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }
        Ok(())
    }

    pub fn default_qos(&self) -> QoS {
        qos_from_u8(self.default_qos)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn post_connect_delay(&self) -> Duration {
        Duration::from_millis(self.post_connect_delay_ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }

    /// Transport options for `client_id`, without credentials or will.
    pub fn connect_options(&self, client_id: &str) -> ConnectOptions {
        ConnectOptions {
            host: self.host.clone(),
            port: self.port,
            use_tls: self.use_tls || self.tls.is_some(),
            client_id: client_id.to_string(),
            keep_alive: Duration::from_secs(self.keep_alive),
            protocol: self.protocol_version,
            clean_session: self.clean_session,
            credentials: None,
            reconnect_period: Duration::from_millis(self.reconnect_period_ms),
            max_reconnect_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            backoff_multiplier: self.reconnect_backoff_multiplier,
            will: None,
            max_packet_size: self.max_packet_size,
            request_channel_capacity: self.request_channel_capacity,
            max_inflight: self.max_inflight,
            tls: self.tls.clone(),
        }
    }
}

fn merge_tables(mut base: toml::Table, overrides: toml::Table) -> toml::Table {
    for (key, value) in overrides {
        match (base.remove(&key), value) {
            (Some(toml::Value::Table(inner)), toml::Value::Table(over)) => {
                base.insert(key, toml::Value::Table(merge_tables(inner, over)));
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
    base
}
