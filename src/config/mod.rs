//! Configuration module
//!
//! TOML-based configuration for relaymq with support for:
//! - Broker connection parameters (endpoint, credentials, keep-alive)
//! - The four peer topics and optional extra routes
//! - Relay behavior (publish timeout, in-flight bounds)
//! - Metrics endpoint
//! - Environment variable overrides (RELAYMQ__* prefix)
//!
//! The loaded `Config` is an explicit immutable value passed into the
//! routing table builder and the connection manager at construction time;
//! nothing reads configuration from ambient global state.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::routing::Route;

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker connection configuration
    pub broker: BrokerConfig,
    /// Peer topic names
    pub topics: TopicsConfig,
    /// Relay behavior
    pub relay: RelayConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
    /// Extra routes appended after the two derived app/embedded pairs
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker address (host:port or just host)
    #[serde(default = "default_address")]
    pub address: String,

    /// Client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Keep-alive interval in seconds (0 disables the keep-alive timer)
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,

    /// Use clean session (no broker-side session persistence)
    #[serde(default = "default_true")]
    pub clean_session: bool,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Initial reconnect interval in seconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,

    /// Maximum reconnect interval in seconds (exponential backoff ceiling)
    #[serde(default = "default_max_reconnect_interval")]
    pub max_reconnect_interval: u64,

    /// Consecutive CONNACK refusals tolerated before giving up
    #[serde(default = "default_auth_retry_limit")]
    pub auth_retry_limit: u32,
}

fn default_address() -> String {
    "localhost:1883".to_string()
}

fn default_client_id() -> String {
    format!("relaymq-{}", std::process::id())
}

fn default_keepalive() -> u16 {
    60
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_reconnect_interval() -> u64 {
    1
}

fn default_max_reconnect_interval() -> u64 {
    60
}

fn default_auth_retry_limit() -> u32 {
    3
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keepalive: default_keepalive(),
            clean_session: true,
            connect_timeout: default_connect_timeout(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
            auth_retry_limit: default_auth_retry_limit(),
        }
    }
}

impl BrokerConfig {
    /// Get the connect timeout as Duration
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Get the initial reconnect interval as Duration
    pub fn reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }

    /// Get the maximum reconnect interval as Duration
    pub fn max_reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_interval)
    }

    /// Parse address into host and port
    pub fn parse_address(&self) -> (String, u16) {
        if let Some((host, port_str)) = self.address.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (self.address.clone(), 1883)
    }
}

/// Peer topic configuration
///
/// Each peer publishes on its `*_publish` topic and listens on its
/// `*_subscribe` topic; the bridge stitches the two pairs together.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TopicsConfig {
    /// Topic the app peer listens on
    pub app_subscribe: String,
    /// Topic the app peer publishes on
    pub app_publish: String,
    /// Topic the embedded peer listens on
    pub embedded_subscribe: String,
    /// Topic the embedded peer publishes on
    pub embedded_publish: String,
    /// Inbound subscription QoS (0 or 1)
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Match origin topics case-insensitively (compatibility option;
    /// MQTT topics are case-sensitive and that is the default here)
    #[serde(default)]
    pub case_insensitive: bool,
}

fn default_qos() -> u8 {
    1
}

/// An extra origin -> destination pair
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    /// Topic to subscribe on
    pub origin: String,
    /// Topic to re-publish to
    pub destination: String,
}

/// Relay behavior configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long an outbound publish may wait for its PUBACK before being
    /// reported as a delivery failure
    #[serde(with = "humantime_serde", default = "default_publish_timeout")]
    pub publish_timeout: Duration,

    /// Maximum concurrently tracked in-flight publishes
    #[serde(default = "default_max_inflight_publishes")]
    pub max_inflight_publishes: usize,

    /// Capacity of the outbound command queue toward the connection task
    #[serde(default = "default_command_queue_capacity")]
    pub command_queue_capacity: usize,

    /// Grace period granted to in-flight publishes on shutdown
    #[serde(with = "humantime_serde", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
}

fn default_publish_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_inflight_publishes() -> usize {
    64
}

fn default_command_queue_capacity() -> usize {
    1024
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            publish_timeout: default_publish_timeout(),
            max_inflight_publishes: default_max_inflight_publishes(),
            command_queue_capacity: default_command_queue_capacity(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the Prometheus endpoint is served
    pub enabled: bool,
    /// Bind address for the /metrics endpoint
    #[serde(default = "default_metrics_bind")]
    pub bind: SocketAddr,
}

fn default_metrics_bind() -> SocketAddr {
    "127.0.0.1:9464".parse().unwrap()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable
    /// overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax
    /// 2. Override via env vars: `RELAYMQ__` prefix with double underscores
    ///    for nesting:
    ///    - `RELAYMQ__BROKER__ADDRESS=broker:1883` overrides `broker.address`
    ///    - `RELAYMQ__TOPICS__APP_PUBLISH=a/pub` overrides `topics.app_publish`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("broker.address", "localhost:1883")?
            .set_default("broker.client_id", default_client_id())?
            .set_default("broker.keepalive", 60)?
            .set_default("broker.clean_session", true)?
            .set_default("broker.connect_timeout", 30)?
            .set_default("broker.reconnect_interval", 1)?
            .set_default("broker.max_reconnect_interval", 60)?
            .set_default("broker.auth_retry_limit", 3)?
            .set_default("topics.qos", 1)?
            .set_default("topics.case_insensitive", false)?
            .set_default("relay.publish_timeout", "5s")?
            .set_default("relay.max_inflight_publishes", 64)?
            .set_default("relay.command_queue_capacity", 1024)?
            .set_default("relay.shutdown_grace", "5s")?
            .set_default("metrics.enabled", false)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (RELAYMQ__BROKER__ADDRESS, etc.)
        let cfg = builder
            .add_source(
                Environment::with_prefix("RELAYMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("topics.app_subscribe", &self.topics.app_subscribe),
            ("topics.app_publish", &self.topics.app_publish),
            ("topics.embedded_subscribe", &self.topics.embedded_subscribe),
            ("topics.embedded_publish", &self.topics.embedded_publish),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Validation(format!("{} is required", name)));
            }
        }

        if self.topics.qos > 1 {
            return Err(ConfigError::Validation(
                "topics.qos must be 0 or 1".to_string(),
            ));
        }

        if self.broker.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "broker.client_id must not be empty".to_string(),
            ));
        }

        if self.broker.reconnect_interval == 0 {
            return Err(ConfigError::Validation(
                "broker.reconnect_interval must be at least 1 second".to_string(),
            ));
        }

        if self.broker.max_reconnect_interval < self.broker.reconnect_interval {
            return Err(ConfigError::Validation(
                "broker.max_reconnect_interval must be >= broker.reconnect_interval".to_string(),
            ));
        }

        if self.relay.max_inflight_publishes == 0 {
            return Err(ConfigError::Validation(
                "relay.max_inflight_publishes must be at least 1".to_string(),
            ));
        }

        if self.relay.command_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "relay.command_queue_capacity must be at least 1".to_string(),
            ));
        }

        if self.relay.publish_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "relay.publish_timeout must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Derive the routing table input.
    ///
    /// The app peer's publish topic routes to the embedded peer's subscribe
    /// topic and vice versa; extra `[[routes]]` entries follow in order.
    /// Duplicate origins are caught by `RoutingTable::build`.
    pub fn routes(&self) -> Vec<Route> {
        let mut routes = vec![
            Route::new(&self.topics.app_publish, &self.topics.embedded_subscribe),
            Route::new(&self.topics.embedded_publish, &self.topics.app_subscribe),
        ];
        for extra in &self.routes {
            routes.push(Route::new(&extra.origin, &extra.destination));
        }
        routes
    }
}
