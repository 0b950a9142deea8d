//! Configuration management for Ratewarden.
//!
//! Configuration is layered: compiled-in defaults, then an optional YAML
//! file, then `RATEWARDEN__SECTION__FIELD` environment variables.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{RatewardenError, Result};
use crate::ratelimit::MAX_WINDOW_MS;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatewardenConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared state store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Node identity and liveness configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Upper bound on a single store round-trip made on behalf of a request
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// The store timeout as a [`Duration`].
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_store_timeout_ms() -> u64 {
    500
}

/// Which store implementation backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// A Redis server shared by every node
    Redis,
    /// Process-local state, only exact within a single node
    Memory,
}

/// Shared state store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend kind
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Number of multiplexed connections to round-robin across
    #[serde(default = "default_connection_count")]
    pub connection_count: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_store_url(),
            connection_count: default_connection_count(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connection_count() -> usize {
    4
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Limit applied when a request omits one
    #[serde(default = "default_limit")]
    pub default_limit: i64,

    /// Window applied when a request omits one
    #[serde(default = "default_window_ms")]
    pub default_window_ms: i64,

    /// Extra lifetime granted to a key's backing structures past the window
    #[serde(default = "default_ttl_buffer_ms")]
    pub ttl_buffer_ms: u64,

    /// Upper bound of random jitter added to `Retry-After`; 0 disables it
    #[serde(default)]
    pub retry_jitter_ms: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_window_ms: default_window_ms(),
            ttl_buffer_ms: default_ttl_buffer_ms(),
            retry_jitter_ms: 0,
        }
    }
}

fn default_limit() -> i64 {
    100
}

fn default_window_ms() -> i64 {
    60_000
}

fn default_ttl_buffer_ms() -> u64 {
    1_000
}

/// Node identity and liveness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Address advertised to peers; defaults to the HTTP address
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Lifetime of the presence record between heartbeats
    #[serde(default = "default_heartbeat_ttl_secs")]
    pub heartbeat_ttl_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            advertise_addr: None,
            heartbeat_ttl_secs: default_heartbeat_ttl_secs(),
        }
    }
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_heartbeat_ttl_secs() -> u64 {
    15
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl RatewardenConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatewardenConfig =
            serde_yaml::from_str(yaml).map_err(|e| RatewardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load layered configuration: defaults, then the optional YAML file,
    /// then environment variables such as `RATEWARDEN__STORE__URL`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(path, config::FileFormat::Yaml).required(true),
            );
        }

        let config: RatewardenConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that can never produce a working node.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.default_limit < 0 {
            return Err(RatewardenError::Config(
                "rate_limiting.default_limit must be >= 0".to_string(),
            ));
        }
        if self.rate_limiting.default_window_ms <= 0
            || self.rate_limiting.default_window_ms > MAX_WINDOW_MS
        {
            return Err(RatewardenError::Config(format!(
                "rate_limiting.default_window_ms must be in 1..={}",
                MAX_WINDOW_MS
            )));
        }
        if self.rate_limiting.ttl_buffer_ms > MAX_WINDOW_MS as u64 {
            return Err(RatewardenError::Config(format!(
                "rate_limiting.ttl_buffer_ms must be <= {}",
                MAX_WINDOW_MS
            )));
        }
        if self.store.connection_count == 0 {
            return Err(RatewardenError::Config(
                "store.connection_count must be > 0".to_string(),
            ));
        }
        if self.node.heartbeat_ttl_secs == 0 {
            return Err(RatewardenError::Config(
                "node.heartbeat_ttl_secs must be > 0".to_string(),
            ));
        }
        if self.node.node_id.is_empty() {
            return Err(RatewardenError::Config("node.node_id must not be empty".to_string()));
        }
        Ok(())
    }

    /// The address this node advertises in its presence record.
    pub fn advertise_addr(&self) -> String {
        self.node
            .advertise_addr
            .clone()
            .unwrap_or_else(|| self.server.http_addr.to_string())
    }
}
