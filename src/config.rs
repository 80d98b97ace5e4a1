//! Configuration management for Gatekeeper.
//!
//! Configuration is read once at startup: an optional YAML/TOML file layered
//! under `GATEKEEPER__*` environment variables (`__` separates sections, e.g.
//! `GATEKEEPER__LIMITER__BYPASS_TOKEN`). There is no hot reload.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{
    BypassPolicy, EmergencyToken, FailurePolicy, LimitSpec, LimiterOptions, RedisStoreConfig,
    RuleCatalog, RuleMode, Whitelist,
};

const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Decision engine configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Fast counter store
    #[serde(default)]
    pub redis: RedisConfig,

    /// Durable fallback store
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limit entries layered over the built-in catalog
    #[serde(default)]
    pub limits: HashMap<String, LimitSpec>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Reverse proxies (addresses or CIDR ranges) whose `X-Forwarded-For` /
    /// `X-Real-IP` headers are honored. Empty means the socket peer is
    /// always the client.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Decision engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Timeout for each store call in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// How long to skip the fast store after it fails, in milliseconds
    #[serde(default = "default_fast_store_cooldown")]
    pub fast_store_cooldown_ms: u64,

    /// How multiple rules in one config combine
    #[serde(default)]
    pub rule_mode: RuleMode,

    /// Decision when no store can count a request
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Trusted addresses or CIDR ranges
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Header carrying the emergency bypass token
    #[serde(default = "default_bypass_header")]
    pub bypass_header: String,

    /// Emergency bypass secret; unset disables the bypass
    #[serde(default)]
    pub bypass_token: Option<String>,

    /// Capacity of the violation event buffer
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Seconds between purges of expired counters and blocks
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: default_store_timeout(),
            fast_store_cooldown_ms: default_fast_store_cooldown(),
            rule_mode: RuleMode::default(),
            failure_policy: FailurePolicy::default(),
            whitelist: Vec::new(),
            bypass_header: default_bypass_header(),
            bypass_token: None,
            event_buffer: default_event_buffer(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_store_timeout() -> u64 {
    250
}

fn default_fast_store_cooldown() -> u64 {
    5000
}

fn default_bypass_header() -> String {
    "x-emergency-bypass".to_string()
}

fn default_event_buffer() -> usize {
    1024
}

fn default_sweep_interval() -> u64 {
    60
}

/// Redis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix for every key written
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_key_prefix() -> String {
    "gatekeeper:".to_string()
}

/// Durable fallback store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL; unset disables the durable fallback
    #[serde(default = "default_database_url")]
    pub url: Option<String>,

    /// Pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_url() -> Option<String> {
    Some("sqlite://gatekeeper.db".to_string())
}

fn default_max_connections() -> u32 {
    4
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,

    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl GatekeeperConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("limiter.whitelist")
                .with_list_parse_key("server.trusted_proxies")
                .try_parsing(true),
        );

        let config: GatekeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path, ignoring the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig =
            serde_yaml::from_str(yaml).map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would only fail later.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.store_timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "limiter.store_timeout_ms must be greater than zero".to_string(),
            ));
        }
        http::HeaderName::from_bytes(self.limiter.bypass_header.as_bytes()).map_err(|_| {
            GatekeeperError::Config(format!(
                "invalid bypass header name: {}",
                self.limiter.bypass_header
            ))
        })?;
        if self.limiter.sweep_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "limiter.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        self.bypass_policy()?;
        self.trusted_proxies()?;
        self.catalog()?;
        Ok(())
    }

    /// The rule catalog: built-ins plus configured entries.
    pub fn catalog(&self) -> Result<RuleCatalog> {
        RuleCatalog::with_overrides(&self.limits)
    }

    /// Peers allowed to report the client address.
    pub fn trusted_proxies(&self) -> Result<Whitelist> {
        Whitelist::parse(self.server.trusted_proxies.as_slice())
    }

    /// How often expired counters and blocks are purged.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.limiter.sweep_interval_secs)
    }

    /// Whitelist and emergency token.
    pub fn bypass_policy(&self) -> Result<BypassPolicy> {
        let whitelist = Whitelist::parse(self.limiter.whitelist.as_slice())?;
        let emergency = EmergencyToken::new(self.limiter.bypass_token.as_deref());
        Ok(BypassPolicy::new(whitelist, emergency))
    }

    pub fn limiter_options(&self) -> LimiterOptions {
        LimiterOptions {
            store_timeout: Duration::from_millis(self.limiter.store_timeout_ms),
            rule_mode: self.limiter.rule_mode,
            failure_policy: self.limiter.failure_policy,
            fast_store_cooldown: Duration::from_millis(self.limiter.fast_store_cooldown_ms),
        }
    }

    pub fn redis_store_config(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            key_prefix: self.redis.key_prefix.clone(),
        }
    }
}
