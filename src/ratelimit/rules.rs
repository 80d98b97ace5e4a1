//! Rate limit rules and the rule catalog.
//!
//! The catalog is a static table from a configuration key (endpoint class,
//! operation type, or role tier) to a [`RateLimitConfig`]. It is built once at
//! startup from the built-in defaults plus any configured overrides, and is
//! never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{GatekeeperError, Result};

/// Key of the generic authenticated API bucket, the only role-aware key.
pub const AUTHENTICATED_API_KEY: &str = "api";
/// Key of the conservative tier used for anonymous traffic and unknown keys.
pub const PUBLIC_KEY: &str = "public";

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Caller role, as supplied by the surrounding authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    SecurityLead,
}

impl Role {
    /// Catalog key of the authenticated API tier for this role.
    pub fn api_tier_key(&self) -> &'static str {
        match self {
            Role::User => AUTHENTICATED_API_KEY,
            Role::Admin => "api:admin",
            Role::SecurityLead => "api:security_lead",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::SecurityLead => "security_lead",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            "security_lead" | "security-lead" => Ok(Role::SecurityLead),
            other => Err(GatekeeperError::Config(format!("unknown role: {}", other))),
        }
    }
}

/// How multiple rules in one config combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    /// Every rule must pass for the request to be admitted.
    #[default]
    All,
    /// A single passing rule admits the request.
    Any,
}

/// Serialized form of a rule, validated into [`RateLimitRule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRule {
    requests_allowed: u64,
    window_secs: u64,
}

/// A single quota: at most `requests_allowed` requests per `window`.
///
/// Invariants (`requests_allowed >= 1`, non-zero window) are enforced by
/// [`RateLimitRule::new`] and by deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRule", into = "RawRule")]
pub struct RateLimitRule {
    requests_allowed: u64,
    window: Duration,
}

impl RateLimitRule {
    /// Create a rule, rejecting a zero quota or an empty window.
    pub fn new(requests_allowed: u64, window: Duration) -> Result<Self> {
        if requests_allowed == 0 {
            return Err(GatekeeperError::Config(
                "requests_allowed must be at least 1".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(GatekeeperError::Config(
                "window duration must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            requests_allowed,
            window,
        })
    }

    pub fn requests_allowed(&self) -> u64 {
        self.requests_allowed
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Unvalidated constructor for the built-in table.
    fn builtin(requests_allowed: u64, window_secs: u64) -> Self {
        Self {
            requests_allowed,
            window: Duration::from_secs(window_secs),
        }
    }
}

impl TryFrom<RawRule> for RateLimitRule {
    type Error = GatekeeperError;

    fn try_from(raw: RawRule) -> Result<Self> {
        Self::new(raw.requests_allowed, Duration::from_secs(raw.window_secs))
    }
}

impl From<RateLimitRule> for RawRule {
    fn from(rule: RateLimitRule) -> Self {
        Self {
            requests_allowed: rule.requests_allowed,
            window_secs: rule.window.as_secs(),
        }
    }
}

/// The enforced policy for one configuration key.
///
/// Fields are private so every instance goes through [`RateLimitConfig::new`]
/// and always carries at least one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// The key counters are tracked under
    key: String,
    /// Ordered rules; the first is the primary enforcement rule
    rules: Vec<RateLimitRule>,
    /// Penalty block applied after a violation
    block_duration: Option<Duration>,
}

impl RateLimitConfig {
    /// Create a config, rejecting an empty rule list or a zero block duration.
    pub fn new(
        key: impl Into<String>,
        rules: Vec<RateLimitRule>,
        block_duration: Option<Duration>,
    ) -> Result<Self> {
        let key = key.into();
        if rules.is_empty() {
            return Err(GatekeeperError::Config(format!(
                "rate limit config '{}' has no rules",
                key
            )));
        }
        if block_duration.is_some_and(|d| d.is_zero()) {
            return Err(GatekeeperError::Config(format!(
                "rate limit config '{}' has a zero block duration",
                key
            )));
        }
        Ok(Self {
            key,
            rules,
            block_duration,
        })
    }

    /// Shorthand for a single-rule config.
    pub fn single(
        key: impl Into<String>,
        requests_allowed: u64,
        window: Duration,
        block_duration: Option<Duration>,
    ) -> Result<Self> {
        Self::new(
            key,
            vec![RateLimitRule::new(requests_allowed, window)?],
            block_duration,
        )
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Ordered rules, never empty.
    pub fn rules(&self) -> &[RateLimitRule] {
        &self.rules
    }

    pub fn block_duration(&self) -> Option<Duration> {
        self.block_duration
    }

    /// The primary enforcement rule.
    pub fn primary(&self) -> &RateLimitRule {
        &self.rules[0]
    }

    fn builtin(key: &str, rule: RateLimitRule, block_secs: Option<u64>) -> Self {
        Self {
            key: key.to_string(),
            rules: vec![rule],
            block_duration: block_secs.map(Duration::from_secs),
        }
    }
}

/// Configuration-file form of a [`RateLimitConfig`]; the key comes from the
/// enclosing map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSpec {
    pub rules: Vec<RateLimitRule>,
    #[serde(default)]
    pub block_duration_secs: Option<u64>,
}

impl LimitSpec {
    /// Validate into a config under `key`.
    pub fn into_config(self, key: &str) -> Result<RateLimitConfig> {
        RateLimitConfig::new(
            key,
            self.rules,
            self.block_duration_secs.map(Duration::from_secs),
        )
    }
}

/// Immutable lookup table from configuration key to policy.
#[derive(Debug, Clone)]
pub struct RuleCatalog {
    configs: HashMap<String, RateLimitConfig>,
    default: RateLimitConfig,
}

impl RuleCatalog {
    /// The built-in catalog.
    pub fn builtin() -> Self {
        let entries = [
            RateLimitConfig::builtin(PUBLIC_KEY, RateLimitRule::builtin(60, MINUTE), None),
            RateLimitConfig::builtin(
                "auth",
                RateLimitRule::builtin(5, 15 * MINUTE),
                Some(30 * MINUTE),
            ),
            RateLimitConfig::builtin("register", RateLimitRule::builtin(3, HOUR), Some(HOUR)),
            RateLimitConfig::builtin(
                "password_reset",
                RateLimitRule::builtin(3, HOUR),
                Some(HOUR),
            ),
            RateLimitConfig::builtin(
                AUTHENTICATED_API_KEY,
                RateLimitRule::builtin(100, MINUTE),
                None,
            ),
            RateLimitConfig::builtin("api:admin", RateLimitRule::builtin(500, MINUTE), None),
            RateLimitConfig::builtin(
                "api:security_lead",
                RateLimitRule::builtin(1000, MINUTE),
                None,
            ),
            RateLimitConfig::builtin("upload", RateLimitRule::builtin(10, MINUTE), None),
            RateLimitConfig::builtin(
                "admin",
                RateLimitRule::builtin(30, MINUTE),
                Some(15 * MINUTE),
            ),
            RateLimitConfig::builtin("security", RateLimitRule::builtin(20, MINUTE), Some(HOUR)),
            RateLimitConfig::builtin("read", RateLimitRule::builtin(300, MINUTE), None),
            RateLimitConfig::builtin("write", RateLimitRule::builtin(60, MINUTE), None),
            RateLimitConfig::builtin("delete", RateLimitRule::builtin(20, MINUTE), None),
            RateLimitConfig::builtin("export", RateLimitRule::builtin(5, HOUR), None),
        ];

        let configs: HashMap<String, RateLimitConfig> = entries
            .into_iter()
            .map(|config| (config.key.clone(), config))
            .collect();
        let default = configs
            .get(PUBLIC_KEY)
            .cloned()
            .unwrap_or_else(|| {
                RateLimitConfig::builtin(PUBLIC_KEY, RateLimitRule::builtin(60, MINUTE), None)
            });

        Self { configs, default }
    }

    /// The built-in catalog with configured entries layered on top.
    ///
    /// A configured entry replaces the built-in entry of the same key.
    pub fn with_overrides(overrides: &HashMap<String, LimitSpec>) -> Result<Self> {
        let mut catalog = Self::builtin();
        for (key, spec) in overrides {
            let config = spec.clone().into_config(key)?;
            catalog.insert(config);
        }
        info!(entries = catalog.len(), "Rule catalog loaded");
        Ok(catalog)
    }

    /// Load overrides from a YAML map of `key -> LimitSpec`.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let overrides: HashMap<String, LimitSpec> = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse rate limits: {}", e)))?;
        Self::with_overrides(&overrides)
    }

    fn insert(&mut self, config: RateLimitConfig) {
        if config.key == PUBLIC_KEY {
            self.default = config.clone();
        }
        self.configs.insert(config.key.clone(), config);
    }

    /// Resolve the policy for `key`.
    ///
    /// Role only matters for the authenticated API key. Unknown keys get the
    /// public tier's rules under their own key, so unrelated unknown
    /// endpoints do not share one bucket.
    pub fn resolve(&self, key: &str, role: Option<Role>) -> RateLimitConfig {
        if key == AUTHENTICATED_API_KEY {
            let tier_key = role.unwrap_or(Role::User).api_tier_key();
            if let Some(config) = self.configs.get(tier_key) {
                return config.clone();
            }
        }

        match self.configs.get(key) {
            Some(config) => config.clone(),
            None => {
                debug!(key = %key, "No rate limit configured, using public tier");
                RateLimitConfig {
                    key: key.to_string(),
                    ..self.default.clone()
                }
            }
        }
    }

    /// Direct lookup without fallback.
    pub fn get(&self, key: &str) -> Option<&RateLimitConfig> {
        self.configs.get(key)
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

impl Default for RuleCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
