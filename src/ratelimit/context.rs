//! Request context and rate limit identifier derivation.

use std::fmt;

use super::rules::Role;

/// Placeholder used when the caller's address cannot be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// What the surrounding request path knows about a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitContext {
    /// Authenticated user id, if any
    pub user_id: Option<String>,
    /// Role of the authenticated user
    pub role: Option<Role>,
    /// Client address; never empty
    pub ip: String,
    /// Raw User-Agent header
    pub user_agent: String,
    /// Endpoint being invoked (path or logical name)
    pub endpoint: String,
    /// Operation type, for operation-keyed buckets
    pub operation_type: Option<String>,
    /// Value of the emergency bypass header, if present
    pub bypass_token: Option<String>,
}

impl RateLimitContext {
    /// Create an anonymous context. An empty `ip` becomes [`UNKNOWN_IP`].
    pub fn new(ip: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            ip: normalize_ip(ip.into()),
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>, role: Option<Role>) -> Self {
        self.user_id = Some(user_id.into());
        self.role = role;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_operation(mut self, operation_type: impl Into<String>) -> Self {
        self.operation_type = Some(operation_type.into());
        self
    }

    pub fn with_bypass_token(mut self, token: impl Into<String>) -> Self {
        self.bypass_token = Some(token.into());
        self
    }

    /// The user id, if it is present and non-blank.
    pub fn authenticated_user(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// The address, falling back to [`UNKNOWN_IP`] for contexts built by hand.
    pub fn ip(&self) -> &str {
        let ip = self.ip.trim();
        if ip.is_empty() {
            UNKNOWN_IP
        } else {
            ip
        }
    }
}

fn normalize_ip(ip: String) -> String {
    let trimmed = ip.trim();
    if trimmed.is_empty() {
        UNKNOWN_IP.to_string()
    } else if trimmed.len() == ip.len() {
        ip
    } else {
        trimmed.to_string()
    }
}

/// The key quota is tracked under.
///
/// `user:{user_id}:{ip}` for authenticated callers, `ip:{ip}` otherwise. The
/// same context always yields the same identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Derive the identifier for a request context.
    pub fn from_context(context: &RateLimitContext) -> Self {
        match context.authenticated_user() {
            Some(user_id) => Self(format!("user:{}:{}", user_id, context.ip())),
            None => Self(format!("ip:{}", context.ip())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Storage key of the counter for a config key and rule index.
    ///
    /// The primary rule uses `identifier:key`; additional rules get a
    /// `#index` suffix so each keeps its own window.
    pub fn counter_key(&self, config_key: &str, rule_index: usize) -> String {
        if rule_index == 0 {
            format!("{}:{}", self.0, config_key)
        } else {
            format!("{}:{}#{}", self.0, config_key, rule_index)
        }
    }

    /// Storage key of the block ledger entry for a config key.
    pub fn block_key(&self, config_key: &str) -> String {
        format!("{}:{}", self.0, config_key)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
