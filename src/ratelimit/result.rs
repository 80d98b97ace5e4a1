//! Admission decisions and their HTTP rendering.

use chrono::{DateTime, SecondsFormat, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use http::StatusCode;
use serde::Serialize;

/// Limit reported for bypassed requests.
pub const UNLIMITED: u64 = u64::MAX;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_BLOCKED: HeaderName = HeaderName::from_static("x-ratelimit-blocked");
pub const X_RATELIMIT_BLOCK_UNTIL: HeaderName = HeaderName::from_static("x-ratelimit-block-until");

/// Why a decision did not come from the primary enforcement path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Degraded {
    /// Admitted through the emergency bypass
    EmergencyBypass,
    /// Counted by the durable fallback store
    DurableFallback,
    /// No store answered; decided by the failure policy
    StorageUnavailable,
}

impl Degraded {
    pub fn as_str(&self) -> &'static str {
        match self {
            Degraded::EmergencyBypass => "emergency_bypass",
            Degraded::DurableFallback => "durable_fallback",
            Degraded::StorageUnavailable => "storage_unavailable",
        }
    }
}

impl std::fmt::Display for Degraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub blocked: bool,
    pub block_until: Option<DateTime<Utc>>,
    pub retry_after_seconds: Option<u64>,
    pub degraded: Option<Degraded>,
}

impl RateLimitResult {
    /// An admitted request with no quota accounting.
    pub fn unlimited(reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit: UNLIMITED,
            remaining: UNLIMITED,
            reset_at,
            blocked: false,
            block_until: None,
            retry_after_seconds: None,
            degraded: None,
        }
    }

    pub fn with_degraded(mut self, degraded: Degraded) -> Self {
        self.degraded = Some(degraded);
        self
    }

    /// `200`-class pass-through or `429`.
    pub fn status(&self) -> StatusCode {
        if self.allowed {
            StatusCode::OK
        } else {
            StatusCode::TOO_MANY_REQUESTS
        }
    }

    /// The rate limit headers for this decision.
    ///
    /// `X-RateLimit-Reset` is epoch milliseconds; `X-RateLimit-Block-Until` is
    /// RFC 3339.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(
            X_RATELIMIT_RESET,
            HeaderValue::from(self.reset_at.timestamp_millis()),
        );

        if !self.allowed {
            if let Some(retry_after) = self.retry_after_seconds {
                headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
            }
            if self.blocked {
                headers.insert(X_RATELIMIT_BLOCKED, HeaderValue::from_static("true"));
                if let Some(until) = self.block_until {
                    let formatted = until.to_rfc3339_opts(SecondsFormat::Secs, true);
                    if let Ok(value) = HeaderValue::from_str(&formatted) {
                        headers.insert(X_RATELIMIT_BLOCK_UNTIL, value);
                    }
                }
            }
        }

        headers
    }
}
