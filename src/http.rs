//! Axum integration: a middleware that admits or rejects requests.
//!
//! ```ignore
//! let guard = RateLimitGuard::new(limiter.clone(), "auth");
//! let app = Router::new()
//!     .route("/api/login", post(login))
//!     .layer(middleware::from_fn_with_state(guard, rate_limit_guard));
//! ```

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::ratelimit::{
    RateLimitConfig, RateLimitContext, RateLimitResult, RateLimiter, Role, Whitelist, UNKNOWN_IP,
};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// Authenticated caller, inserted into request extensions by an upstream
/// authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Option<Role>,
}

/// Per-route middleware state.
#[derive(Debug, Clone)]
pub struct RateLimitGuard {
    limiter: Arc<RateLimiter>,
    config_key: Arc<str>,
    override_config: Option<Arc<RateLimitConfig>>,
    bypass_header: HeaderName,
    /// Peers allowed to report the client address in forwarding headers
    trusted_proxies: Arc<Whitelist>,
}

impl RateLimitGuard {
    pub fn new(limiter: Arc<RateLimiter>, config_key: &str) -> Self {
        Self {
            limiter,
            config_key: Arc::from(config_key),
            override_config: None,
            bypass_header: HeaderName::from_static("x-emergency-bypass"),
            trusted_proxies: Arc::new(Whitelist::default()),
        }
    }

    /// The same settings guarding a different catalog key.
    pub fn with_config_key(mut self, config_key: &str) -> Self {
        self.config_key = Arc::from(config_key);
        self
    }

    /// Enforce `config` instead of the catalog entry.
    pub fn with_override(mut self, config: RateLimitConfig) -> Self {
        self.override_config = Some(Arc::new(config));
        self
    }

    pub fn with_bypass_header(mut self, header: HeaderName) -> Self {
        self.bypass_header = header;
        self
    }

    /// Honor `X-Forwarded-For` / `X-Real-IP` only on connections from these
    /// peers. Empty, the default, means the socket peer is always the client.
    pub fn with_trusted_proxies(mut self, proxies: Whitelist) -> Self {
        self.trusted_proxies = Arc::new(proxies);
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub(crate) fn context(&self, request: &Request) -> RateLimitContext {
        let headers = request.headers();
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let ip = client_ip(headers, peer, &self.trusted_proxies);

        let mut context = RateLimitContext::new(ip, request.uri().path());
        if let Some(agent) = header_str(headers, &header::USER_AGENT) {
            context = context.with_user_agent(agent);
        }
        if let Some(identity) = request.extensions().get::<Identity>() {
            context = context.with_user(identity.user_id.clone(), identity.role);
        }
        if let Some(token) = header_str(headers, &self.bypass_header) {
            context = context.with_bypass_token(token);
        }
        context
    }
}

/// Rate limit middleware for `axum::middleware::from_fn_with_state`.
pub async fn rate_limit_guard(
    State(guard): State<RateLimitGuard>,
    request: Request,
    next: Next,
) -> Response {
    let context = guard.context(&request);
    let result = guard
        .limiter
        .check(&context, &guard.config_key, guard.override_config.as_deref())
        .await;

    if !result.allowed {
        return rejection(&result);
    }

    let mut response = next.run(request).await;
    response.headers_mut().extend(result.headers());
    response
}

/// The `429` response for a rejected decision.
pub fn rejection(result: &RateLimitResult) -> Response {
    let (code, message) = if result.blocked {
        (
            "E-RATE-BLOCKED",
            "Access temporarily blocked due to repeated violations.",
        )
    } else {
        ("E-RATE-LIMITED", "Too many requests. Please slow down.")
    };
    let body = serde_json::json!({
        "error": {
            "code": code,
            "message": message,
            "details": {
                "limit": result.limit,
                "retryAfter": result.retry_after_seconds,
                "resetAt": result.reset_at,
                "blockUntil": result.block_until,
                "degraded": result.degraded,
            }
        }
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    response.headers_mut().extend(result.headers());
    response
}

/// Client address for a request that arrived from `peer`.
///
/// Forwarding headers count only when the peer is a trusted proxy. The
/// forwarded chain is walked from the nearest hop and the first address that
/// is not itself a trusted proxy wins, so entries a client prepends are never
/// reached.
fn client_ip(headers: &HeaderMap, peer: Option<String>, trusted_proxies: &Whitelist) -> String {
    let Some(peer) = peer else {
        return UNKNOWN_IP.to_string();
    };
    if !trusted_proxies.contains(&peer) {
        return peer;
    }

    let forwarded = header_str(headers, &X_FORWARDED_FOR).and_then(|value| {
        value
            .rsplit(',')
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .find(|ip| !trusted_proxies.contains(ip))
    });
    if let Some(ip) = forwarded {
        return ip.to_string();
    }
    match header_str(headers, &X_REAL_IP).map(str::trim) {
        Some(ip) if !ip.is_empty() => ip.to_string(),
        _ => peer,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
