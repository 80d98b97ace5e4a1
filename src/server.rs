//! HTTP server hosting rate-limited routes.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::Result;
use crate::http::{rate_limit_guard, RateLimitGuard};
use crate::ratelimit::{RateLimiter, AUTHENTICATED_API_KEY};

/// Catalog key guarding the login route.
pub const LOGIN_KEY: &str = "auth";

/// HTTP server for the admission engine.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared middleware settings; the config key is replaced per route
    guard: RateLimitGuard,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, guard: RateLimitGuard) -> Self {
        Self { addr, guard }
    }

    /// Convenience constructor with default middleware settings.
    pub fn with_limiter(addr: SocketAddr, limiter: Arc<RateLimiter>) -> Self {
        Self::new(addr, RateLimitGuard::new(limiter, AUTHENTICATED_API_KEY))
    }

    /// The application routes.
    pub fn router(&self) -> Router {
        let login = Router::new()
            .route("/api/login", post(login))
            .layer(middleware::from_fn_with_state(
                self.guard.clone().with_config_key(LOGIN_KEY),
                rate_limit_guard,
            ));
        let items = Router::new()
            .route("/api/items", get(items))
            .layer(middleware::from_fn_with_state(
                self.guard.clone().with_config_key(AUTHENTICATED_API_KEY),
                rate_limit_guard,
            ));

        Router::new()
            .route("/health", get(health))
            .route(
                "/api/blocks/{key}",
                get(block_status).with_state(self.guard.clone()),
            )
            .merge(login)
            .merge(items)
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn login() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "accepted" }))
}

async fn items() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "items": [] }))
}

/// Read-only block lookup for the calling identity.
async fn block_status(
    State(guard): State<RateLimitGuard>,
    Path(key): Path<String>,
    request: Request,
) -> Response {
    let context = guard.context(&request);
    match guard.limiter().block_status(&context, &key).await {
        Ok(until) => Json(serde_json::json!({
            "key": key,
            "blocked": until.is_some(),
            "blockUntil": until,
        }))
        .into_response(),
        Err(e) => {
            error!(key = %key, error = %e, "Block status lookup failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": {
                        "code": "E-RATE-UNAVAILABLE",
                        "message": "Block ledger unavailable."
                    }
                })),
            )
                .into_response()
        }
    }
}
