use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::http::RateLimitGuard;
use gatekeeper::ratelimit::{
    ChannelEventSink, EventSink, RateLimiter, RedisStore, SqliteFallbackStore, TracingEventSink,
};
use gatekeeper::server::HttpServer;

#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about = "Request admission and abuse mitigation service")]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, env = "GATEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    /// Keep all state in process instead of Redis and SQLite
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = GatekeeperConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    if args.json_logs || config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let sink = event_sink(config.limiter.event_buffer);
    let limiter = Arc::new(build_limiter(&config, args.memory, sink).await?);
    info!(limiter = ?limiter, "Rate limiter initialized");
    let sweeper = limiter.spawn_sweeper(config.sweep_interval());

    let trusted_proxies = config.trusted_proxies()?;
    if trusted_proxies.is_empty() {
        info!("No trusted proxies configured, using the socket peer as client address");
    } else {
        info!(proxies = trusted_proxies.len(), "Honoring forwarding headers from trusted proxies");
    }

    let header = axum::http::HeaderName::from_bytes(config.limiter.bypass_header.as_bytes())?;
    let guard = RateLimitGuard::new(limiter, gatekeeper::ratelimit::PUBLIC_KEY)
        .with_bypass_header(header)
        .with_trusted_proxies(trusted_proxies);

    HttpServer::new(config.server.listen_addr, guard)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("Gatekeeper stopped");
    Ok(())
}

async fn build_limiter(
    config: &GatekeeperConfig,
    memory: bool,
    sink: Arc<dyn EventSink>,
) -> anyhow::Result<RateLimiter> {
    let catalog = config.catalog()?;
    let limiter = if memory {
        info!("Using in-process counter store");
        RateLimiter::in_memory(catalog)
    } else {
        let redis = Arc::new(RedisStore::open(&config.redis.url, config.redis_store_config())?);
        info!(url = %config.redis.url, "Redis counter store configured");
        let limiter = RateLimiter::new(catalog, redis.clone(), redis);
        match &config.database.url {
            Some(url) => {
                let fallback = Arc::new(
                    SqliteFallbackStore::connect(url, config.database.max_connections).await?,
                );
                limiter
                    .with_fallback(fallback.clone())
                    .with_fallback_blocks(fallback)
            }
            None => {
                warn!("No durable fallback store configured");
                limiter
            }
        }
    };

    Ok(limiter
        .with_event_sink(sink)
        .with_bypass(config.bypass_policy()?)
        .with_options(config.limiter_options()))
}

/// Audit events go through a bounded channel to a logging task so the
/// request path never waits on the sink.
fn event_sink(capacity: usize) -> Arc<dyn EventSink> {
    let (sink, mut receiver) = ChannelEventSink::new(capacity);
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            if let Err(e) = TracingEventSink.emit(event) {
                error!(error = %e, "Failed to record violation event");
            }
        }
    });
    Arc::new(sink)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
