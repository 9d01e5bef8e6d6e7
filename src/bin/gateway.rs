//! hatchery-gateway - token-gated websocket proxy to worker terminals.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hatchery::config::GatewayConfig;
use hatchery::gateway::{self, GatewayState, KeySetCache};
use hatchery::shutdown::{self, ShutdownCoordinator};
use hatchery::store::{MemoryStore, PostgresStore, PostgresStoreOptions, SessionStore};

/// hatchery-gateway
///
/// Verifies capability tokens against the controller's published keys,
/// consumes the one-shot token record, and proxies the terminal byte
/// stream between clients and workers.
#[derive(Parser, Debug)]
#[command(name = "hatchery-gateway", version, about, long_about = None)]
struct Args {
    /// Address to bind the HTTP/WebSocket server
    #[arg(long, env = "HATCHERY_GATEWAY_BIND", default_value = "0.0.0.0:8081")]
    bind: SocketAddr,

    /// Controller base URL for the JWKS fetch
    #[arg(long, env = "HATCHERY_CONTROLLER_URL", default_value = "http://localhost:8080")]
    controller_url: String,

    /// JWKS cache refresh interval in seconds (capped at 300)
    #[arg(long, env = "HATCHERY_JWKS_REFRESH_SECS", default_value_t = 300)]
    jwks_refresh_secs: u64,

    /// Postgres connection URL; must point at the controller's store
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Store pool: maximum connections
    #[arg(long, env = "HATCHERY_DB_MAX_CONNS", default_value_t = 20)]
    db_max_conns: u32,

    /// Store pool: minimum idle connections
    #[arg(long, env = "HATCHERY_DB_MIN_CONNS", default_value_t = 1)]
    db_min_conns: u32,

    /// Store pool: acquire timeout in seconds
    #[arg(long, env = "HATCHERY_DB_ACQUIRE_TIMEOUT_SECS", default_value_t = 5)]
    db_acquire_timeout_secs: u64,

    /// Attach-time endpoint re-resolution budget in seconds
    #[arg(long, env = "HATCHERY_RESOLVE_WAIT_SECS", default_value_t = 5)]
    resolve_wait_secs: u64,

    /// Proxy idle timeout in seconds
    #[arg(long, env = "HATCHERY_WS_IDLE_SECS", default_value_t = 3600)]
    ws_idle_secs: u64,

    /// Keepalive ping interval in seconds
    #[arg(long, env = "HATCHERY_WS_PING_SECS", default_value_t = 30)]
    ws_ping_secs: u64,

    /// Keepalive pong deadline in seconds
    #[arg(long, env = "HATCHERY_WS_PONG_DEADLINE_SECS", default_value_t = 60)]
    ws_pong_deadline_secs: u64,

    /// Backpressure write stall budget in seconds
    #[arg(long, env = "HATCHERY_WS_WRITE_STALL_SECS", default_value_t = 10)]
    ws_write_stall_secs: u64,
}

async fn connect_store(args: &Args) -> Result<Arc<dyn SessionStore>, String> {
    let Some(url) = &args.database_url else {
        tracing::warn!(
            "no DATABASE_URL configured, using an in-memory store; \
             attaches only work when the controller shares this process's store"
        );
        return Ok(Arc::new(MemoryStore::new()));
    };

    let options = PostgresStoreOptions {
        max_connections: args.db_max_conns,
        min_connections: args.db_min_conns,
        acquire_timeout: Duration::from_secs(args.db_acquire_timeout_secs),
    };

    let mut last_error = String::new();
    for attempt in 1..=5u32 {
        match PostgresStore::connect(url, options.clone()).await {
            Ok(store) => return Ok(Arc::new(store)),
            Err(e) => {
                last_error = e.to_string();
                tracing::warn!(attempt, error = %e, "store connection failed");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
    Err(last_error)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "hatchery=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("hatchery-gateway starting");

    let store = match connect_store(&args).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "store unreachable beyond retry budget");
            std::process::exit(1);
        }
    };

    let keyset = match KeySetCache::new(
        &args.controller_url,
        Duration::from_secs(args.jwks_refresh_secs),
    ) {
        Ok(keyset) => Arc::new(keyset),
        Err(e) => {
            tracing::error!(error = %e, "key set cache init failed");
            std::process::exit(1);
        }
    };
    // Warm the cache; a cold controller is not fatal, attaches retry.
    if let Err(e) = keyset.current().await {
        tracing::warn!(error = %e, "initial JWKS fetch failed, will retry on attach");
    }

    let config = GatewayConfig {
        resolve_wait: Duration::from_secs(args.resolve_wait_secs),
        idle_timeout: Duration::from_secs(args.ws_idle_secs),
        ping_interval: Duration::from_secs(args.ws_ping_secs),
        pong_deadline: Duration::from_secs(args.ws_pong_deadline_secs),
        write_stall: Duration::from_secs(args.ws_write_stall_secs),
        ..Default::default()
    };

    let coordinator = ShutdownCoordinator::new();
    let state = GatewayState {
        store: store.clone(),
        keyset,
        config: Arc::new(config),
        shutdown: coordinator.clone(),
    };

    let app = gateway::router(state);
    let listener = match tokio::net::TcpListener::bind(args.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %args.bind, error = %e, "bind failed");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %args.bind, "gateway listening");

    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                close_rx.await.ok();
            })
            .await
    });

    shutdown::signal().await;
    tracing::info!(
        active = coordinator.active_count(),
        "shutdown signal received, draining"
    );

    // Closing proxies first lets the graceful HTTP shutdown finish quickly.
    let drained = coordinator.drain(Duration::from_secs(30)).await;
    if !drained {
        tracing::warn!("proxy drain deadline exceeded");
    }
    let _ = close_tx.send(());
    match tokio::time::timeout(Duration::from_secs(5), server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!(error = %e, "server ended with error"),
        Ok(Err(e)) => tracing::warn!(error = %e, "server task panicked"),
        Err(_) => tracing::warn!("server stop deadline exceeded"),
    }

    store.close().await;
    tracing::info!("hatchery-gateway exiting");
}
