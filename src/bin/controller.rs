//! hatchery-controller - session admission, token mint, worker launch.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hatchery::config::ControllerConfig;
use hatchery::controller::{self, ControllerState};
use hatchery::orchestrator::{KubeDriver, KubeDriverConfig, Orchestrator};
use hatchery::pruner;
use hatchery::ratelimit::RateLimiter;
use hatchery::shutdown::{self, ShutdownCoordinator};
use hatchery::signer::Signer;
use hatchery::store::{MemoryStore, PostgresStore, PostgresStoreOptions, SessionStore};

/// hatchery-controller
///
/// Admits job requests, launches sandboxed workers, and mints single-use
/// capability tokens for the websocket gateway.
#[derive(Parser, Debug)]
#[command(name = "hatchery-controller", version, about, long_about = None)]
struct Args {
    /// Address to bind the HTTP server
    #[arg(long, env = "HATCHERY_CONTROLLER_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Shared API key callers must present (secret)
    #[arg(long, env = "HATCHERY_API_KEY")]
    api_key: String,

    /// Path to a PKCS#8 PEM Ed25519 signing key (secret); generated
    /// ephemerally when absent
    #[arg(long, env = "HATCHERY_SIGNING_KEY_FILE")]
    signing_key_file: Option<PathBuf>,

    /// Postgres connection URL; falls back to a non-durable in-memory
    /// store when absent (single-replica development only)
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

    /// Public base URL of the gateway, templated into terminalUrl
    #[arg(long, env = "HATCHERY_GATEWAY_URL", default_value = "http://localhost:8081")]
    gateway_url: String,

    /// Kubernetes API server base URL
    #[arg(long, env = "HATCHERY_KUBE_API_URL", default_value = "https://kubernetes.default.svc")]
    kube_api_url: String,

    /// Namespace worker objects are created in
    #[arg(long, env = "HATCHERY_NAMESPACE", default_value = "hatchery-workers")]
    namespace: String,

    /// Bearer token file for the Kubernetes API
    #[arg(
        long,
        env = "HATCHERY_KUBE_TOKEN_FILE",
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token"
    )]
    kube_token_file: PathBuf,

    /// CA bundle for the Kubernetes API
    #[arg(
        long,
        env = "HATCHERY_KUBE_CA_FILE",
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"
    )]
    kube_ca_file: PathBuf,

    /// Worker container image
    #[arg(long, env = "HATCHERY_WORKER_IMAGE", default_value = "hatchery-worker:latest")]
    worker_image: String,

    /// Session lifetime in seconds
    #[arg(long, env = "HATCHERY_SESSION_TTL_SECS", default_value_t = 600)]
    session_ttl_secs: u64,

    /// Capability token lifetime in seconds
    #[arg(long, env = "HATCHERY_TOKEN_TTL_SECS", default_value_t = 300)]
    token_ttl_secs: u64,

    /// Inline worker endpoint resolution deadline in seconds
    #[arg(long, env = "HATCHERY_RESOLVE_DEADLINE_SECS", default_value_t = 30)]
    resolve_deadline_secs: u64,

    /// Admitted calls per caller per rate window
    #[arg(long, env = "HATCHERY_RATE_LIMIT", default_value_t = 5)]
    rate_limit: u32,

    /// Rate window in seconds
    #[arg(long, env = "HATCHERY_RATE_WINDOW_SECS", default_value_t = 60)]
    rate_window_secs: u64,

    /// TTL pruner wake interval in seconds
    #[arg(long, env = "HATCHERY_PRUNE_INTERVAL_SECS", default_value_t = 60)]
    prune_interval_secs: u64,
}

/// Attempts the store connection with a bounded retry schedule; a store
/// that stays down past the budget is a fatal init failure.
async fn connect_store(args: &Args) -> Result<Arc<dyn SessionStore>, String> {
    let Some(url) = &args.database_url else {
        tracing::warn!("no DATABASE_URL configured, using non-durable in-memory store");
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

fn build_orchestrator(args: &Args) -> Result<Arc<dyn Orchestrator>, String> {
    // In-cluster credential defaults are only used when present so a dev
    // run against a plain endpoint does not fail at boot. Explicitly
    // configured paths must exist.
    let token_path = if args.kube_token_file.exists() {
        Some(args.kube_token_file.display().to_string())
    } else {
        tracing::warn!(path = %args.kube_token_file.display(),
            "kube token file missing, talking to the API server unauthenticated");
        None
    };
    let ca_path = if args.kube_ca_file.exists() {
        Some(args.kube_ca_file.display().to_string())
    } else {
        None
    };

    let driver = KubeDriver::new(KubeDriverConfig {
        api_url: args.kube_api_url.clone(),
        namespace: args.namespace.clone(),
        token_path,
        ca_path,
        request_timeout: Duration::from_secs(15),
        poll_interval: Duration::from_millis(500),
    })
    .map_err(|e| e.to_string())?;
    Ok(Arc::new(driver))
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

    tracing::info!("hatchery-controller starting");

    let store = match connect_store(&args).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "store unreachable beyond retry budget");
            std::process::exit(1);
        }
    };

    let signer = match Signer::load_or_generate(args.signing_key_file.as_deref()) {
        Ok(signer) => Arc::new(signer),
        Err(e) => {
            tracing::error!(error = %e, "signing key unavailable");
            std::process::exit(1);
        }
    };
    tracing::info!(kid = %signer.kid(), "signing key loaded");

    let orchestrator = match build_orchestrator(&args) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            tracing::error!(error = %e, "orchestrator driver init failed");
            std::process::exit(1);
        }
    };

    let config = ControllerConfig {
        api_key: args.api_key.clone(),
        public_gateway_url: args.gateway_url.clone(),
        worker_image: args.worker_image.clone(),
        session_ttl: Duration::from_secs(args.session_ttl_secs),
        token_ttl: Duration::from_secs(args.token_ttl_secs),
        resolve_deadline: Duration::from_secs(args.resolve_deadline_secs),
        rate_limit: args.rate_limit,
        rate_window: Duration::from_secs(args.rate_window_secs),
        prune_interval: Duration::from_secs(args.prune_interval_secs),
        ..Default::default()
    }
    .normalized();

    let coordinator = ShutdownCoordinator::new();
    let state = ControllerState {
        store: store.clone(),
        orchestrator,
        signer,
        limiter: Arc::new(RateLimiter::new(config.rate_limit, config.rate_window)),
        config: Arc::new(config.clone()),
        shutdown: coordinator.clone(),
    };

    let pruner_handle = pruner::spawn(store.clone(), config.prune_interval, coordinator.token());

    let app = controller::router(state);
    let listener = match tokio::net::TcpListener::bind(args.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %args.bind, error = %e, "bind failed");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %args.bind, "controller listening");

    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            close_rx.await.ok();
        })
        .await
    });

    shutdown::signal().await;
    tracing::info!("shutdown signal received, draining");

    coordinator.shutdown();
    let _ = close_tx.send(());
    match tokio::time::timeout(Duration::from_secs(30), server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!(error = %e, "server ended with error"),
        Ok(Err(e)) => tracing::warn!(error = %e, "server task panicked"),
        Err(_) => tracing::warn!("drain deadline exceeded, aborting in-flight requests"),
    }
    pruner_handle.abort();

    // Close the pool exactly once; the store's own guard makes a second
    // close harmless.
    store.close().await;
    tracing::info!("hatchery-controller exiting");
}
