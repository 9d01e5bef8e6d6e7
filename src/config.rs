use std::time::Duration;

/// Runtime configuration for the session controller plane.
///
/// Built from CLI flags / environment in `bin/controller.rs`; the library
/// only sees the typed form. Call [`ControllerConfig::normalized`] after
/// construction to enforce cross-field bounds.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Shared API key callers must present as a bearer credential.
    pub api_key: String,
    /// Base URL of the gateway, used to template `terminalUrl` in responses.
    pub public_gateway_url: String,
    /// Container image reference for worker pods.
    pub worker_image: String,
    /// Lifetime of a session (worker active deadline, row TTL).
    pub session_ttl: Duration,
    /// Lifetime of a capability token. Never exceeds `session_ttl`.
    pub token_ttl: Duration,
    /// How long `create_session` waits inline for the worker endpoint.
    pub resolve_deadline: Duration,
    /// Poll interval while waiting for the worker endpoint.
    pub resolve_interval: Duration,
    /// Admitted calls allowed per caller within `rate_window`.
    pub rate_limit: u32,
    /// Sliding window for the admission rate limit.
    pub rate_window: Duration,
    /// How often the TTL pruner wakes.
    pub prune_interval: Duration,
    /// Per-operation store timeout.
    pub store_timeout: Duration,
}

impl ControllerConfig {
    /// Enforces cross-field invariants: the session TTL is never shorter
    /// than the token TTL, and poll intervals are never zero.
    pub fn normalized(mut self) -> Self {
        if self.session_ttl < self.token_ttl {
            tracing::warn!(
                session_ttl_secs = self.session_ttl.as_secs(),
                token_ttl_secs = self.token_ttl.as_secs(),
                "session TTL below token TTL, raising session TTL"
            );
            self.session_ttl = self.token_ttl;
        }
        if self.resolve_interval.is_zero() {
            self.resolve_interval = Duration::from_millis(500);
        }
        self
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            public_gateway_url: "http://localhost:8081".to_string(),
            worker_image: "hatchery-worker:latest".to_string(),
            session_ttl: Duration::from_secs(600),
            token_ttl: Duration::from_secs(300),
            resolve_deadline: Duration::from_secs(30),
            resolve_interval: Duration::from_millis(500),
            rate_limit: 5,
            rate_window: Duration::from_secs(60),
            prune_interval: Duration::from_secs(60),
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// Runtime configuration for the websocket gateway plane.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long the gateway re-polls the store for a still-unset worker
    /// endpoint before giving up on an attach.
    pub resolve_wait: Duration,
    /// Poll interval during attach-time endpoint resolution.
    pub resolve_interval: Duration,
    /// Keepalive ping cadence towards both proxy sides.
    pub ping_interval: Duration,
    /// A side that produces no pong within this window is considered dead.
    pub pong_deadline: Duration,
    /// No data in either direction for this long closes the proxy.
    pub idle_timeout: Duration,
    /// A side that cannot accept a write for this long closes the proxy.
    pub write_stall: Duration,
    /// Connect timeout when dialing the worker's terminal server.
    pub worker_connect_timeout: Duration,
    /// Per-operation store timeout.
    pub store_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            resolve_wait: Duration::from_secs(5),
            resolve_interval: Duration::from_millis(250),
            ping_interval: Duration::from_secs(30),
            pong_deadline: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(3600),
            write_stall: Duration::from_secs(10),
            worker_connect_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_secs(5),
        }
    }
}
