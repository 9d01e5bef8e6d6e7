use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Coordinates graceful shutdown across request handlers and proxy loops.
///
/// Long-lived connections call [`register`](ShutdownCoordinator::register)
/// and hold the returned guard for their lifetime; the guard's drop
/// decrements the active count. On shutdown the cancellation token fires,
/// each loop observes it and closes its connection, and
/// [`drain`](ShutdownCoordinator::drain) waits for the count to reach zero
/// up to a deadline.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    cancel: CancellationToken,
    active: AtomicUsize,
    all_closed: Notify,
}

/// RAII guard representing one active connection.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.all_closed.notify_waiters();
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancel: CancellationToken::new(),
                active: AtomicUsize::new(0),
                all_closed: Notify::new(),
            }),
        }
    }

    /// Registers a connection. Returns the guard plus a token the
    /// connection loop selects on.
    pub fn register(&self) -> (ConnectionGuard, CancellationToken) {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        (
            ConnectionGuard {
                inner: self.inner.clone(),
            },
            self.inner.cancel.child_token(),
        )
    }

    /// Token observed by tasks that outlive individual connections (the
    /// pruner, background resolvers).
    pub fn token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    /// Signals every registered connection and task to stop.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Signals shutdown and waits for all connections to close, up to
    /// `deadline`. Returns `true` when everything drained in time.
    pub async fn drain(&self, deadline: Duration) -> bool {
        self.shutdown();
        let wait = async {
            loop {
                if self.inner.active.load(Ordering::Acquire) == 0 {
                    return;
                }
                // Re-check after each notification; notify_waiters does not
                // store a permit, so the count check must come first.
                let notified = self.inner.all_closed.notified();
                if self.inner.active.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, wait).await.is_ok()
    }
}

/// Resolves when the process receives SIGINT or, on Unix, SIGTERM.
pub async fn signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_drop_tracks_count() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.active_count(), 0);

        let (guard_a, _) = coordinator.register();
        let (guard_b, _) = coordinator.register();
        assert_eq!(coordinator.active_count(), 2);

        drop(guard_a);
        assert_eq!(coordinator.active_count(), 1);
        drop(guard_b);
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_registered_tokens() {
        let coordinator = ShutdownCoordinator::new();
        let (_guard, token) = coordinator.register();
        assert!(!token.is_cancelled());
        coordinator.shutdown();
        token.cancelled().await;
    }

    #[tokio::test]
    async fn drain_returns_true_when_connections_close() {
        let coordinator = ShutdownCoordinator::new();
        let (guard, token) = coordinator.register();

        tokio::spawn(async move {
            token.cancelled().await;
            drop(guard);
        });

        assert!(coordinator.drain(Duration::from_secs(1)).await);
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn drain_times_out_on_stuck_connection() {
        let coordinator = ShutdownCoordinator::new();
        let (_guard, _token) = coordinator.register();
        // Guard is held across the drain; it cannot complete.
        assert!(!coordinator.drain(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn drain_with_no_connections_is_immediate() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.drain(Duration::from_millis(10)).await);
    }
}
