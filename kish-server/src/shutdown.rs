//! Server shutdown and tunnel draining.
//!
//! Each tunnel holds a [`TunnelGuard`] from upgrade until its host is
//! unregistered. When shutdown starts the accept loop exits, tunnel tasks
//! waiting on [`ShutdownSignal::wait`] close their sessions, and
//! [`ShutdownSignal::wait_for_drain`] holds the process until every guard is
//! gone or the timeout passes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Seconds to wait for open tunnels after shutdown starts.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Shared by the accept loop and every tunnel task. Clones observe the same
/// state and tunnel count.
#[derive(Clone)]
pub struct ShutdownSignal {
    is_shutting_down: Arc<AtomicBool>,
    notify: broadcast::Sender<()>,
    active_tunnels: Arc<AtomicUsize>,
    timeout: Duration,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT_SECS)
    }
}

impl ShutdownSignal {
    pub fn new(timeout_secs: u64) -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            notify,
            active_tunnels: Arc::new(AtomicUsize::new(0)),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Stop accepting control connections and tell every tunnel to close.
    pub fn initiate_shutdown(&self) {
        self.is_shutting_down.store(true, Ordering::SeqCst);
        let _ = self.notify.send(());
        info!("Shutdown initiated");
    }

    /// Resolves once shutdown has started, even if it started before the call.
    pub async fn wait(&self) {
        let mut rx = self.notify.subscribe();
        if self.is_shutting_down() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Count a tunnel as open until the returned guard is dropped.
    pub fn register_tunnel(&self) -> TunnelGuard {
        let active = self.active_tunnels.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Tunnel registered, active: {}", active);
        TunnelGuard {
            counter: self.active_tunnels.clone(),
        }
    }

    pub fn active_tunnel_count(&self) -> usize {
        self.active_tunnels.load(Ordering::SeqCst)
    }

    /// Wait until every tunnel has released its guard. Returns false if some
    /// were still open at the timeout.
    pub async fn wait_for_drain(&self) -> bool {
        info!(
            "Waiting for {} active tunnels to close (timeout: {:?})",
            self.active_tunnel_count(),
            self.timeout
        );

        let drain = async {
            while self.active_tunnel_count() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        match timeout(self.timeout, drain).await {
            Ok(()) => {
                info!("All tunnels closed");
                true
            }
            Err(_) => {
                warn!(
                    "Shutdown timeout reached with {} tunnels still active",
                    self.active_tunnel_count()
                );
                false
            }
        }
    }
}

/// Held by a tunnel task for the lifetime of its session.
pub struct TunnelGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        debug!("Tunnel closed, active: {}", prev.saturating_sub(1));
    }
}

/// Resolves on Ctrl+C or SIGTERM, whichever comes first.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
