//! Graceful shutdown coordination.
//!
//! OS signals fan out two ways: a broadcast channel for tasks that care
//! about the reason, and a `CancellationToken` threaded through the data
//! plane so in-flight upstream I/O stops promptly. Request handlers use
//! child tokens of the root token.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use eyre::Result;
use tokio::{signal, sync::broadcast};
use tokio_util::sync::CancellationToken;

/// Why the process is going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM or SIGINT.
    Graceful,
    /// Shutdown channel failure; treat as immediate.
    Force,
}

/// Coordinates signal handling, shutdown broadcast and cancellation.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    initiated: Arc<AtomicBool>,
    token: CancellationToken,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            shutdown_tx,
            initiated: Arc::new(AtomicBool::new(false)),
            token: CancellationToken::new(),
        }
    }

    /// Root cancellation token; request-scoped tokens are children of it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::Relaxed)
    }

    /// Trigger shutdown programmatically (tests, admin surface).
    pub fn trigger(&self, reason: ShutdownReason) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!(?reason, "shutdown initiated");
            self.token.cancel();
            let _ = self.shutdown_tx.send(reason);
        }
    }

    /// Listen for SIGTERM / SIGINT and initiate shutdown on the first one.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("received SIGINT");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("received SIGTERM");
            }
        }
        self.trigger(ShutdownReason::Graceful);
        Ok(())
    }

    /// Block until shutdown is triggered.
    pub async fn wait(&self) -> ShutdownReason {
        if self.is_initiated() {
            return ShutdownReason::Graceful;
        }
        match self.shutdown_tx.subscribe().recv().await {
            Ok(reason) => reason,
            Err(_) => ShutdownReason::Force,
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_token_and_broadcasts() {
        let shutdown = GracefulShutdown::new();
        let token = shutdown.cancellation_token();
        let mut rx = shutdown.shutdown_tx.subscribe();

        assert!(!shutdown.is_initiated());
        shutdown.trigger(ShutdownReason::Graceful);

        assert!(shutdown.is_initiated());
        assert!(token.is_cancelled());
        assert_eq!(rx.try_recv().unwrap(), ShutdownReason::Graceful);
    }

    #[tokio::test]
    async fn test_second_trigger_is_ignored() {
        let shutdown = GracefulShutdown::new();
        shutdown.trigger(ShutdownReason::Graceful);
        shutdown.trigger(ShutdownReason::Force);
        assert_eq!(shutdown.wait().await, ShutdownReason::Graceful);
    }

    #[tokio::test]
    async fn test_child_tokens_observe_shutdown() {
        let shutdown = GracefulShutdown::new();
        let child = shutdown.cancellation_token().child_token();
        shutdown.trigger(ShutdownReason::Graceful);
        assert!(child.is_cancelled());
    }
}
