//! Graceful Shutdown Handler
//!
//! Cancellation and drain tracking for the node's background tasks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::Notify;

/// Shutdown coordinator for graceful termination.
///
/// Tracks in-flight tasks and signals cancellation to every subscriber.
#[derive(Clone)]
pub struct ShutdownController {
    /// Whether shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
    /// Number of in-flight tasks
    active_tasks: Arc<AtomicUsize>,
    /// Broadcast channel for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Notify when all tasks are drained
    drain_complete: Arc<Notify>,
}

impl ShutdownController {
    /// Create a new shutdown controller.
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            active_tasks: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            drain_complete: Arc::new(Notify::new()),
        }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Check if shutdown has been initiated.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Completes once shutdown has been initiated, including before the call.
    pub async fn cancelled(&self) {
        // subscribe first so a shutdown between the check and the wait is seen
        let mut rx = self.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Get the number of in-flight tasks.
    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    fn task_started(&self) {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
    }

    fn task_ended(&self) {
        let prev = self.active_tasks.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.drain_complete.notify_waiters();
        }
    }

    /// Wait for all tasks to drain (with timeout).
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let notified = self.drain_complete.notified();
        if self.active_tasks() == 0 {
            return true;
        }

        tokio::select! {
            _ = notified => true,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    "drain timeout: {} tasks still active",
                    self.active_tasks()
                );
                false
            }
        }
    }

    /// Create a task guard that auto-decrements on drop.
    pub fn task_guard(&self) -> TaskGuard {
        self.task_started();
        TaskGuard {
            controller: self.clone(),
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for tracking in-flight tasks.
pub struct TaskGuard {
    controller: ShutdownController,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.controller.task_ended();
    }
}

/// Install signal handlers for graceful shutdown.
///
/// Returns a future that completes when a shutdown signal is received.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }

    controller.shutdown();
}
