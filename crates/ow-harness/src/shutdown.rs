use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cooperative process shutdown.
///
/// Long-running loops (the approval wait, the timeout sweeper, the console
/// gateway) `select!` on [`ShutdownSignal::cancelled`] next to their work.
/// The state is a latched `watch` value, so a waiter that starts after the
/// trigger still returns immediately.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
///
/// tokio::select! {
///     _ = shutdown.cancelled() => { /* cleanup */ }
///     _ = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    state_tx: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<bool>,
    drain_tx: Arc<watch::Sender<usize>>,
    drain_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = watch::channel(0);
        Self {
            state_tx: Arc::new(state_tx),
            state_rx,
            drain_tx: Arc::new(drain_tx),
            drain_rx,
        }
    }

    /// Check if shutdown has been triggered (non-blocking).
    pub fn is_shutting_down(&self) -> bool {
        *self.state_rx.borrow()
    }

    /// Trigger shutdown for every waiter. Repeated calls are no-ops.
    pub fn trigger(&self) {
        let first = self.state_tx.send_if_modified(|state| {
            if *state {
                false
            } else {
                *state = true;
                true
            }
        });
        if first {
            info!("shutdown signal triggered");
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.state_rx.clone();
        // The sender lives as long as any clone of `self`, so an error here
        // only happens during teardown; treat it as shutdown too.
        let _ = rx.wait_for(|down| *down).await;
    }

    /// Notify that a component has finished draining.
    pub fn confirm_drained(&self) {
        self.drain_tx.send_modify(|count| *count += 1);
    }

    /// Wait for `expected` components to confirm drain, with a timeout.
    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainResult {
        let mut rx = self.drain_rx.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|count| *count >= expected)).await;
        let confirmed = *self.drain_rx.borrow();

        match waited {
            Ok(_) => {
                info!(count = confirmed, "all components drained");
                DrainResult::Complete(confirmed)
            }
            Err(_) => {
                warn!(
                    confirmed,
                    expected, "drain timeout, some components did not confirm"
                );
                DrainResult::Timeout {
                    confirmed,
                    expected,
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DrainResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    /// All expected components confirmed drain.
    Complete(usize),
    /// Timeout expired before all components confirmed.
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

// ---------------------------------------------------------------------------
// ShutdownGuard
// ---------------------------------------------------------------------------

/// Calls `confirm_drained()` when dropped. Hand one to each background loop.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl ShutdownGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
