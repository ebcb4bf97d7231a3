use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ow_core::ledger::{AuditSink, LedgerError, RunLedger};
use ow_core::types::{AuditEvent, RiskClass};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LockdownError {
    #[error("failed to cancel active runs: {0}")]
    Ledger(#[from] LedgerError),
}

/// Process-wide kill switch.
///
/// `normal` ⇄ `locked`. Activation cancels every active run in the ledger.
/// The flag lives in memory only, so a restarted process always comes up
/// unlocked; re-arm after restart if an emergency stop must survive it.
///
/// Waiters that cannot afford a poll interval of staleness subscribe to the
/// state through [`Lockdown::subscribe`].
pub struct Lockdown {
    locked: AtomicBool,
    state_tx: watch::Sender<bool>,
    ledger: Arc<RunLedger>,
    audit: Arc<dyn AuditSink>,
}

impl Lockdown {
    pub fn new(ledger: Arc<RunLedger>, audit: Arc<dyn AuditSink>) -> Self {
        let (state_tx, _) = watch::channel(false);
        Self {
            locked: AtomicBool::new(false),
            state_tx,
            ledger,
            audit,
        }
    }

    /// Non-blocking read of the flag.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state_tx.subscribe()
    }

    /// Lock, cancel every queued/running/awaiting-approval run, and audit.
    /// Returns the number of runs cancelled.
    ///
    /// The flag is set before the ledger write, so it stays set even when
    /// the cancellation fails.
    pub async fn activate(&self, trace_id: &str) -> Result<u64, LockdownError> {
        self.set(true);
        let cancelled = self.ledger.cancel_active_runs().await?;

        let event = AuditEvent::new(trace_id, "system", "kill_switch", RiskClass::R0)
            .output(format!("Lockdown activated, {cancelled} runs cancelled"))
            .decision("kill_switch");
        if let Err(e) = self.audit.record(event).await {
            warn!(error = %e, "lockdown audit write failed");
        }

        info!(cancelled, trace_id, "lockdown activated");
        Ok(cancelled)
    }

    pub async fn resume(&self, trace_id: &str) {
        self.set(false);

        let event = AuditEvent::new(trace_id, "system", "resume", RiskClass::R0)
            .output("Lockdown deactivated")
            .decision("resume");
        if let Err(e) = self.audit.record(event).await {
            warn!(error = %e, "resume audit write failed");
        }

        info!(trace_id, "lockdown lifted, operations resumed");
    }

    fn set(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
        self.state_tx.send_replace(locked);
    }
}
