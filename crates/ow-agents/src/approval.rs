use std::sync::Arc;
use std::time::Duration;

use ow_core::ledger::{LedgerError, RunLedger};
use ow_core::types::{ApprovalRequest, ApprovalStatus, RiskClass};
use ow_harness::shutdown::ShutdownSignal;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::lockdown::Lockdown;
use crate::narrator::Notifier;

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval request not found: {0}")]
    NotFound(Uuid),
    #[error("approval request {id} already resolved as {status}")]
    AlreadyResolved { id: Uuid, status: ApprovalStatus },
    #[error("no pending approval request")]
    NoPending,
    #[error("{0} is not a human decision")]
    InvalidDecision(ApprovalStatus),
    #[error("approval wait interrupted by shutdown")]
    Shutdown,
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

// ---------------------------------------------------------------------------
// ApprovalConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ApprovalConfig {
    /// How often the wait loop re-reads the ledger.
    pub poll_interval: Duration,
    /// Deadline for one wait; also the sweeper's staleness threshold.
    pub timeout: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

// ---------------------------------------------------------------------------
// ApprovalGate
// ---------------------------------------------------------------------------

/// Bridges a running pipeline to an out-of-band human decision.
///
/// The ledger is the single source of truth for request status. Every
/// resolver (the human, the wait loop on lockdown or deadline, the sweeper)
/// goes through the ledger's conditional update, so exactly one wins and
/// the loser re-reads the winner's status.
pub struct ApprovalGate {
    ledger: Arc<RunLedger>,
    notifier: Arc<dyn Notifier>,
    lockdown: Arc<Lockdown>,
    shutdown: ShutdownSignal,
    config: ApprovalConfig,
}

impl ApprovalGate {
    pub fn new(
        ledger: Arc<RunLedger>,
        notifier: Arc<dyn Notifier>,
        lockdown: Arc<Lockdown>,
        shutdown: ShutdownSignal,
        config: ApprovalConfig,
    ) -> Self {
        Self {
            ledger,
            notifier,
            lockdown,
            shutdown,
            config,
        }
    }

    pub fn config(&self) -> ApprovalConfig {
        self.config
    }

    /// Persist a `pending` request, tell the human, and park the run in
    /// `awaiting_approval`.
    pub async fn request_approval(
        &self,
        run_id: Uuid,
        risk: RiskClass,
        summary: &str,
        channel_id: &str,
        message: &str,
    ) -> Result<Uuid> {
        let approval_id = self.ledger.create_approval(run_id, risk, summary).await?;

        if let Err(e) = self.notifier.notify(channel_id, message).await {
            warn!(approval_id = %approval_id, error = %e, "approval notification failed");
        }

        if !self.ledger.mark_awaiting_approval(run_id).await? {
            debug!(run_id = %run_id, "run not parked, it already left the active set");
        }

        info!(approval_id = %approval_id, run_id = %run_id, risk = %risk, "approval requested");
        Ok(approval_id)
    }

    /// Suspend until the request leaves `pending`.
    ///
    /// Lockdown observed during the wait force-resolves the request to
    /// `denied`; the deadline resolves it to `timeout`. Shutdown abandons
    /// the wait and leaves the request to the sweeper.
    pub async fn await_decision(&self, approval_id: Uuid, timeout: Duration) -> Result<ApprovalStatus> {
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
        let mut lockdown_rx = self.lockdown.subscribe();
        let mut lockdown_open = true;
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.lockdown.is_locked() {
                info!(approval_id = %approval_id, "lockdown during approval wait, denying");
                return self.force_resolve(approval_id, ApprovalStatus::Denied).await;
            }

            let request = self
                .ledger
                .get_approval(approval_id)
                .await?
                .ok_or(ApprovalError::NotFound(approval_id))?;
            if request.status.is_resolved() {
                debug!(approval_id = %approval_id, status = %request.status, "approval resolved");
                return Ok(request.status);
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = lockdown_rx.changed(), if lockdown_open => {
                    if changed.is_err() {
                        lockdown_open = false;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    info!(approval_id = %approval_id, "approval wait timed out");
                    return self.force_resolve(approval_id, ApprovalStatus::Timeout).await;
                }
                _ = self.shutdown.cancelled() => {
                    return Err(ApprovalError::Shutdown);
                }
            }
        }
    }

    /// The human path: approve or deny a specific request.
    pub async fn resolve(&self, approval_id: Uuid, decision: ApprovalStatus) -> Result<ApprovalRequest> {
        if !matches!(decision, ApprovalStatus::Approved | ApprovalStatus::Denied) {
            return Err(ApprovalError::InvalidDecision(decision));
        }

        let won = self.ledger.resolve_approval(approval_id, decision).await?;
        let request = self
            .ledger
            .get_approval(approval_id)
            .await?
            .ok_or(ApprovalError::NotFound(approval_id))?;

        if !won {
            return Err(ApprovalError::AlreadyResolved {
                id: approval_id,
                status: request.status,
            });
        }
        info!(approval_id = %approval_id, decision = %decision, "approval resolved by user");
        Ok(request)
    }

    /// Resolve the oldest pending request, the target of a bare
    /// "approve"/"deny" reply.
    pub async fn resolve_oldest(&self, decision: ApprovalStatus) -> Result<ApprovalRequest> {
        let pending = self
            .ledger
            .oldest_pending_approval()
            .await?
            .ok_or(ApprovalError::NoPending)?;
        self.resolve(pending.id, decision).await
    }

    /// Conditional resolve; when another resolver won, report its status.
    async fn force_resolve(&self, approval_id: Uuid, status: ApprovalStatus) -> Result<ApprovalStatus> {
        if self.ledger.resolve_approval(approval_id, status).await? {
            return Ok(status);
        }
        let request = self
            .ledger
            .get_approval(approval_id)
            .await?
            .ok_or(ApprovalError::NotFound(approval_id))?;
        debug!(
            approval_id = %approval_id,
            wanted = %status,
            actual = %request.status,
            "approval already resolved elsewhere"
        );
        Ok(request.status)
    }
}

// ---------------------------------------------------------------------------
// ApprovalSweeper
// ---------------------------------------------------------------------------

/// Times out pending requests older than the approval timeout, independent
/// of any in-flight wait.
pub struct ApprovalSweeper {
    ledger: Arc<RunLedger>,
    timeout: Duration,
    interval: Duration,
}

impl ApprovalSweeper {
    pub fn new(ledger: Arc<RunLedger>, timeout: Duration, interval: Duration) -> Self {
        Self {
            ledger,
            timeout,
            interval,
        }
    }

    pub async fn sweep_once(&self) -> std::result::Result<u64, LedgerError> {
        let older_than =
            chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);
        let timed_out = self.ledger.timeout_stale_approvals(older_than).await?;
        if timed_out > 0 {
            info!(count = timed_out, "timed out stale approvals");
        }
        Ok(timed_out)
    }

    /// Sweep every interval until shutdown.
    pub async fn run(self, shutdown: ShutdownSignal) {
        info!(
            timeout_secs = self.timeout.as_secs(),
            interval_secs = self.interval.as_secs(),
            "approval sweeper started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "approval sweep failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("approval sweeper stopped");
                    break;
                }
            }
        }
    }
}
