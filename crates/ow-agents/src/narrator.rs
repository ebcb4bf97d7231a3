//! Human-facing narration: pure formatting of pipeline outcomes and the
//! `Notifier` seam they are delivered through.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ow_core::types::{truncate_chars, AgentRun, CriticOutput, ExecutorOutput, PlannerOutput};
use serde::Serialize;
use tracing::info;

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("channel closed")]
    Closed,
}

/// Outbound delivery of a rendered message to a channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel_id: &str, message: &str) -> Result<(), NotifyError>;
}

/// Writes every notification to the process log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, channel_id: &str, message: &str) -> Result<(), NotifyError> {
        info!(channel = channel_id, "{message}");
        Ok(())
    }
}

/// Keeps every notification in memory. Used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(channel_id, message)` pairs in delivery order.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, channel_id: &str, message: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .map_err(|_| NotifyError::Closed)?
            .push((channel_id.to_string(), message.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Totals appended to terminal messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

pub fn format_plan_for_approval(plan: &PlannerOutput, review: &CriticOutput, task: &str) -> String {
    let mut msg = format!("*Agent Plan* | {task}\n\n");

    for (i, opt) in plan.options.iter().enumerate() {
        let rec = if i == plan.recommended_index {
            " [RECOMMENDED]"
        } else {
            ""
        };
        let _ = writeln!(msg, "*Option {}: {}*{}", i + 1, opt.label, rec);
        let _ = writeln!(
            msg,
            "Risk: {} | Est: ${:.3}",
            opt.risk_class, opt.estimated_cost_usd
        );
        for step in &opt.steps {
            let _ = writeln!(msg, "  - {step}");
        }
        msg.push('\n');
    }

    let _ = writeln!(msg, "*Critic Review* ({}/10)", review.score);
    if !review.issues.is_empty() {
        let _ = writeln!(msg, "Issues: {}", review.issues.join("; "));
    }
    if !review.suggestions.is_empty() {
        let _ = writeln!(msg, "Suggestions: {}", review.suggestions.join("; "));
    }
    let verdict = if review.approved {
        "APPROVED"
    } else {
        "NEEDS REVIEW"
    };
    let _ = writeln!(msg, "Verdict: {verdict}");
    msg.push_str("\nReply *approve* or *deny*");
    msg
}

pub fn format_execution_result(result: &ExecutorOutput, task: &str, totals: UsageTotals) -> String {
    let mut msg = format!("*Executed* | {task}\n\n{}\n", result.result);

    if !result.actions.is_empty() {
        msg.push_str("\n*Actions:*\n");
        for action in &result.actions {
            let _ = writeln!(msg, "  - {action}");
        }
    }
    if !result.artifacts.is_empty() {
        msg.push_str("\n*Artifacts:*\n");
        for artifact in &result.artifacts {
            let _ = writeln!(msg, "  - {artifact}");
        }
    }

    msg.push('\n');
    msg.push_str(&usage_footer(totals));
    msg
}

pub fn format_denial(task: &str, reason: &str, totals: UsageTotals) -> String {
    format!("*Denied* | {task}\nReason: {reason}\n{}", usage_footer(totals))
}

pub fn format_error(task: &str, error: &str, totals: UsageTotals) -> String {
    format!("*Agent Error* | {task}\n{error}\n{}", usage_footer(totals))
}

/// `Tokens: n | Cost: $c | Time: ts`, appended to every terminal message.
fn usage_footer(totals: UsageTotals) -> String {
    format!(
        "Tokens: {} | Cost: ${:.3} | Time: {:.1}s",
        totals.tokens,
        totals.cost_usd,
        totals.duration_ms as f64 / 1000.0
    )
}

pub fn format_kill_confirmation(cancelled: u64) -> String {
    format!(
        "*LOCKDOWN ACTIVE*\nAll agent operations suspended.\n{cancelled} running task(s) cancelled.\nSend *resume* to exit lockdown."
    )
}

pub fn format_resume_confirmation() -> String {
    "*LOCKDOWN LIFTED*\nAgent operations resumed.\nAll systems operational.".to_string()
}

pub fn format_agent_status(active: &[AgentRun], recent: &[AgentRun], locked: bool) -> String {
    let mut msg = format!(
        "*Agent Status*{}\n\n",
        if locked { " [LOCKDOWN]" } else { "" }
    );

    if active.is_empty() {
        msg.push_str("No active agents.\n\n");
    } else {
        msg.push_str("*Active:*\n");
        for run in active {
            let _ = writeln!(
                msg,
                "  [{}] {}: {} ({})",
                run.status,
                run.agent_name,
                truncate_chars(&run.task_description, 40),
                short_id(run)
            );
        }
        msg.push('\n');
    }

    if !recent.is_empty() {
        msg.push_str("*Recent:*\n");
        for run in recent {
            let cost = run
                .cost_usd
                .filter(|c| *c > 0.0)
                .map(|c| format!(" ${c:.3}"))
                .unwrap_or_default();
            let dur = run
                .duration_ms
                .filter(|d| *d > 0)
                .map(|d| format!(" {:.1}s", d as f64 / 1000.0))
                .unwrap_or_default();
            let _ = writeln!(
                msg,
                "  [{}] {}: {}{}{} ({})",
                run.status,
                run.agent_name,
                truncate_chars(&run.task_description, 40),
                cost,
                dur,
                short_id(run)
            );
        }
    }

    msg
}

fn short_id(run: &AgentRun) -> String {
    run.id.simple().to_string()[..8].to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
