//! The supervised pipeline: Planner → Critic → Sentinel → (Approval Gate) →
//! Executor → Notify, driven as an explicit state machine.
//!
//! One call to [`Orchestrator::run_task`] owns one [`PipelineState`]. Tasks
//! in flight at the same time share only the sentinel's rule cache, the run
//! ledger and the lockdown flag.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ow_core::ledger::RunLedger;
use ow_core::types::{
    truncate_chars, AgentContext, ApprovalStatus, CriticOutput, ExecutorOutput, PlanOption,
    PlannerOutput, PolicyDecision, RunStatus,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::lockdown::Lockdown;
use crate::narrator::{self, Notifier, UsageTotals};
use crate::roles::{CriticAgent, Executor, ExecutorAgent, PlannerAgent, PlannerInput};
use crate::sentinel::{Sentinel, SentinelResult};
use crate::task_agent::{AgentInvocation, AgentOutcome, AgentSpec};

pub const DEFAULT_CRITIC_SCORE_FLOOR: f64 = 3.0;
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub const LOCKDOWN_MESSAGE: &str = "LOCKDOWN: All agent operations suspended";

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    Plan,
    Critic,
    Sentinel,
    ApprovalGate,
    Execute,
    NotifySuccess,
    NotifyDenial,
    NotifyError,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::Plan => "plan",
            Stage::Critic => "critic",
            Stage::Sentinel => "sentinel",
            Stage::ApprovalGate => "approval_gate",
            Stage::Execute => "execute",
            Stage::NotifySuccess => "notify_success",
            Stage::NotifyDenial => "notify_denial",
            Stage::NotifyError => "notify_error",
            Stage::Done => "done",
        }
    }

    pub fn is_notify(&self) -> bool {
        matches!(
            self,
            Stage::NotifySuccess | Stage::NotifyDenial | Stage::NotifyError
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

/// Everything one task accumulated on its way through the pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub task: String,
    pub context: AgentContext,
    pub auto_execute: bool,
    pub stage: Stage,
    /// Every stage entered, in order, ending with `done`.
    pub history: Vec<Stage>,
    pub plan: Option<PlannerOutput>,
    pub plan_run_id: Option<Uuid>,
    pub review: Option<CriticOutput>,
    pub critic_run_id: Option<Uuid>,
    pub selected_option_index: Option<usize>,
    pub sentinel: Option<SentinelResult>,
    pub approval_request_id: Option<Uuid>,
    pub approval_status: Option<ApprovalStatus>,
    pub execution_result: Option<ExecutorOutput>,
    pub executor_run_id: Option<Uuid>,
    pub totals: UsageTotals,
    pub denial_reason: Option<String>,
    pub error: Option<String>,
}

impl PipelineState {
    fn new(task: &str, context: AgentContext, auto_execute: bool) -> Self {
        Self {
            task: task.to_string(),
            context,
            auto_execute,
            stage: Stage::Start,
            history: Vec::new(),
            plan: None,
            plan_run_id: None,
            review: None,
            critic_run_id: None,
            selected_option_index: None,
            sentinel: None,
            approval_request_id: None,
            approval_status: None,
            execution_result: None,
            executor_run_id: None,
            totals: UsageTotals::default(),
            denial_reason: None,
            error: None,
        }
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        self.history.push(stage);
    }

    /// Whether the task passed through `stage`.
    pub fn visited(&self, stage: Stage) -> bool {
        self.history.contains(&stage)
    }

    /// The notify stage the task ended in, if it reached one.
    pub fn outcome(&self) -> Option<Stage> {
        self.history.iter().rev().copied().find(Stage::is_notify)
    }

    pub fn selected_option(&self) -> Option<&PlanOption> {
        let plan = self.plan.as_ref()?;
        plan.options.get(self.selected_option_index?)
    }

    fn add_usage<T>(&mut self, outcome: &AgentOutcome<T>) {
        self.totals.tokens += outcome.tokens;
        self.totals.cost_usd += outcome.cost_usd;
    }

    fn fail(&mut self, error: impl Into<String>) -> Stage {
        self.error = Some(error.into());
        Stage::NotifyError
    }

    fn deny(&mut self, reason: impl Into<String>) -> Stage {
        self.denial_reason = Some(reason.into());
        Stage::NotifyDenial
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The three language-model agents the pipeline drives.
pub struct PipelineAgents {
    pub planner: PlannerAgent,
    pub critic: CriticAgent,
    pub executor: ExecutorAgent,
}

pub struct Orchestrator {
    agents: PipelineAgents,
    sentinel: Arc<Sentinel>,
    lockdown: Arc<Lockdown>,
    gate: Arc<ApprovalGate>,
    ledger: Arc<RunLedger>,
    notifier: Arc<dyn Notifier>,
    critic_score_floor: f64,
    approval_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        agents: PipelineAgents,
        sentinel: Arc<Sentinel>,
        lockdown: Arc<Lockdown>,
        gate: Arc<ApprovalGate>,
        ledger: Arc<RunLedger>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            agents,
            sentinel,
            lockdown,
            gate,
            ledger,
            notifier,
            critic_score_floor: DEFAULT_CRITIC_SCORE_FLOOR,
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
        }
    }

    /// Critic scores strictly below this are rejected whatever the
    /// critic's own verdict.
    pub fn with_critic_floor(mut self, floor: f64) -> Self {
        self.critic_score_floor = floor;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    pub fn lockdown(&self) -> &Arc<Lockdown> {
        &self.lockdown
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    /// Drive one task to `done`. Never fails: every error ends in a
    /// `notify_*` stage with exactly one outbound notification.
    pub async fn run_task(
        &self,
        description: &str,
        context: AgentContext,
        auto_execute: bool,
    ) -> PipelineState {
        let started = Instant::now();
        let mut state = PipelineState::new(description, context, auto_execute);
        info!(
            trace_id = %state.context.trace_id,
            auto_execute,
            task = truncate_chars(description, 80),
            "task accepted"
        );

        let mut stage = Stage::Start;
        loop {
            state.enter(stage);
            stage = match stage {
                Stage::Start => self.start(&mut state),
                Stage::Plan => self.plan(&mut state).await,
                Stage::Critic => self.critic(&mut state).await,
                Stage::Sentinel => self.sentinel(&mut state).await,
                Stage::ApprovalGate => self.approval_gate(&mut state).await,
                Stage::Execute => self.execute(&mut state).await,
                Stage::NotifySuccess | Stage::NotifyDenial | Stage::NotifyError => {
                    state.totals.duration_ms = started.elapsed().as_millis() as u64;
                    self.notify(&state, stage).await;
                    Stage::Done
                }
                Stage::Done => break,
            };
        }

        info!(
            trace_id = %state.context.trace_id,
            outcome = %state.outcome().map(|s| s.as_str()).unwrap_or("none"),
            tokens = state.totals.tokens,
            cost_usd = state.totals.cost_usd,
            duration_ms = state.totals.duration_ms,
            "task finished"
        );
        state
    }

    // -- stages --------------------------------------------------------------

    fn start(&self, state: &mut PipelineState) -> Stage {
        if self.lockdown.is_locked() {
            return state.fail(LOCKDOWN_MESSAGE);
        }
        Stage::Plan
    }

    async fn plan(&self, state: &mut PipelineState) -> Stage {
        if self.lockdown.is_locked() {
            return state.fail(LOCKDOWN_MESSAGE);
        }

        let result = self
            .agents
            .planner
            .invoke(
                &state.task,
                &PlannerInput::default(),
                &state.context,
                AgentInvocation::default(),
            )
            .await;

        match result {
            Ok(outcome) => {
                state.add_usage(&outcome);
                state.plan_run_id = Some(outcome.run_id);
                state.plan = Some(outcome.output);
                Stage::Critic
            }
            Err(e) => state.fail(format!("Planner failed: {e}")),
        }
    }

    async fn critic(&self, state: &mut PipelineState) -> Stage {
        if self.lockdown.is_locked() {
            return state.fail(LOCKDOWN_MESSAGE);
        }
        let Some(plan) = state.plan.as_ref() else {
            return state.fail("Critic failed: no plan to review");
        };

        let result = self
            .agents
            .critic
            .invoke(
                &state.task,
                plan,
                &state.context,
                AgentInvocation::with_parent(state.plan_run_id),
            )
            .await;

        match result {
            Ok(outcome) => {
                state.add_usage(&outcome);
                state.critic_run_id = Some(outcome.run_id);
                let score = outcome.output.score;
                state.review = Some(outcome.output);
                if score < self.critic_score_floor {
                    return state.deny(format!("Critic rejected the plan (score {score}/10)"));
                }
                Stage::Sentinel
            }
            Err(e) => state.fail(format!("Critic failed: {e}")),
        }
    }

    async fn sentinel(&self, state: &mut PipelineState) -> Stage {
        if self.lockdown.is_locked() {
            return state.fail(LOCKDOWN_MESSAGE);
        }
        let Some(plan) = state.plan.as_ref() else {
            return state.fail("Sentinel failed: no plan to evaluate");
        };
        let index = plan.recommended_index;
        let Some(option) = plan.options.get(index) else {
            return state.fail(format!("Planner failed: recommended option {index} does not exist"));
        };

        let result = self
            .sentinel
            .evaluate_and_log(
                Executor::NAME,
                Executor::ACTION,
                None,
                option.risk_class,
                &state.context.trace_id,
            )
            .await;
        state.selected_option_index = Some(index);

        let next = match result.decision {
            PolicyDecision::Deny => {
                let reason = format!("Sentinel denied: {}", result.reason);
                state.denial_reason = Some(reason);
                Stage::NotifyDenial
            }
            PolicyDecision::Allow if state.auto_execute => Stage::Execute,
            PolicyDecision::Allow
            | PolicyDecision::RequireApproval => Stage::ApprovalGate,
        };
        state.sentinel = Some(result);
        next
    }

    async fn approval_gate(&self, state: &mut PipelineState) -> Stage {
        if self.lockdown.is_locked() {
            return state.fail(LOCKDOWN_MESSAGE);
        }
        let (Some(plan), Some(review), Some(option)) = (
            state.plan.as_ref(),
            state.review.as_ref(),
            state.selected_option(),
        ) else {
            return state.fail("Approval failed: no reviewed plan");
        };
        let risk = option.risk_class;
        let message = narrator::format_plan_for_approval(plan, review, &state.task);
        let summary = format!("Execute: {}", truncate_chars(&state.task, 100));

        let reserved = self
            .agents
            .executor
            .reserve_run(&state.task, option, &state.context, state.plan_run_id)
            .await;
        let run_id = match reserved {
            Ok(id) => id,
            Err(e) => return state.fail(format!("Approval failed: {e}")),
        };
        state.executor_run_id = Some(run_id);

        let requested = self
            .gate
            .request_approval(run_id, risk, &summary, &state.context.channel_id, &message)
            .await;
        let approval_id = match requested {
            Ok(id) => id,
            Err(e) => {
                let error = format!("Approval failed: {e}");
                self.cancel_reserved(run_id, &error).await;
                return state.fail(error);
            }
        };
        state.approval_request_id = Some(approval_id);

        let decision = self.gate.await_decision(approval_id, self.approval_timeout).await;
        match decision {
            Ok(ApprovalStatus::Approved) => {
                state.approval_status = Some(ApprovalStatus::Approved);
                Stage::Execute
            }
            Ok(status @ (ApprovalStatus::Denied | ApprovalStatus::Timeout)) => {
                state.approval_status = Some(status);
                let reason = match status {
                    ApprovalStatus::Timeout => "Approval timed out",
                    _ if self.lockdown.is_locked() => "Lockdown activated while awaiting approval",
                    _ => "User denied the plan",
                };
                self.cancel_reserved(run_id, reason).await;
                state.deny(reason)
            }
            Ok(ApprovalStatus::Pending) => {
                let error = "Approval failed: request still pending";
                self.cancel_reserved(run_id, error).await;
                state.fail(error)
            }
            Err(e) => {
                let error = format!("Approval failed: {e}");
                self.cancel_reserved(run_id, &error).await;
                state.fail(error)
            }
        }
    }

    async fn execute(&self, state: &mut PipelineState) -> Stage {
        if self.lockdown.is_locked() {
            return state.fail(LOCKDOWN_MESSAGE);
        }
        let Some(option) = state.selected_option() else {
            return state.fail("Executor failed: no selected option");
        };
        let invocation = match state.executor_run_id {
            Some(run_id) => AgentInvocation::reserved(run_id),
            None => AgentInvocation::with_parent(state.plan_run_id),
        };

        let result = self
            .agents
            .executor
            .invoke(&state.task, option, &state.context, invocation)
            .await;

        match result {
            Ok(outcome) => {
                state.add_usage(&outcome);
                state.executor_run_id = Some(outcome.run_id);
                state.execution_result = Some(outcome.output);
                Stage::NotifySuccess
            }
            Err(e) => state.fail(format!("Executor failed: {e}")),
        }
    }

    async fn notify(&self, state: &PipelineState, stage: Stage) {
        let message = match (stage, &state.execution_result) {
            (Stage::NotifySuccess, Some(result)) => {
                narrator::format_execution_result(result, &state.task, state.totals)
            }
            (Stage::NotifyDenial, _) => narrator::format_denial(
                &state.task,
                state.denial_reason.as_deref().unwrap_or("Denied"),
                state.totals,
            ),
            _ => narrator::format_error(
                &state.task,
                state.error.as_deref().unwrap_or("Unknown error"),
                state.totals,
            ),
        };

        if let Err(e) = self
            .notifier
            .notify(&state.context.channel_id, &message)
            .await
        {
            warn!(
                trace_id = %state.context.trace_id,
                stage = %stage,
                error = %e,
                "outcome notification failed"
            );
        }
    }

    /// Take the reserved executor run out of the active set. A lockdown may
    /// already have cancelled it, in which case this is a no-op.
    async fn cancel_reserved(&self, run_id: Uuid, reason: &str) {
        match self
            .ledger
            .finish_run(run_id, RunStatus::Cancelled, Some(reason), None)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(run_id = %run_id, "reserved run already terminal");
            }
            Err(e) => warn!(run_id = %run_id, error = %e, "failed to cancel reserved run"),
        }
    }
}
