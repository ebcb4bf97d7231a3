use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use ow_core::ledger::{AuditSink, LedgerError, RunLedger};
use ow_core::types::{
    truncate_chars, AgentContext, AuditEvent, NewRun, RiskClass, RunCompletion, RunStatus,
};
use ow_harness::llm::{LlmConfig, LlmError, LlmMessage, LlmProvider, LlmResponse};
use ow_harness::tariff::Tariff;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::response::{decode_response, ResponseError};

// ---------------------------------------------------------------------------
// AgentSpec
// ---------------------------------------------------------------------------

/// What distinguishes one task agent from another: its prompt, its output
/// schema, and how its runs are labelled and summarised.
///
/// The invocation machinery (run bookkeeping, the model call, extraction,
/// audit) is shared by every agent through [`TaskAgent`].
pub trait AgentSpec: Send + Sync + 'static {
    /// Role-specific input beyond the task description.
    type Input: Send + Sync;
    /// Strictly decoded structured output.
    type Output: DeserializeOwned + Serialize + Send;

    /// Ledger and audit name, e.g. `planner`.
    const NAME: &'static str;
    /// Human-facing name used in error messages, e.g. `Planner`.
    const LABEL: &'static str;
    const TASK_TYPE: &'static str;
    const ACTION: &'static str;

    fn system_prompt() -> &'static str;

    fn risk_class(input: &Self::Input) -> RiskClass;

    fn user_message(task: &str, input: &Self::Input) -> String;

    /// JSON payload stored on the run at creation.
    fn run_input(task: &str, input: &Self::Input) -> serde_json::Value;

    fn input_summary(task: &str, _input: &Self::Input) -> String {
        truncate_chars(task, 100).to_string()
    }

    /// Semantic checks beyond the schema. The message completes the
    /// sentence "<Label> returned ...".
    fn validate(_output: &Self::Output) -> Result<(), String> {
        Ok(())
    }

    fn output_summary(output: &Self::Output) -> String;

    fn decision(_output: &Self::Output) -> &'static str {
        "auto_approved"
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("task description is empty")]
    EmptyTask,

    #[error("{0}")]
    Llm(#[from] LlmError),

    #[error("{agent} returned no valid JSON")]
    NoJson { agent: &'static str },

    #[error("{agent} returned invalid JSON: {detail}")]
    InvalidJson { agent: &'static str, detail: String },

    #[error("{agent} returned {reason}")]
    Invalid { agent: &'static str, reason: String },

    /// The run left the active set (lockdown) before this agent could
    /// record its result. Any model output has been discarded.
    #[error("run {0} was cancelled")]
    Cancelled(Uuid),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

impl AgentError {
    fn from_response(agent: &'static str, err: ResponseError) -> Self {
        match err {
            ResponseError::NoJson => AgentError::NoJson { agent },
            ResponseError::InvalidJson(detail) => AgentError::InvalidJson { agent, detail },
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation types
// ---------------------------------------------------------------------------

/// Optional run linkage for one invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentInvocation {
    /// Parent recorded on a newly created run.
    pub parent_run_id: Option<Uuid>,
    /// Use this already-created run instead of creating a new one.
    pub reserved_run_id: Option<Uuid>,
}

impl AgentInvocation {
    pub fn with_parent(parent: Option<Uuid>) -> Self {
        Self {
            parent_run_id: parent,
            reserved_run_id: None,
        }
    }

    pub fn reserved(run_id: Uuid) -> Self {
        Self {
            parent_run_id: None,
            reserved_run_id: Some(run_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentOutcome<T> {
    pub output: T,
    pub run_id: Uuid,
    pub model: String,
    pub tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// TaskAgent
// ---------------------------------------------------------------------------

/// One prompt-plus-schema agent backed by a language model.
pub struct TaskAgent<S: AgentSpec> {
    provider: Arc<dyn LlmProvider>,
    llm: LlmConfig,
    tariff: Tariff,
    ledger: Arc<RunLedger>,
    audit: Arc<dyn AuditSink>,
    _spec: PhantomData<fn() -> S>,
}

impl<S: AgentSpec> TaskAgent<S> {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        llm: LlmConfig,
        tariff: Tariff,
        ledger: Arc<RunLedger>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            provider,
            llm: llm.with_system_prompt(S::system_prompt()),
            tariff,
            ledger,
            audit,
            _spec: PhantomData,
        }
    }

    pub fn tariff(&self) -> Tariff {
        self.tariff
    }

    /// Create this agent's run in `queued` ahead of time, so it can wait on
    /// approval before [`TaskAgent::invoke`] picks it up.
    pub async fn reserve_run(
        &self,
        task: &str,
        input: &S::Input,
        ctx: &AgentContext,
        parent_run_id: Option<Uuid>,
    ) -> Result<Uuid, AgentError> {
        let run = NewRun::new(S::NAME, task, S::TASK_TYPE, S::risk_class(input))
            .triggered_by(ctx.triggered_by.clone())
            .with_input(S::run_input(task, input))
            .with_parent(parent_run_id);
        Ok(self.ledger.create_run(&run).await?)
    }

    /// Run the agent once: queued → running → model call → extraction →
    /// completed, or failed with the error re-raised to the caller.
    pub async fn invoke(
        &self,
        task: &str,
        input: &S::Input,
        ctx: &AgentContext,
        invocation: AgentInvocation,
    ) -> Result<AgentOutcome<S::Output>, AgentError> {
        if task.trim().is_empty() {
            return Err(AgentError::EmptyTask);
        }

        let started = Instant::now();
        let risk = S::risk_class(input);
        let run_id = match invocation.reserved_run_id {
            Some(id) => id,
            None => {
                self.reserve_run(task, input, ctx, invocation.parent_run_id)
                    .await?
            }
        };

        if !self.ledger.mark_running(run_id).await? {
            let err = AgentError::Cancelled(run_id);
            warn!(agent = S::NAME, run_id = %run_id, "run no longer startable");
            self.record_failure(task, input, ctx, risk, &err, elapsed_ms(started))
                .await;
            return Err(err);
        }
        debug!(agent = S::NAME, run_id = %run_id, trace_id = %ctx.trace_id, "agent run started");

        let (output, response) = match self.call_and_decode(task, input).await {
            Ok(pair) => pair,
            Err(err) => {
                let duration_ms = elapsed_ms(started);
                let message = err.to_string();
                if let Err(e) = self
                    .ledger
                    .finish_run(run_id, RunStatus::Failed, Some(&message), Some(duration_ms))
                    .await
                {
                    warn!(agent = S::NAME, run_id = %run_id, error = %e, "failed to record run failure");
                }
                warn!(agent = S::NAME, run_id = %run_id, error = %message, "agent run failed");
                self.record_failure(task, input, ctx, risk, &err, duration_ms)
                    .await;
                return Err(err);
            }
        };

        let tokens = response.total_tokens();
        let cost_usd = self
            .tariff
            .calculate_cost(response.input_tokens, response.output_tokens);
        let duration_ms = elapsed_ms(started);

        let completion = RunCompletion {
            model: Some(response.model.clone()),
            tokens,
            cost_usd,
            duration_ms,
            output: serde_json::to_value(&output).ok(),
        };
        if !self.ledger.complete_run(run_id, &completion).await? {
            let err = AgentError::Cancelled(run_id);
            warn!(agent = S::NAME, run_id = %run_id, "run cancelled while in flight, output discarded");
            self.record_failure(task, input, ctx, risk, &err, duration_ms)
                .await;
            return Err(err);
        }

        let event = AuditEvent::new(&ctx.trace_id, S::NAME, S::ACTION, risk)
            .input(S::input_summary(task, input))
            .output(S::output_summary(&output))
            .decision(S::decision(&output))
            .usage(response.model.clone(), tokens, cost_usd)
            .duration(duration_ms)
            .metadata(serde_json::json!({ "run_id": run_id }));
        self.emit(event).await;

        info!(
            agent = S::NAME,
            run_id = %run_id,
            tokens,
            cost_usd,
            duration_ms,
            "agent run completed"
        );

        Ok(AgentOutcome {
            output,
            run_id,
            model: response.model,
            tokens,
            cost_usd,
            duration_ms,
        })
    }

    async fn call_and_decode(
        &self,
        task: &str,
        input: &S::Input,
    ) -> Result<(S::Output, LlmResponse), AgentError> {
        let messages = [LlmMessage::user(S::user_message(task, input))];
        let response = self.provider.complete(&messages, &self.llm).await?;

        let output: S::Output = decode_response(&response.content).map_err(|e| {
            debug!(
                agent = S::NAME,
                raw = truncate_chars(&response.content, 500),
                "unusable model response"
            );
            AgentError::from_response(S::LABEL, e)
        })?;
        S::validate(&output).map_err(|reason| AgentError::Invalid {
            agent: S::LABEL,
            reason,
        })?;

        Ok((output, response))
    }

    async fn record_failure(
        &self,
        task: &str,
        input: &S::Input,
        ctx: &AgentContext,
        risk: RiskClass,
        err: &AgentError,
        duration_ms: u64,
    ) {
        let event = AuditEvent::new(&ctx.trace_id, S::NAME, S::ACTION, risk)
            .input(S::input_summary(task, input))
            .error(err.to_string())
            .duration(duration_ms);
        self.emit(event).await;
    }

    async fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(event).await {
            warn!(agent = S::NAME, error = %e, "audit write failed");
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
