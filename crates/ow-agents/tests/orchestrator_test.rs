use std::sync::Arc;
use std::time::Duration;

use ow_agents::approval::{ApprovalConfig, ApprovalGate};
use ow_agents::lockdown::Lockdown;
use ow_agents::narrator::MemoryNotifier;
use ow_agents::orchestrator::{Orchestrator, PipelineAgents, PipelineState, Stage, LOCKDOWN_MESSAGE};
use ow_agents::roles::{CriticAgent, ExecutorAgent, PlannerAgent};
use ow_agents::sentinel::Sentinel;
use ow_core::ledger::RunLedger;
use ow_core::types::{
    AgentContext, ApprovalRequest, ApprovalStatus, PolicyDecision, PolicyRule, RiskClass,
    RunStatus,
};
use ow_harness::llm::{LlmConfig, LlmError, MockProvider};
use ow_harness::shutdown::ShutdownSignal;
use ow_harness::tariff::Tariff;

const PLAN_JSON: &str = r#"{
  "options": [
    {"label": "Read only", "steps": ["fetch issues", "summarise"], "riskClass": "R0", "estimatedCostUsd": 0.01, "rationale": "safe"},
    {"label": "Triage", "steps": ["fetch issues", "label issues"], "riskClass": "R2", "estimatedCostUsd": 0.02, "rationale": "useful"}
  ],
  "recommendedIndex": 1,
  "reasoning": "labels help"
}"#;

const EXEC_JSON: &str =
    r#"{"result": "Labelled 12 issues", "actions": ["fetched", "labelled"], "artifacts": []}"#;

fn review(score: f64, approved: bool) -> String {
    format!(
        r#"{{"approved": {approved}, "score": {score}, "issues": [], "suggestions": ["add dry run"], "reasoning": "checked"}}"#
    )
}

struct Harness {
    ledger: Arc<RunLedger>,
    lockdown: Arc<Lockdown>,
    notifier: MemoryNotifier,
    gate: Arc<ApprovalGate>,
    orchestrator: Arc<Orchestrator>,
    planner: MockProvider,
    critic: MockProvider,
    executor: MockProvider,
}

struct Script {
    rules: Vec<PolicyRule>,
    planner: MockProvider,
    critic: MockProvider,
    executor: MockProvider,
    approval_timeout: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            rules: vec![allow_all()],
            planner: MockProvider::new().with_text(PLAN_JSON, 100, 50),
            critic: MockProvider::new().with_text(review(7.0, true), 80, 20),
            executor: MockProvider::new().with_text(EXEC_JSON, 60, 40),
            approval_timeout: Duration::from_secs(10),
        }
    }
}

fn allow_all() -> PolicyRule {
    PolicyRule::new("allow everything", PolicyDecision::Allow, 100)
}

async fn harness(script: Script) -> Harness {
    let ledger = Arc::new(RunLedger::open_in_memory().await.unwrap());
    for rule in &script.rules {
        ledger.insert_policy_rule(rule).await.unwrap();
    }
    let lockdown = Arc::new(Lockdown::new(ledger.clone(), ledger.clone()));
    let notifier = MemoryNotifier::new();
    let gate = Arc::new(ApprovalGate::new(
        ledger.clone(),
        Arc::new(notifier.clone()),
        lockdown.clone(),
        ShutdownSignal::new(),
        ApprovalConfig {
            poll_interval: Duration::from_millis(20),
            timeout: script.approval_timeout,
        },
    ));

    let agents = PipelineAgents {
        planner: PlannerAgent::new(
            Arc::new(script.planner.clone()),
            LlmConfig::new("claude-sonnet-4-20250514", 2048),
            Tariff::ANTHROPIC_SONNET,
            ledger.clone(),
            ledger.clone(),
        ),
        critic: CriticAgent::new(
            Arc::new(script.critic.clone()),
            LlmConfig::new("gemini-2.5-pro", 4096),
            Tariff::GEMINI_PRO,
            ledger.clone(),
            ledger.clone(),
        ),
        executor: ExecutorAgent::new(
            Arc::new(script.executor.clone()),
            LlmConfig::new("claude-sonnet-4-20250514", 2048),
            Tariff::ANTHROPIC_SONNET,
            ledger.clone(),
            ledger.clone(),
        ),
    };
    let sentinel = Arc::new(Sentinel::new(ledger.clone(), ledger.clone()));
    let orchestrator = Orchestrator::new(
        agents,
        sentinel,
        lockdown.clone(),
        gate.clone(),
        ledger.clone(),
        Arc::new(notifier.clone()),
    )
    .with_approval_timeout(script.approval_timeout);

    Harness {
        ledger,
        lockdown,
        notifier,
        gate,
        orchestrator: Arc::new(orchestrator),
        planner: script.planner,
        critic: script.critic,
        executor: script.executor,
    }
}

fn ctx(trace: &str) -> AgentContext {
    AgentContext::new("ops", "alice").with_trace_id(trace)
}

impl Harness {
    fn spawn(&self, task: &str, trace: &str, auto: bool) -> tokio::task::JoinHandle<PipelineState> {
        let orchestrator = self.orchestrator.clone();
        let task = task.to_string();
        let context = ctx(trace);
        tokio::spawn(async move { orchestrator.run_task(&task, context, auto).await })
    }

    async fn pending_approval(&self) -> ApprovalRequest {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(request) = self.ledger.oldest_pending_approval().await.unwrap() {
                return request;
            }
            assert!(tokio::time::Instant::now() < deadline, "no approval was requested");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Messages other than the approval prompt.
    fn outcome_messages(&self) -> Vec<String> {
        self.notifier
            .messages()
            .into_iter()
            .map(|(_, message)| message)
            .filter(|message| !message.starts_with("*Agent Plan*"))
            .collect()
    }
}

// ===========================================================================
// Routing
// ===========================================================================

#[tokio::test]
async fn allow_without_auto_execute_goes_through_approval() {
    let h = harness(Script::default()).await;
    let handle = h.spawn("triage the issue tracker", "t-gate", false);

    let request = h.pending_approval().await;
    assert_eq!(request.risk_class, RiskClass::R2);
    assert_eq!(request.summary, "Execute: triage the issue tracker");
    assert!(h.executor.captured_requests().is_empty(), "no execution before approval");

    let reserved = h.ledger.get_run(request.run_id).await.unwrap().unwrap();
    assert_eq!(reserved.status, RunStatus::AwaitingApproval);
    assert_eq!(reserved.agent_name, "executor");

    h.gate.resolve(request.id, ApprovalStatus::Approved).await.unwrap();
    let state = handle.await.unwrap();

    assert_eq!(
        state.history,
        vec![
            Stage::Start,
            Stage::Plan,
            Stage::Critic,
            Stage::Sentinel,
            Stage::ApprovalGate,
            Stage::Execute,
            Stage::NotifySuccess,
            Stage::Done,
        ]
    );
    assert_eq!(state.stage, Stage::Done);
    assert_eq!(state.approval_status, Some(ApprovalStatus::Approved));
    assert_eq!(state.executor_run_id, Some(request.run_id));
    assert_eq!(state.totals.tokens, 350);
    assert_eq!(state.selected_option().unwrap().label, "Triage");

    let executed = h.ledger.get_run(request.run_id).await.unwrap().unwrap();
    assert_eq!(executed.status, RunStatus::Completed);
    assert_eq!(executed.parent_run_id, state.plan_run_id);

    let all = h.notifier.messages();
    assert_eq!(all.len(), 2);
    assert!(all[0].1.starts_with("*Agent Plan* | triage the issue tracker"));
    assert!(all[1].1.starts_with("*Executed* | triage the issue tracker"));
    assert!(all[1].1.contains("Tokens: 350"));
    assert!(all.iter().all(|(channel, _)| channel == "ops"));
}

#[tokio::test]
async fn allow_with_auto_execute_skips_the_gate() {
    let h = harness(Script::default()).await;
    let state = h.orchestrator.run_task("triage", ctx("t-auto"), true).await;

    assert!(!state.visited(Stage::ApprovalGate));
    assert_eq!(state.outcome(), Some(Stage::NotifySuccess));
    assert_eq!(
        state.execution_result.as_ref().unwrap().result,
        "Labelled 12 issues"
    );
    assert!(h.ledger.oldest_pending_approval().await.unwrap().is_none());
    assert_eq!(h.notifier.messages().len(), 1);

    let cost = state.totals.cost_usd;
    let expected = Tariff::ANTHROPIC_SONNET.calculate_cost(100, 50)
        + Tariff::GEMINI_PRO.calculate_cost(80, 20)
        + Tariff::ANTHROPIC_SONNET.calculate_cost(60, 40);
    assert!((cost - expected).abs() < 1e-12);
}

#[tokio::test]
async fn require_approval_gates_even_with_auto_execute() {
    let h = harness(Script {
        rules: vec![
            PolicyRule::new("external writes need a human", PolicyDecision::RequireApproval, 10)
                .agent("executor")
                .risk(RiskClass::R2),
            allow_all(),
        ],
        ..Script::default()
    })
    .await;
    let handle = h.spawn("triage", "t-req", true);

    let request = h.pending_approval().await;
    h.gate.resolve(request.id, ApprovalStatus::Denied).await.unwrap();
    let state = handle.await.unwrap();

    assert_eq!(state.outcome(), Some(Stage::NotifyDenial));
    assert_eq!(state.denial_reason.as_deref(), Some("User denied the plan"));
    assert!(h.executor.captured_requests().is_empty());

    let run = h.ledger.get_run(request.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.error.as_deref(), Some("User denied the plan"));

    let outcomes = h.outcome_messages();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].starts_with("*Denied* | triage\nReason: User denied the plan"));
}

#[tokio::test]
async fn sentinel_deny_ends_in_denial() {
    let h = harness(Script {
        rules: vec![PolicyRule::new("no executor", PolicyDecision::Deny, 0).agent("*")],
        ..Script::default()
    })
    .await;
    let state = h.orchestrator.run_task("triage", ctx("t-deny"), true).await;

    assert_eq!(state.outcome(), Some(Stage::NotifyDenial));
    assert_eq!(
        state.denial_reason.as_deref(),
        Some("Sentinel denied: Matched policy: no executor (priority 0)")
    );
    assert!(!state.visited(Stage::Execute));
    assert!(h.executor.captured_requests().is_empty());
    assert_eq!(state.totals.tokens, 250);

    let sent = h.notifier.messages();
    assert_eq!(sent.len(), 1);
    let footer = format!(
        "\nTokens: 250 | Cost: ${:.3} | Time: {:.1}s",
        state.totals.cost_usd,
        state.totals.duration_ms as f64 / 1000.0
    );
    assert!(sent[0].1.ends_with(&footer), "{}", sent[0].1);
}

#[tokio::test]
async fn no_policies_fail_closed() {
    let h = harness(Script {
        rules: vec![],
        ..Script::default()
    })
    .await;
    let state = h.orchestrator.run_task("triage", ctx("t"), true).await;
    assert_eq!(
        state.denial_reason.as_deref(),
        Some("Sentinel denied: FAIL-CLOSED: No policies loaded")
    );
}

// ===========================================================================
// Critic floor
// ===========================================================================

#[tokio::test]
async fn low_score_is_denied_even_when_approved() {
    let h = harness(Script {
        critic: MockProvider::new().with_text(review(2.0, true), 10, 10),
        ..Script::default()
    })
    .await;
    let state = h.orchestrator.run_task("triage", ctx("t"), true).await;

    assert_eq!(state.outcome(), Some(Stage::NotifyDenial));
    assert_eq!(
        state.denial_reason.as_deref(),
        Some("Critic rejected the plan (score 2/10)")
    );
    assert!(!state.visited(Stage::Sentinel));
}

#[tokio::test]
async fn score_at_the_floor_proceeds_even_when_not_approved() {
    let h = harness(Script {
        critic: MockProvider::new().with_text(review(3.0, false), 10, 10),
        ..Script::default()
    })
    .await;
    let state = h.orchestrator.run_task("triage", ctx("t"), true).await;

    assert!(state.visited(Stage::Sentinel));
    assert_eq!(state.outcome(), Some(Stage::NotifySuccess));
}

// ===========================================================================
// Errors
// ===========================================================================

#[tokio::test]
async fn planner_without_json_ends_in_error() {
    let h = harness(Script {
        planner: MockProvider::new().with_text("Sorry, I can't produce a plan.", 10, 10),
        ..Script::default()
    })
    .await;
    let state = h.orchestrator.run_task("triage", ctx("t-s5"), false).await;

    assert_eq!(state.outcome(), Some(Stage::NotifyError));
    assert_eq!(
        state.error.as_deref(),
        Some("Planner failed: Planner returned no valid JSON")
    );
    assert!(h.critic.captured_requests().is_empty());

    let runs = h.ledger.recent_runs(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);

    let events = h.ledger.list_audit_events("t-s5").await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].error.is_some());

    let sent = h.notifier.messages();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.starts_with(
        "*Agent Error* | triage\nPlanner failed: Planner returned no valid JSON\nTokens: 0 | Cost: $0.000 | Time: "
    ));
}

#[tokio::test]
async fn out_of_range_recommendation_ends_in_error() {
    let bad = PLAN_JSON.replace("\"recommendedIndex\": 1", "\"recommendedIndex\": 5");
    let h = harness(Script {
        planner: MockProvider::new().with_text(bad, 10, 10),
        ..Script::default()
    })
    .await;
    let state = h.orchestrator.run_task("triage", ctx("t"), true).await;

    assert_eq!(state.outcome(), Some(Stage::NotifyError));
    assert!(state.error.as_deref().unwrap().starts_with("Planner failed:"));
    assert!(!state.visited(Stage::Critic));
}

#[tokio::test]
async fn critic_failure_ends_in_error() {
    let h = harness(Script {
        critic: MockProvider::new().with_error(LlmError::Timeout),
        ..Script::default()
    })
    .await;
    let state = h.orchestrator.run_task("triage", ctx("t"), true).await;

    assert_eq!(state.outcome(), Some(Stage::NotifyError));
    assert_eq!(state.error.as_deref(), Some("Critic failed: request timed out"));
    assert_eq!(state.totals.tokens, 150, "planner usage is still counted");
}

#[tokio::test]
async fn executor_failure_ends_in_error() {
    let h = harness(Script {
        executor: MockProvider::new().with_text("done, no json", 10, 10),
        ..Script::default()
    })
    .await;
    let state = h.orchestrator.run_task("triage", ctx("t"), true).await;

    assert_eq!(state.outcome(), Some(Stage::NotifyError));
    assert_eq!(
        state.error.as_deref(),
        Some("Executor failed: Executor returned no valid JSON")
    );
    assert_eq!(state.totals.tokens, 250, "planner and critic usage");

    let sent = h.notifier.messages();
    assert_eq!(sent.len(), 1);
    let footer = format!(
        "\nTokens: 250 | Cost: ${:.3} | Time: {:.1}s",
        state.totals.cost_usd,
        state.totals.duration_ms as f64 / 1000.0
    );
    assert!(sent[0].1.starts_with("*Agent Error* | triage\nExecutor failed:"));
    assert!(sent[0].1.ends_with(&footer), "{}", sent[0].1);
}

// ===========================================================================
// Lockdown and timeout
// ===========================================================================

#[tokio::test]
async fn lockdown_at_entry_does_no_work() {
    let h = harness(Script::default()).await;
    h.lockdown.activate("t").await.unwrap();

    let state = h.orchestrator.run_task("triage", ctx("t"), true).await;
    assert_eq!(
        state.history,
        vec![Stage::Start, Stage::NotifyError, Stage::Done]
    );
    assert_eq!(state.error.as_deref(), Some(LOCKDOWN_MESSAGE));
    assert!(h.planner.captured_requests().is_empty());
    assert!(h.ledger.recent_runs(10).await.unwrap().is_empty());

    let sent = h.notifier.messages();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.starts_with(&format!(
        "*Agent Error* | triage\n{LOCKDOWN_MESSAGE}\nTokens: 0 | Cost: $0.000 | Time: "
    )));
}

#[tokio::test]
async fn lockdown_while_awaiting_approval_is_a_denial() {
    let h = harness(Script::default()).await;
    let handle = h.spawn("triage", "t-kill", false);

    let request = h.pending_approval().await;
    h.lockdown.activate("t-kill").await.unwrap();
    let state = tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .expect("pipeline should stop promptly")
        .unwrap();

    assert_eq!(state.outcome(), Some(Stage::NotifyDenial));
    assert_eq!(state.approval_status, Some(ApprovalStatus::Denied));
    assert_eq!(
        state.denial_reason.as_deref(),
        Some("Lockdown activated while awaiting approval")
    );
    assert_eq!(
        h.ledger.get_approval(request.id).await.unwrap().unwrap().status,
        ApprovalStatus::Denied
    );
    assert_eq!(
        h.ledger.get_run(request.run_id).await.unwrap().unwrap().status,
        RunStatus::Cancelled
    );
    assert!(h.executor.captured_requests().is_empty());
}

#[tokio::test]
async fn approval_timeout_is_a_denial() {
    let h = harness(Script {
        approval_timeout: Duration::from_millis(150),
        ..Script::default()
    })
    .await;
    let state = h.orchestrator.run_task("triage", ctx("t"), false).await;

    assert_eq!(state.outcome(), Some(Stage::NotifyDenial));
    assert_eq!(state.approval_status, Some(ApprovalStatus::Timeout));
    assert_eq!(state.denial_reason.as_deref(), Some("Approval timed out"));

    let run = h
        .ledger
        .get_run(state.executor_run_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.error.as_deref(), Some("Approval timed out"));
    assert_eq!(h.outcome_messages().len(), 1);
}

#[tokio::test]
async fn concurrent_tasks_share_ledger_but_not_state() {
    let h = harness(Script {
        planner: MockProvider::new()
            .with_text(PLAN_JSON, 100, 50)
            .with_text(PLAN_JSON, 100, 50),
        critic: MockProvider::new()
            .with_text(review(7.0, true), 80, 20)
            .with_text(review(7.0, true), 80, 20),
        executor: MockProvider::new()
            .with_text(EXEC_JSON, 60, 40)
            .with_text(EXEC_JSON, 60, 40),
        ..Script::default()
    })
    .await;

    let a = h.spawn("first", "t-a", true);
    let b = h.spawn("second", "t-b", true);
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert_eq!(a.outcome(), Some(Stage::NotifySuccess));
    assert_eq!(b.outcome(), Some(Stage::NotifySuccess));
    assert_eq!(a.totals.tokens, 350);
    assert_eq!(b.totals.tokens, 350);
    assert_ne!(a.plan_run_id, b.plan_run_id);
    assert_eq!(h.ledger.recent_runs(10).await.unwrap().len(), 6);
}
