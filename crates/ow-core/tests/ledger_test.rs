use ow_core::ledger::{AuditSink, LedgerError, PolicySource, RunLedger};
use ow_core::types::*;

fn planner_run() -> NewRun {
    NewRun::new("planner", "rotate the logs", "planning", RiskClass::R0).triggered_by("alice")
}

#[tokio::test]
async fn run_create_and_get() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    let id = ledger
        .create_run(&planner_run().with_input(serde_json::json!({"task": "rotate the logs"})))
        .await
        .unwrap();

    let run = ledger.get_run(id).await.unwrap().expect("run should exist");
    assert_eq!(run.agent_name, "planner");
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.triggered_by, "alice");
    assert_eq!(run.risk_class, RiskClass::R0);
    assert_eq!(run.input.unwrap()["task"], "rotate the logs");
    assert!(run.started_at.is_none());
    assert!(run.completed_at.is_none());
}

#[tokio::test]
async fn run_lifecycle_to_completed() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    let id = ledger.create_run(&planner_run()).await.unwrap();

    assert!(ledger.mark_running(id).await.unwrap());
    let completion = RunCompletion {
        model: Some("claude-sonnet-4-20250514".into()),
        tokens: 1500,
        cost_usd: 0.0105,
        duration_ms: 820,
        output: Some(serde_json::json!({"ok": true})),
    };
    assert!(ledger.complete_run(id, &completion).await.unwrap());

    let run = ledger.get_run(id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.tokens_used, Some(1500));
    assert_eq!(run.duration_ms, Some(820));
    assert_eq!(run.model_used.as_deref(), Some("claude-sonnet-4-20250514"));
    assert!(run.started_at.is_some());
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn terminal_runs_reject_further_writes() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    let id = ledger.create_run(&planner_run()).await.unwrap();
    ledger.mark_running(id).await.unwrap();
    assert!(ledger
        .finish_run(id, RunStatus::Failed, Some("boom"), Some(10))
        .await
        .unwrap());

    assert!(!ledger.mark_running(id).await.unwrap());
    assert!(!ledger
        .complete_run(id, &RunCompletion::default())
        .await
        .unwrap());
    assert!(!ledger
        .finish_run(id, RunStatus::Cancelled, None, None)
        .await
        .unwrap());

    let run = ledger.get_run(id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn finish_run_rejects_non_terminal_target() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    let id = ledger.create_run(&planner_run()).await.unwrap();
    let err = ledger
        .finish_run(id, RunStatus::Running, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransition(_)));
}

#[tokio::test]
async fn awaiting_approval_can_start_running() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    let id = ledger
        .create_run(&NewRun::new("executor", "t", "execution", RiskClass::R2))
        .await
        .unwrap();
    assert!(ledger.mark_awaiting_approval(id).await.unwrap());
    assert_eq!(
        ledger.get_run(id).await.unwrap().unwrap().status,
        RunStatus::AwaitingApproval
    );
    assert!(ledger.mark_running(id).await.unwrap());
}

#[tokio::test]
async fn cancel_active_runs_leaves_terminal_runs_alone() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    let queued = ledger.create_run(&planner_run()).await.unwrap();
    let running = ledger.create_run(&planner_run()).await.unwrap();
    ledger.mark_running(running).await.unwrap();
    let waiting = ledger.create_run(&planner_run()).await.unwrap();
    ledger.mark_awaiting_approval(waiting).await.unwrap();
    let done = ledger.create_run(&planner_run()).await.unwrap();
    ledger.mark_running(done).await.unwrap();
    ledger
        .complete_run(done, &RunCompletion::default())
        .await
        .unwrap();

    assert_eq!(ledger.active_runs().await.unwrap().len(), 3);
    assert_eq!(ledger.cancel_active_runs().await.unwrap(), 3);

    for id in [queued, running, waiting] {
        let run = ledger.get_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(!ledger.mark_running(id).await.unwrap());
    }
    assert_eq!(
        ledger.get_run(done).await.unwrap().unwrap().status,
        RunStatus::Completed
    );
    assert!(ledger.active_runs().await.unwrap().is_empty());
    assert_eq!(ledger.cancel_active_runs().await.unwrap(), 0);
}

#[tokio::test]
async fn parent_links_are_stored() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    let parent = ledger.create_run(&planner_run()).await.unwrap();
    let child = ledger
        .create_run(&NewRun::new("executor", "t", "execution", RiskClass::R1).with_parent(Some(parent)))
        .await
        .unwrap();
    let run = ledger.get_run(child).await.unwrap().unwrap();
    assert_eq!(run.parent_run_id, Some(parent));
}

#[tokio::test]
async fn recent_runs_respects_limit() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    for _ in 0..5 {
        ledger.create_run(&planner_run()).await.unwrap();
    }
    assert_eq!(ledger.recent_runs(3).await.unwrap().len(), 3);
    assert_eq!(ledger.recent_runs(10).await.unwrap().len(), 5);
}

#[tokio::test]
async fn approval_resolves_exactly_once() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    let run = ledger.create_run(&planner_run()).await.unwrap();
    let id = ledger
        .create_approval(run, RiskClass::R2, "deploy the thing")
        .await
        .unwrap();

    let pending = ledger.get_approval(id).await.unwrap().unwrap();
    assert_eq!(pending.status, ApprovalStatus::Pending);
    assert!(pending.responded_at.is_none());

    assert!(ledger
        .resolve_approval(id, ApprovalStatus::Approved)
        .await
        .unwrap());
    assert!(!ledger
        .resolve_approval(id, ApprovalStatus::Timeout)
        .await
        .unwrap());

    let resolved = ledger.get_approval(id).await.unwrap().unwrap();
    assert_eq!(resolved.status, ApprovalStatus::Approved);
    assert!(resolved.responded_at.is_some());
}

#[tokio::test]
async fn approval_cannot_resolve_to_pending() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    let run = ledger.create_run(&planner_run()).await.unwrap();
    let id = ledger.create_approval(run, RiskClass::R1, "s").await.unwrap();
    assert!(ledger
        .resolve_approval(id, ApprovalStatus::Pending)
        .await
        .is_err());
}

#[tokio::test]
async fn stale_approvals_time_out() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    let run = ledger.create_run(&planner_run()).await.unwrap();
    let stale = ledger.create_approval(run, RiskClass::R1, "old").await.unwrap();

    // Nothing is older than an hour yet.
    assert_eq!(
        ledger
            .timeout_stale_approvals(chrono::Duration::hours(1))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        ledger
            .timeout_stale_approvals(chrono::Duration::zero())
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        ledger.get_approval(stale).await.unwrap().unwrap().status,
        ApprovalStatus::Timeout
    );
    assert!(ledger.oldest_pending_approval().await.unwrap().is_none());
}

#[tokio::test]
async fn oldest_pending_approval_is_first_created() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    let run = ledger.create_run(&planner_run()).await.unwrap();
    let first = ledger.create_approval(run, RiskClass::R1, "first").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let _second = ledger.create_approval(run, RiskClass::R1, "second").await.unwrap();

    let oldest = ledger.oldest_pending_approval().await.unwrap().unwrap();
    assert_eq!(oldest.id, first);
    assert_eq!(oldest.summary, "first");
}

#[tokio::test]
async fn policy_rules_load_active_in_priority_order() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    ledger
        .insert_policy_rule(&PolicyRule::new("catch-all deny", PolicyDecision::Deny, 1000))
        .await
        .unwrap();
    ledger
        .insert_policy_rule(
            &PolicyRule::new("read only", PolicyDecision::Allow, 10).risk(RiskClass::R0),
        )
        .await
        .unwrap();
    ledger
        .insert_policy_rule(
            &PolicyRule::new("disabled", PolicyDecision::Allow, 0)
                .agent("*")
                .inactive(),
        )
        .await
        .unwrap();

    let active = ledger.load_active_rules().await.unwrap();
    let names: Vec<_> = active.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["read only", "catch-all deny"]);
    assert_eq!(active[0].risk_class, Some(RiskClass::R0));

    let all = ledger.list_policy_rules().await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].name, "disabled");
    assert!(!all[0].is_active);
}

#[tokio::test]
async fn policy_rule_upsert_replaces_by_id() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    let mut rule = PolicyRule::new("r", PolicyDecision::Allow, 5);
    ledger.insert_policy_rule(&rule).await.unwrap();
    rule.rule_type = PolicyDecision::RequireApproval;
    ledger.insert_policy_rule(&rule).await.unwrap();

    let rules = ledger.list_policy_rules().await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].rule_type, PolicyDecision::RequireApproval);
}

#[tokio::test]
async fn audit_events_round_trip_by_trace() {
    let ledger = RunLedger::open_in_memory().await.unwrap();
    ledger
        .record(
            AuditEvent::new("trace-a", "planner", "generate_plan", RiskClass::R0)
                .input("Task: x")
                .output("2 options, recommended: Quick")
                .usage("claude-sonnet-4-20250514", 900, 0.004)
                .duration(120)
                .metadata(serde_json::json!({"run": 1})),
        )
        .await
        .unwrap();
    ledger
        .record(
            AuditEvent::new("trace-a", "sentinel", "policy_check", RiskClass::R1)
                .decision("deny")
                .error("no rules"),
        )
        .await
        .unwrap();
    ledger
        .record(AuditEvent::new("trace-b", "system", "kill_switch", RiskClass::R0))
        .await
        .unwrap();

    let events = ledger.list_audit_events("trace-a").await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].agent_name, "planner");
    assert_eq!(events[0].tokens_used, Some(900));
    assert_eq!(events[0].metadata["run"], 1);
    assert_eq!(events[1].decision, "deny");
    assert_eq!(events[1].error.as_deref(), Some("no rules"));
}

#[tokio::test]
async fn ledger_persists_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("ledger.db");

    let id = {
        let ledger = RunLedger::open(&path).await.unwrap();
        ledger.create_run(&planner_run()).await.unwrap()
    };

    let reopened = RunLedger::open(&path).await.unwrap();
    let run = reopened.get_run(id).await.unwrap().unwrap();
    assert_eq!(run.task_description, "rotate the logs");
}
