use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ParseEnumError
// ---------------------------------------------------------------------------

/// Returned when a stored or user-supplied label does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// RiskClass
// ---------------------------------------------------------------------------

/// Ordinal severity of an action. `R0` is read-only; each step up is more
/// dangerous (local write, external write, destructive, irreversible).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskClass {
    R0,
    R1,
    R2,
    R3,
    R4,
}

impl RiskClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskClass::R0 => "R0",
            RiskClass::R1 => "R1",
            RiskClass::R2 => "R2",
            RiskClass::R3 => "R3",
            RiskClass::R4 => "R4",
        }
    }
}

impl fmt::Display for RiskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskClass {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "R0" => Ok(RiskClass::R0),
            "R1" => Ok(RiskClass::R1),
            "R2" => Ok(RiskClass::R2),
            "R3" => Ok(RiskClass::R3),
            "R4" => Ok(RiskClass::R4),
            _ => Err(ParseEnumError::new("risk class", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const ACTIVE: [RunStatus; 3] = [
        RunStatus::Queued,
        RunStatus::Running,
        RunStatus::AwaitingApproval,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::AwaitingApproval => "awaiting_approval",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states are final: no further status writes are accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "awaiting_approval" => Ok(RunStatus::AwaitingApproval),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(ParseEnumError::new("run status", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentRun
// ---------------------------------------------------------------------------

/// One invocation of one agent, as recorded in the run ledger.
///
/// `started_at` is set once the run has been `running`; `completed_at` is set
/// exactly when the status is terminal. The parent reference is fixed at
/// creation, so runs form a forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: Uuid,
    pub agent_name: String,
    pub task_description: String,
    pub task_type: String,
    pub risk_class: RiskClass,
    pub status: RunStatus,
    pub triggered_by: String,
    pub model_used: Option<String>,
    pub tokens_used: Option<u64>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub parent_run_id: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Everything needed to create a run in `queued`.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub agent_name: String,
    pub task_description: String,
    pub task_type: String,
    pub risk_class: RiskClass,
    pub triggered_by: String,
    pub input: Option<serde_json::Value>,
    pub parent_run_id: Option<Uuid>,
}

impl NewRun {
    pub fn new(
        agent_name: impl Into<String>,
        task_description: impl Into<String>,
        task_type: impl Into<String>,
        risk_class: RiskClass,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            task_description: task_description.into(),
            task_type: task_type.into(),
            risk_class,
            triggered_by: "system".to_string(),
            input: None,
            parent_run_id: None,
        }
    }

    pub fn triggered_by(mut self, actor: impl Into<String>) -> Self {
        self.triggered_by = actor.into();
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_parent(mut self, parent: Option<Uuid>) -> Self {
        self.parent_run_id = parent;
        self
    }
}

/// Usage and output recorded when a run completes successfully.
#[derive(Debug, Clone, Default)]
pub struct RunCompletion {
    pub model: Option<String>,
    pub tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub output: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Timeout,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Timeout => "timeout",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "denied" => Ok(ApprovalStatus::Denied),
            "timeout" => Ok(ApprovalStatus::Timeout),
            _ => Err(ParseEnumError::new("approval status", s)),
        }
    }
}

/// A pending or resolved human decision tied to one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub run_id: Uuid,
    pub risk_class: RiskClass,
    pub summary: String,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Outcome of a policy rule, and therefore of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Deny,
    RequireApproval,
}

impl PolicyDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyDecision::Allow => "allow",
            PolicyDecision::Deny => "deny",
            PolicyDecision::RequireApproval => "require_approval",
        }
    }
}

impl fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyDecision {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(PolicyDecision::Allow),
            "deny" => Ok(PolicyDecision::Deny),
            "require_approval" => Ok(PolicyDecision::RequireApproval),
            _ => Err(ParseEnumError::new("policy decision", s)),
        }
    }
}

/// A precedence-ordered matcher. `None` or `"*"` patterns match anything;
/// lower `priority` values are evaluated first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: Uuid,
    pub name: String,
    pub rule_type: PolicyDecision,
    pub agent_pattern: Option<String>,
    pub action_pattern: Option<String>,
    pub tool_pattern: Option<String>,
    pub risk_class: Option<RiskClass>,
    pub is_active: bool,
    pub priority: i32,
}

impl PolicyRule {
    pub fn new(name: impl Into<String>, rule_type: PolicyDecision, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            rule_type,
            agent_pattern: None,
            action_pattern: None,
            tool_pattern: None,
            risk_class: None,
            is_active: true,
            priority,
        }
    }

    pub fn agent(mut self, pattern: impl Into<String>) -> Self {
        self.agent_pattern = Some(pattern.into());
        self
    }

    pub fn action(mut self, pattern: impl Into<String>) -> Self {
        self.action_pattern = Some(pattern.into());
        self
    }

    pub fn tool(mut self, pattern: impl Into<String>) -> Self {
        self.tool_pattern = Some(pattern.into());
        self
    }

    pub fn risk(mut self, risk: RiskClass) -> Self {
        self.risk_class = Some(risk);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Agent outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOption {
    pub label: String,
    pub steps: Vec<String>,
    pub risk_class: RiskClass,
    pub estimated_cost_usd: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerOutput {
    pub options: Vec<PlanOption>,
    pub recommended_index: usize,
    pub reasoning: String,
}

impl PlannerOutput {
    pub fn recommended(&self) -> Option<&PlanOption> {
        self.options.get(self.recommended_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticOutput {
    pub approved: bool,
    pub score: f64,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorOutput {
    pub result: String,
    pub actions: Vec<String>,
    pub artifacts: Vec<String>,
}

// ---------------------------------------------------------------------------
// AgentContext
// ---------------------------------------------------------------------------

/// Correlation data carried through every stage of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContext {
    /// Where narration for this task is delivered.
    pub channel_id: String,
    pub trace_id: String,
    /// Actor label recorded on every run the task creates.
    pub triggered_by: String,
}

impl AgentContext {
    /// New context with a fresh trace id.
    pub fn new(channel_id: impl Into<String>, triggered_by: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            trace_id: Uuid::new_v4().simple().to_string(),
            triggered_by: triggered_by.into(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }
}

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

/// One append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub trace_id: String,
    pub agent_name: String,
    pub action_type: String,
    pub risk_class: RiskClass,
    pub tool_name: Option<String>,
    pub input_summary: Option<String>,
    pub output_summary: Option<String>,
    pub decision: String,
    pub model_used: Option<String>,
    pub tokens_used: Option<u64>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        trace_id: impl Into<String>,
        agent_name: impl Into<String>,
        action_type: impl Into<String>,
        risk_class: RiskClass,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            agent_name: agent_name.into(),
            action_type: action_type.into(),
            risk_class,
            tool_name: None,
            input_summary: None,
            output_summary: None,
            decision: "auto_approved".to_string(),
            model_used: None,
            tokens_used: None,
            cost_usd: None,
            duration_ms: None,
            error: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    pub fn tool(mut self, tool: Option<&str>) -> Self {
        self.tool_name = tool.map(str::to_string);
        self
    }

    pub fn input(mut self, summary: impl Into<String>) -> Self {
        self.input_summary = Some(summary.into());
        self
    }

    pub fn output(mut self, summary: impl Into<String>) -> Self {
        self.output_summary = Some(summary.into());
        self
    }

    pub fn decision(mut self, decision: impl Into<String>) -> Self {
        self.decision = decision.into();
        self
    }

    pub fn usage(mut self, model: impl Into<String>, tokens: u64, cost_usd: f64) -> Self {
        self.model_used = Some(model.into());
        self.tokens_used = Some(tokens);
        self.cost_usd = Some(cost_usd);
        self
    }

    pub fn duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_class_orders_by_severity() {
        assert!(RiskClass::R0 < RiskClass::R1);
        assert!(RiskClass::R3 < RiskClass::R4);
    }

    #[test]
    fn risk_class_parses_case_insensitively() {
        assert_eq!("r2".parse::<RiskClass>().unwrap(), RiskClass::R2);
        assert_eq!(" R4 ".parse::<RiskClass>().unwrap(), RiskClass::R4);
        assert!("R9".parse::<RiskClass>().is_err());
    }

    #[test]
    fn run_status_terminal_states() {
        for status in RunStatus::ACTIVE {
            assert!(status.is_active(), "{status} should be active");
        }
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn run_status_round_trips_through_label() {
        let status: RunStatus = RunStatus::AwaitingApproval.as_str().parse().unwrap();
        assert_eq!(status, RunStatus::AwaitingApproval);
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn planner_output_uses_camel_case_fields() {
        let raw = r#"{
            "options": [{
                "label": "Quick",
                "steps": ["read"],
                "riskClass": "R0",
                "estimatedCostUsd": 0.01,
                "rationale": "cheap"
            }],
            "recommendedIndex": 0,
            "reasoning": "only one"
        }"#;
        let plan: PlannerOutput = serde_json::from_str(raw).unwrap();
        assert_eq!(plan.recommended().unwrap().label, "Quick");
        assert_eq!(plan.options[0].risk_class, RiskClass::R0);
    }

    #[test]
    fn critic_output_requires_every_field() {
        let raw = r#"{"approved": true, "score": 8}"#;
        assert!(serde_json::from_str::<CriticOutput>(raw).is_err());
    }

    #[test]
    fn policy_decision_labels() {
        assert_eq!(
            "require_approval".parse::<PolicyDecision>().unwrap(),
            PolicyDecision::RequireApproval
        );
        assert_eq!(PolicyDecision::Deny.to_string(), "deny");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn context_generates_trace_id() {
        let a = AgentContext::new("console", "tester");
        let b = AgentContext::new("console", "tester");
        assert_ne!(a.trace_id, b.trace_id);
        assert_eq!(a.with_trace_id("t-1").trace_id, "t-1");
    }
}
