use std::sync::Arc;
use std::time::Duration;

use ow_core::ledger::{AuditSink, LedgerError, PolicySource};
use ow_core::types::{AuditEvent, PolicyDecision, PolicyRule, RiskClass};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, warn};

pub const DEFAULT_POLICY_TTL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// SentinelResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentinelResult {
    pub decision: PolicyDecision,
    pub matched_rule: Option<String>,
    pub reason: String,
}

impl SentinelResult {
    fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: PolicyDecision::Deny,
            matched_rule: None,
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == PolicyDecision::Allow
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// `None` and `"*"` match anything; otherwise a case-insensitive equality
/// that an absent value never satisfies.
fn matches_pattern(value: Option<&str>, pattern: Option<&str>) -> bool {
    match pattern {
        None | Some("*") => true,
        Some(pattern) => value.is_some_and(|v| v.eq_ignore_ascii_case(pattern)),
    }
}

fn rule_matches(
    rule: &PolicyRule,
    agent: &str,
    action: &str,
    tool: Option<&str>,
    risk: RiskClass,
) -> bool {
    rule.is_active
        && matches_pattern(Some(agent), rule.agent_pattern.as_deref())
        && matches_pattern(Some(action), rule.action_pattern.as_deref())
        && matches_pattern(tool, rule.tool_pattern.as_deref())
        && rule.risk_class.is_none_or(|r| r == risk)
}

/// First-match evaluation over rules already in ascending priority order.
///
/// Fail-closed: an empty rule set, or no matching rule, is a denial.
pub fn evaluate_rules(
    rules: &[PolicyRule],
    agent: &str,
    action: &str,
    tool: Option<&str>,
    risk: RiskClass,
) -> SentinelResult {
    if rules.is_empty() {
        return SentinelResult::deny("FAIL-CLOSED: No policies loaded");
    }

    rules
        .iter()
        .find(|rule| rule_matches(rule, agent, action, tool, risk))
        .map(|rule| SentinelResult {
            decision: rule.rule_type,
            matched_rule: Some(rule.name.clone()),
            reason: format!("Matched policy: {} (priority {})", rule.name, rule.priority),
        })
        .unwrap_or_else(|| SentinelResult::deny("FAIL-CLOSED: No matching policy rule"))
}

// ---------------------------------------------------------------------------
// Sentinel
// ---------------------------------------------------------------------------

struct PolicyCache {
    rules: Arc<Vec<PolicyRule>>,
    loaded_at: Instant,
}

/// The policy engine: a TTL cache over the durable rule set plus
/// fail-closed evaluation.
///
/// Tasks share one `Sentinel`. A read may see rules up to one TTL old.
pub struct Sentinel {
    source: Arc<dyn PolicySource>,
    audit: Arc<dyn AuditSink>,
    ttl: Duration,
    cache: RwLock<Option<PolicyCache>>,
}

impl Sentinel {
    pub fn new(source: Arc<dyn PolicySource>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            source,
            audit,
            ttl: DEFAULT_POLICY_TTL,
            cache: RwLock::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Cached rules, reloading from the source once the TTL has elapsed.
    pub async fn load_policies(&self) -> Result<Arc<Vec<PolicyRule>>, LedgerError> {
        {
            let guard = self.cache.read().await;
            if let Some(cache) = guard.as_ref() {
                if cache.loaded_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&cache.rules));
                }
            }
        }
        self.reload().await
    }

    /// Force a reload regardless of the TTL. Returns the number of rules.
    pub async fn refresh(&self) -> Result<usize, LedgerError> {
        Ok(self.reload().await?.len())
    }

    pub async fn clear_cache(&self) {
        *self.cache.write().await = None;
    }

    async fn reload(&self) -> Result<Arc<Vec<PolicyRule>>, LedgerError> {
        let rules = Arc::new(self.source.load_active_rules().await?);
        debug!(count = rules.len(), "policy rules loaded");
        *self.cache.write().await = Some(PolicyCache {
            rules: Arc::clone(&rules),
            loaded_at: Instant::now(),
        });
        Ok(rules)
    }

    /// Evaluate against whatever is cached right now, without loading.
    pub async fn evaluate(
        &self,
        agent: &str,
        action: &str,
        tool: Option<&str>,
        risk: RiskClass,
    ) -> SentinelResult {
        let guard = self.cache.read().await;
        let rules = guard.as_ref().map(|c| c.rules.as_slice()).unwrap_or(&[]);
        evaluate_rules(rules, agent, action, tool, risk)
    }

    /// Load (if stale), evaluate, and audit. Never fails: a load error or a
    /// failed audit write resolves to `deny`.
    pub async fn evaluate_and_log(
        &self,
        agent: &str,
        action: &str,
        tool: Option<&str>,
        risk: RiskClass,
        trace_id: &str,
    ) -> SentinelResult {
        let base = AuditEvent::new(trace_id, "sentinel", "policy_check", risk)
            .tool(tool)
            .input(format!("{agent}:{action} ({risk})"));

        let result = match self.load_policies().await {
            Ok(rules) => {
                let result = evaluate_rules(&rules, agent, action, tool, risk);
                let event = base
                    .clone()
                    .output(format!("{}: {}", result.decision, result.reason))
                    .decision(result.decision.as_str());
                match self.audit.record(event).await {
                    Ok(()) => result,
                    Err(e) => {
                        error!(
                            trace_id,
                            decision = %result.decision,
                            error = %e,
                            "sentinel audit write failed, denying"
                        );
                        self.deny_and_log(base, e.to_string()).await
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "policy load failed, denying");
                self.deny_and_log(base, e.to_string()).await
            }
        };

        debug!(
            agent,
            action,
            risk = %risk,
            decision = %result.decision,
            reason = %result.reason,
            "policy evaluated"
        );
        result
    }

    async fn deny_and_log(&self, base: AuditEvent, error: String) -> SentinelResult {
        let result = SentinelResult::deny(format!("FAIL-CLOSED ERROR: {error}"));
        let event = base
            .error(error)
            .decision(PolicyDecision::Deny.as_str());
        if let Err(e) = self.audit.record(event).await {
            error!(error = %e, "sentinel audit write failed");
        }
        result
    }
}
