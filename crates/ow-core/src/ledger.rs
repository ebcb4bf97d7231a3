use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::{
    AgentRun, ApprovalRequest, ApprovalStatus, AuditEvent, NewRun, PolicyRule, RiskClass,
    RunCompletion, RunStatus,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Append-only audit destination.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

/// Source of active policy rules, ordered by ascending priority.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn load_active_rules(&self) -> Result<Vec<PolicyRule>>;
}

// ---------------------------------------------------------------------------
// RunLedger
// ---------------------------------------------------------------------------

/// Durable record of agent runs, approval requests, policy rules, and audit
/// events, backed by SQLite.
///
/// Every status write is conditional on the current status so that
/// concurrent writers (lockdown, sweeper, explicit approve/deny, the agent
/// itself) resolve to exactly one winner.
pub struct RunLedger {
    conn: Connection,
}

const RUN_COLUMNS: &str = "id, agent_name, task_description, task_type, risk_class, status,
    triggered_by, model_used, tokens_used, cost_usd, duration_ms, input_data, output_data,
    parent_run_id, error, created_at, started_at, completed_at";

const APPROVAL_COLUMNS: &str =
    "id, run_id, risk_class, summary, status, requested_at, responded_at";

const ACTIVE_STATUSES: &str = "('queued', 'running', 'awaiting_approval')";
const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

impl RunLedger {
    /// Open (or create) a ledger at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref()).await?;
        let ledger = Self { conn };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    /// Create a purely in-memory ledger (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let ledger = Self { conn };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS agent_runs (
                        id               TEXT PRIMARY KEY,
                        agent_name       TEXT NOT NULL,
                        task_description TEXT NOT NULL,
                        task_type        TEXT NOT NULL,
                        risk_class       TEXT NOT NULL,
                        status           TEXT NOT NULL,
                        triggered_by     TEXT NOT NULL,
                        model_used       TEXT,
                        tokens_used      INTEGER,
                        cost_usd         REAL,
                        duration_ms      INTEGER,
                        input_data       TEXT,
                        output_data      TEXT,
                        parent_run_id    TEXT,
                        error            TEXT,
                        created_at       TEXT NOT NULL,
                        started_at       TEXT,
                        completed_at     TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_runs_status  ON agent_runs(status);
                    CREATE INDEX IF NOT EXISTS idx_runs_created ON agent_runs(created_at);

                    CREATE TABLE IF NOT EXISTS approval_requests (
                        id           TEXT PRIMARY KEY,
                        run_id       TEXT NOT NULL,
                        risk_class   TEXT NOT NULL,
                        summary      TEXT NOT NULL,
                        status       TEXT NOT NULL,
                        requested_at TEXT NOT NULL,
                        responded_at TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_approvals_status ON approval_requests(status);

                    CREATE TABLE IF NOT EXISTS policy_rules (
                        id             TEXT PRIMARY KEY,
                        name           TEXT NOT NULL,
                        rule_type      TEXT NOT NULL,
                        agent_pattern  TEXT,
                        action_pattern TEXT,
                        tool_pattern   TEXT,
                        risk_class     TEXT,
                        is_active      INTEGER NOT NULL DEFAULT 1,
                        priority       INTEGER NOT NULL DEFAULT 100
                    );

                    CREATE TABLE IF NOT EXISTS audit_events (
                        id             INTEGER PRIMARY KEY AUTOINCREMENT,
                        trace_id       TEXT NOT NULL,
                        agent_name     TEXT NOT NULL,
                        action_type    TEXT NOT NULL,
                        risk_class     TEXT NOT NULL,
                        tool_name      TEXT,
                        input_summary  TEXT,
                        output_summary TEXT,
                        decision       TEXT NOT NULL,
                        model_used     TEXT,
                        tokens_used    INTEGER,
                        cost_usd       REAL,
                        duration_ms    INTEGER,
                        error          TEXT,
                        metadata       TEXT NOT NULL,
                        created_at     TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_audit_trace ON audit_events(trace_id);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Agent runs
    // -----------------------------------------------------------------------

    /// Insert a run in `queued` and return its id.
    pub async fn create_run(&self, run: &NewRun) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let id_str = id.to_string();
        let agent_name = run.agent_name.clone();
        let task = run.task_description.clone();
        let task_type = run.task_type.clone();
        let risk = run.risk_class.as_str();
        let triggered_by = run.triggered_by.clone();
        let input = run.input.as_ref().map(|v| v.to_string());
        let parent = run.parent_run_id.map(|p| p.to_string());
        let created_at = to_sql_time(Utc::now());

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agent_runs (id, agent_name, task_description, task_type,
                        risk_class, status, triggered_by, input_data, parent_run_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        id_str, agent_name, task, task_type, risk, triggered_by, input, parent,
                        created_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    /// `queued | awaiting_approval -> running`. Returns `false` when the run
    /// was not in a startable state (e.g. already cancelled).
    pub async fn mark_running(&self, id: Uuid) -> Result<bool> {
        let id_str = id.to_string();
        let now = to_sql_time(Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE agent_runs SET status = 'running', started_at = ?2
                     WHERE id = ?1 AND status IN ('queued', 'awaiting_approval')",
                    rusqlite::params![id_str, now],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed == 1)
    }

    /// `queued | running -> awaiting_approval`.
    pub async fn mark_awaiting_approval(&self, id: Uuid) -> Result<bool> {
        let id_str = id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE agent_runs SET status = 'awaiting_approval'
                     WHERE id = ?1 AND status IN ('queued', 'running')",
                    rusqlite::params![id_str],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed == 1)
    }

    /// Move a non-terminal run to `completed`, recording usage and output.
    pub async fn complete_run(&self, id: Uuid, completion: &RunCompletion) -> Result<bool> {
        let id_str = id.to_string();
        let model = completion.model.clone();
        let tokens = completion.tokens as i64;
        let cost = completion.cost_usd;
        let duration = completion.duration_ms as i64;
        let output = completion.output.as_ref().map(|v| v.to_string());
        let now = to_sql_time(Utc::now());

        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    &format!(
                        "UPDATE agent_runs SET status = 'completed', model_used = ?2,
                            tokens_used = ?3, cost_usd = ?4, duration_ms = ?5,
                            output_data = ?6, completed_at = ?7
                         WHERE id = ?1 AND status NOT IN {TERMINAL_STATUSES}"
                    ),
                    rusqlite::params![id_str, model, tokens, cost, duration, output, now],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed == 1)
    }

    /// Move a non-terminal run to `failed` or `cancelled`.
    pub async fn finish_run(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<&str>,
        duration_ms: Option<u64>,
    ) -> Result<bool> {
        if !matches!(status, RunStatus::Failed | RunStatus::Cancelled) {
            return Err(LedgerError::InvalidTransition(format!(
                "finish_run cannot set {status}"
            )));
        }
        let id_str = id.to_string();
        let status_str = status.as_str();
        let error = error.map(str::to_string);
        let duration = duration_ms.map(|d| d as i64);
        let now = to_sql_time(Utc::now());

        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    &format!(
                        "UPDATE agent_runs SET status = ?2, error = ?3,
                            duration_ms = COALESCE(?4, duration_ms), completed_at = ?5
                         WHERE id = ?1 AND status NOT IN {TERMINAL_STATUSES}"
                    ),
                    rusqlite::params![id_str, status_str, error, duration, now],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed == 1)
    }

    /// Cancel every queued, running, or awaiting-approval run in one statement.
    pub async fn cancel_active_runs(&self) -> Result<u64> {
        let now = to_sql_time(Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    &format!(
                        "UPDATE agent_runs SET status = 'cancelled', completed_at = ?1
                         WHERE status IN {ACTIVE_STATUSES}"
                    ),
                    rusqlite::params![now],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed as u64)
    }

    pub async fn get_run(&self, id: Uuid) -> Result<Option<AgentRun>> {
        let id_str = id.to_string();
        let run = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {RUN_COLUMNS} FROM agent_runs WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_run(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(run)
    }

    /// Runs still in flight, newest first.
    pub async fn active_runs(&self) -> Result<Vec<AgentRun>> {
        let runs = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM agent_runs
                     WHERE status IN {ACTIVE_STATUSES}
                     ORDER BY created_at DESC"
                ))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_run(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(runs)
    }

    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<AgentRun>> {
        let limit = limit as i64;
        let runs = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM agent_runs
                     ORDER BY created_at DESC LIMIT ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_run(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(runs)
    }

    // -----------------------------------------------------------------------
    // Approval requests
    // -----------------------------------------------------------------------

    pub async fn create_approval(
        &self,
        run_id: Uuid,
        risk_class: RiskClass,
        summary: &str,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let id_str = id.to_string();
        let run_str = run_id.to_string();
        let risk = risk_class.as_str();
        let summary = summary.to_string();
        let requested_at = to_sql_time(Utc::now());

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO approval_requests (id, run_id, risk_class, summary, status, requested_at)
                     VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                    rusqlite::params![id_str, run_str, risk, summary, requested_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    pub async fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalRequest>> {
        let id_str = id.to_string();
        let approval = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_approval(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(approval)
    }

    /// The oldest request still waiting for a human.
    pub async fn oldest_pending_approval(&self) -> Result<Option<ApprovalRequest>> {
        let approval = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approval_requests
                     WHERE status = 'pending'
                     ORDER BY requested_at ASC LIMIT 1"
                ))?;
                let mut rows = stmt.query([])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_approval(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(approval)
    }

    /// Resolve a request only while it is still `pending`.
    ///
    /// Returns `true` if this call won the resolution; `false` if some other
    /// resolver got there first (or the id is unknown).
    pub async fn resolve_approval(&self, id: Uuid, status: ApprovalStatus) -> Result<bool> {
        if !status.is_resolved() {
            return Err(LedgerError::InvalidTransition(
                "cannot resolve an approval back to pending".into(),
            ));
        }
        let id_str = id.to_string();
        let status_str = status.as_str();
        let now = to_sql_time(Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE approval_requests SET status = ?2, responded_at = ?3
                     WHERE id = ?1 AND status = 'pending'",
                    rusqlite::params![id_str, status_str, now],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed == 1)
    }

    /// Resolve every pending request older than `older_than` to `timeout`.
    pub async fn timeout_stale_approvals(&self, older_than: chrono::Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = to_sql_time(
            now.checked_sub_signed(older_than)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        );
        let now = to_sql_time(now);
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE approval_requests SET status = 'timeout', responded_at = ?1
                     WHERE status = 'pending' AND requested_at <= ?2",
                    rusqlite::params![now, cutoff],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed as u64)
    }

    // -----------------------------------------------------------------------
    // Policy rules
    // -----------------------------------------------------------------------

    pub async fn insert_policy_rule(&self, rule: &PolicyRule) -> Result<()> {
        let id = rule.id.to_string();
        let name = rule.name.clone();
        let rule_type = rule.rule_type.as_str();
        let agent = rule.agent_pattern.clone();
        let action = rule.action_pattern.clone();
        let tool = rule.tool_pattern.clone();
        let risk = rule.risk_class.map(|r| r.as_str());
        let active = rule.is_active;
        let priority = rule.priority;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO policy_rules (id, name, rule_type, agent_pattern,
                        action_pattern, tool_pattern, risk_class, is_active, priority)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, rule_type=excluded.rule_type,
                        agent_pattern=excluded.agent_pattern, action_pattern=excluded.action_pattern,
                        tool_pattern=excluded.tool_pattern, risk_class=excluded.risk_class,
                        is_active=excluded.is_active, priority=excluded.priority",
                    rusqlite::params![id, name, rule_type, agent, action, tool, risk, active, priority],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Every rule, active or not, in evaluation order.
    pub async fn list_policy_rules(&self) -> Result<Vec<PolicyRule>> {
        self.query_rules(false).await
    }

    async fn query_rules(&self, active_only: bool) -> Result<Vec<PolicyRule>> {
        let filter = if active_only { "WHERE is_active = 1" } else { "" };
        let sql = format!(
            "SELECT id, name, rule_type, agent_pattern, action_pattern, tool_pattern,
                    risk_class, is_active, priority
             FROM policy_rules {filter}
             ORDER BY priority ASC, rowid ASC"
        );
        let rules = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_rule(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rules)
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    pub async fn list_audit_events(&self, trace_id: &str) -> Result<Vec<AuditEvent>> {
        let trace_id = trace_id.to_string();
        let events = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT trace_id, agent_name, action_type, risk_class, tool_name,
                            input_summary, output_summary, decision, model_used, tokens_used,
                            cost_usd, duration_ms, error, metadata, created_at
                     FROM audit_events WHERE trace_id = ?1 ORDER BY id ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![trace_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_audit(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(events)
    }
}

#[async_trait]
impl AuditSink for RunLedger {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        let risk = event.risk_class.as_str();
        let metadata = serde_json::to_string(&event.metadata)?;
        let created_at = to_sql_time(event.created_at);
        let tokens = event.tokens_used.map(|t| t as i64);
        let duration = event.duration_ms.map(|d| d as i64);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO audit_events (trace_id, agent_name, action_type, risk_class,
                        tool_name, input_summary, output_summary, decision, model_used,
                        tokens_used, cost_usd, duration_ms, error, metadata, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                    rusqlite::params![
                        event.trace_id,
                        event.agent_name,
                        event.action_type,
                        risk,
                        event.tool_name,
                        event.input_summary,
                        event.output_summary,
                        event.decision,
                        event.model_used,
                        tokens,
                        event.cost_usd,
                        duration,
                        event.error,
                        metadata,
                        created_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PolicySource for RunLedger {
    async fn load_active_rules(&self) -> Result<Vec<PolicyRule>> {
        self.query_rules(true).await
    }
}

// ---------------------------------------------------------------------------
// helpers – values <-> SQLite text
// ---------------------------------------------------------------------------

/// Fixed-width UTC timestamps so that text comparison orders chronologically.
fn to_sql_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| conversion_error(idx, e))
}

fn parse_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_json(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| conversion_error(idx, e))
}

fn enum_from_sql<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRun> {
    let id_str: String = row.get(0)?;
    let risk_str: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let tokens: Option<i64> = row.get(8)?;
    let duration: Option<i64> = row.get(10)?;
    let input_str: Option<String> = row.get(11)?;
    let output_str: Option<String> = row.get(12)?;
    let parent_str: Option<String> = row.get(13)?;
    let created_str: String = row.get(15)?;
    let started_str: Option<String> = row.get(16)?;
    let completed_str: Option<String> = row.get(17)?;

    Ok(AgentRun {
        id: parse_uuid(0, &id_str)?,
        agent_name: row.get(1)?,
        task_description: row.get(2)?,
        task_type: row.get(3)?,
        risk_class: enum_from_sql(4, &risk_str)?,
        status: enum_from_sql(5, &status_str)?,
        triggered_by: row.get(6)?,
        model_used: row.get(7)?,
        tokens_used: tokens.map(|t| t as u64),
        cost_usd: row.get(9)?,
        duration_ms: duration.map(|d| d as u64),
        input: input_str.map(|s| parse_json(11, &s)).transpose()?,
        output: output_str.map(|s| parse_json(12, &s)).transpose()?,
        parent_run_id: parent_str.map(|s| parse_uuid(13, &s)).transpose()?,
        error: row.get(14)?,
        created_at: parse_time(15, &created_str)?,
        started_at: started_str.map(|s| parse_time(16, &s)).transpose()?,
        completed_at: completed_str.map(|s| parse_time(17, &s)).transpose()?,
    })
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRequest> {
    let id_str: String = row.get(0)?;
    let run_str: String = row.get(1)?;
    let risk_str: String = row.get(2)?;
    let status_str: String = row.get(4)?;
    let requested_str: String = row.get(5)?;
    let responded_str: Option<String> = row.get(6)?;

    Ok(ApprovalRequest {
        id: parse_uuid(0, &id_str)?,
        run_id: parse_uuid(1, &run_str)?,
        risk_class: enum_from_sql(2, &risk_str)?,
        summary: row.get(3)?,
        status: enum_from_sql(4, &status_str)?,
        requested_at: parse_time(5, &requested_str)?,
        responded_at: responded_str.map(|s| parse_time(6, &s)).transpose()?,
    })
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<PolicyRule> {
    let id_str: String = row.get(0)?;
    let type_str: String = row.get(2)?;
    let risk_str: Option<String> = row.get(6)?;

    Ok(PolicyRule {
        id: parse_uuid(0, &id_str)?,
        name: row.get(1)?,
        rule_type: enum_from_sql(2, &type_str)?,
        agent_pattern: row.get(3)?,
        action_pattern: row.get(4)?,
        tool_pattern: row.get(5)?,
        risk_class: risk_str.map(|s| enum_from_sql(6, &s)).transpose()?,
        is_active: row.get(7)?,
        priority: row.get(8)?,
    })
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEvent> {
    let risk_str: String = row.get(3)?;
    let tokens: Option<i64> = row.get(9)?;
    let duration: Option<i64> = row.get(11)?;
    let metadata_str: String = row.get(13)?;
    let created_str: String = row.get(14)?;

    Ok(AuditEvent {
        trace_id: row.get(0)?,
        agent_name: row.get(1)?,
        action_type: row.get(2)?,
        risk_class: enum_from_sql(3, &risk_str)?,
        tool_name: row.get(4)?,
        input_summary: row.get(5)?,
        output_summary: row.get(6)?,
        decision: row.get(7)?,
        model_used: row.get(8)?,
        tokens_used: tokens.map(|t| t as u64),
        cost_usd: row.get(10)?,
        duration_ms: duration.map(|d| d as u64),
        error: row.get(12)?,
        metadata: parse_json(13, &metadata_str)?,
        created_at: parse_time(14, &created_str)?,
    })
}
