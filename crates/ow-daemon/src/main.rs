//! Overwatch: supervised AI agents from the command line.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ow_agents::approval::ApprovalGate;
use ow_agents::lockdown::Lockdown;
use ow_agents::narrator::{self, LogNotifier};
use ow_core::config::Config;
use ow_core::types::{AgentContext, ApprovalStatus, PolicyDecision, PolicyRule, RiskClass};
use ow_daemon::daemon::{approval_config, describe_decision, open_ledger, Daemon};
use ow_harness::shutdown::ShutdownSignal;
use tracing::{error, info, warn};
use uuid::Uuid;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "overwatch", version, about)]
struct Cli {
    /// Path to config.toml (default: ~/.overwatch/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan, review, and carry out one task.
    Run {
        /// Execute without a human approval when policy allows.
        #[arg(long)]
        auto: bool,
        /// What to do.
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,
    },

    /// Approve a pending plan (the oldest if no id is given).
    Approve { id: Option<Uuid> },

    /// Deny a pending plan (the oldest if no id is given).
    Deny { id: Option<Uuid> },

    /// Active and recent agent runs.
    Status,

    /// Inspect or edit policy rules.
    Policy {
        #[command(subcommand)]
        action: PolicyCommand,
    },

    /// Interactive console on stdin/stdout.
    Serve,
}

#[derive(Subcommand)]
enum PolicyCommand {
    /// List every rule, active or not.
    List,

    /// Add a rule.
    Add {
        name: String,
        /// allow, deny, or require_approval.
        #[arg(long)]
        decision: PolicyDecision,
        /// Lower wins.
        #[arg(long, default_value_t = 100)]
        priority: i32,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        action: Option<String>,
        #[arg(long)]
        tool: Option<String>,
        /// R0..R4; omitted matches any risk.
        #[arg(long)]
        risk: Option<RiskClass>,
        /// Store the rule disabled.
        #[arg(long)]
        inactive: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path.clone())?,
        None => Config::load()?,
    };
    config.validate().context("invalid configuration")?;

    ow_telemetry::logging::init_logging(
        "overwatch",
        config.general.log_format,
        &config.general.log_level,
    );

    match cli.command {
        Commands::Run { auto, task } => run_task(config, task.join(" "), auto).await,
        Commands::Approve { id } => decide(config, id, ApprovalStatus::Approved).await,
        Commands::Deny { id } => decide(config, id, ApprovalStatus::Denied).await,
        Commands::Status => status(config).await,
        Commands::Policy { action } => policy(config, action).await,
        Commands::Serve => serve(config).await,
    }
}

async fn run_task(config: Config, task: String, auto_execute: bool) -> Result<()> {
    let daemon = Daemon::new(config).await?;
    let sweeper = daemon.spawn_sweeper();
    wire_ctrl_c(&daemon);

    let context = AgentContext::new(daemon.default_channel(), "cli");
    info!(trace_id = %context.trace_id, "running task");
    let state = daemon.submit(&task, context, auto_execute).await?;

    daemon.shutdown_handle().trigger();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "sweeper task ended abnormally");
    }

    match (state.denial_reason, state.error) {
        (_, Some(error)) => bail!(error),
        (Some(reason), None) => {
            info!(reason = %reason, "task denied");
            Ok(())
        }
        (None, None) => Ok(()),
    }
}

async fn serve(config: Config) -> Result<()> {
    let daemon = Daemon::new(config).await?;
    let _sweeper = daemon.spawn_sweeper();
    wire_ctrl_c(&daemon);

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let served = daemon.serve_console(stdin).await;

    let shutdown = daemon.shutdown_handle();
    shutdown.trigger();
    if !daemon.drain(DRAIN_TIMEOUT).await {
        warn!("tasks still running at shutdown");
    }
    let drained = shutdown.wait_for_drain(1, DRAIN_TIMEOUT).await;
    if !drained.is_complete() {
        warn!("sweeper did not confirm shutdown");
    }
    served
}

/// Approve/deny from a second process sharing the ledger. The waiting
/// pipeline sees the decision on its next poll.
async fn decide(config: Config, id: Option<Uuid>, decision: ApprovalStatus) -> Result<()> {
    let ledger = open_ledger(&config).await?;
    let lockdown = Arc::new(Lockdown::new(ledger.clone(), ledger.clone()));
    let gate = ApprovalGate::new(
        ledger,
        Arc::new(LogNotifier),
        lockdown,
        ShutdownSignal::new(),
        approval_config(&config.agents),
    );
    let result = match id {
        Some(id) => gate.resolve(id, decision).await,
        None => gate.resolve_oldest(decision).await,
    };
    println!("{}", describe_decision(result, decision));
    Ok(())
}

async fn status(config: Config) -> Result<()> {
    let ledger = open_ledger(&config).await?;
    let active = ledger.active_runs().await?;
    let recent = ledger.recent_runs(10).await?;
    // Lockdown lives in the serving process; a fresh process is never locked.
    println!("{}", narrator::format_agent_status(&active, &recent, false));
    Ok(())
}

async fn policy(config: Config, action: PolicyCommand) -> Result<()> {
    let ledger = open_ledger(&config).await?;
    match action {
        PolicyCommand::List => {
            let rules = ledger.list_policy_rules().await?;
            if rules.is_empty() {
                println!("No policy rules. Every request is denied.");
            }
            for rule in rules {
                println!(
                    "{:>4}  {:<16}  {:<6}  agent={} action={} tool={} risk={}  {}",
                    rule.priority,
                    rule.rule_type.as_str(),
                    if rule.is_active { "active" } else { "off" },
                    rule.agent_pattern.as_deref().unwrap_or("*"),
                    rule.action_pattern.as_deref().unwrap_or("*"),
                    rule.tool_pattern.as_deref().unwrap_or("*"),
                    rule.risk_class.map(|r| r.as_str()).unwrap_or("*"),
                    rule.name,
                );
            }
        }
        PolicyCommand::Add {
            name,
            decision,
            priority,
            agent,
            action,
            tool,
            risk,
            inactive,
        } => {
            let mut rule = PolicyRule::new(name, decision, priority);
            if let Some(agent) = agent {
                rule = rule.agent(agent);
            }
            if let Some(action) = action {
                rule = rule.action(action);
            }
            if let Some(tool) = tool {
                rule = rule.tool(tool);
            }
            if let Some(risk) = risk {
                rule = rule.risk(risk);
            }
            if inactive {
                rule = rule.inactive();
            }
            ledger.insert_policy_rule(&rule).await?;
            println!("Added policy rule {} ({})", rule.name, rule.id);
        }
    }
    Ok(())
}

/// Ctrl-C is the kill switch: lock down, cancel active runs, stop.
fn wire_ctrl_c(daemon: &Daemon) {
    let daemon = daemon.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, engaging lockdown");
        let trace = AgentContext::new(daemon.default_channel(), "signal").trace_id;
        daemon.emergency_stop(&trace).await;
    });
}
