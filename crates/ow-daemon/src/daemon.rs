use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ow_agents::approval::{ApprovalConfig, ApprovalError, ApprovalGate, ApprovalSweeper};
use ow_agents::lockdown::Lockdown;
use ow_agents::narrator::{self, Notifier, UsageTotals};
use ow_agents::orchestrator::{Orchestrator, PipelineAgents, PipelineState};
use ow_agents::roles::{CriticAgent, ExecutorAgent, PlannerAgent};
use ow_agents::sentinel::Sentinel;
use ow_core::config::{AgentsConfig, Config, ProvidersConfig};
use ow_core::ledger::RunLedger;
use ow_core::types::{truncate_chars, AgentContext, ApprovalRequest, ApprovalStatus};
use ow_harness::llm::{
    api_key_from_env, AnthropicProvider, GeminiProvider, LlmConfig, LlmError, LlmProvider,
};
use ow_harness::shutdown::{ShutdownGuard, ShutdownSignal};
use ow_harness::tariff::Tariff;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::console::{ConsoleCommand, ConsoleNotifier, ParseCommandError, HELP_TEXT};

/// Upper bound on a single language-model request.
const LLM_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const STATUS_RECENT_LIMIT: usize = 10;

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// The model backend behind each agent role.
#[derive(Clone)]
pub struct Providers {
    pub planner: Arc<dyn LlmProvider>,
    pub critic: Arc<dyn LlmProvider>,
    pub executor: Arc<dyn LlmProvider>,
}

impl Providers {
    /// Anthropic for planning and execution, Gemini for critique. API keys
    /// come from the environment variables the config names.
    pub fn from_config(cfg: &ProvidersConfig) -> Result<Self, LlmError> {
        let anthropic: Arc<dyn LlmProvider> = Arc::new(
            AnthropicProvider::new(api_key_from_env(&cfg.anthropic.api_key_env)?)
                .with_base_url(cfg.anthropic.base_url.clone()),
        );
        let gemini: Arc<dyn LlmProvider> = Arc::new(
            GeminiProvider::new(api_key_from_env(&cfg.gemini.api_key_env)?)
                .with_base_url(cfg.gemini.base_url.clone()),
        );
        Ok(Self {
            planner: anthropic.clone(),
            critic: gemini,
            executor: anthropic,
        })
    }
}

pub fn approval_config(agents: &AgentsConfig) -> ApprovalConfig {
    ApprovalConfig {
        poll_interval: agents.poll_interval(),
        timeout: agents.approval_timeout(),
    }
}

pub async fn open_ledger(config: &Config) -> Result<Arc<RunLedger>> {
    let path = config.ledger.resolved_path();
    let ledger = RunLedger::open(&path)
        .await
        .with_context(|| format!("failed to open ledger at {}", path.display()))?;
    Ok(Arc::new(ledger))
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// The running Overwatch process: one orchestrator, one ledger, one
/// lockdown flag, and admission control over concurrent tasks.
#[derive(Clone)]
pub struct Daemon {
    config: Arc<Config>,
    ledger: Arc<RunLedger>,
    lockdown: Arc<Lockdown>,
    gate: Arc<ApprovalGate>,
    orchestrator: Arc<Orchestrator>,
    notifier: Arc<dyn Notifier>,
    admission: Arc<Semaphore>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Open the ledger from config and talk to the real providers.
    pub async fn new(config: Config) -> Result<Self> {
        let ledger = open_ledger(&config).await?;
        let providers =
            Providers::from_config(&config.providers).context("language-model providers")?;
        Ok(Self::build(
            config,
            ledger,
            providers,
            Arc::new(ConsoleNotifier::new()),
        ))
    }

    pub fn build(
        config: Config,
        ledger: Arc<RunLedger>,
        providers: Providers,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let shutdown = ShutdownSignal::new();
        let anthropic = &config.providers.anthropic;
        let gemini = &config.providers.gemini;

        let agents = PipelineAgents {
            planner: PlannerAgent::new(
                providers.planner,
                LlmConfig::new(anthropic.planner_model.clone(), anthropic.max_tokens)
                    .with_timeout(LLM_REQUEST_TIMEOUT),
                Tariff::from(anthropic.tariff),
                ledger.clone(),
                ledger.clone(),
            ),
            critic: CriticAgent::new(
                providers.critic,
                LlmConfig::new(gemini.critic_model.clone(), gemini.max_tokens)
                    .json_response()
                    .with_timeout(LLM_REQUEST_TIMEOUT),
                Tariff::from(gemini.tariff),
                ledger.clone(),
                ledger.clone(),
            ),
            executor: ExecutorAgent::new(
                providers.executor,
                LlmConfig::new(anthropic.executor_model.clone(), anthropic.max_tokens)
                    .with_timeout(LLM_REQUEST_TIMEOUT),
                Tariff::from(anthropic.tariff),
                ledger.clone(),
                ledger.clone(),
            ),
        };

        let lockdown = Arc::new(Lockdown::new(ledger.clone(), ledger.clone()));
        let sentinel = Arc::new(
            Sentinel::new(ledger.clone(), ledger.clone())
                .with_ttl(config.agents.policy_cache_ttl()),
        );
        let gate = Arc::new(ApprovalGate::new(
            ledger.clone(),
            notifier.clone(),
            lockdown.clone(),
            shutdown.clone(),
            approval_config(&config.agents),
        ));
        let orchestrator = Orchestrator::new(
            agents,
            sentinel,
            lockdown.clone(),
            gate.clone(),
            ledger.clone(),
            notifier.clone(),
        )
        .with_critic_floor(config.agents.critic_score_floor)
        .with_approval_timeout(config.agents.approval_timeout());

        let admission = Arc::new(Semaphore::new(config.agents.max_concurrent_runs));

        Self {
            config: Arc::new(config),
            ledger,
            lockdown,
            gate,
            orchestrator: Arc::new(orchestrator),
            notifier,
            admission,
            shutdown,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<RunLedger> {
        &self.ledger
    }

    pub fn lockdown(&self) -> &Arc<Lockdown> {
        &self.lockdown
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// The channel narration goes to when the caller names none.
    pub fn default_channel(&self) -> &str {
        &self.config.notifications.default_channel
    }

    /// Run one task to completion, waiting for an admission slot first.
    pub async fn submit(
        &self,
        task: &str,
        context: AgentContext,
        auto_execute: bool,
    ) -> Result<PipelineState> {
        let _permit = self
            .admission
            .acquire()
            .await
            .context("admission control closed")?;
        Ok(self.orchestrator.run_task(task, context, auto_execute).await)
    }

    /// [`Daemon::submit`] on a background task.
    pub fn spawn_task(
        &self,
        task: String,
        context: AgentContext,
        auto_execute: bool,
    ) -> JoinHandle<Result<PipelineState>> {
        let daemon = self.clone();
        tokio::spawn(async move { daemon.submit(&task, context, auto_execute).await })
    }

    /// Start the approval timeout sweeper. It confirms drain on exit.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let sweeper = ApprovalSweeper::new(
            self.ledger.clone(),
            self.config.agents.approval_timeout(),
            self.config.agents.sweeper_interval(),
        );
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _guard = ShutdownGuard::new(shutdown.clone());
            sweeper.run(shutdown).await;
        })
    }

    /// Ctrl-C path: lock everything down, then stop the process loops.
    pub async fn emergency_stop(&self, trace_id: &str) {
        match self.lockdown.activate(trace_id).await {
            Ok(cancelled) => warn!(cancelled, "emergency stop, lockdown engaged"),
            Err(e) => error!(error = %e, "emergency stop could not cancel active runs"),
        }
        self.shutdown.trigger();
    }

    /// Wait until every admitted task has released its slot.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = self.config.agents.max_concurrent_runs as u32;
        tokio::time::timeout(timeout, self.admission.acquire_many(all))
            .await
            .map(|permit| permit.is_ok())
            .unwrap_or(false)
    }

    pub async fn status_report(&self) -> Result<String> {
        let active = self.ledger.active_runs().await?;
        let recent = self.ledger.recent_runs(STATUS_RECENT_LIMIT).await?;
        Ok(narrator::format_agent_status(
            &active,
            &recent,
            self.lockdown.is_locked(),
        ))
    }

    // -- console -------------------------------------------------------------

    /// Execute one console command and return the reply text. Task commands
    /// are started in the background; their narration arrives separately.
    pub async fn dispatch(&self, command: ConsoleCommand, channel_id: &str) -> String {
        match command {
            ConsoleCommand::Run(task) | ConsoleCommand::Auto(task)
                if self.lockdown.is_locked() =>
            {
                narrator::format_error(
                    &task,
                    ow_agents::orchestrator::LOCKDOWN_MESSAGE,
                    UsageTotals::default(),
                )
            }
            ConsoleCommand::Run(task) => self.accept(task, channel_id, false),
            ConsoleCommand::Auto(task) => self.accept(task, channel_id, true),
            ConsoleCommand::Approve(id) => self.decide(id, ApprovalStatus::Approved).await,
            ConsoleCommand::Deny(id) => self.decide(id, ApprovalStatus::Denied).await,
            ConsoleCommand::Kill => {
                let trace = AgentContext::new(channel_id, "console").trace_id;
                match self.lockdown.activate(&trace).await {
                    Ok(cancelled) => narrator::format_kill_confirmation(cancelled),
                    Err(e) => format!("*LOCKDOWN ACTIVE*\nCancelling runs failed: {e}"),
                }
            }
            ConsoleCommand::Resume => {
                let trace = AgentContext::new(channel_id, "console").trace_id;
                self.lockdown.resume(&trace).await;
                narrator::format_resume_confirmation()
            }
            ConsoleCommand::Status => self
                .status_report()
                .await
                .unwrap_or_else(|e| format!("Status unavailable: {e}")),
            ConsoleCommand::Help => HELP_TEXT.to_string(),
        }
    }

    fn accept(&self, task: String, channel_id: &str, auto_execute: bool) -> String {
        let context = AgentContext::new(channel_id, "console");
        let reply = format!(
            "Task accepted: {} (trace {})",
            truncate_chars(&task, 80),
            context.trace_id
        );
        let handle = self.spawn_task(task, context, auto_execute);
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "task was not admitted"),
                Err(e) => error!(error = %e, "task panicked"),
            }
        });
        reply
    }

    async fn decide(&self, id: Option<uuid::Uuid>, decision: ApprovalStatus) -> String {
        let result = match id {
            Some(id) => self.gate.resolve(id, decision).await,
            None => self.gate.resolve_oldest(decision).await,
        };
        describe_decision(result, decision)
    }

    /// Read commands line by line until EOF or shutdown. Replies go to the
    /// default channel through the notifier.
    pub async fn serve_console<R>(&self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let channel = self.default_channel().to_string();
        let mut lines = input.lines();
        info!(channel = %channel, "console gateway ready");
        self.reply(&channel, HELP_TEXT).await;

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line.context("failed to read console input")?,
                _ = self.shutdown.cancelled() => break,
            };
            let Some(line) = line else {
                info!("console input closed");
                break;
            };

            let reply = match line.parse::<ConsoleCommand>() {
                Ok(command) => self.dispatch(command, &channel).await,
                Err(ParseCommandError::Empty) => continue,
                Err(e) => e.to_string(),
            };
            self.reply(&channel, &reply).await;
        }
        Ok(())
    }

    async fn reply(&self, channel_id: &str, message: &str) {
        if let Err(e) = self.notifier.notify(channel_id, message).await {
            warn!(channel = channel_id, error = %e, "console reply failed");
        }
    }
}

/// Human-readable outcome of an approve/deny command.
pub fn describe_decision(
    result: Result<ApprovalRequest, ApprovalError>,
    decision: ApprovalStatus,
) -> String {
    let verb = match decision {
        ApprovalStatus::Approved => "Approved",
        _ => "Denied",
    };
    match result {
        Ok(request) => format!("{verb}: {} ({})", request.summary, request.id),
        Err(ApprovalError::NoPending) => "No pending approvals.".to_string(),
        Err(ApprovalError::AlreadyResolved { status, .. }) => {
            format!("That request was already resolved ({status}).")
        }
        Err(e) => format!("Could not record decision: {e}"),
    }
}
