use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from `~/.overwatch/config.toml`.
///
/// **Security**: this struct never stores API keys. Providers read their
/// credentials at runtime from the environment variable named here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl Config {
    /// Load config from `~/.overwatch/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not expressible via types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.agents.validate()?;
        if self.ledger.path.trim().is_empty() {
            return Err(ConfigError::Validation("ledger.path must not be empty".into()));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".overwatch")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

impl LedgerConfig {
    /// The configured path with a leading `~` expanded to the home directory.
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

fn default_ledger_path() -> String {
    "~/.overwatch/ledger.db".into()
}

/// Expand a leading `~/` (or a bare `~`) to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let home = || dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    if path == "~" {
        home()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home().join(rest)
    } else {
        Path::new(path).to_path_buf()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub anthropic: AnthropicConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
}

/// Per-million-token prices used to estimate run cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TariffConfig {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    #[serde(default = "default_anthropic_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
    #[serde(default = "default_anthropic_model")]
    pub planner_model: String,
    #[serde(default = "default_anthropic_model")]
    pub executor_model: String,
    #[serde(default = "default_anthropic_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_anthropic_tariff")]
    pub tariff: TariffConfig,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_anthropic_key_env(),
            base_url: default_anthropic_base_url(),
            planner_model: default_anthropic_model(),
            executor_model: default_anthropic_model(),
            max_tokens: default_anthropic_max_tokens(),
            tariff: default_anthropic_tariff(),
        }
    }
}

fn default_anthropic_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn default_anthropic_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_anthropic_max_tokens() -> u32 {
    2048
}
fn default_anthropic_tariff() -> TariffConfig {
    TariffConfig {
        input_per_million: 3.0,
        output_per_million: 15.0,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    #[serde(default = "default_gemini_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    #[serde(default = "default_gemini_model")]
    pub critic_model: String,
    #[serde(default = "default_gemini_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_gemini_tariff")]
    pub tariff: TariffConfig,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_gemini_key_env(),
            base_url: default_gemini_base_url(),
            critic_model: default_gemini_model(),
            max_tokens: default_gemini_max_tokens(),
            tariff: default_gemini_tariff(),
        }
    }
}

fn default_gemini_key_env() -> String {
    "GOOGLE_API_KEY".into()
}
fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}
fn default_gemini_model() -> String {
    "gemini-2.5-pro".into()
}
fn default_gemini_max_tokens() -> u32 {
    4096
}
fn default_gemini_tariff() -> TariffConfig {
    TariffConfig {
        input_per_million: 1.25,
        output_per_million: 10.0,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_minutes: u64,
    #[serde(default = "default_poll_interval")]
    pub approval_poll_interval_secs: u64,
    #[serde(default = "default_sweeper_interval")]
    pub sweeper_interval_secs: u64,
    #[serde(default = "default_policy_ttl")]
    pub policy_cache_ttl_secs: u64,
    /// Critic scores strictly below this are denied outright.
    #[serde(default = "default_score_floor")]
    pub critic_score_floor: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_runs: usize,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            approval_timeout_minutes: default_approval_timeout(),
            approval_poll_interval_secs: default_poll_interval(),
            sweeper_interval_secs: default_sweeper_interval(),
            policy_cache_ttl_secs: default_policy_ttl(),
            critic_score_floor: default_score_floor(),
            max_concurrent_runs: default_max_concurrent(),
        }
    }
}

/// One week.
pub const MAX_APPROVAL_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;

impl AgentsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.approval_timeout_minutes == 0 {
            return Err(ConfigError::Validation(
                "agents.approval_timeout_minutes must be > 0".into(),
            ));
        }
        if self.approval_timeout_minutes > MAX_APPROVAL_TIMEOUT_MINUTES {
            return Err(ConfigError::Validation(format!(
                "agents.approval_timeout_minutes must be at most {MAX_APPROVAL_TIMEOUT_MINUTES}, got {}",
                self.approval_timeout_minutes
            )));
        }
        if self.approval_poll_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "agents.approval_poll_interval_secs must be > 0".into(),
            ));
        }
        if self.sweeper_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "agents.sweeper_interval_secs must be > 0".into(),
            ));
        }
        if !(0.0..=10.0).contains(&self.critic_score_floor) {
            return Err(ConfigError::Validation(format!(
                "agents.critic_score_floor must be within 0..=10, got {}",
                self.critic_score_floor
            )));
        }
        if self.max_concurrent_runs == 0 {
            return Err(ConfigError::Validation(
                "agents.max_concurrent_runs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_minutes.saturating_mul(60))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.approval_poll_interval_secs)
    }

    pub fn sweeper_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper_interval_secs)
    }

    pub fn policy_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.policy_cache_ttl_secs)
    }
}

fn default_approval_timeout() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    3
}
fn default_sweeper_interval() -> u64 {
    60
}
fn default_policy_ttl() -> u64 {
    300
}
fn default_score_floor() -> f64 {
    3.0
}
fn default_max_concurrent() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_channel")]
    pub default_channel: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_channel: default_channel(),
        }
    }
}

fn default_channel() -> String {
    "console".into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
