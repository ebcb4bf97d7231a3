use ow_core::config::TariffConfig;
use serde::{Deserialize, Serialize};

/// Linear per-provider pricing in USD per 1M tokens.
///
/// Cost is a pure function of token counts, so each agent can carry its own
/// tariff when planner/executor and critic run on different providers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tariff {
    pub input_cost_per_1m: f64,
    pub output_cost_per_1m: f64,
}

impl Tariff {
    pub const fn new(input_cost_per_1m: f64, output_cost_per_1m: f64) -> Self {
        Self {
            input_cost_per_1m,
            output_cost_per_1m,
        }
    }

    /// Claude Sonnet: $3/M input, $15/M output.
    pub const ANTHROPIC_SONNET: Tariff = Tariff::new(3.0, 15.0);

    /// Gemini 2.5 Pro: $1.25/M input, $10/M output (prompts up to 200k).
    pub const GEMINI_PRO: Tariff = Tariff::new(1.25, 10.0);

    /// Zero-cost tariff for local or mocked providers.
    pub const FREE: Tariff = Tariff::new(0.0, 0.0);

    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_1m
            + (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_1m
    }
}

impl From<TariffConfig> for Tariff {
    fn from(cfg: TariffConfig) -> Self {
        Tariff::new(cfg.input_per_million, cfg.output_per_million)
    }
}
