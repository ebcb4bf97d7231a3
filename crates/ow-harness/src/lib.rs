//! Harness: the execution layer between agent logic and the outside world.
//!
//! - Language-model capability (`LlmProvider`) with Anthropic and Gemini
//!   HTTP providers and a scripted mock for tests
//! - Linear per-provider tariffs for cost estimation
//! - Cooperative shutdown coordination

pub mod llm;
pub mod shutdown;
pub mod tariff;
