//! Language-model provider abstraction.
//!
//! One async trait covers every provider the agents talk to (Anthropic for
//! planning and execution, Gemini for critique) plus a scripted mock for
//! tests. Responses are never streamed: the agents need the whole text before
//! they can extract structured output from it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur when interacting with an LLM provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// An HTTP-level error (connection failure, DNS, TLS, etc.).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The API returned a non-success status with a message.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Failed to parse the API response body.
    #[error("parse error: {0}")]
    ParseError(String),

    /// The API indicated rate limiting (HTTP 429).
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The provider answered but produced no text.
    #[error("empty response (finish reason: {0})")]
    EmptyResponse(String),

    /// The API key environment variable is not set.
    #[error("{0} not set")]
    MissingApiKey(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::HttpError(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Core data types
// ---------------------------------------------------------------------------

/// Role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    User,
    Assistant,
}

impl fmt::Display for LlmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmRole::User => write!(f, "user"),
            LlmRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::User,
            content: content.into(),
        }
    }
}

/// Configuration for one completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    /// Provider default when `None`.
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    /// Ask the provider to emit JSON only, where it supports that.
    pub json_response: bool,
    /// Caller-side bound on the whole HTTP exchange.
    pub timeout: Option<Duration>,
}

impl LlmConfig {
    pub fn new(model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            temperature: None,
            system_prompt: None,
            json_response: false,
            timeout: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn json_response(mut self) -> Self {
        self.json_response = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response from an LLM completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    /// Model identifier the provider reports having used.
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: String,
}

impl LlmResponse {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

/// Async trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short provider label used in logs.
    fn name(&self) -> &str;

    /// Send a completion request and return the full response.
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError>;
}

/// Read an API key from the named environment variable.
pub fn api_key_from_env(var: &str) -> Result<String, LlmError> {
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(LlmError::MissingApiKey(var.to_string())),
    }
}

async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = resp.status().as_u16();

    if status == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return Err(LlmError::RateLimited {
            retry_after_secs: retry_after,
        });
    }

    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::ApiError {
            status,
            message: text,
        });
    }

    Ok(resp)
}

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

/// LLM provider for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    /// `api_key` is sent as the `x-api-key` header.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    /// Override the base URL (useful for testing with a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Build the JSON request body for the Anthropic Messages API.
    ///
    /// The system prompt goes in the top-level `system` field.
    pub fn build_request_body(messages: &[LlmMessage], config: &LlmConfig) -> serde_json::Value {
        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|msg| {
                serde_json::json!({
                    "role": msg.role.to_string(),
                    "content": msg.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": config.model,
            "max_tokens": config.max_tokens,
            "messages": api_messages,
        });

        if let Some(temperature) = config.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(ref system) = config.system_prompt {
            body["system"] = serde_json::Value::String(system.clone());
        }

        body
    }

    /// Concatenate the text blocks of a Messages API response.
    pub fn parse_response_body(body: &str) -> Result<LlmResponse, LlmError> {
        let api_resp: AnthropicResponse =
            serde_json::from_str(body).map_err(|e| LlmError::ParseError(e.to_string()))?;

        let content = api_resp
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(LlmResponse {
            content,
            model: api_resp.model,
            input_tokens: api_resp.usage.input_tokens,
            output_tokens: api_resp.usage.output_tokens,
            finish_reason: api_resp.stop_reason.unwrap_or_else(|| "unknown".into()),
        })
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        let body = Self::build_request_body(messages, config);
        let url = format!("{}/v1/messages", self.base_url);

        let mut req = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body);
        if let Some(timeout) = config.timeout {
            req = req.timeout(timeout);
        }

        let resp = error_for_status(req.send().await?).await?;
        let text = resp.text().await?;
        Self::parse_response_body(&text)
    }
}

// ---------------------------------------------------------------------------
// GeminiProvider
// ---------------------------------------------------------------------------

/// LLM provider for the Gemini `generateContent` REST API.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn build_request_body(messages: &[LlmMessage], config: &LlmConfig) -> serde_json::Value {
        let contents: Vec<serde_json::Value> = messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    LlmRole::User => "user",
                    LlmRole::Assistant => "model",
                };
                serde_json::json!({
                    "role": role,
                    "parts": [{ "text": msg.content }],
                })
            })
            .collect();

        let mut generation = serde_json::json!({ "maxOutputTokens": config.max_tokens });
        if config.json_response {
            generation["responseMimeType"] = serde_json::json!("application/json");
        }
        if let Some(temperature) = config.temperature {
            generation["temperature"] = serde_json::json!(temperature);
        }

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": generation,
        });
        if let Some(ref system) = config.system_prompt {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }
        body
    }

    /// Join the parts of the first candidate. Empty text is an error; a
    /// `MAX_TOKENS` truncation is logged and the partial text returned.
    pub fn parse_response_body(body: &str, model: &str) -> Result<LlmResponse, LlmError> {
        let api_resp: GeminiResponse =
            serde_json::from_str(body).map_err(|e| LlmError::ParseError(e.to_string()))?;

        let candidate = api_resp.candidates.into_iter().next();
        let finish_reason = candidate
            .as_ref()
            .and_then(|c| c.finish_reason.clone())
            .unwrap_or_else(|| "unknown".into());
        let content = candidate
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if content.is_empty() {
            return Err(LlmError::EmptyResponse(finish_reason));
        }
        if finish_reason == "MAX_TOKENS" {
            warn!(model, "gemini response truncated at max tokens, using partial text");
        }

        let usage = api_resp.usage_metadata.unwrap_or_default();
        Ok(LlmResponse {
            content,
            model: api_resp.model_version.unwrap_or_else(|| model.to_string()),
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            finish_reason,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
    model_version: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        let body = Self::build_request_body(messages, config);
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, config.model
        );

        let mut req = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(timeout) = config.timeout {
            req = req.timeout(timeout);
        }

        let resp = error_for_status(req.send().await?).await?;
        let text = resp.text().await?;
        Self::parse_response_body(&text, &config.model)
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// A scripted LLM provider for tests.
///
/// Each call to `complete` pops the next queued result. When the queue is
/// empty a fixed default response is returned.
#[derive(Clone, Default)]
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<Result<LlmResponse, LlmError>>>>,
    /// Captured requests for test assertions.
    #[allow(clippy::type_complexity)]
    captured_requests: Arc<Mutex<Vec<(Vec<LlmMessage>, LlmConfig)>>>,
    delay: Option<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn with_response(self, response: LlmResponse) -> Self {
        lock(&self.responses).push_back(Ok(response));
        self
    }

    /// Queue a successful response with the given text and token counts.
    pub fn with_text(self, content: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        self.with_response(LlmResponse {
            content: content.into(),
            model: "mock-model".to_string(),
            input_tokens,
            output_tokens,
            finish_reason: "end_turn".to_string(),
        })
    }

    /// Queue an error response.
    pub fn with_error(self, error: LlmError) -> Self {
        lock(&self.responses).push_back(Err(error));
        self
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn captured_requests(&self) -> Vec<(Vec<LlmMessage>, LlmConfig)> {
        lock(&self.captured_requests).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.responses).len()
    }

    fn default_response(model: &str) -> LlmResponse {
        LlmResponse {
            content: "Mock response".to_string(),
            model: model.to_string(),
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: "end_turn".to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        lock(&self.captured_requests).push((messages.to_vec(), config.clone()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = lock(&self.responses).pop_front();
        next.unwrap_or_else(|| Ok(Self::default_response(&config.model)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LlmConfig {
        LlmConfig::new("test-model", 512).with_system_prompt("be terse")
    }

    #[test]
    fn anthropic_body_puts_system_at_top_level() {
        let body = AnthropicProvider::build_request_body(&[LlmMessage::user("hi")], &config());
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn anthropic_response_joins_text_blocks() {
        let raw = r#"{
            "content": [
                {"type": "text", "text": "{\"a\":"},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": "1}"}
            ],
            "model": "claude-sonnet-4-20250514",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 7}
        }"#;
        let resp = AnthropicProvider::parse_response_body(raw).unwrap();
        assert_eq!(resp.content, "{\"a\":1}");
        assert_eq!(resp.total_tokens(), 19);
        assert_eq!(resp.finish_reason, "end_turn");
    }

    #[test]
    fn anthropic_response_parse_error() {
        let err = AnthropicProvider::parse_response_body("not json").unwrap_err();
        assert!(matches!(err, LlmError::ParseError(_)));
    }

    #[test]
    fn gemini_body_uses_system_instruction_and_json_mime() {
        let cfg = config().json_response();
        let body = GeminiProvider::build_request_body(&[LlmMessage::user("review")], &cfg);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "review");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 512);
        assert_eq!(
            body["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn gemini_response_reads_usage_metadata() {
        let raw = r#"{
            "candidates": [{
                "content": {"parts": [{"text": "{\"score\":"}, {"text": "8}"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 100, "candidatesTokenCount": 40}
        }"#;
        let resp = GeminiProvider::parse_response_body(raw, "gemini-2.5-pro").unwrap();
        assert_eq!(resp.content, "{\"score\":8}");
        assert_eq!(resp.model, "gemini-2.5-pro");
        assert_eq!(resp.input_tokens, 100);
        assert_eq!(resp.output_tokens, 40);
    }

    #[test]
    fn gemini_empty_candidate_is_an_error() {
        let raw = r#"{"candidates": [{"finishReason": "SAFETY"}]}"#;
        let err = GeminiProvider::parse_response_body(raw, "gemini-2.5-pro").unwrap_err();
        match err {
            LlmError::EmptyResponse(reason) => assert_eq!(reason, "SAFETY"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_api_key_is_reported_by_name() {
        let err = api_key_from_env("OW_TEST_KEY_THAT_IS_NEVER_SET").unwrap_err();
        assert_eq!(err.to_string(), "OW_TEST_KEY_THAT_IS_NEVER_SET not set");
    }

    #[tokio::test]
    async fn mock_provider_returns_queue_then_default() {
        let mock = MockProvider::new()
            .with_text("first", 3, 4)
            .with_error(LlmError::Timeout);

        let first = mock.complete(&[LlmMessage::user("a")], &config()).await.unwrap();
        assert_eq!(first.content, "first");
        assert!(matches!(
            mock.complete(&[LlmMessage::user("b")], &config()).await,
            Err(LlmError::Timeout)
        ));
        let fallback = mock.complete(&[LlmMessage::user("c")], &config()).await.unwrap();
        assert_eq!(fallback.content, "Mock response");
        assert_eq!(fallback.model, "test-model");

        let captured = mock.captured_requests();
        assert_eq!(captured.len(), 3);
        assert_eq!(captured[1].0[0].content, "b");
        assert_eq!(captured[0].1.system_prompt.as_deref(), Some("be terse"));
    }

    #[tokio::test]
    async fn mock_provider_clones_share_queue() {
        let mock = MockProvider::new().with_text("only", 1, 1);
        let clone = mock.clone();
        clone.complete(&[LlmMessage::user("x")], &config()).await.unwrap();
        assert_eq!(mock.remaining(), 0);
        assert_eq!(mock.captured_requests().len(), 1);
    }
}
