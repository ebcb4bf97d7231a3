//! Structured output extraction from free-form model text.
//!
//! Models are asked for JSON only but often wrap it in markdown fences or
//! surround it with prose. Extraction strips the fences, takes the first
//! balanced `{...}` object, and decodes it strictly into the target type.
//! Anything short of a complete, well-typed object is an error.

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResponseError {
    #[error("no JSON object found")]
    NoJson,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
}

fn fence_patterns() -> Option<&'static (Regex, Regex)> {
    static FENCES: OnceLock<Option<(Regex, Regex)>> = OnceLock::new();
    FENCES
        .get_or_init(|| {
            let open = Regex::new(r"(?i)^```(?:json)?\s*\n?").ok()?;
            let close = Regex::new(r"\n?```\s*$").ok()?;
            Some((open, close))
        })
        .as_ref()
}

/// Remove a leading ```` ```json ```` fence and a trailing ```` ``` ```` fence.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    match fence_patterns() {
        Some((open, close)) => {
            let without_open = open.replace(trimmed, "");
            close.replace(&without_open, "").into_owned()
        }
        None => trimmed.to_string(),
    }
}

/// The first balanced `{...}` object in `text`, honouring JSON string
/// literals and escapes so braces inside strings do not count.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Strip fences, extract the first object, and decode it into `T`.
pub fn decode_response<T: DeserializeOwned>(raw: &str) -> Result<T, ResponseError> {
    let cleaned = strip_code_fences(raw);
    let object = extract_json_object(&cleaned).ok_or(ResponseError::NoJson)?;
    serde_json::from_str(object).map_err(|e| ResponseError::InvalidJson(e.to_string()))
}
