//! Reasoning backend boundary.
//!
//! Every structured answer from the backend passes through
//! [`parse_structured`], which either yields the expected type or a
//! `MalformedResponse` error. There is no lenient fallback parsing.

mod client;
mod types;

pub use client::OpenAiCompatibleClient;
pub use types::{
    ChatRequest, ChatResponse, Choice, ChoiceMessage, Completion, CompletionRequest, Message,
    MessageRole, ResponseFormat, Usage,
};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{BackendResult, ResearchError, ResearchResult};

/// Text generation collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Run one structured prompt and return the raw completion text.
    async fn complete(&self, request: CompletionRequest) -> BackendResult<Completion>;
}

/// Extract the JSON payload from a completion.
///
/// Accepts raw JSON, a ```` ```json ```` fenced block, or a bare fenced block.
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    // Fast path: raw JSON
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}

/// Validate a completion against the expected response type.
///
/// A top-level array is accepted when its first element matches `T`.
pub fn parse_structured<T: DeserializeOwned>(text: &str, schema: &str) -> ResearchResult<T> {
    let json = extract_json_from_completion(text).map_err(|message| {
        ResearchError::MalformedResponse {
            message: format!("{}: {}", schema, message),
        }
    })?;

    let value: Value = serde_json::from_str(json).map_err(|e| ResearchError::MalformedResponse {
        message: format!("{}: invalid JSON: {}", schema, e),
    })?;

    let value = match value {
        Value::Array(items) => items
            .into_iter()
            .next()
            .ok_or_else(|| ResearchError::MalformedResponse {
                message: format!("{}: empty JSON array", schema),
            })?,
        other => other,
    };

    serde_json::from_value(value).map_err(|e| ResearchError::MalformedResponse {
        message: format!("response does not match schema '{}': {}", schema, e),
    })
}

/// Serialize a value for prompt embedding, falling back to an empty JSON value.
pub(crate) fn to_prompt_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
}
