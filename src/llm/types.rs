use serde::{Deserialize, Serialize};

/// Message in a chat conversation with the reasoning backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Speaker of the message.
    pub role: MessageRole,
    /// Message text.
    pub content: String,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions for the model.
    System,
    /// User input.
    User,
    /// Model output.
    Assistant,
}

impl Message {
    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// A structured prompt: role-tagged messages plus the name of the response
/// schema the caller will validate against.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Conversation sent to the model.
    pub messages: Vec<Message>,
    /// Schema tag used to route and validate the response.
    pub schema: &'static str,
    /// Sampling temperature override.
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    /// Create a request expecting the named schema
    pub fn new(schema: &'static str, messages: Vec<Message>) -> Self {
        Self {
            messages,
            schema,
            temperature: None,
        }
    }

    /// Override the sampling temperature
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }
}

/// Raw text returned by the backend
#[derive(Debug, Clone, Default)]
pub struct Completion {
    /// Raw model output.
    pub text: String,
    /// Token usage, when reported.
    pub usage: Option<Usage>,
}

impl Completion {
    /// Completion with no usage accounting
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }

    /// Total tokens reported by the backend, zero when unknown
    pub fn total_tokens(&self) -> u64 {
        self.usage
            .as_ref()
            .and_then(|u| u.total_tokens)
            .map(u64::from)
            .unwrap_or(0)
    }
}

/// Body of a `POST /chat/completions` call
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Model name.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<Message>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Requested response format.
    pub response_format: ResponseFormat,
}

/// Requested output format
#[derive(Debug, Clone, Serialize)]
pub struct ResponseFormat {
    /// Format type, e.g. "json_object".
    #[serde(rename = "type")]
    pub kind: String,
}

impl ResponseFormat {
    /// JSON object mode
    pub fn json_object() -> Self {
        Self {
            kind: "json_object".to_string(),
        }
    }
}

impl ChatRequest {
    /// Create a JSON-mode chat request
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            response_format: ResponseFormat::json_object(),
        }
    }

    /// Set the sampling temperature
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Response from `POST /chat/completions`
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    /// Completion choices.
    pub choices: Vec<Choice>,
    /// Model that served the request.
    pub model: Option<String>,
    /// Token usage.
    pub usage: Option<Usage>,
}

/// One completion choice
#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    /// Returned message.
    pub message: ChoiceMessage,
    /// Why generation stopped.
    pub finish_reason: Option<String>,
}

/// Assistant message inside a choice
#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceMessage {
    /// Message role.
    pub role: Option<String>,
    /// Message text.
    pub content: Option<String>,
}

/// Token usage information
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    pub prompt_tokens: Option<u32>,
    /// Tokens in the completion.
    pub completion_tokens: Option<u32>,
    /// Total tokens.
    pub total_tokens: Option<u32>,
}

impl ChatResponse {
    /// Text of the first choice, if any
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
    }
}

#[cfg(test)]
#[path = "types_tests.rs"]
mod types_tests;
