use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::types::{ChatRequest, ChatResponse, Completion, CompletionRequest};
use super::ReasoningBackend;
use crate::config::{LlmConfig, RequestConfig};
use crate::error::{BackendError, BackendResult};

/// Client for OpenAI-compatible chat completion endpoints
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    default_temperature: f64,
    request_config: RequestConfig,
}

impl OpenAiCompatibleClient {
    /// Create a new client
    pub fn new(config: &LlmConfig, request_config: RequestConfig) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(BackendError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            default_temperature: config.temperature,
            request_config,
        })
    }

    /// Send a chat request, retrying transport failures with exponential backoff
    pub async fn chat(&self, request: ChatRequest) -> BackendResult<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut last_error = None;
        let mut retries = 0;

        while retries <= self.request_config.max_retries {
            if retries > 0 {
                let delay = Duration::from_millis(
                    self.request_config.retry_delay_ms * (2_u64.pow(retries - 1)),
                );
                warn!(
                    model = %self.model,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "Retrying chat completion request"
                );
                tokio::time::sleep(delay).await;
            }

            let start = Instant::now();

            match self.execute_request(&url, &request).await {
                Ok(response) => {
                    info!(
                        model = %self.model,
                        latency_ms = start.elapsed().as_millis(),
                        "Chat completion succeeded"
                    );
                    return Ok(response);
                }
                Err(e) if is_client_error(&e) => {
                    error!(model = %self.model, error = %e, "Chat completion rejected");
                    return Err(e);
                }
                Err(e) => {
                    error!(
                        model = %self.model,
                        error = %e,
                        latency_ms = start.elapsed().as_millis(),
                        retry = retries,
                        "Chat completion failed"
                    );
                    last_error = Some(e);
                    retries += 1;
                }
            }
        }

        match last_error {
            // A timeout on the final attempt stays a timeout so callers can classify it
            Some(BackendError::Timeout { timeout_ms }) => Err(BackendError::Timeout { timeout_ms }),
            last => Err(BackendError::Unavailable {
                message: last
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "Unknown error".to_string()),
                retries,
            }),
        }
    }

    /// Execute a single request (internal)
    async fn execute_request(&self, url: &str, request: &ChatRequest) -> BackendResult<ChatResponse> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Calling chat completion endpoint"
        );

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    BackendError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(BackendError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| BackendError::InvalidResponse {
                message: format!("Failed to parse response: {}", e),
            })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the configured model name
    pub fn model(&self) -> &str {
        &self.model
    }
}

/// 4xx responses other than rate limiting will not improve on retry
fn is_client_error(err: &BackendError) -> bool {
    matches!(err, BackendError::Api { status, .. } if (400..500).contains(status) && *status != 429)
}

#[async_trait]
impl ReasoningBackend for OpenAiCompatibleClient {
    async fn complete(&self, request: CompletionRequest) -> BackendResult<Completion> {
        let schema = request.schema;
        let chat = ChatRequest::new(&self.model, request.messages)
            .with_temperature(request.temperature.unwrap_or(self.default_temperature));

        let response = self.chat(chat).await?;
        let text = response
            .first_content()
            .ok_or_else(|| BackendError::InvalidResponse {
                message: format!("Empty completion for schema '{}'", schema),
            })?
            .to_string();

        Ok(Completion {
            text,
            usage: response.usage,
        })
    }
}
