//! Chat-completion client for an OpenAI-compatible LLM server.
//!
//! [`ChatClient`] is the seam the orchestrator talks through; the throttled
//! wrapper implements the same trait, and tests substitute a scripted mock.

use crate::json_repair;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Typed error kinds of the client layer. Upper layers convert these into
/// their own semantics and never inspect transport-level codes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("model is not ready")]
    ModelNotReady,
    #[error("malformed JSON in model response")]
    MalformedJson { content: String },
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("request cancelled")]
    Cancelled,
}

impl LlmError {
    /// Errors worth retrying at the transport level.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout(_) | LlmError::Transport(_) | LlmError::Server { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One chat-completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the server for a JSON object and parse/repair the content.
    pub json_response: bool,
    /// Optional guided-decoding schema hint.
    pub json_schema: Option<serde_json::Value>,
}

impl ChatRequest {
    pub fn json(messages: Vec<Message>, max_tokens: u32, temperature: f32) -> Self {
        Self {
            messages,
            max_tokens,
            temperature,
            json_response: true,
            json_schema: None,
        }
    }
}

/// One chat-completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    /// Parsed content when the request asked for JSON.
    pub json: Option<serde_json::Value>,
    /// True when the JSON only parsed after repair.
    pub repaired: bool,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// The client seam between the orchestrator and the model server.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// HTTP client against `<base>/v1/chat/completions` (C5).
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
    max_retries: u32,
}

impl LlmClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            timeout,
            max_retries: 1,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn send_once(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let response_format = if let Some(schema) = &request.json_schema {
            Some(ResponseFormat::JsonSchema {
                json_schema: JsonSchemaFormat {
                    name: "extraction".to_string(),
                    schema: schema.clone(),
                },
            })
        } else if request.json_response {
            Some(ResponseFormat::JsonObject)
        } else {
            None
        };

        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: request.messages.clone(),
            max_tokens: Some(request.max_tokens),
            temperature: Some(request.temperature),
            response_format,
        };

        let url = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        debug!("Sending chat completion to {} (model={})", url, self.model);

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout)
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            if status.as_u16() == 503 && message.to_lowercase().contains("model") {
                return Err(LlmError::ModelNotReady);
            }
            return Err(LlmError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(format!("invalid response body: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let usage = parsed.usage.unwrap_or_default();
        info!(
            "Chat completion: {} tokens (prompt {}, completion {})",
            usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
        );

        finish_response(content, request, usage)
    }
}

/// Parse the content per the request's JSON expectations.
fn finish_response(
    content: String,
    request: &ChatRequest,
    usage: Usage,
) -> Result<ChatResponse, LlmError> {
    let (json, repaired) = if request.json_response {
        match json_repair::parse_or_repair(&content) {
            Ok(parsed) => {
                let repaired = parsed.was_repaired();
                (Some(parsed.into_value()), repaired)
            }
            Err(repaired_content) => {
                warn!("Model returned unrepairable JSON ({} chars)", content.len());
                return Err(LlmError::MalformedJson {
                    content: repaired_content,
                });
            }
        }
    } else {
        (None, false)
    };

    Ok(ChatResponse {
        content,
        json,
        repaired,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    })
}

#[async_trait]
impl ChatClient for LlmClient {
    async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(250 * (1 << (attempt - 1)));
                debug!("Retrying chat completion after {:?}", backoff);
                tokio::time::sleep(backoff).await;
            }

            match self.send_once(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    warn!("Chat completion attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(LlmError::Transport("no attempts made".to_string())))
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseFormat {
    JsonObject,
    JsonSchema { json_schema: JsonSchemaFormat },
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: String,
    schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}
