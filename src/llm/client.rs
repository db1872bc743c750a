//! Chat-completions client and the [`TextGenerator`] capability trait.
//!
//! Both default backends speak the OpenAI chat-completions wire format:
//! OpenAI natively and Anthropic through its OpenAI-compatible endpoint.
//! Anything else that speaks the same format (a LiteLLM proxy, OpenRouter)
//! can be registered under its own service name.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::ratelimit::{ANTHROPIC_SERVICE, OPENAI_SERVICE};

/// Default OpenAI API base.
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
/// Default Anthropic API base (OpenAI-compatible surface).
pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";

/// A message in a conversation with an LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender ("system", "user", "assistant").
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Request for text generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Model identifier to use for generation.
    pub model: String,
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum number of tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Concatenated user message content, mostly useful for assertions in fakes.
    pub fn user_content(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Token usage statistics for a generation request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A single generated choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    /// Reason the generation stopped ("stop", "length").
    pub finish_reason: Option<String>,
}

/// Response from a generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub id: String,
    /// Model that generated this response.
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl GenerationResponse {
    /// Builds a single-choice response.
    pub fn text(model: impl Into<String>, content: impl Into<String>, usage: Usage) -> Self {
        Self {
            id: String::new(),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: Some("stop".to_string()),
            }],
            usage,
        }
    }

    /// Content of the first choice, if any.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// A remote text-generation capability.
///
/// `service_name` selects the rate-limit budget every call is charged to.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn service_name(&self) -> &str;

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;
}

/// Client for OpenAI-compatible chat-completions APIs.
pub struct ChatCompletionsClient {
    service: String,
    api_base: String,
    api_key: String,
    http_client: Client,
}

impl ChatCompletionsClient {
    /// Creates a client charging calls to `service`.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingApiKey` when no key is given.
    pub fn new(
        service: impl Into<String>,
        api_base: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, LlmError> {
        let service = service.into();
        let api_key = api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::MissingApiKey(service.clone()))?;

        Ok(Self {
            service,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            http_client: build_http_client(Duration::from_secs(120)),
        })
    }

    /// OpenAI client at the default base URL.
    pub fn openai(api_key: Option<String>) -> Result<Self, LlmError> {
        Self::new(OPENAI_SERVICE, OPENAI_API_BASE, api_key)
    }

    /// Anthropic client at the default base URL.
    pub fn anthropic(api_key: Option<String>) -> Result<Self, LlmError> {
        Self::new(ANTHROPIC_SERVICE, ANTHROPIC_API_BASE, api_key)
    }

    /// Overrides the HTTP-level timeout (the stage timeout still applies on top).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http_client = build_http_client(timeout);
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }
}

fn build_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Internal response structure from the API.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    #[serde(default)]
    index: u32,
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    role: String,
    /// Null when the model refused or returned only tool calls.
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
    code: Option<serde_json::Value>,
}

/// Maps a non-success HTTP status and body to an [`LlmError`].
fn classify_error(status_code: u16, body: &str) -> LlmError {
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(parsed) => {
            let code = parsed
                .error
                .code
                .as_ref()
                .and_then(|c| c.as_str())
                .unwrap_or_default();
            if status_code == 429 {
                LlmError::RateLimited(parsed.error.message)
            } else if code == "context_length_exceeded" {
                LlmError::ContextLengthExceeded {
                    message: parsed.error.message,
                }
            } else {
                LlmError::ApiError {
                    code: status_code,
                    message: parsed.error.message,
                }
            }
        }
        Err(_) if status_code == 429 => LlmError::RateLimited(body.to_string()),
        Err(_) => LlmError::ApiError {
            code: status_code,
            message: body.to_string(),
        },
    }
}

fn convert_response(api_response: ApiResponse) -> GenerationResponse {
    let choices = api_response
        .choices
        .into_iter()
        .map(|choice| Choice {
            index: choice.index,
            message: Message {
                role: choice.message.role,
                content: choice.message.content.unwrap_or_default(),
            },
            finish_reason: choice.finish_reason,
        })
        .collect();

    let usage = api_response
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u
                .total_tokens
                .unwrap_or(u.prompt_tokens + u.completion_tokens),
        })
        .unwrap_or_default();

    GenerationResponse {
        id: api_response.id,
        model: api_response.model,
        choices,
        usage,
    }
}

#[async_trait]
impl TextGenerator for ChatCompletionsClient {
    fn service_name(&self) -> &str {
        &self.service
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let url = format!("{}/chat/completions", self.api_base);

        let http_response = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::RequestFailed(format!("request timed out: {}", e))
                } else {
                    LlmError::RequestFailed(e.to_string())
                }
            })?;

        let status = http_response.status();
        if !status.is_success() {
            let body = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(classify_error(status.as_u16(), &body));
        }

        let api_response: ApiResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;

        let mut response = convert_response(api_response);
        if response.model.is_empty() {
            response.model = request.model;
        }
        Ok(response)
    }
}
