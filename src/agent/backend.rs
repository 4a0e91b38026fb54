//! Reasoning backend client.
//!
//! The backend receives one fully rendered request and returns free-form
//! text. Failures are classified as transient (worth retrying) or
//! permanent, and that classification drives the evaluator's retry loop.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// A classified backend failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Timeouts, connection problems, rate limits, server errors, empty replies.
    #[error("transient backend failure: {0}")]
    Transient(String),
    /// Authentication, malformed requests and anything else not worth retrying.
    #[error("permanent backend failure: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let body = truncate(body, 300);
        let message = format!("HTTP {}: {}", status, body);
        if status == 408 || status == 429 || (500..=599).contains(&status) {
            BackendError::Transient(message)
        } else {
            BackendError::Permanent(message)
        }
    }
}

/// Something that can evaluate a rendered request.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Model identifier, used for cache keys and reports.
    fn model_name(&self) -> &str;

    /// Send one request and return the raw response text.
    async fn complete(&self, request: &str) -> Result<String, BackendError>;
}

/// Settings for the chat-completions backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model_name: String,
    pub temperature: Option<f32>,
    pub max_completion_tokens: Option<u32>,
    pub reasoning_effort: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatCompletionsBackend {
    config: BackendConfig,
    http_client: reqwest::Client,
}

impl ChatCompletionsBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        info!(
            "Initializing reasoning backend {} at {}",
            config.model_name, config.api_url
        );

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ReasoningBackend for ChatCompletionsBackend {
    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    async fn complete(&self, request: &str) -> Result<String, BackendError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| BackendError::Permanent("API key is not set".to_string()))?;

        let body = ChatRequest {
            model: &self.config.model_name,
            messages: vec![ChatMessage {
                role: "user",
                content: request,
            }],
            temperature: self.config.temperature,
            max_completion_tokens: self.config.max_completion_tokens,
            reasoning_effort: self.config.reasoning_effort.as_deref(),
        };

        debug!("Sending request of {} chars", request.len());

        let response = self
            .http_client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Transient(format!(
                        "request timed out after {}s",
                        self.config.timeout_seconds
                    ))
                } else if e.is_connect() {
                    BackendError::Transient(format!("cannot connect to {}", self.config.api_url))
                } else {
                    BackendError::Transient(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), &body));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Permanent(format!("failed to parse response: {}", e)))?;

        Ok(chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}…", head)
    }
}
