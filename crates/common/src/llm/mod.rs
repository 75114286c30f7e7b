//! Language-model completion clients
//!
//! Provides:
//! - `LanguageModel` trait consumed by the enhancer, splitter and SQL generator
//! - OpenAI-compatible chat-completions client (NIM, OpenAI, vLLM)
//! - Scripted mock model for tests and offline development

use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A black-box prompt → completion service
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete a single user prompt
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Chat-completions client over HTTP
pub struct ChatCompletionsClient {
    config: LlmConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

impl ChatCompletionsClient {
    /// Create a new client
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { config, client })
    }

    async fn send(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'));

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
        };

        let response = self.client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport_error("llm", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("llm", status, body));
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            AppError::parse("llm", format!("invalid completion envelope: {}", e))
        })?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| AppError::parse("llm", "completion has no choices"))
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let start = Instant::now();
        let result = self.send(prompt).await;

        crate::metrics::record_model_call(
            start.elapsed().as_secs_f64(),
            &self.config.model,
            result.is_ok(),
        );
        tracing::debug!(
            model = %self.config.model,
            prompt_chars = prompt.len(),
            ok = result.is_ok(),
            "Completion finished"
        );

        result
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Map a failed HTTP exchange to the error taxonomy.
///
/// Timeouts, 408, 429 and 5xx are transient; any other status is a hard
/// upstream failure.
pub(crate) fn classify_status(
    service: &str,
    status: reqwest::StatusCode,
    body: String,
) -> AppError {
    let message = format!("API error {}: {}", status, body);
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        AppError::TransientService {
            service: service.to_string(),
            message,
        }
    } else {
        AppError::ServiceUnavailable { message }
    }
}

pub(crate) fn classify_transport_error(service: &str, err: reqwest::Error) -> AppError {
    if err.is_timeout() || err.is_connect() {
        AppError::TransientService {
            service: service.to_string(),
            message: err.to_string(),
        }
    } else {
        AppError::HttpClient(err)
    }
}

/// Mock model replaying scripted responses in order.
///
/// Every prompt is recorded so tests can assert on what was sent.
pub struct MockLanguageModel {
    responses: Mutex<VecDeque<Result<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful completion
    pub fn push_response(&self, text: impl Into<String>) -> &Self {
        self.lock_responses().push_back(Ok(text.into()));
        self
    }

    /// Queue a failed completion
    pub fn push_error(&self, err: AppError) -> &Self {
        self.lock_responses().push_back(Err(err));
        self
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String>>> {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MockLanguageModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn complete(&self, prompt: &str) -> Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        self.lock_responses().pop_front().unwrap_or_else(|| {
            Err(AppError::ServiceUnavailable {
                message: "mock model has no scripted response".to_string(),
            })
        })
    }

    fn model_name(&self) -> &str {
        "mock-llm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let rate_limited = classify_status("llm", reqwest::StatusCode::TOO_MANY_REQUESTS, String::new());
        assert!(rate_limited.is_transient());

        let bad_gateway = classify_status("llm", reqwest::StatusCode::BAD_GATEWAY, String::new());
        assert!(bad_gateway.is_transient());

        let unauthorized = classify_status("llm", reqwest::StatusCode::UNAUTHORIZED, "bad key".into());
        assert!(!unauthorized.is_transient());
        assert!(unauthorized.to_string().contains("401"));
    }

    #[tokio::test]
    async fn test_mock_replays_in_order() {
        let model = MockLanguageModel::new();
        model.push_response("first").push_response("second");

        assert_eq!(model.complete("a").await.unwrap(), "first");
        assert_eq!(model.complete("b").await.unwrap(), "second");
        assert!(model.complete("c").await.is_err());
        assert_eq!(model.prompts(), vec!["a", "b", "c"]);
    }
}
