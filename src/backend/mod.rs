//! Backend trait and normalized request/response types.
//!
//! The [`Backend`] trait abstracts over LLM providers, translating between
//! normalized [`LlmRequest`]/[`LlmResponse`] types and provider-specific
//! HTTP APIs. Built-in implementations: [`OpenAiBackend`] and [`MockBackend`].
//!
//! ## Architecture
//!
//! ```text
//! PromptExecutor ──► LlmRequest ──► with_backoff() ──► Backend::complete() ──► LlmResponse
//!                                                            │
//!                                                 ┌──────────┴──────────┐
//!                                           OpenAiBackend          MockBackend
//!                                       /v1/chat/completions      canned / closure
//! ```

pub mod backoff;
pub mod mock;
pub mod openai;

pub use backoff::BackoffConfig;
pub use mock::MockBackend;
pub use openai::OpenAiBackend;

use crate::client::LlmConfig;
use crate::error::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Type alias for the callback invoked before each transport retry.
///
/// Arguments: `(attempt_number, delay_before_retry, reason_for_retry)`.
pub type RetryCallback<'a> = Option<&'a mut (dyn FnMut(u32, std::time::Duration, &str) + Send)>;

/// A normalized, provider-agnostic LLM request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Model identifier (e.g. `"openai/gpt-oss-20b:free"`).
    pub model: String,

    /// Ordered, role-tagged conversation sent to the provider.
    pub messages: Vec<ChatMessage>,

    /// LLM configuration (temperature, max_tokens, response_format).
    pub config: LlmConfig,
}

impl LlmRequest {
    /// A request carrying a single `user` message.
    pub fn user(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::new(Role::User, content)],
            config: LlmConfig::default(),
        }
    }

    /// Content of the last `user` message, if any.
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author.
    pub role: Role,
    /// The message content.
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) response.
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A normalized LLM response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// The generated text content.
    pub text: String,

    /// HTTP status code (for diagnostics/logging).
    pub status: u16,

    /// Token usage, when the provider reports it.
    pub usage: Option<Usage>,

    /// Why generation stopped (`"stop"`, `"length"`, ...), when reported.
    pub finish_reason: Option<String>,
}

impl LlmResponse {
    /// A plain 200 response with no usage metadata.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: 200,
            usage: None,
            finish_reason: None,
        }
    }
}

/// Abstraction over LLM providers.
///
/// Implementors translate between the normalized [`LlmRequest`]/[`LlmResponse`]
/// and the provider's HTTP API. A failure is always a typed
/// [`PipelineError`](crate::PipelineError), never a panic; timeouts surface as
/// [`PipelineError::Timeout`](crate::PipelineError::Timeout).
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute a non-streaming LLM call.
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Execute a backend call, re-sending it while the [`BackoffConfig`] allows.
///
/// Returns the first successful response, or the error that ended the
/// attempts.
pub async fn with_backoff(
    backend: &Arc<dyn Backend>,
    client: &Client,
    base_url: &str,
    request: &LlmRequest,
    config: &BackoffConfig,
    mut on_retry: RetryCallback<'_>,
) -> Result<LlmResponse> {
    let mut attempt = 0;
    loop {
        let error = match backend.complete(client, base_url, request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };
        if !config.should_retry(&error, attempt) {
            return Err(error);
        }

        attempt += 1;
        let delay = config.delay_before(attempt, &error);
        if let Some(ref mut cb) = on_retry {
            cb(attempt, delay, &error.to_string());
        }
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipelineError;
    use std::time::Duration;

    #[test]
    fn test_role_round_trips_through_str() {
        for role in [Role::System, Role::User, Role::Assistant] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("tool".parse::<Role>().is_err());
    }

    #[test]
    fn test_last_user_content() {
        let request = LlmRequest {
            model: "m".into(),
            messages: vec![
                ChatMessage::new(Role::System, "rules"),
                ChatMessage::new(Role::User, "first"),
                ChatMessage::new(Role::Assistant, "answer"),
                ChatMessage::new(Role::User, "second"),
            ],
            config: LlmConfig::default(),
        };
        assert_eq!(request.last_user_content(), Some("second"));
    }

    #[tokio::test]
    async fn test_backoff_retries_then_succeeds() {
        let mock = MockBackend::new(vec!["ok".into()]).failing_first(
            2,
            || PipelineError::HttpError {
                status: 503,
                body: "busy".into(),
                retry_after: Some(Duration::from_millis(1)),
            },
        );
        let backend: Arc<dyn Backend> = Arc::new(mock);
        let config = BackoffConfig {
            max_retries: 3,
            ..BackoffConfig::standard()
        };

        let mut attempts = Vec::new();
        let mut on_retry = |attempt: u32, _delay: Duration, _reason: &str| attempts.push(attempt);
        let resp = with_backoff(
            &backend,
            &Client::new(),
            "http://unused",
            &LlmRequest::user("m", "hi"),
            &config,
            Some(&mut on_retry),
        )
        .await
        .unwrap();

        assert_eq!(resp.text, "ok");
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_backoff_none_returns_first_error() {
        let mock = MockBackend::fixed("never").failing_first(1, || PipelineError::Timeout);
        let backend: Arc<dyn Backend> = Arc::new(mock);
        let result = with_backoff(
            &backend,
            &Client::new(),
            "http://unused",
            &LlmRequest::user("m", "hi"),
            &BackoffConfig::none(),
            None,
        )
        .await;
        assert!(matches!(result, Err(PipelineError::Timeout)));
    }
}
