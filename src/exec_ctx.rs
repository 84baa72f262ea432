//! Execution context shared by every LLM call of a generation.
//!
//! [`ExecCtx`] carries the HTTP client, LLM backend, endpoint, model,
//! transport backoff, the bounded call pool and an optional event handler.
//! It is constructed once and shared (behind an `Arc`) by the scheduler,
//! the prompt executor and the direct fallback path.

use crate::backend::{self, Backend, BackoffConfig, LlmRequest, LlmResponse, OpenAiBackend};
use crate::client::LlmConfig;
use crate::events::{emit, Event, EventHandler};
use crate::PipelineError;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Default model when none is configured.
pub const DEFAULT_MODEL: &str = "openai/gpt-oss-20b:free";

/// Default number of LLM calls allowed in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// Default per-call network budget.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared execution context for LLM calls.
///
/// # Example
///
/// ```
/// use staged_generation::ExecCtx;
///
/// let ctx = ExecCtx::builder("https://openrouter.ai/api/v1")
///     .openai_with_key("sk-or-...")
///     .model("openai/gpt-oss-20b:free")
///     .max_concurrency(5)
///     .build();
/// ```
pub struct ExecCtx {
    /// HTTP client shared by every call.
    pub client: Client,
    /// Base URL for the LLM provider, without the `/v1/...` suffix.
    pub base_url: String,
    /// LLM backend. Default: [`OpenAiBackend`] without a key.
    pub backend: Arc<dyn Backend>,
    /// Model identifier sent with every request.
    pub model: String,
    /// Transport retry configuration. Default: [`BackoffConfig::none()`].
    pub backoff: BackoffConfig,
    /// Optional event handler for lifecycle events.
    pub event_handler: Option<Arc<dyn EventHandler>>,
    max_concurrency: usize,
    pool: Arc<Semaphore>,
}

impl ExecCtx {
    /// Create a new builder.
    pub fn builder(base_url: impl Into<String>) -> ExecCtxBuilder {
        ExecCtxBuilder {
            client: None,
            base_url: base_url.into(),
            backend: None,
            model: None,
            backoff: None,
            event_handler: None,
            timeout: None,
            max_concurrency: None,
        }
    }

    /// Capacity of the call pool.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Build a request for the configured model.
    pub fn request(&self, messages: Vec<backend::ChatMessage>, config: LlmConfig) -> LlmRequest {
        LlmRequest {
            model: self.model.clone(),
            messages,
            config,
        }
    }

    /// Run one LLM call through the bounded pool with transport retry.
    ///
    /// At most [`max_concurrency`](Self::max_concurrency) calls hold a pool
    /// slot at once; the rest wait for a free slot.
    pub async fn complete(&self, request: &LlmRequest) -> crate::error::Result<LlmResponse> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|e| PipelineError::Other(format!("call pool closed: {}", e)))?;

        let event_handler = self.event_handler.clone();
        let mut on_retry = |attempt: u32, delay: Duration, reason: &str| {
            warn!(attempt, ?delay, reason, "retrying LLM call");
            emit(
                &event_handler,
                Event::TransportRetry {
                    attempt,
                    delay_ms: saturating_millis(delay),
                    reason: reason.to_string(),
                },
            );
        };

        let response = backend::with_backoff(
            &self.backend,
            &self.client,
            &self.base_url,
            request,
            &self.backoff,
            Some(&mut on_retry),
        )
        .await?;

        match response.usage {
            Some(usage) => info!(
                model = %request.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "LLM call completed"
            ),
            None => info!(model = %request.model, backend = self.backend.name(), "LLM call completed without usage data"),
        }

        Ok(response)
    }
}

impl std::fmt::Debug for ExecCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCtx")
            .field("base_url", &self.base_url)
            .field("backend", &self.backend.name())
            .field("model", &self.model)
            .field("backoff", &self.backoff)
            .field("max_concurrency", &self.max_concurrency)
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

/// Builder for [`ExecCtx`].
pub struct ExecCtxBuilder {
    client: Option<Client>,
    base_url: String,
    backend: Option<Arc<dyn Backend>>,
    model: Option<String>,
    backoff: Option<BackoffConfig>,
    event_handler: Option<Arc<dyn EventHandler>>,
    timeout: Option<Duration>,
    max_concurrency: Option<usize>,
}

impl ExecCtxBuilder {
    /// Set the HTTP client. If not set, a default client is created.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the LLM backend.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use the OpenAI-compatible backend with API key authentication.
    pub fn openai_with_key(mut self, api_key: impl Into<String>) -> Self {
        self.backend = Some(Arc::new(OpenAiBackend::new().with_api_key(api_key)));
        self
    }

    /// Set the model. Default: [`DEFAULT_MODEL`].
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the transport retry configuration. Default: [`BackoffConfig::none()`].
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = Some(config);
        self
    }

    /// Set the event handler.
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Set the per-call timeout. Default: 30 seconds.
    ///
    /// Applies to the client built by [`build`](Self::build). A custom
    /// `Client` passed via [`client`](Self::client) keeps its own timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the number of LLM calls allowed in flight at once. Default: 5.
    /// Values below 1 are raised to 1.
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    /// Build the execution context.
    pub fn build(self) -> ExecCtx {
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let client = self.client.unwrap_or_else(|| {
            Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default()
        });
        let max_concurrency = self
            .max_concurrency
            .unwrap_or(DEFAULT_MAX_CONCURRENCY)
            .max(1);
        ExecCtx {
            client,
            base_url: normalize_base_url(&self.base_url),
            backend: self
                .backend
                .unwrap_or_else(|| Arc::new(OpenAiBackend::new())),
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            backoff: self.backoff.unwrap_or_else(BackoffConfig::none),
            event_handler: self.event_handler,
            max_concurrency,
            pool: Arc::new(Semaphore::new(max_concurrency)),
        }
    }
}

fn saturating_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Strip known provider path suffixes from a base URL.
/// Backends append `/v1/chat/completions` themselves.
/// e.g., "https://openrouter.ai/api/v1" -> "https://openrouter.ai/api"
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    // longest first
    for suffix in &["/v1/chat/completions", "/v1/chat", "/v1"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}
