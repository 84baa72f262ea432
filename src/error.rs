use std::time::Duration;
use thiserror::Error;

/// Errors produced by the LLM boundary and the generation pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Low-level HTTP transport failure (connection refused, reset, etc.).
    #[error("Ошибка сети: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("Неверный формат ответа от API: {0}")]
    Json(#[from] serde_json::Error),

    /// The provider did not answer within the per-call budget.
    #[error("Превышено время ожидания ответа от API")]
    Timeout,

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`Backend`](crate::backend::Backend) implementations when
    /// the provider returns a non-success status code.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// The provider answered 2xx but without any choices.
    #[error("Пустой ответ от API")]
    EmptyResponse,

    /// Invalid configuration detected at build or load time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No API key was found in the settings or the environment.
    #[error("API key is not configured")]
    MissingApiKey,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

impl From<crate::config::ConfigError> for PipelineError {
    fn from(err: crate::config::ConfigError) -> Self {
        PipelineError::InvalidConfig(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
