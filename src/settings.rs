//! Provider settings.
//!
//! [`Settings`] can be built from the environment or, with the `yaml`
//! feature, from a YAML document, and turned into an [`ExecCtx`].

use crate::backend::BackoffConfig;
use crate::error::Result;
use crate::exec_ctx::{ExecCtx, DEFAULT_MAX_CONCURRENCY, DEFAULT_MODEL};
use crate::PipelineError;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

pub const ENV_API_KEY: &str = "OPENROUTER_API_KEY";
pub const ENV_MODEL: &str = "OPENROUTER_MODEL";
pub const ENV_BASE_URL: &str = "OPENROUTER_BASE_URL";

/// Connection and execution settings for the LLM provider.
#[derive(Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_concurrency: usize,
    /// Transport retries per call. 0 disables retry.
    pub max_retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 30,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: 0,
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl Settings {
    /// Read `OPENROUTER_API_KEY`, `OPENROUTER_MODEL` and `OPENROUTER_BASE_URL`.
    ///
    /// Fails with [`PipelineError::MissingApiKey`] when no key is set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut settings = Self {
            api_key: non_empty(ENV_API_KEY),
            ..Self::default()
        };
        if let Some(model) = non_empty(ENV_MODEL) {
            settings.model = model;
        }
        if let Some(url) = non_empty(ENV_BASE_URL) {
            settings.base_url = url;
        }
        settings.check()?;
        Ok(settings)
    }

    /// Parse settings from YAML. Missing fields take their defaults.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(text)
            .map_err(|e| PipelineError::InvalidConfig(format!("settings: {}", e)))?;
        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> Result<()> {
        match self.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(()),
            _ => Err(PipelineError::MissingApiKey),
        }
    }

    /// Build an execution context with an OpenRouter-compatible backend.
    pub fn into_ctx(self) -> Result<ExecCtx> {
        self.check()?;
        let api_key = self.api_key.unwrap_or_default();
        let backoff = if self.max_retries == 0 {
            BackoffConfig::none()
        } else {
            BackoffConfig::standard().with_max_retries(self.max_retries)
        };

        Ok(ExecCtx::builder(self.base_url)
            .openai_with_key(api_key)
            .model(self.model)
            .timeout(Duration::from_secs(self.timeout_secs))
            .max_concurrency(self.max_concurrency)
            .backoff(backoff)
            .build())
    }
}
