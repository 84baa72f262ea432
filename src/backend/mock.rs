//! Mock backend for testing without a live LLM.
//!
//! [`MockBackend`] answers from canned responses or from a closure over the
//! incoming request, optionally after a per-call delay, and records every
//! request it receives so tests can inspect the rendered prompts.
//!
//! # Example
//!
//! ```
//! use staged_generation::backend::MockBackend;
//!
//! let canned = MockBackend::new(vec!["Hello, world!".to_string()]);
//! let echo = MockBackend::from_fn(|req| {
//!     Ok(format!("R({})", req.last_user_content().unwrap_or_default()))
//! });
//! ```

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{Backend, LlmRequest, LlmResponse};
use crate::error::Result;
use crate::PipelineError;

type Responder = Arc<dyn Fn(&LlmRequest) -> Result<String> + Send + Sync>;
type DelayFn = Arc<dyn Fn(&LlmRequest) -> Duration + Send + Sync>;
type ErrorFactory = Arc<dyn Fn() -> PipelineError + Send + Sync>;

/// A test backend driven by canned responses or a closure.
pub struct MockBackend {
    responder: Responder,
    delay: Option<DelayFn>,
    fail_remaining: AtomicUsize,
    fail_with: Option<ErrorFactory>,
    requests: Mutex<Vec<LlmRequest>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockBackend {
    /// Create a mock backend with the given canned responses.
    ///
    /// Responses are returned in call order. When exhausted, cycles from the beginning.
    pub fn new(responses: Vec<String>) -> Self {
        assert!(!responses.is_empty(), "MockBackend requires at least one response");
        let index = AtomicUsize::new(0);
        Self::from_fn(move |_| {
            let idx = index.fetch_add(1, Ordering::Relaxed) % responses.len();
            Ok(responses[idx].clone())
        })
    }

    /// Create a mock that always returns the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Create a mock whose answer is computed from the request.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&LlmRequest) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(f),
            delay: None,
            fail_remaining: AtomicUsize::new(0),
            fail_with: None,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Create a mock where every call fails with `PipelineError::Other(message)`.
    pub fn failing(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::from_fn(move |_| Err(PipelineError::Other(message.clone())))
    }

    /// Sleep for a fixed duration before answering each call.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_delay_fn(move |_| delay)
    }

    /// Sleep for a request-dependent duration before answering each call.
    pub fn with_delay_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&LlmRequest) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Arc::new(f));
        self
    }

    /// Fail the first `n` calls with the error built by `make_err`.
    pub fn failing_first<F>(mut self, n: usize, make_err: F) -> Self
    where
        F: Fn() -> PipelineError + Send + Sync + 'static,
    {
        self.fail_remaining = AtomicUsize::new(n);
        self.fail_with = Some(Arc::new(make_err));
        self
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Highest number of calls that were in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn take_forced_failure(&self) -> Option<PipelineError> {
        let factory = self.fail_with.as_ref()?;
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| factory())
    }
}

impl fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockBackend")
            .field("calls", &self.call_count())
            .field("has_delay", &self.delay.is_some())
            .field("fail_remaining", &self.fail_remaining.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(ref delay) = self.delay {
            tokio::time::sleep(delay(request)).await;
        }

        let outcome = match self.take_forced_failure() {
            Some(err) => Err(err),
            None => (self.responder)(request).map(LlmResponse::text),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
