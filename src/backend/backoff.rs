//! Transport retry policy.
//!
//! A prompt whose call fails gets the formatted error text in its slot, so
//! retrying is opt-in: [`BackoffConfig::none()`] is the default and a failed
//! call fails its prompt at once. With retries enabled, rate limits, 5xx
//! answers, connection errors and timeouts are retried after a doubling,
//! jittered delay, or after the provider's `Retry-After` when it sent one.

use crate::PipelineError;
use std::time::Duration;

/// When and how long to wait before re-sending a failed call.
///
/// ```
/// use staged_generation::backend::BackoffConfig;
///
/// assert_eq!(BackoffConfig::none().max_retries, 0);
/// assert_eq!(BackoffConfig::standard().with_max_retries(2).max_retries, 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Retries after the first attempt. 0 disables retry.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further one.
    pub base_delay: Duration,
    /// Upper bound for a computed delay.
    pub max_delay: Duration,
    /// Randomise the upper half of each computed delay.
    pub jitter: bool,
    /// HTTP statuses worth another attempt.
    pub retry_statuses: Vec<u16>,
    /// Prefer the provider's `Retry-After` over the computed delay.
    pub honor_retry_after: bool,
}

impl BackoffConfig {
    /// No retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// 3 retries starting at 1 s, capped at 30 s (the per-call budget).
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
            retry_statuses: vec![408, 429, 500, 502, 503, 504],
            honor_retry_after: true,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether `error` on attempt `attempt` (0 = first call) earns another try.
    pub fn should_retry(&self, error: &PipelineError, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        match error {
            PipelineError::HttpError { status, .. } => self.retry_statuses.contains(status),
            PipelineError::Request(_) | PipelineError::Timeout => true,
            _ => false,
        }
    }

    /// Wait before retry number `retry` (1-based) after `error`.
    pub fn delay_before(&self, retry: u32, error: &PipelineError) -> Duration {
        if self.honor_retry_after {
            if let PipelineError::HttpError {
                retry_after: Some(hint),
                ..
            } = error
            {
                return *hint;
            }
        }
        self.computed_delay(retry)
    }

    fn computed_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter {
            return delay;
        }
        let half = delay / 2;
        half + half.mul_f64(fastrand::f64())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> BackoffConfig {
        BackoffConfig {
            jitter: false,
            ..BackoffConfig::standard()
        }
    }

    fn http(status: u16, retry_after: Option<Duration>) -> PipelineError {
        PipelineError::HttpError {
            status,
            body: String::new(),
            retry_after,
        }
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let config = fixed();
        let err = PipelineError::Timeout;
        assert_eq!(config.delay_before(1, &err), Duration::from_secs(1));
        assert_eq!(config.delay_before(2, &err), Duration::from_secs(2));
        assert_eq!(config.delay_before(4, &err), Duration::from_secs(8));
        assert_eq!(config.delay_before(20, &err), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let config = BackoffConfig::standard();
        for _ in 0..100 {
            let d = config.delay_before(2, &PipelineError::Timeout);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2), "delay {:?}", d);
        }
    }

    #[test]
    fn test_retry_after_wins_when_honored() {
        let err = http(429, Some(Duration::from_secs(7)));
        assert_eq!(fixed().delay_before(1, &err), Duration::from_secs(7));

        let ignoring = BackoffConfig {
            honor_retry_after: false,
            ..fixed()
        };
        assert_eq!(ignoring.delay_before(1, &err), Duration::from_secs(1));
    }

    #[test]
    fn test_transient_errors_are_retried() {
        let config = BackoffConfig::standard();
        assert!(config.should_retry(&http(429, None), 0));
        assert!(config.should_retry(&http(503, None), 2));
        assert!(config.should_retry(&PipelineError::Timeout, 0));
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let config = BackoffConfig::standard();
        assert!(!config.should_retry(&http(400, None), 0));
        assert!(!config.should_retry(&http(401, None), 0));
        assert!(!config.should_retry(&PipelineError::EmptyResponse, 0));
    }

    #[test]
    fn test_budget_is_respected() {
        assert!(!BackoffConfig::standard().should_retry(&PipelineError::Timeout, 3));
        assert!(!BackoffConfig::none().should_retry(&PipelineError::Timeout, 0));
    }
}
