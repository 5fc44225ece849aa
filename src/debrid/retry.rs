//! Retry with exponential backoff for transient provider API failures.
//!
//! Every provider call goes through [`RetryPolicy`]. A failed call is first
//! classified into a [`FailureType`]; only transient and rate-limited
//! failures are retried, and never more than `max_attempts` times in total.
//!
//! Provider API errors (bad token, limits, infringement, ...) are permanent
//! here. They are business outcomes the adapter or orchestrator handles, and
//! retrying them would only burn the resolve deadline.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::ProviderError;

/// Default maximum attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);

const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

const MAX_JITTER: Duration = Duration::from_millis(250);

/// Upper bound for a provider-requested Retry-After delay.
///
/// Resolutions run under a two-minute ceiling, so waiting longer than this
/// cannot produce a useful answer.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Classification of a provider call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Timeouts, connection resets, 408 and 5xx responses.
    Transient,
    /// Anything a retry would not change.
    Permanent,
    /// HTTP 429.
    RateLimited,
}

/// Decision on whether to retry a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// The upcoming attempt number (1-indexed, first retry is 2).
        attempt: u32,
    },
    /// Give up and surface the error.
    DoNotRetry {
        /// Why the call is not retried.
        reason: String,
    },
}

/// Exponential backoff configuration.
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
///
/// With defaults the delays are roughly 0.5 s then 1 s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom `max_attempts` and default delays.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether the call that just failed on `attempt` is retried.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Like [`should_retry`](Self::should_retry), but honors the error's
    /// Retry-After hint when it is longer than the computed backoff.
    #[must_use]
    pub fn decide(&self, error: &ProviderError, attempt: u32) -> RetryDecision {
        let decision = self.should_retry(classify_error(error), attempt);
        match (decision, retry_after_hint(error)) {
            (RetryDecision::Retry { delay, attempt }, Some(hint)) if hint > delay => {
                RetryDecision::Retry {
                    delay: hint,
                    attempt,
                }
            }
            (decision, _) => decision,
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = (base_ms * multiplier.powf(exponent)).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=MAX_JITTER.as_millis() as u64))
    }
}

/// Classifies a provider error for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | Network (timeout, connect) | Transient |
/// | Network (TLS) | Permanent |
/// | HTTP 408, 5xx | Transient |
/// | HTTP 429 | RateLimited |
/// | Other HTTP | Permanent |
/// | Provider API error | Permanent |
/// | Decode / contract errors | Permanent |
#[must_use]
pub fn classify_error(error: &ProviderError) -> FailureType {
    match error {
        ProviderError::Network { message, .. } => {
            if is_tls_error(message) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        ProviderError::HttpStatus { status, .. } => classify_http_status(*status),
        ProviderError::Api { .. }
        | ProviderError::UnexpectedResponse { .. }
        | ProviderError::FileNotFound { .. }
        | ProviderError::TorrentFailed { .. }
        | ProviderError::InvalidCredential { .. }
        | ProviderError::ClientUnavailable { .. } => FailureType::Permanent,
    }
}

fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("certificate") || message.contains("tls") || message.contains("ssl")
}

fn retry_after_hint(error: &ProviderError) -> Option<Duration> {
    match error {
        ProviderError::HttpStatus {
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}

/// Parses a Retry-After header value (delta-seconds or HTTP-date).
///
/// Values above [`MAX_RETRY_AFTER`] are capped. Negative, past or
/// malformed values yield `None`.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        return Some(cap_retry_after(Duration::from_secs(seconds as u64)));
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        return datetime
            .duration_since(std::time::SystemTime::now())
            .ok()
            .map(cap_retry_after);
    }

    debug!(header_value, "unparseable Retry-After value");
    None
}

fn cap_retry_after(duration: Duration) -> Duration {
    if duration > MAX_RETRY_AFTER {
        warn!(
            delay_secs = duration.as_secs(),
            max_secs = MAX_RETRY_AFTER.as_secs(),
            "Retry-After exceeds maximum, capping"
        );
        MAX_RETRY_AFTER
    } else {
        duration
    }
}
