//! Exponential-backoff retry wrapper with jitter and cooperative
//! cancellation.
//!
//! Grounded in the cancellation-aware async loop idioms used throughout
//! the worktree and worker modules (`tokio_util::sync::CancellationToken`,
//! `tokio::select!`), generalised into a standalone component since no
//! single teacher module implements retry/backoff directly.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Tuning knobs for [`Retrier::do_with`].
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetrierConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling the backoff delay is clamped to.
    pub max_delay: Duration,
    /// Fractional jitter applied to each delay, e.g. `0.25` means the
    /// delay is scaled by a uniform factor in `[0.75, 1.25]`.
    pub jitter: f64,
}

impl Default for RetrierConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl RetrierConfig {
    /// Compute the (unjittered) base delay before the attempt-th retry
    /// (0-indexed), clamped to `max_delay`.
    fn base_delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let clamped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(clamped)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
    }
}

/// A marker error wrapper that forces [`RetryClassify::is_retryable`] to
/// return `false` regardless of the wrapped error's own classification.
///
/// Equality and display delegate to the inner error so callers that
/// compare against the original error still succeed.
#[derive(Debug, Clone)]
pub struct NonRetryable<E>(pub E);

impl<E> NonRetryable<E> {
    pub fn into_inner(self) -> E {
        self.0
    }
}

impl<E: fmt::Display> fmt::Display for NonRetryable<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for NonRetryable<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl<E: PartialEq> PartialEq<E> for NonRetryable<E> {
    fn eq(&self, other: &E) -> bool {
        &self.0 == other
    }
}

/// Implemented by any error type the [`Retrier`] is asked to classify.
pub trait RetryClassify {
    /// Whether this error should trigger another attempt.
    fn is_retryable(&self) -> bool;
}

impl<E: RetryClassify> RetryClassify for NonRetryable<E> {
    fn is_retryable(&self) -> bool {
        false
    }
}

/// Substrings (already lower-cased) that mark a message as describing a
/// transient failure worth retrying. Checked before the non-retryable
/// list so that overlaps like "429" (a 4xx code, but explicitly a rate
/// limit signal) classify as retryable.
const RETRYABLE_SUBSTRINGS: &[&str] = &[
    "rate limit",
    "too many requests",
    "429",
    "connection refused",
    "connection reset",
    "network unreachable",
    "no such host",
    "temporary failure",
    "timeout",
    "timed out",
    "deadline exceeded",
    "500",
    "502",
    "503",
    "504",
    "internal server error",
    "bad gateway",
    "service unavailable",
];

/// Substrings marking a message as describing a non-retryable failure.
/// Checked only to document intent; classification already defaults to
/// non-retryable when nothing in [`RETRYABLE_SUBSTRINGS`] matches.
const NON_RETRYABLE_SUBSTRINGS: &[&str] = &[
    "invalid",
    "unauthorized",
    "forbidden",
    "not found",
    "bad request",
];

/// Classify a free-form error message using the heuristic substring
/// rules from the retryable-error taxonomy. Intended for wrapping
/// process-output or SDK-less errors; typed errors should implement
/// [`RetryClassify`] directly instead of round-tripping through text.
pub fn classify_message(message: &str) -> bool {
    let normalised = message.to_lowercase();
    if RETRYABLE_SUBSTRINGS
        .iter()
        .any(|needle| normalised.contains(needle))
    {
        return true;
    }
    if NON_RETRYABLE_SUBSTRINGS
        .iter()
        .any(|needle| normalised.contains(needle))
    {
        return false;
    }
    false
}

/// Retries a fallible async operation with exponential backoff and
/// jitter, honouring cooperative cancellation.
#[derive(Debug, Clone)]
pub struct Retrier {
    config: RetrierConfig,
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(RetrierConfig::default())
    }
}

impl Retrier {
    pub fn new(config: RetrierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetrierConfig {
        &self.config
    }

    /// Call `f` up to `1 + max_retries` times, retrying only while the
    /// returned error classifies as retryable. Returns the last observed
    /// error if the budget is exhausted, or if `cancel` fires during a
    /// backoff sleep.
    pub async fn do_with<T, E, F, Fut>(&self, cancel: &CancellationToken, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassify,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = f().await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = err.is_retryable();
                    if !retryable || attempt >= self.config.max_retries {
                        return Err(err);
                    }

                    let delay = self.config.jittered_delay(attempt);
                    debug!(attempt, ?delay, "retrying after transient failure");

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            warn!("retry wait cancelled before next attempt");
                            return Err(err);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    attempt += 1;
                }
            }
        }
    }
}
