//! Exponential backoff retry for feed requests.
//!
//! [`RetryFeed`] decorates any [`FeedSource`] and transparently retries
//! transient failures (connection errors, timeouts, 5xx and 429 responses).
//! Malformed responses are not retried; they surface immediately.
//!
//! # Retry Strategy
//!
//! - Maximum 3 retry attempts by default
//! - Exponential backoff starting at 1 second
//! - Maximum delay capped at 30 seconds
//! - Random jitter (0-250ms) added to each delay

use std::fmt;
use std::time::{Duration, Instant};

use rand::{Rng, rng};
use tokio::time::sleep;
use tracing::{error, instrument, warn};

use crate::error::FeedError;
use crate::feed::{FeedSource, RawPage};

/// Backoff parameters shared by retrying decorators.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    ///
    /// ```text
    /// delay = min(base_delay * 2^(attempt-1), max_delay)
    /// ```
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(31) as u32;
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Whether a feed error is worth retrying.
pub fn is_retryable(err: &FeedError) -> bool {
    match err {
        FeedError::Transport { source, .. } => {
            source.is_timeout() || source.is_connect() || source.is_request() || source.is_body()
        }
        FeedError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
        _ => false,
    }
}

/// Wrapper that adds exponential backoff retry logic to any [`FeedSource`].
pub struct RetryFeed<T> {
    inner: T,
    policy: BackoffPolicy,
}

impl<T: FeedSource> RetryFeed<T> {
    pub fn new(inner: T, policy: BackoffPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<T> fmt::Debug for RetryFeed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryFeed")
            .field("max_retries", &self.policy.max_retries)
            .field("base_delay", &self.policy.base_delay)
            .field("max_delay", &self.policy.max_delay)
            .finish()
    }
}

impl<T: FeedSource> FeedSource for RetryFeed<T> {
    #[instrument(level = "debug", skip(self))]
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<RawPage, FeedError> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempt_t0 = Instant::now();
            match self.inner.fetch_page(page, per_page).await {
                Ok(raw) => return Ok(raw),
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.policy.max_retries {
                        error!(
                            attempt,
                            max = self.policy.max_retries,
                            elapsed_ms_total = total_t0.elapsed().as_millis(),
                            error = %e,
                            "fetch_page() exhausted retries"
                        );
                        return Err(e);
                    }

                    let jitter_ms: u64 = rng().random_range(0..=250);
                    let delay =
                        self.policy.delay_for_attempt(attempt) + Duration::from_millis(jitter_ms);
                    warn!(
                        attempt,
                        max = self.policy.max_retries,
                        elapsed_ms_attempt = attempt_t0.elapsed().as_millis(),
                        ?delay,
                        error = %e,
                        "fetch_page() attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
