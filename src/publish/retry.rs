use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Backoff strategy between publish attempts
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Fixed delay between attempts
    #[default]
    Fixed,
    /// delay = min(base * 2^attempt + jitter, max)
    ExponentialWithJitter { base_ms: u64, max_ms: u64 },
}

/// How many times a publish is attempted before the measurement is queued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3, // 1 initial + 2 retries
            delay: Duration::from_millis(500),
            backoff: BackoffStrategy::Fixed,
        }
    }
}

impl RetryConfig {
    /// One attempt, no retries. Failures go straight to the pending queue.
    pub fn single() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn exponential(max_attempts: u32, base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_attempts,
            delay: Duration::from_millis(base_ms),
            backoff: BackoffStrategy::ExponentialWithJitter { base_ms, max_ms },
        }
    }

    /// Delay to wait after the given (zero-based) failed attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match &self.backoff {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::ExponentialWithJitter { base_ms, max_ms } => {
                let base = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
                let jitter = random_jitter(base / 2);
                Duration::from_millis(base.saturating_add(jitter).min(*max_ms))
            }
        }
    }
}

fn random_jitter(max_jitter: u64) -> u64 {
    if max_jitter == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max_jitter)
}

/// Errors that may succeed if the operation is repeated
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or runs out of attempts.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = config.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    max = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying publish after transient error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
