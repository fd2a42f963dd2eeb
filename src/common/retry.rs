// src/common/retry.rs
// Exponential backoff with jitter, shared by reconnects and RPC retries.

use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Share of the computed delay that may be added as random jitter.
pub const JITTER_RATIO: f64 = 0.3;

pub type RetryCallback = Arc<dyn Fn(&dyn Display, u32) + Send + Sync>;

#[derive(Clone)]
pub struct RetryOptions {
    /// Total number of attempts, including the first one
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Called with the failed attempt's error and number before sleeping
    pub on_retry: Option<RetryCallback>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            factor: 2.0,
            on_retry: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("factor", &self.factor)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(&dyn Display, u32) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// Delay before the retry that follows failed attempt `attempt`, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(self.initial_delay, self.factor, self.max_delay, attempt)
    }

    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// `min(initial * factor^(attempt - 1), max)`; attempts are 1-based.
pub fn backoff_delay(initial: Duration, factor: f64, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let factor = if factor.is_finite() && factor >= 1.0 { factor } else { 1.0 };
    let millis = initial.as_millis() as f64 * factor.powi(exponent);
    let capped = millis.min(max.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

/// Adds between 0 and [`JITTER_RATIO`] of `delay` on top of it.
pub fn add_jitter(delay: Duration) -> Duration {
    let jitter = rand::random::<f64>() * JITTER_RATIO * delay.as_millis() as f64;
    delay + Duration::from_millis(jitter as u64)
}

/// Runs `operation` until it succeeds or `options.max_retries` attempts fail,
/// returning the last error in the latter case.
pub async fn with_retry<T, E, F, Fut>(mut operation: F, options: &RetryOptions) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = options.attempts();
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt >= attempts => {
                warn!(attempt, error = %err, "Operation failed, retries exhausted");
                return Err(err);
            }
            Err(err) => {
                let delay = add_jitter(options.delay_for(attempt));
                warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                );
                if let Some(callback) = &options.on_retry {
                    callback(&err, attempt);
                }
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Same loop as [`with_retry`], but yields `fallback` once retries are exhausted.
pub async fn with_retry_or_fallback<T, E, F, Fut>(
    operation: F,
    fallback: T,
    options: &RetryOptions,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    match with_retry(operation, options).await {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "Falling back to default value after retries");
            fallback
        }
    }
}

/// Fire-and-forget retry. Failures are logged, never returned.
pub fn queue_background_retry<T, E, F, Fut>(operation: F, options: RetryOptions) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send,
    E: Display + Send,
{
    tokio::spawn(async move {
        if let Err(err) = with_retry(operation, &options).await {
            error!(error = %err, "Background operation failed after all retries");
        }
    })
}
