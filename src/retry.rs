//! Backoff policy shared by page fetches and the task queue
//!
//! Frontier sources wrap each HTTP fetch in [`with_retry`]. The worker does not
//! sleep in-process; it stores [`retry_delay`] on the task record and lets the
//! queue hand the unit out again later. Only [`ErrorKind::Transient`] failures
//! are retried.
//!
//! ```no_run
//! use news_ingest::config::RetryConfig;
//! use news_ingest::retry::with_retry;
//!
//! # async fn example(client: reqwest::Client) -> news_ingest::Result<()> {
//! let body = with_retry(&RetryConfig::default(), || async {
//!     let response = client.get("https://znews.vn/sitemap.xml").send().await?;
//!     Ok::<_, news_ingest::Error>(response.text().await?)
//! })
//! .await?;
//! # drop(body);
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{DownloadError, Error, ErrorKind};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Failure classification consumed by [`with_retry`]
pub trait IsRetryable {
    /// Whether trying the same operation again may succeed
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl IsRetryable for DownloadError {
    fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Run `operation`, sleeping [`retry_delay`] between transient failures
///
/// `config.max_attempts` counts retries after the first call, so an operation
/// runs at most `max_attempts + 1` times.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut retries = 0;
    loop {
        let e = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    tracing::debug!(retries, "Recovered after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !e.is_retryable() {
            return Err(e);
        }
        if retries >= config.max_attempts {
            tracing::warn!(error = %e, retries, "Giving up, retries exhausted");
            return Err(e);
        }

        retries += 1;
        let delay = retry_delay(config, retries);
        tracing::debug!(error = %e, retry = retries, of = config.max_attempts, delay_ms = delay.as_millis() as u64, "Transient failure, backing off");
        tokio::time::sleep(delay).await;
    }
}

/// Delay before retry number `retry` (1-based), without jitter
///
/// `initial_delay * backoff_multiplier^(retry - 1)`, capped at `max_delay`.
pub fn backoff_delay(config: &RetryConfig, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(63) as i32;
    let secs = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    if !secs.is_finite() || secs >= config.max_delay.as_secs_f64() {
        return config.max_delay;
    }
    Duration::from_secs_f64(secs)
}

/// Delay before retry number `retry`, with jitter applied when configured
pub fn retry_delay(config: &RetryConfig, retry: u32) -> Duration {
    let delay = backoff_delay(config, retry);
    if config.jitter { add_jitter(delay) } else { delay }
}

/// Scale `delay` by a random factor in `[1, 2]`
fn add_jitter(delay: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(0.0..=1.0);
    delay.mul_f64(factor)
}
