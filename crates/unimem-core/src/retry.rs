//! Bounded exponential backoff for transient adapter failures.

use crate::error::StorageResult;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Minimum delay between retries in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 = no jitter, 1.0 = full jitter).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            min_delay_ms: 25,
            max_delay_ms: 2_000,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            min_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
        }
    }
}

/// Delay before retry number `attempt` (0-indexed).
///
/// `min(min_delay * 2^attempt, max_delay) * (1 + random * jitter)`, capped at `max_delay`.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config
        .min_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(config.max_delay_ms);

    if config.jitter <= 0.0 {
        return capped;
    }

    let with_jitter = (capped as f64) * (1.0 + pseudo_random_fraction() * config.jitter);
    (with_jitter as u64).min(config.max_delay_ms)
}

/// A fraction in `[0, 1)` from the clock; good enough for jitter.
fn pseudo_random_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let mixed = nanos.wrapping_mul(2654435761);
    (mixed as f64) / (u32::MAX as f64 + 1.0)
}

/// Run an adapter call, retrying transient failures with backoff.
///
/// Non-transient errors are returned immediately.
pub async fn retry_storage<F, Fut, T>(config: &RetryConfig, what: &str, mut operation: F) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let max = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(op = what, attempt = attempt + 1, "retry succeeded");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt + 1 < max => {
                let delay_ms = compute_backoff(config, attempt);
                warn!(
                    op = what,
                    engine = %err.engine,
                    attempt = attempt + 1,
                    max_attempts = max,
                    delay_ms,
                    "transient storage error, retrying: {}",
                    err.message
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(op = what, engine = %err.engine, attempts = max, "retries exhausted");
                }
                return Err(err);
            }
        }
    }
}
