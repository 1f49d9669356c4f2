//! Conductor-Core: Bounded Retry with Exponential Backoff
//!
//! Used around idempotent persistence calls. Non-idempotent operations must
//! not be wrapped here; surface their errors instead.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Backoff policy for [`retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay_ms: u64,
    /// Ceiling for any single delay
    pub max_delay_ms: u64,
    /// Multiplier applied after each failed attempt
    pub backoff_multiplier: f64,
    /// Random factor in `[-jitter, +jitter]` applied to each delay
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Run `op` until it succeeds or `max_attempts` is exhausted, sleeping an
/// exponentially growing, jittered delay between attempts. Returns the last
/// error when attempts run out.
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay_ms as f64;
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_attempts.max(1) {
                    return Err(err);
                }
                let jitter = {
                    let mut rng = rand::thread_rng();
                    1.0 + config.jitter_factor * (rng.gen::<f64>() * 2.0 - 1.0)
                };
                let sleep_ms = (delay * jitter)
                    .clamp(0.0, config.max_delay_ms as f64) as u64;
                tracing::warn!(
                    attempt,
                    delay_ms = sleep_ms,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                delay = (delay * config.backoff_multiplier).min(config.max_delay_ms as f64);
                attempt += 1;
            }
        }
    }
}
