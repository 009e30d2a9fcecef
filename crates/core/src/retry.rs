//! Jittered exponential backoff.
//!
//! Used for per-page catalog retries, streaming reconnects and store writes.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Jittered exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        let clamped_base = base_delay_ms.max(1);
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: clamped_base,
            max_delay_ms: max_delay_ms.max(clamped_base),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (0-based), capped and jittered.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt.min(32) as u32);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        let delay = if self.jitter_pct > 0.0 {
            let spread = (delay as f64 * self.jitter_pct) as i64;
            let delta = rand::thread_rng().gen_range(-spread..=spread);
            delay.saturating_add_signed(delta)
        } else {
            delay
        };
        Duration::from_millis(delay)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. The closure receives the 0-based attempt.
    pub async fn retry_async<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(val) => return Ok(val),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt - 1);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Blocking counterpart of [`retry_async`](Self::retry_async) for
    /// synchronous store writes.
    pub fn retry_blocking<F, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(usize) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(val) => return Ok(val),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt - 1);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// Start a stateful backoff sequence (for reconnect loops with no
    /// attempt limit).
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 250, 5_000, 0.2)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self::new(cfg.max_attempts, cfg.base_delay_ms, cfg.max_delay_ms, cfg.jitter_pct)
    }
}

/// Unbounded backoff counter; reset once a connection is healthy again.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: usize,
}

impl Backoff {
    /// Delay for the next retry, advancing the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempts(&self) -> usize {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Map an error that exhausted its budget into the caller's terminal error.
pub fn exhausted(context: &str, err: Error) -> Error {
    match err {
        Error::TransientNetwork(msg) | Error::MalformedPage(msg) => {
            Error::upstream(format!("{context}: {msg}"))
        }
        other => other,
    }
}
