//! Bounded retry for transient persistence failures.
//!
//! `delay = min(initial_delay_ms * 2^attempt, max_delay_ms) + random_jitter`.
//! Only errors classified by [`EngineError::is_transient`] are retried;
//! everything else is returned on the first failure.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry (ms).
    pub initial_delay_ms: u32,
    /// Maximum delay cap (ms).
    pub max_delay_ms: u32,
    /// Retries after the first attempt before giving up.
    pub max_retries: u32,
    /// Maximum random jitter added to each delay (ms).
    pub jitter_ms: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
            max_retries: 5,
            jitter_ms: 25,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = (self.initial_delay_ms as u64)
            .saturating_mul(factor)
            .min(self.max_delay_ms as u64);
        Duration::from_millis(ms)
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms as u64)
        };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }
}

/// Run `op`, retrying transient failures per `policy`.
///
/// Exhausting the budget yields `PersistenceUnavailable`.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    mut op: impl FnMut() -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt >= policy.max_retries {
                    tracing::error!(attempts = attempt + 1, error = %e, "Persistence retry budget exhausted");
                    return Err(EngineError::PersistenceUnavailable {
                        attempts: attempt + 1,
                        last_error: e.to_string(),
                    });
                }
                let delay = policy.delay_with_jitter(attempt);
                tracing::warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %e, "Transient persistence error, retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
