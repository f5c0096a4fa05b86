//! Retry-on-lock-conflict helper
//!
//! Used around short locked sections that take a `NOWAIT` row lock. Only
//! errors that report a lock conflict are retried; everything else is
//! returned on the first occurrence.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::LockRetryConfig;
use crate::store::StoreError;

/// Implemented by errors that can carry a "row lock unavailable" condition
pub trait LockConflict {
    fn is_lock_conflict(&self) -> bool;
}

impl LockConflict for StoreError {
    fn is_lock_conflict(&self) -> bool {
        self.is_lock_unavailable()
    }
}

#[derive(Debug, Clone)]
pub struct LockRetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self::from(&LockRetryConfig::default())
    }
}

impl From<&LockRetryConfig> for LockRetryPolicy {
    fn from(config: &LockRetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_jitter: config.max_jitter(),
        }
    }
}

impl LockRetryPolicy {
    /// No sleeping between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt + 1`: `base * 2^attempt + jitter`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        exp + jitter
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the
/// attempts are used up (the last conflict error is returned).
pub async fn retry_on_lock_conflict<T, E, F, Fut>(
    policy: &LockRetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, E>
where
    E: LockConflict,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_lock_conflict() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Row lock busy, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
