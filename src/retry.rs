//! Retry policy for control-plane probes.
//!
//! Retry behavior is expressed as a pure [`BackoffPolicy`] value consumed
//! through an injectable [`Sleeper`], so the health-check budget can be
//! unit-tested without real wall-clock delays.

use std::time::Duration;

use async_trait::async_trait;

/// Bounded linear-backoff policy: attempt `n` (1-based) is followed by a
/// delay of `base_delay * n`, up to `max_attempts` attempts in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl BackoffPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay to wait after the given 1-based attempt, or `None` when the
    /// budget is exhausted (no sleep after the final attempt).
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            None
        } else {
            Some(self.base_delay * attempt)
        }
    }

    /// Total time this policy can spend sleeping, all attempts failing.
    pub fn total_delay(&self) -> Duration {
        (1..self.max_attempts).map(|n| self.base_delay * n).sum()
    }
}

impl Default for BackoffPolicy {
    /// Five attempts, 2s linear backoff: roughly a 20s sleep budget, which
    /// together with per-request timeouts keeps startup probing near 30s.
    fn default() -> Self {
        Self::new(5, Duration::from_secs(2))
    }
}

/// Clock abstraction for retry delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
