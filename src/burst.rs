//! Minimum spacing between admitted requests.

use crate::sleeper::{Sleeper, TokioSleeper};
use std::sync::Arc;
use std::time::Duration;

/// Spaces requests at least `interval` apart.
///
/// [`BurstLimiter::required_wait`] is the rule the allocator enforces (it rejects);
/// [`BurstLimiter::wait_for_burst`] lets well-behaved callers pause instead of being rejected.
#[derive(Debug, Clone)]
pub struct BurstLimiter {
    interval: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl BurstLimiter {
    /// Create a limiter that sleeps on the tokio timer.
    pub fn new(interval: Duration) -> Self {
        Self { interval, sleeper: Arc::new(TokioSleeper) }
    }

    /// Override the sleeper (useful for deterministic tests).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time left before another request may go out, or `None` if it may go now.
    ///
    /// `last_request_ts == 0` means no request was ever made.
    pub fn required_wait(&self, last_request_ts: u64, now: u64) -> Option<Duration> {
        required_wait(self.interval, last_request_ts, now)
    }

    /// Suspend until the interval since `last_request_ts` has passed; returns at once if it has.
    pub async fn wait_for_burst(&self, last_request_ts: u64, now: u64) {
        if let Some(wait) = self.required_wait(last_request_ts, now) {
            self.pause(wait).await;
        }
    }

    /// Sleep for a wait already computed by [`BurstLimiter::required_wait`].
    pub async fn pause(&self, wait: Duration) {
        tracing::debug!(wait_ms = wait.as_millis() as u64, "Burst spacing: delaying request");
        self.sleeper.sleep(wait).await;
    }
}

pub(crate) fn required_wait(interval: Duration, last_request_ts: u64, now: u64) -> Option<Duration> {
    if last_request_ts == 0 {
        return None;
    }
    let elapsed = Duration::from_millis(now.saturating_sub(last_request_ts));
    (elapsed < interval).then(|| interval - elapsed)
}
