//! Async admission interface and tower middleware.
//!
//! - [`RateLimiter`]: the core trait the middleware talks to: acquire, then report the outcome.
//! - [`ConsumerBudget`]: a [`BudgetManager`] bound to one consumer, implementing the trait.
//! - [`BudgetLayer`]: tower middleware gating an upstream client service.
//! - [`Decision`]: a typed view of a [`BudgetCheck`].
//!
//! # Architecture
//!
//! The middleware does not know how budgets work, only that it should ask a `RateLimiter`
//! before the call and tell it how the call went afterwards. Requests name their endpoint
//! through [`UpstreamRequest`]; responses surface upstream telemetry through
//! [`UpstreamResponse`].

use crate::allocator::{BudgetCheck, DenialKind};
use crate::error::BudgetError;
use crate::manager::BudgetManager;
use crate::rate_info::RateLimitInfo;
use crate::store::StateStore;
use std::sync::Arc;
use std::time::Duration;

pub mod middleware;
pub use middleware::{BudgetLayer, BudgetService};

/// The decision carried by a [`BudgetCheck`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Go ahead with a live upstream call.
    Allowed {
        /// Daily requests left for this consumer, borrowing included.
        remaining_daily: u32,
        /// Hourly requests left for this consumer's tier.
        remaining_hourly: u32,
    },
    /// Admitted, but serve from cache instead of calling upstream.
    CacheOnly {
        /// Global daily requests left before the hard cap.
        remaining_daily: u32,
    },
    /// Refused.
    Denied {
        kind: DenialKind,
        /// How long the caller should wait before retrying, when known.
        wait: Option<Duration>,
        reason: String,
    },
}

impl Decision {
    /// Helper to check if a live call may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

impl From<&BudgetCheck> for Decision {
    fn from(check: &BudgetCheck) -> Self {
        match (check.allowed, check.cache_only, check.denial) {
            (true, false, _) => Decision::Allowed {
                remaining_daily: check.remaining_daily,
                remaining_hourly: check.remaining_hourly,
            },
            (true, true, _) => Decision::CacheOnly { remaining_daily: check.remaining_daily },
            (false, _, kind) => Decision::Denied {
                kind: kind.unwrap_or(DenialKind::ConsumerDailyExhausted),
                wait: check.wait(),
                reason: check.reason.clone().unwrap_or_default(),
            },
        }
    }
}

/// Admission control for one caller class.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Ask whether a request to `endpoint` may go out now.
    ///
    /// A live admission is charged immediately, so a concurrent caller sees it before this
    /// request completes.
    async fn acquire(&self, endpoint: &str) -> Result<BudgetCheck, BudgetError>;

    /// Report a successful upstream call admitted by [`RateLimiter::acquire`].
    async fn record_success(&self, rate_info: Option<RateLimitInfo>) -> Result<(), BudgetError>;

    /// Report a failed upstream call.
    async fn record_failure(&self) -> Result<(), BudgetError>;

    /// Pause until burst spacing allows another request. Defaults to no pause.
    async fn pace(&self) -> Result<(), BudgetError> {
        Ok(())
    }
}

/// A [`BudgetManager`] bound to one consumer.
///
/// Store access blocks (the file store waits on an advisory lock held by other processes),
/// so every operation runs on tokio's blocking pool.
#[derive(Debug)]
pub struct ConsumerBudget<S> {
    manager: Arc<BudgetManager<S>>,
    consumer: Arc<str>,
}

impl<S> Clone for ConsumerBudget<S> {
    fn clone(&self) -> Self {
        Self { manager: self.manager.clone(), consumer: self.consumer.clone() }
    }
}

impl<S: StateStore> ConsumerBudget<S> {
    /// Bind `manager` to `consumer`.
    pub fn new(manager: Arc<BudgetManager<S>>, consumer: impl Into<String>) -> Self {
        Self { manager, consumer: Arc::from(consumer.into()) }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}

impl<S: StateStore + 'static> ConsumerBudget<S> {
    async fn blocking<R, F>(&self, op: F) -> Result<R, BudgetError>
    where
        F: FnOnce(&BudgetManager<S>, &str) -> Result<R, BudgetError> + Send + 'static,
        R: Send + 'static,
    {
        let manager = self.manager.clone();
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || op(&manager, &consumer))
            .await
            .map_err(BudgetError::Task)?
    }
}

#[async_trait::async_trait]
impl<S: StateStore + 'static> RateLimiter for ConsumerBudget<S> {
    async fn acquire(&self, endpoint: &str) -> Result<BudgetCheck, BudgetError> {
        let endpoint = endpoint.to_string();
        self.blocking(move |manager, consumer| manager.check_and_record(consumer, &endpoint))
            .await
    }

    async fn record_success(&self, rate_info: Option<RateLimitInfo>) -> Result<(), BudgetError> {
        self.blocking(move |manager, _| manager.record_outcome(rate_info)).await
    }

    async fn record_failure(&self) -> Result<(), BudgetError> {
        self.blocking(|manager, _| manager.record_error().map(|_tripped| ())).await
    }

    async fn pace(&self) -> Result<(), BudgetError> {
        let wait = self.blocking(|manager, _| manager.burst_wait()).await?;
        self.manager.pause(wait).await;
        Ok(())
    }
}

/// A request that knows which upstream endpoint it targets.
pub trait UpstreamRequest {
    /// Endpoint key the request is counted under, e.g. `/v3/search/contents`.
    fn endpoint(&self) -> String;
}

/// A response that may carry the upstream's own rate-limit figures.
pub trait UpstreamResponse {
    /// Upstream telemetry, usually parsed with [`RateLimitInfo::from_headers`].
    fn rate_limit_info(&self) -> Option<RateLimitInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Denial;

    #[test]
    fn decision_views_of_checks() {
        assert_eq!(
            Decision::from(&BudgetCheck::allowed(10, 2)),
            Decision::Allowed { remaining_daily: 10, remaining_hourly: 2 }
        );
        assert!(Decision::from(&BudgetCheck::allowed(10, 2)).is_allowed());

        let cached = BudgetCheck::allowed(250, 0).cache_only("soft cap");
        assert_eq!(Decision::from(&cached), Decision::CacheOnly { remaining_daily: 250 });
        assert!(!Decision::from(&cached).is_allowed());

        let denied = BudgetCheck::denied(Denial::new(
            DenialKind::CircuitOpen,
            Some(Duration::from_secs(3)),
        ));
        match Decision::from(&denied) {
            Decision::Denied { kind, wait, reason } => {
                assert_eq!(kind, DenialKind::CircuitOpen);
                assert_eq!(wait, Some(Duration::from_secs(3)));
                assert!(reason.contains("circuit"));
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }
}
