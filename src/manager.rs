//! Long-lived owner of the budget: store, table, clock and burst limiter behind one API.

use crate::allocator::{Allocator, BudgetCheck};
use crate::burst::BurstLimiter;
use crate::clock::{Clock, SystemClock};
use crate::config::BudgetTable;
use crate::error::BudgetError;
use crate::rate_info::RateLimitInfo;
use crate::recorder;
use crate::sleeper::Sleeper;
use crate::state::RateState;
use crate::status::format_status;
use crate::store::StateStore;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Runs every budget operation as one load → decide/mutate → save critical section.
///
/// Two locks apply: an in-process mutex serializes threads sharing this manager, and the
/// store's own lock (an advisory file lock for [`FileStateStore`](crate::FileStateStore))
/// serializes separate processes sharing the persisted state. Neither is held across an
/// `.await`.
#[derive(Debug)]
pub struct BudgetManager<S> {
    store: S,
    allocator: Allocator,
    clock: Arc<dyn Clock>,
    burst: BurstLimiter,
    gate: Mutex<()>,
}

impl<S: StateStore> BudgetManager<S> {
    /// Create a manager over `store` using the system clock and tokio sleeps.
    pub fn new(store: S, table: BudgetTable) -> Self {
        let burst = BurstLimiter::new(table.min_request_interval());
        Self {
            store,
            allocator: Allocator::new(Arc::new(table)),
            clock: Arc::new(SystemClock),
            burst,
            gate: Mutex::new(()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the sleeper used by [`BudgetManager::wait_for_burst`].
    pub fn with_sleeper<P: Sleeper + 'static>(mut self, sleeper: P) -> Self {
        self.burst = self.burst.with_sleeper(sleeper);
        self
    }

    pub fn table(&self) -> &BudgetTable {
        self.allocator.table()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn exclusive<R>(&self, op: impl FnOnce(u64) -> Result<R, BudgetError>) -> Result<R, BudgetError> {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        op(self.now())
    }

    /// Admission verdict for `consumer`. Reads state, never writes it.
    pub fn check(&self, consumer: &str) -> Result<BudgetCheck, BudgetError> {
        self.exclusive(|now| {
            self.store.read(now, |state| self.allocator.check_budget(state, consumer, now))
        })
    }

    /// Count a successful upstream request.
    pub fn record_request(
        &self,
        consumer: &str,
        endpoint: &str,
        rate_info: Option<RateLimitInfo>,
    ) -> Result<(), BudgetError> {
        self.exclusive(|now| {
            self.store.transaction(now, |state| {
                recorder::record_request(state, consumer, endpoint, rate_info, now)
            })
        })
    }

    /// Count a failed upstream request. Returns `true` if the breaker tripped.
    pub fn record_error(&self) -> Result<bool, BudgetError> {
        let config = self.table().circuit_breaker().clone();
        self.exclusive(|now| {
            self.store.transaction(now, |state| recorder::record_error(state, &config, now))
        })
    }

    /// Check and, if admitted for a live call, count the request in the same critical section.
    ///
    /// The admitted request is charged and stamped for burst spacing before the upstream call
    /// goes out, so concurrent callers cannot all pass the same check. Report the result
    /// afterwards with [`BudgetManager::record_outcome`] or [`BudgetManager::record_error`].
    pub fn check_and_record(&self, consumer: &str, endpoint: &str) -> Result<BudgetCheck, BudgetError> {
        self.exclusive(|now| {
            self.store.transaction(now, |state| {
                let check = self.allocator.check_budget(state, consumer, now);
                if check.is_live() {
                    recorder::count_request(state, consumer, endpoint, now);
                }
                check
            })
        })
    }

    /// Apply a successful response to a request already counted by
    /// [`BudgetManager::check_and_record`]: store its telemetry and clear the error streak.
    pub fn record_outcome(&self, rate_info: Option<RateLimitInfo>) -> Result<(), BudgetError> {
        self.exclusive(|now| {
            self.store.transaction(now, |state| recorder::record_outcome(state, rate_info))
        })
    }

    /// Current state after rollover.
    pub fn snapshot(&self) -> Result<RateState, BudgetError> {
        self.exclusive(|now| self.store.read(now, RateState::clone))
    }

    /// Operator status report.
    pub fn status(&self) -> Result<String, BudgetError> {
        self.exclusive(|now| {
            self.store.read(now, |state| format_status(state, self.allocator.table(), now))
        })
    }

    /// Time left before burst spacing admits another request, `None` if one may go now.
    pub fn burst_wait(&self) -> Result<Option<Duration>, BudgetError> {
        self.exclusive(|now| {
            self.store.read(now, |state| self.burst.required_wait(state.last_request_ts, now))
        })
    }

    /// Pause until burst spacing allows another request. Locks are released before sleeping.
    pub async fn wait_for_burst(&self) -> Result<(), BudgetError> {
        let wait = self.burst_wait()?;
        self.pause(wait).await;
        Ok(())
    }

    /// Sleep through a wait returned by [`BudgetManager::burst_wait`].
    pub async fn pause(&self, wait: Option<Duration>) {
        if let Some(wait) = wait {
            self.burst.pause(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::DenialKind;
    use crate::clock::ManualClock;
    use crate::sleeper::TrackingSleeper;
    use crate::store::InMemoryStateStore;

    const T0: u64 = 1_710_498_600_000;
    const MINUTE: u64 = 60_000;

    fn manager() -> (BudgetManager<InMemoryStateStore>, ManualClock, TrackingSleeper) {
        let clock = ManualClock::new(T0);
        let sleeper = TrackingSleeper::new();
        let manager = BudgetManager::new(InMemoryStateStore::new(), BudgetTable::default())
            .with_clock(clock.clone())
            .with_sleeper(sleeper.clone());
        (manager, clock, sleeper)
    }

    #[test]
    fn check_does_not_persist() {
        let (manager, _, _) = manager();
        assert!(manager.check("cyber-ops").expect("check").allowed);
        assert!(manager.store().snapshot().is_none());
    }

    #[test]
    fn second_request_inside_interval_is_burst_limited() {
        let (manager, clock, _) = manager();
        manager.record_request("cyber-ops", "/v3/entries", None).expect("record");
        clock.advance(500);
        let check = manager.check("cyber-ops").expect("check");
        assert_eq!(check.denial, Some(DenialKind::BurstLimited));
        assert_eq!(check.wait_ms, Some(1500));

        clock.advance(1500);
        assert!(manager.check("cyber-ops").expect("check").allowed);
    }

    #[test]
    fn tripped_breaker_blocks_then_recovers() {
        let (manager, clock, _) = manager();
        for _ in 0..4 {
            assert!(!manager.record_error().expect("record error"));
            clock.advance(MINUTE);
        }
        assert!(manager.record_error().expect("record error"));

        let check = manager.check("cyber-ops").expect("check");
        assert_eq!(check.denial, Some(DenialKind::CircuitOpen));
        assert_eq!(check.wait(), Some(Duration::from_secs(15 * 60)));

        clock.advance(15 * MINUTE);
        assert!(manager.check("cyber-ops").expect("check").allowed);
    }

    #[test]
    fn check_and_record_counts_only_live_admissions() {
        let (manager, clock, _) = manager();
        assert!(manager.check_and_record("landscape", "/v3/mixes").expect("first").allowed);
        let second = manager.check_and_record("landscape", "/v3/mixes").expect("second");
        assert!(!second.allowed);
        clock.advance(2000);
        assert!(manager.check_and_record("landscape", "/v3/mixes").expect("third").allowed);

        let state = manager.snapshot().expect("snapshot");
        assert_eq!(state.daily.used_by("landscape"), 2);
        assert_eq!(state.last_updated, T0 + 2000);
    }

    #[test]
    fn outcome_after_admission_does_not_count_twice() {
        let (manager, _, _) = manager();
        manager.record_error().expect("error");
        assert!(manager.check_and_record("cyber-ops", "/v3/entries").expect("admit").allowed);
        assert_eq!(manager.snapshot().expect("snapshot").circuit_breaker.consecutive_errors, 1);

        manager.record_outcome(Some(RateLimitInfo::from_counts(5, 100))).expect("outcome");
        let state = manager.snapshot().expect("snapshot");
        assert_eq!(state.daily.total, 1);
        assert_eq!(state.circuit_breaker.consecutive_errors, 0);
        assert_eq!(state.last_api_rate_info.map(|i| i.count), Some(5));
    }

    #[test]
    fn day_rollover_restores_budget() {
        let (manager, clock, _) = manager();
        let mut exhausted = RateState::fresh(T0);
        exhausted.daily.total = 1667;
        exhausted.daily.by_consumer.insert("cyber-ops".into(), 1667);
        exhausted.monthly.total = 1667;
        manager.store().save(&exhausted).expect("seed");

        assert!(!manager.check("cyber-ops").expect("check").allowed);
        clock.advance(24 * 60 * MINUTE);
        let check = manager.check("cyber-ops").expect("check");
        assert!(check.allowed);
        assert_eq!(check.remaining_daily, 1000);
        assert_eq!(manager.snapshot().expect("snapshot").monthly.total, 1667);
    }

    #[test]
    fn status_reflects_recorded_requests() {
        let (manager, _, _) = manager();
        manager.record_request("twitter-bot", "/v3/streams", None).expect("record");
        let status = manager.status().expect("status");
        assert!(status.contains("daily:   1/1667"));
        assert!(status.contains("/v3/streams"));
    }

    #[tokio::test]
    async fn wait_for_burst_sleeps_remaining_interval() {
        let (manager, clock, sleeper) = manager();
        manager.wait_for_burst().await.expect("idle wait");
        assert!(sleeper.calls().is_empty());

        manager.record_request("cyber-ops", "/v3/entries", None).expect("record");
        clock.advance(300);
        manager.wait_for_burst().await.expect("wait");
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(1700)]);
    }
}
