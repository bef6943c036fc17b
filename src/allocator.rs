//! Admission decisions.
//!
//! [`Allocator::check_budget`] is a pure function of the loaded state, the budget table, the
//! consumer and the current time. It never mutates state; denials are values, not errors.

use crate::config::{BudgetTable, Priority, PRIORITY_DONOR, RESERVE};
use crate::state::RateState;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    /// The breaker is open; retry after the returned wait.
    CircuitOpen,
    /// Too soon after the previous request; retry after the returned wait.
    BurstLimited,
    /// The upstream reports its own window nearly used up. Not locally computable when
    /// that window resets, so back off conservatively.
    UpstreamHardStop,
    /// The global daily budget is spent until the next day.
    GlobalDailyExhausted,
    /// This consumer and everything it may borrow is spent until the next day.
    ConsumerDailyExhausted,
}

impl DenialKind {
    fn summary(self) -> &'static str {
        match self {
            DenialKind::CircuitOpen => "circuit breaker open",
            DenialKind::BurstLimited => "burst limit",
            DenialKind::UpstreamHardStop => "upstream rate limit nearly exhausted",
            DenialKind::GlobalDailyExhausted => "global daily limit reached",
            DenialKind::ConsumerDailyExhausted => "consumer daily budget exhausted",
        }
    }
}

/// A refusal with its classification, human-readable reason and advisory wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    /// Which rule refused the request.
    pub kind: DenialKind,
    /// Advisory wait before retrying; `None` when the denial lasts until a period rolls over.
    pub wait: Option<Duration>,
    /// Human-readable explanation, including the figures that triggered the rule.
    pub reason: String,
}

impl Denial {
    /// Create a denial with the default reason for `kind`.
    pub fn new(kind: DenialKind, wait: Option<Duration>) -> Self {
        let reason = match wait {
            Some(wait) => format!("{}: retry in {}ms", kind.summary(), wait.as_millis()),
            None => kind.summary().to_string(),
        };
        Self { kind, wait, reason }
    }

    /// Replace the default reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

/// Verdict returned to the HTTP-client collaborator.
///
/// `cache_only` means the request is admitted but should be served from cache rather than
/// go upstream. Denials report zero remaining budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCheck {
    /// Whether the request is admitted (live or cache-only).
    pub allowed: bool,
    /// Why the request was denied or diverted to cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The rule that denied the request, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial: Option<DenialKind>,
    /// Admitted, but serve from cache instead of calling upstream.
    pub cache_only: bool,
    /// Requests left today: the consumer's effective limit for live admissions, the global
    /// headroom for cache-only ones.
    pub remaining_daily: u32,
    /// Requests left this hour for the consumer's tier. Informational.
    pub remaining_hourly: u32,
    /// Advisory wait in milliseconds before retrying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
}

impl BudgetCheck {
    /// A live admission.
    pub fn allowed(remaining_daily: u32, remaining_hourly: u32) -> Self {
        Self {
            allowed: true,
            reason: None,
            denial: None,
            cache_only: false,
            remaining_daily,
            remaining_hourly,
            wait_ms: None,
        }
    }

    /// Divert an admission to cache.
    pub fn cache_only(mut self, reason: impl Into<String>) -> Self {
        self.cache_only = true;
        self.reason = Some(reason.into());
        self
    }

    /// A refusal. Remaining counts are reported as zero.
    pub fn denied(denial: Denial) -> Self {
        Self {
            allowed: false,
            wait_ms: denial.wait.map(|w| u64::try_from(w.as_millis()).unwrap_or(u64::MAX)),
            reason: Some(denial.reason),
            denial: Some(denial.kind),
            cache_only: false,
            remaining_daily: 0,
            remaining_hourly: 0,
        }
    }

    /// Advisory wait before retrying, if the denial has one.
    pub fn wait(&self) -> Option<Duration> {
        self.wait_ms.map(Duration::from_millis)
    }

    /// Admitted for a live upstream call (not denied, not cache-only).
    pub fn is_live(&self) -> bool {
        self.allowed && !self.cache_only
    }
}

/// Combines breaker, burst spacing, upstream telemetry, global caps and per-consumer
/// borrowing into one verdict.
#[derive(Debug, Clone)]
pub struct Allocator {
    table: Arc<BudgetTable>,
}

impl Allocator {
    /// Create an allocator over a shared budget table.
    pub fn new(table: Arc<BudgetTable>) -> Self {
        Self { table }
    }

    /// The table decisions are made against.
    pub fn table(&self) -> &BudgetTable {
        &self.table
    }

    /// Decide whether `consumer` may issue a request at `now`.
    ///
    /// Rules are evaluated in order and the first match wins:
    /// 1. open circuit breaker,
    /// 2. burst spacing,
    /// 3. upstream-reported usage at or above the hard stop,
    /// 4. global daily hard cap,
    /// 5. global soft cap (admitted, cache only),
    /// 6. the consumer's own daily limit plus whatever it may borrow.
    pub fn check_budget(&self, state: &RateState, consumer: &str, now: u64) -> BudgetCheck {
        let check = self.decide(state, consumer, now);
        if !check.allowed {
            tracing::debug!(
                consumer,
                denial = ?check.denial,
                wait_ms = ?check.wait_ms,
                daily_total = state.daily.total,
                "Budget denied"
            );
        }
        check
    }

    fn decide(&self, state: &RateState, consumer: &str, now: u64) -> BudgetCheck {
        let table = &*self.table;

        if let Some(wait) = state.circuit_breaker.remaining_cooldown(now) {
            let denial = Denial::new(DenialKind::CircuitOpen, Some(wait)).with_reason(format!(
                "circuit breaker open, retry in {}s",
                wait.as_millis().div_ceil(1000)
            ));
            return BudgetCheck::denied(denial);
        }

        if let Some(wait) =
            crate::burst::required_wait(table.min_request_interval(), state.last_request_ts, now)
        {
            return BudgetCheck::denied(Denial::new(DenialKind::BurstLimited, Some(wait)));
        }

        if let Some(info) = &state.last_api_rate_info {
            if info.percent_used >= table.hard_stop_percent() {
                let denial = Denial::new(DenialKind::UpstreamHardStop, None).with_reason(format!(
                    "upstream reports {:.1}% of its rate limit used ({}/{})",
                    info.percent_used, info.count, info.limit
                ));
                return BudgetCheck::denied(denial);
            }
        }

        let global = table.global_daily_limit();
        let total = state.daily.total;
        if total >= global {
            let denial = Denial::new(DenialKind::GlobalDailyExhausted, None)
                .with_reason(format!("global daily limit reached ({}/{})", total, global));
            return BudgetCheck::denied(denial);
        }

        let allocation = table.allocation(consumer);
        let remaining_hourly = allocation.hourly_limit.saturating_sub(state.hourly.total);

        if table.soft_cap_reached(total) {
            return BudgetCheck::allowed(global - total, remaining_hourly).cache_only(format!(
                "global soft cap reached ({}/{}), serve from cache",
                total, global
            ));
        }

        let used = state.daily.used_by(consumer);
        let effective = self.effective_limit(state, consumer);
        if used >= effective {
            let denial = Denial::new(DenialKind::ConsumerDailyExhausted, None).with_reason(format!(
                "{} daily budget exhausted ({}/{})",
                consumer, used, effective
            ));
            return BudgetCheck::denied(denial);
        }

        BudgetCheck::allowed(effective - used, remaining_hourly)
    }

    /// The consumer's daily limit plus borrowed capacity.
    ///
    /// Borrowing starts only once the consumer's own limit is spent. A borrower takes the
    /// reserve's unused quota; a priority-1 borrower also takes the donor's unused quota.
    /// Nothing flows the other way.
    pub fn effective_limit(&self, state: &RateState, consumer: &str) -> u32 {
        let table = &*self.table;
        let allocation = table.allocation(consumer);
        let used = state.daily.used_by(consumer);
        let mut effective = allocation.daily_limit;

        if used >= allocation.daily_limit && allocation.can_borrow {
            let reserve_unused =
                table.reserve().daily_limit.saturating_sub(state.daily.used_by(RESERVE));
            effective = effective.saturating_add(reserve_unused);

            if allocation.priority == Priority::High {
                let donor_unused = table
                    .get(PRIORITY_DONOR)
                    .map(|donor| donor.daily_limit.saturating_sub(state.daily.used_by(PRIORITY_DONOR)))
                    .unwrap_or(0);
                effective = effective.saturating_add(donor_unused);
            }

            tracing::trace!(consumer, used, effective, "Consumer borrowing beyond its own limit");
        }
        effective
    }
}
