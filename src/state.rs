//! The persisted budget aggregate and its period rollover.

use crate::circuit_breaker::BreakerState;
use crate::clock::PeriodKeys;
use crate::rate_info::RateLimitInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version written by this crate.
///
/// * `0`: no `version` field and possibly no `circuitBreaker` record.
/// * `1`: current layout.
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    pub date: String,
    pub total: u32,
    pub by_endpoint: BTreeMap<String, u32>,
    pub by_consumer: BTreeMap<String, u32>,
}

impl DailyUsage {
    /// Requests `consumer` made today.
    pub fn used_by(&self, consumer: &str) -> u32 {
        self.by_consumer.get(consumer).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyUsage {
    pub hour: String,
    pub total: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyUsage {
    pub month: String,
    pub total: u32,
}

/// Everything the allocator knows: counters per period, upstream telemetry, burst and
/// breaker timestamps. Timestamps are unix millis, 0 meaning never.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateState {
    pub version: u32,
    pub daily: DailyUsage,
    pub hourly: HourlyUsage,
    pub monthly: MonthlyUsage,
    pub last_api_rate_info: Option<RateLimitInfo>,
    pub last_request_ts: u64,
    pub circuit_breaker: BreakerState,
    pub last_updated: u64,
}

/// Which buckets a rollover reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rollover {
    pub daily: bool,
    pub hourly: bool,
    pub monthly: bool,
}

impl Rollover {
    pub fn any(&self) -> bool {
        self.daily || self.hourly || self.monthly
    }
}

impl RateState {
    /// Zeroed state keyed to the periods containing `now`.
    pub fn fresh(now: u64) -> Self {
        let keys = PeriodKeys::at(now);
        Self {
            version: STATE_VERSION,
            daily: DailyUsage { date: keys.date, ..Default::default() },
            hourly: HourlyUsage { hour: keys.hour, total: 0 },
            monthly: MonthlyUsage { month: keys.month, total: 0 },
            last_api_rate_info: None,
            last_request_ts: 0,
            circuit_breaker: BreakerState::default(),
            last_updated: now,
        }
    }

    /// Reset every bucket whose period has ended by `now`; periods are independent.
    ///
    /// A stored key newer than the clock (the clock stepped back) is left alone, so period
    /// keys never move backwards.
    pub fn roll_over(&mut self, now: u64) -> Rollover {
        let keys = PeriodKeys::at(now);
        let mut rolled = Rollover::default();

        if advances(&self.daily.date, &keys.date, "daily") {
            tracing::info!(from = %self.daily.date, to = %keys.date, total = self.daily.total, "Daily budget rolled over");
            self.daily = DailyUsage { date: keys.date, ..Default::default() };
            rolled.daily = true;
        }
        if advances(&self.hourly.hour, &keys.hour, "hourly") {
            tracing::debug!(from = %self.hourly.hour, to = %keys.hour, total = self.hourly.total, "Hourly budget rolled over");
            self.hourly = HourlyUsage { hour: keys.hour, total: 0 };
            rolled.hourly = true;
        }
        if advances(&self.monthly.month, &keys.month, "monthly") {
            tracing::info!(from = %self.monthly.month, to = %keys.month, total = self.monthly.total, "Monthly budget rolled over");
            self.monthly = MonthlyUsage { month: keys.month, total: 0 };
            rolled.monthly = true;
        }
        rolled
    }
}

fn advances(stored: &str, current: &str, period: &'static str) -> bool {
    if stored == current {
        return false;
    }
    if stored > current {
        tracing::warn!(period, stored, current, "Clock is behind persisted budget period; keeping counters");
        return false;
    }
    true
}

/// On-disk shape accepted by [`RateState`]'s deserializer, covering older schema versions.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredState {
    #[serde(default)]
    version: u32,
    daily: DailyUsage,
    hourly: HourlyUsage,
    monthly: MonthlyUsage,
    #[serde(default)]
    last_api_rate_info: Option<RateLimitInfo>,
    #[serde(default)]
    last_request_ts: u64,
    circuit_breaker: Option<BreakerState>,
    #[serde(default)]
    last_updated: u64,
}

impl StoredState {
    fn upgrade(self) -> RateState {
        if self.version < STATE_VERSION {
            tracing::debug!(from = self.version, to = STATE_VERSION, "Upgrading persisted budget state");
        }
        let circuit_breaker = self.circuit_breaker.unwrap_or_else(|| {
            tracing::debug!("Persisted budget state has no circuit breaker record; starting closed");
            BreakerState::default()
        });
        RateState {
            version: STATE_VERSION,
            daily: self.daily,
            hourly: self.hourly,
            monthly: self.monthly,
            last_api_rate_info: self.last_api_rate_info,
            last_request_ts: self.last_request_ts,
            circuit_breaker,
            last_updated: self.last_updated,
        }
    }
}

impl<'de> Deserialize<'de> for RateState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        StoredState::deserialize(deserializer).map(StoredState::upgrade)
    }
}
