//! Wall-clock abstractions used by rollover, burst spacing and breaker cooldowns.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
///
/// Values are unix epoch milliseconds. Budget periods are calendar periods, so unlike a
/// monotonic timer this has to survive process restarts.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Production clock backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Hand-driven clock for deterministic tests. Clones share the same instant.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(start_millis)) }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Calendar keys (UTC) of the day, hour and month containing an instant.
///
/// Keys are zero-padded ISO-8601 prefixes, so lexical order matches time order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodKeys {
    /// `YYYY-MM-DD`
    pub date: String,
    /// `YYYY-MM-DDTHH`
    pub hour: String,
    /// `YYYY-MM`
    pub month: String,
}

impl PeriodKeys {
    pub fn at(millis: u64) -> Self {
        let millis = i64::try_from(millis).unwrap_or(i64::MAX);
        let ts: DateTime<Utc> = DateTime::from_timestamp_millis(millis).unwrap_or_default();
        Self {
            date: ts.format("%Y-%m-%d").to_string(),
            hour: ts.format("%Y-%m-%dT%H").to_string(),
            month: ts.format("%Y-%m").to_string(),
        }
    }
}
