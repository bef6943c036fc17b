//! Static budget table: per-consumer allocations plus global caps.
//!
//! Loaded once at startup (built-in defaults or a JSON file) and immutable afterwards.

use crate::circuit_breaker::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pseudo-consumer whose allocation is the shared borrowing pool and the fallback tier.
pub const RESERVE: &str = "reserve";
/// Priority-2 consumer whose unused quota priority-1 consumers may borrow.
pub const PRIORITY_DONOR: &str = "twitter-bot";

/// Errors produced when building or loading a [`BudgetTable`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("budget table must define a `reserve` allocation")]
    MissingReserve,
    #[error("global daily limit must be > 0")]
    InvalidGlobalLimit,
    #[error("soft cap ratio must be in (0, 1] (got {0})")]
    InvalidSoftCap(f64),
    #[error("hard stop percentage must be in (0, 100] (got {0})")]
    InvalidHardStop(f64),
    #[error("minimum request interval must be > 0")]
    InvalidBurstInterval,
    #[error("priority must be 1, 2 or 3 (got {0})")]
    InvalidPriority(u8),
    #[error(transparent)]
    CircuitBreaker(#[from] crate::circuit_breaker::CircuitBreakerError),
    #[error("failed to read budget table {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse budget table: {0}")]
    Parse(#[source] serde_json::Error),
}

/// Consumer class. Lower number wins; only [`Priority::High`] borrows from the donor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    High = 1,
    Normal = 2,
    Low = 3,
}

impl TryFrom<u8> for Priority {
    type Error = ConfigError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Priority::High),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::Low),
            other => Err(ConfigError::InvalidPriority(other)),
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p as u8
    }
}

/// One consumer's slice of the global budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetAllocation {
    pub daily_limit: u32,
    /// Reported as `remaining_hourly`; never a denial rule.
    pub hourly_limit: u32,
    pub priority: Priority,
    /// May draw on the reserve (and, at [`Priority::High`], the donor) once its own limit is spent.
    pub can_borrow: bool,
}

impl BudgetAllocation {
    pub const fn new(daily_limit: u32, hourly_limit: u32, priority: Priority, can_borrow: bool) -> Self {
        Self { daily_limit, hourly_limit, priority, can_borrow }
    }
}

/// Validated budget configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBudgetTable", into = "RawBudgetTable")]
pub struct BudgetTable {
    allocations: BTreeMap<String, BudgetAllocation>,
    global_daily_limit: u32,
    global_monthly_limit: u32,
    soft_cap_ratio: f64,
    hard_stop_percent: f64,
    min_request_interval: Duration,
    circuit_breaker: CircuitBreakerConfig,
}

impl Default for BudgetTable {
    /// The production split of a 50k/month upstream plan: 1667 requests a day.
    fn default() -> Self {
        let allocations = [
            ("cyber-ops", BudgetAllocation::new(1000, 100, Priority::High, true)),
            (PRIORITY_DONOR, BudgetAllocation::new(500, 50, Priority::Normal, false)),
            ("landscape", BudgetAllocation::new(300, 30, Priority::Low, true)),
            (RESERVE, BudgetAllocation::new(167, 20, Priority::Low, false)),
        ]
        .into_iter()
        .map(|(name, alloc)| (name.to_string(), alloc))
        .collect();

        Self {
            allocations,
            global_daily_limit: 1667,
            global_monthly_limit: 50_000,
            soft_cap_ratio: 0.85,
            hard_stop_percent: 90.0,
            min_request_interval: Duration::from_millis(2000),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl BudgetTable {
    /// Build a table from explicit allocations, keeping the default caps and tuning.
    pub fn new(
        allocations: BTreeMap<String, BudgetAllocation>,
        global_daily_limit: u32,
    ) -> Result<Self, ConfigError> {
        let table = Self { allocations, global_daily_limit, ..Self::default() };
        table.validate()?;
        Ok(table)
    }

    /// Parse and validate a JSON budget table. Omitted globals take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(ConfigError::Parse)
    }

    /// Read a JSON budget table from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let table = Self::from_json_str(&json)?;
        tracing::info!(path = %path.display(), consumers = table.allocations.len(), "Loaded budget table");
        Ok(table)
    }

    /// Override the soft cap ratio; must be in (0, 1].
    pub fn with_soft_cap_ratio(mut self, ratio: f64) -> Result<Self, ConfigError> {
        self.soft_cap_ratio = ratio;
        self.validate()?;
        Ok(self)
    }

    /// Override the minimum spacing between admitted requests; must be > 0.
    pub fn with_min_request_interval(mut self, interval: Duration) -> Result<Self, ConfigError> {
        self.min_request_interval = interval;
        self.validate()?;
        Ok(self)
    }

    /// Override the breaker tuning.
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.allocations.contains_key(RESERVE) {
            return Err(ConfigError::MissingReserve);
        }
        if self.global_daily_limit == 0 {
            return Err(ConfigError::InvalidGlobalLimit);
        }
        if !(self.soft_cap_ratio > 0.0 && self.soft_cap_ratio <= 1.0) {
            return Err(ConfigError::InvalidSoftCap(self.soft_cap_ratio));
        }
        if !(self.hard_stop_percent > 0.0 && self.hard_stop_percent <= 100.0) {
            return Err(ConfigError::InvalidHardStop(self.hard_stop_percent));
        }
        if self.min_request_interval.is_zero() {
            return Err(ConfigError::InvalidBurstInterval);
        }
        Ok(())
    }

    /// Allocation for `consumer`, falling back to the reserve tier for unknown names.
    pub fn allocation(&self, consumer: &str) -> &BudgetAllocation {
        self.allocations.get(consumer).unwrap_or_else(|| self.reserve())
    }

    /// Allocation configured for exactly `consumer`, without fallback.
    pub fn get(&self, consumer: &str) -> Option<&BudgetAllocation> {
        self.allocations.get(consumer)
    }

    pub fn reserve(&self) -> &BudgetAllocation {
        // Present on every constructed table, see validate().
        &self.allocations[RESERVE]
    }

    /// Configured consumers ordered by priority, then name.
    pub fn consumers(&self) -> Vec<(&str, &BudgetAllocation)> {
        let mut list: Vec<_> =
            self.allocations.iter().map(|(name, alloc)| (name.as_str(), alloc)).collect();
        list.sort_by_key(|(name, alloc)| (alloc.priority, *name));
        list
    }

    pub fn global_daily_limit(&self) -> u32 {
        self.global_daily_limit
    }

    pub fn global_monthly_limit(&self) -> u32 {
        self.global_monthly_limit
    }

    pub fn soft_cap_ratio(&self) -> f64 {
        self.soft_cap_ratio
    }

    /// Daily total at which live requests switch to cache-only.
    pub fn soft_cap_reached(&self, daily_total: u32) -> bool {
        f64::from(daily_total) >= f64::from(self.global_daily_limit) * self.soft_cap_ratio
    }

    /// Upstream-reported usage percentage at which every request is refused.
    pub fn hard_stop_percent(&self) -> f64 {
        self.hard_stop_percent
    }

    pub fn min_request_interval(&self) -> Duration {
        self.min_request_interval
    }

    pub fn circuit_breaker(&self) -> &CircuitBreakerConfig {
        &self.circuit_breaker
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBudgetTable {
    allocations: BTreeMap<String, BudgetAllocation>,
    #[serde(default = "defaults::global_daily_limit")]
    global_daily_limit: u32,
    #[serde(default = "defaults::global_monthly_limit")]
    global_monthly_limit: u32,
    #[serde(default = "defaults::soft_cap_ratio")]
    soft_cap_ratio: f64,
    #[serde(default = "defaults::hard_stop_percent")]
    hard_stop_percent: f64,
    #[serde(default = "defaults::min_request_interval_ms")]
    min_request_interval_ms: u64,
    #[serde(default)]
    circuit_breaker: CircuitBreakerConfig,
}

mod defaults {
    pub fn global_daily_limit() -> u32 {
        1667
    }
    pub fn global_monthly_limit() -> u32 {
        50_000
    }
    pub fn soft_cap_ratio() -> f64 {
        0.85
    }
    pub fn hard_stop_percent() -> f64 {
        90.0
    }
    pub fn min_request_interval_ms() -> u64 {
        2000
    }
}

impl TryFrom<RawBudgetTable> for BudgetTable {
    type Error = ConfigError;

    fn try_from(raw: RawBudgetTable) -> Result<Self, Self::Error> {
        let table = Self {
            allocations: raw.allocations,
            global_daily_limit: raw.global_daily_limit,
            global_monthly_limit: raw.global_monthly_limit,
            soft_cap_ratio: raw.soft_cap_ratio,
            hard_stop_percent: raw.hard_stop_percent,
            min_request_interval: Duration::from_millis(raw.min_request_interval_ms),
            circuit_breaker: raw.circuit_breaker,
        };
        table.validate()?;
        Ok(table)
    }
}

impl From<BudgetTable> for RawBudgetTable {
    fn from(table: BudgetTable) -> Self {
        Self {
            allocations: table.allocations,
            global_daily_limit: table.global_daily_limit,
            global_monthly_limit: table.global_monthly_limit,
            soft_cap_ratio: table.soft_cap_ratio,
            hard_stop_percent: table.hard_stop_percent,
            min_request_interval_ms: u64::try_from(table.min_request_interval.as_millis())
                .unwrap_or(u64::MAX),
            circuit_breaker: table.circuit_breaker,
        }
    }
}
