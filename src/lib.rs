#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ratebudget
//!
//! Admission control for a shared, quota-limited upstream API: per-consumer daily budgets with
//! priority borrowing, global soft/hard caps, burst spacing, upstream rate-limit telemetry and
//! a circuit breaker, all backed by state that survives restarts and period rollovers.
//!
//! ## Features
//!
//! - **Priority budgets** with one-way borrowing from a shared reserve and a donor tier
//! - **Global caps**: cache-only past the soft cap, hard stop at the daily limit
//! - **Upstream telemetry** as ground truth for a hard stop
//! - **Circuit breaker** with alternating 15/30 minute cooldowns
//! - **Burst spacing** enforced on checks and available as an async pause
//! - **File-backed state** with daily/hourly/monthly rollover and cross-process locking
//! - **Tower middleware** gating an upstream client service
//!
//! ## Quick Start
//!
//! ```rust
//! use ratebudget::{BudgetManager, BudgetTable, InMemoryStateStore};
//!
//! let manager = BudgetManager::new(InMemoryStateStore::new(), BudgetTable::default());
//!
//! let check = manager.check("cyber-ops").unwrap();
//! if check.is_live() {
//!     // ...call the upstream API, then:
//!     manager.record_request("cyber-ops", "/v3/search/contents", None).unwrap();
//! }
//! ```

pub mod allocator;
pub mod burst;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod prelude;
pub mod rate_info;
pub mod rate_limit;
pub mod recorder;
pub mod sleeper;
pub mod state;
pub mod status;
pub mod store;

// Re-exports
pub use allocator::{Allocator, BudgetCheck, Denial, DenialKind};
pub use burst::BurstLimiter;
pub use circuit_breaker::{BreakerState, CircuitBreakerConfig, CircuitState, CooldownLevel};
pub use clock::{Clock, ManualClock, PeriodKeys, SystemClock};
pub use config::{BudgetAllocation, BudgetTable, ConfigError, Priority};
pub use error::{AdmissionError, BudgetError};
pub use manager::BudgetManager;
pub use rate_info::RateLimitInfo;
pub use rate_limit::{BudgetLayer, ConsumerBudget, Decision, RateLimiter};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use state::RateState;
pub use status::{format_status, StatusReport};
pub use store::{FileStateStore, InMemoryStateStore, StateStore};
