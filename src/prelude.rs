//! Convenient re-exports for common ratebudget types.
pub use crate::{
    allocator::{BudgetCheck, DenialKind},
    config::{BudgetTable, Priority},
    error::{AdmissionError, BudgetError},
    manager::BudgetManager,
    rate_info::RateLimitInfo,
    rate_limit::{
        BudgetLayer, ConsumerBudget, Decision, RateLimiter, UpstreamRequest, UpstreamResponse,
    },
    store::{FileStateStore, InMemoryStateStore, StateStore},
};
