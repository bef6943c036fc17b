//! Error types for budget infrastructure and gated services.
//!
//! Admission denials are not errors; they travel as [`BudgetCheck`] values. The types here
//! cover what the allocator cannot reason about: unreadable or unwritable state, and the
//! inner failures of a service wrapped by [`BudgetLayer`](crate::rate_limit::BudgetLayer).
//! Configuration problems are reported separately as [`ConfigError`](crate::config::ConfigError).

use crate::allocator::BudgetCheck;
use std::fmt;
use std::path::PathBuf;

/// Infrastructure failure while loading, locking or persisting budget state.
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    /// Reading or writing the state file failed.
    #[error("state file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The state file exists but does not parse.
    #[error("state file {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// Encoding the state for persistence failed.
    #[error("failed to encode budget state: {0}")]
    Serialize(#[source] serde_json::Error),
    /// The exclusive lock guarding the state could not be taken.
    #[error("failed to lock {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A blocking budget operation offloaded from the async runtime did not complete.
    #[error("budget task failed: {0}")]
    Task(#[source] tokio::task::JoinError),
}

/// Error returned by a service gated through [`BudgetLayer`](crate::rate_limit::BudgetLayer).
#[derive(Debug)]
pub enum AdmissionError<E> {
    /// The budget denied the request; the check says why and how long to wait.
    Denied(BudgetCheck),
    /// Budget state could not be read or written.
    Budget(BudgetError),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied(check) => match check.reason.as_deref() {
                Some(reason) => write!(f, "request denied by budget: {}", reason),
                None => write!(f, "request denied by budget"),
            },
            Self::Budget(e) => write!(f, "budget unavailable: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Denied(_) => None,
            Self::Budget(e) => Some(e),
            Self::Inner(e) => Some(e),
        }
    }
}

impl<E> AdmissionError<E> {
    /// Check if the budget denied the request.
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }

    /// Borrow the denying check, if any.
    pub fn check(&self) -> Option<&BudgetCheck> {
        match self {
            Self::Denied(check) => Some(check),
            _ => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<BudgetError> for AdmissionError<E> {
    fn from(e: BudgetError) -> Self {
        Self::Budget(e)
    }
}
