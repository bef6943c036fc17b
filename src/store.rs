//! Persistence for [`RateState`].
//!
//! A store hands out a fresh copy of the state on every load, already rolled over to the
//! caller's clock, and persists whole records on save. Callers that mutate go through
//! [`StateStore::transaction`], which holds the store's exclusive lock across the full
//! load-mutate-save sequence so concurrent invocations cannot lose increments.

use crate::error::BudgetError;
use crate::state::RateState;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Storage backend for the budget state.
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Exclusive-access token; released on drop.
    type Guard<'a>
    where
        Self: 'a;

    /// Take the store's exclusive lock, blocking until it is free.
    fn lock(&self) -> Result<Self::Guard<'_>, BudgetError>;

    /// Load the state, creating a zeroed one if none exists, with rollover applied for `now`.
    fn load(&self, now: u64) -> Result<RateState, BudgetError>;

    /// Persist the full state. Single attempt; failures propagate.
    fn save(&self, state: &RateState) -> Result<(), BudgetError>;

    /// Load under the lock and hand the state to `f` without persisting anything.
    fn read<R, F>(&self, now: u64, f: F) -> Result<R, BudgetError>
    where
        Self: Sized,
        F: FnOnce(&RateState) -> R,
    {
        let _guard = self.lock()?;
        let state = self.load(now)?;
        Ok(f(&state))
    }

    /// Lock, load, mutate and save as one critical section.
    fn transaction<R, F>(&self, now: u64, f: F) -> Result<R, BudgetError>
    where
        Self: Sized,
        F: FnOnce(&mut RateState) -> R,
    {
        let _guard = self.lock()?;
        let mut state = self.load(now)?;
        let out = f(&mut state);
        state.last_updated = now;
        self.save(&state)?;
        Ok(out)
    }
}

/// JSON file store guarded by an advisory lock on a `<file>.lock` sibling.
///
/// The lock serializes independent processes sharing one state file. Writes go to a
/// temporary sibling first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Holds the advisory lock of a [`FileStateStore`] until dropped.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(error = %e, "Failed to release budget state lock");
        }
    }
}

impl FileStateStore {
    /// Store state at `path`; the lock and temp files sit next to it.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = sibling(&path, "lock");
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> BudgetError {
        BudgetError::Io { path: self.path.clone(), source }
    }

    fn ensure_parent(&self) -> Result<(), BudgetError> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                std::fs::create_dir_all(dir).map_err(|e| self.io_error(e))
            }
            _ => Ok(()),
        }
    }
}

impl StateStore for FileStateStore {
    type Guard<'a> = FileLockGuard;

    fn lock(&self) -> Result<FileLockGuard, BudgetError> {
        self.ensure_parent()?;
        let lock_err = |source| BudgetError::Lock { path: self.lock_path.clone(), source };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(lock_err)?;
        file.lock().map_err(lock_err)?;
        Ok(FileLockGuard { file })
    }

    fn load(&self, now: u64) -> Result<RateState, BudgetError> {
        let mut state = match std::fs::read_to_string(&self.path) {
            Ok(json) => serde_json::from_str::<RateState>(&json)
                .map_err(|source| BudgetError::Corrupt { path: self.path.clone(), source })?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No budget state yet; starting fresh");
                RateState::fresh(now)
            }
            Err(e) => return Err(self.io_error(e)),
        };
        state.roll_over(now);
        Ok(state)
    }

    fn save(&self, state: &RateState) -> Result<(), BudgetError> {
        self.ensure_parent()?;
        let json = serde_json::to_string_pretty(state).map_err(BudgetError::Serialize)?;
        let tmp = sibling(&self.path, "tmp");
        std::fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        tracing::trace!(path = %self.path.display(), daily_total = state.daily.total, "Saved budget state");
        Ok(())
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Process-local store, mainly for tests and embedders that persist elsewhere.
///
/// Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    state: Arc<Mutex<Option<RateState>>>,
    txn: Arc<Mutex<()>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a given record instead of an empty store.
    pub fn with_state(state: RateState) -> Self {
        Self { state: Arc::new(Mutex::new(Some(state))), txn: Arc::default() }
    }

    /// The stored record as last saved, without rollover.
    pub fn snapshot(&self) -> Option<RateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl StateStore for InMemoryStateStore {
    type Guard<'a> = MutexGuard<'a, ()>;

    fn lock(&self) -> Result<MutexGuard<'_, ()>, BudgetError> {
        Ok(self.txn.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn load(&self, now: u64) -> Result<RateState, BudgetError> {
        let mut state = self.snapshot().unwrap_or_else(|| RateState::fresh(now));
        state.roll_over(now);
        Ok(state)
    }

    fn save(&self, state: &RateState) -> Result<(), BudgetError> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        Ok(())
    }
}
