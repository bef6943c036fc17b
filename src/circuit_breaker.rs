//! Circuit breaker over persisted failure counters.
//!
//! The breaker has no handle of its own: its whole state lives in [`BreakerState`] inside the
//! persisted [`RateState`](crate::state::RateState), so a trip survives a process restart and
//! is visible to every caller that loads the same state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Rejects every admission until the cooldown ends.
    Open,
}

/// Which cooldown the next trip uses. Flips on every trip: 15, 30, 15, 30 minutes...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CooldownLevel {
    #[default]
    Standard,
    Extended,
}

impl CooldownLevel {
    fn flipped(self) -> Self {
        match self {
            CooldownLevel::Standard => CooldownLevel::Extended,
            CooldownLevel::Extended => CooldownLevel::Standard,
        }
    }
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBreakerConfig", into = "RawBreakerConfig")]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    error_window: Duration,
    standard_cooldown: Duration,
    extended_cooldown: Duration,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Failure threshold must be > 0.
    InvalidFailureThreshold {
        /// Value provided by caller.
        provided: u32,
    },
    /// The error window must be > 0.
    InvalidErrorWindow(Duration),
    /// Cooldowns must be > 0 and the extended one at least as long as the standard one.
    InvalidCooldown {
        /// Standard cooldown provided.
        standard: Duration,
        /// Extended cooldown provided.
        extended: Duration,
    },
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::InvalidFailureThreshold { provided } => {
                write!(f, "failure_threshold must be > 0 (got {})", provided)
            }
            CircuitBreakerError::InvalidErrorWindow(window) => {
                write!(f, "error_window must be > 0 (got {:?})", window)
            }
            CircuitBreakerError::InvalidCooldown { standard, extended } => write!(
                f,
                "cooldowns must be > 0 with extended >= standard (got {:?} / {:?})",
                standard, extended
            ),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

impl Default for CircuitBreakerConfig {
    /// Five errors inside ten minutes trip the breaker for 15 minutes, then 30 on the next trip.
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            error_window: Duration::from_secs(10 * 60),
            standard_cooldown: Duration::from_secs(15 * 60),
            extended_cooldown: Duration::from_secs(30 * 60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(
        failure_threshold: u32,
        error_window: Duration,
        standard_cooldown: Duration,
        extended_cooldown: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if error_window.is_zero() {
            return Err(CircuitBreakerError::InvalidErrorWindow(error_window));
        }
        if standard_cooldown.is_zero() || extended_cooldown < standard_cooldown {
            return Err(CircuitBreakerError::InvalidCooldown {
                standard: standard_cooldown,
                extended: extended_cooldown,
            });
        }
        Ok(Self { failure_threshold, error_window, standard_cooldown, extended_cooldown })
    }

    /// Consecutive errors that trip the breaker.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// How long an error streak stays alive, measured from its first error.
    pub fn error_window(&self) -> Duration {
        self.error_window
    }

    /// Cooldown applied by a trip at the given level.
    pub fn cooldown(&self, level: CooldownLevel) -> Duration {
        match level {
            CooldownLevel::Standard => self.standard_cooldown,
            CooldownLevel::Extended => self.extended_cooldown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBreakerConfig {
    failure_threshold: u32,
    error_window_ms: u64,
    standard_cooldown_ms: u64,
    extended_cooldown_ms: u64,
}

impl TryFrom<RawBreakerConfig> for CircuitBreakerConfig {
    type Error = CircuitBreakerError;

    fn try_from(raw: RawBreakerConfig) -> Result<Self, Self::Error> {
        Self::new(
            raw.failure_threshold,
            Duration::from_millis(raw.error_window_ms),
            Duration::from_millis(raw.standard_cooldown_ms),
            Duration::from_millis(raw.extended_cooldown_ms),
        )
    }
}

impl From<CircuitBreakerConfig> for RawBreakerConfig {
    fn from(cfg: CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            error_window_ms: millis(cfg.error_window),
            standard_cooldown_ms: millis(cfg.standard_cooldown),
            extended_cooldown_ms: millis(cfg.extended_cooldown),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Persisted breaker counters. All timestamps are unix millis, 0 meaning unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerState {
    /// Failures in the current streak.
    pub consecutive_errors: u32,
    /// When the current streak started.
    pub first_error_ts: u64,
    /// The breaker is open until this instant.
    pub tripped_until: u64,
    /// Cooldown length applied by the next trip.
    pub cooldown: CooldownLevel,
}

impl BreakerState {
    /// Open while `tripped_until` lies in the future.
    pub fn state(&self, now: u64) -> CircuitState {
        if self.tripped_until > now {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    pub fn is_open(&self, now: u64) -> bool {
        self.state(now) == CircuitState::Open
    }

    /// Time left before the breaker closes, if it is open.
    pub fn remaining_cooldown(&self, now: u64) -> Option<Duration> {
        self.is_open(now).then(|| Duration::from_millis(self.tripped_until - now))
    }

    /// Counts one upstream failure. Returns `true` if this failure tripped the breaker.
    ///
    /// A streak older than the error window is discarded before counting. Every failure at or
    /// past the threshold trips: it restarts the cooldown for the current level and flips the
    /// level for the next trip. Only a success or an expired window ends the streak.
    pub fn record_failure(&mut self, config: &CircuitBreakerConfig, now: u64) -> bool {
        if self.first_error_ts > 0
            && now.saturating_sub(self.first_error_ts) > millis(config.error_window)
        {
            tracing::debug!(
                stale_errors = self.consecutive_errors,
                "Circuit breaker: error window expired, streak reset"
            );
            self.consecutive_errors = 0;
            self.first_error_ts = 0;
        }

        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if self.first_error_ts == 0 {
            self.first_error_ts = now;
        }

        if self.consecutive_errors < config.failure_threshold {
            tracing::debug!(
                errors = self.consecutive_errors,
                threshold = config.failure_threshold,
                "Circuit breaker: failure recorded"
            );
            return false;
        }

        let cooldown = config.cooldown(self.cooldown);
        self.tripped_until = now.saturating_add(millis(cooldown));
        tracing::error!(
            failures = self.consecutive_errors,
            threshold = config.failure_threshold,
            cooldown_secs = cooldown.as_secs(),
            level = ?self.cooldown,
            "Circuit breaker → open"
        );
        self.cooldown = self.cooldown.flipped();
        true
    }

    /// Clears the failure streak. The cooldown level is kept so alternation survives recovery.
    pub fn record_success(&mut self) {
        if self.consecutive_errors > 0 {
            tracing::debug!(
                cleared = self.consecutive_errors,
                "Circuit breaker: success cleared failure streak"
            );
        }
        self.consecutive_errors = 0;
        self.first_error_ts = 0;
    }
}
