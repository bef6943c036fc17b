//! State mutations that follow an upstream call.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::rate_info::RateLimitInfo;
use crate::state::RateState;

/// Count one successful upstream request against every bucket.
///
/// Equivalent to [`count_request`] followed by [`record_outcome`].
pub fn record_request(
    state: &mut RateState,
    consumer: &str,
    endpoint: &str,
    rate_info: Option<RateLimitInfo>,
    now: u64,
) {
    count_request(state, consumer, endpoint, now);
    record_outcome(state, rate_info);
}

/// Charge one request to every bucket and stamp it for burst spacing.
///
/// The consumer and daily total move together, keeping `daily.total` equal to the sum of
/// the per-consumer counts. Used on its own to reserve capacity at admission time, before
/// the upstream call is made.
pub fn count_request(state: &mut RateState, consumer: &str, endpoint: &str, now: u64) {
    state.daily.total = state.daily.total.saturating_add(1);
    bump(state.daily.by_endpoint.entry(endpoint.to_string()).or_default());
    bump(state.daily.by_consumer.entry(consumer.to_string()).or_default());
    state.hourly.total = state.hourly.total.saturating_add(1);
    state.monthly.total = state.monthly.total.saturating_add(1);
    state.last_request_ts = now;

    tracing::debug!(
        consumer,
        endpoint,
        daily_total = state.daily.total,
        consumer_total = state.daily.used_by(consumer),
        "Recorded upstream request"
    );
}

/// Apply what a successful upstream response tells us.
///
/// Supplied telemetry replaces the previous value unconditionally. Any success also clears
/// the breaker's failure streak.
pub fn record_outcome(state: &mut RateState, rate_info: Option<RateLimitInfo>) {
    if let Some(info) = rate_info {
        state.last_api_rate_info = Some(info);
    }
    state.circuit_breaker.record_success();
}

/// Count one failed upstream request. Returns `true` if it tripped the breaker.
pub fn record_error(state: &mut RateState, config: &CircuitBreakerConfig, now: u64) -> bool {
    state.circuit_breaker.record_failure(config, now)
}

fn bump(counter: &mut u32) {
    *counter = counter.saturating_add(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CooldownLevel;

    const T0: u64 = 1_710_498_600_000;

    #[test]
    fn request_moves_every_counter() {
        let mut state = RateState::fresh(T0);
        record_request(&mut state, "cyber-ops", "/v3/search/contents", None, T0);
        record_request(&mut state, "landscape", "/v3/search/contents", None, T0 + 1);
        record_request(&mut state, "cyber-ops", "/v3/entries", None, T0 + 2);

        assert_eq!(state.daily.total, 3);
        assert_eq!(state.daily.used_by("cyber-ops"), 2);
        assert_eq!(state.daily.by_endpoint["/v3/search/contents"], 2);
        assert_eq!(state.hourly.total, 3);
        assert_eq!(state.monthly.total, 3);
        assert_eq!(state.last_request_ts, T0 + 2);
        assert_eq!(state.daily.total, state.daily.by_consumer.values().sum::<u32>());
    }

    #[test]
    fn telemetry_always_takes_newest_value() {
        let mut state = RateState::fresh(T0);
        record_request(&mut state, "cyber-ops", "/e", Some(RateLimitInfo::from_counts(95, 100)), T0);
        record_request(&mut state, "cyber-ops", "/e", Some(RateLimitInfo::from_counts(3, 100)), T0 + 1);
        assert_eq!(state.last_api_rate_info.as_ref().map(|i| i.count), Some(3));

        record_request(&mut state, "cyber-ops", "/e", None, T0 + 2);
        assert_eq!(state.last_api_rate_info.as_ref().map(|i| i.count), Some(3));
    }

    #[test]
    fn success_clears_error_streak_but_not_level() {
        let cfg = CircuitBreakerConfig::default();
        let mut state = RateState::fresh(T0);
        state.circuit_breaker.cooldown = CooldownLevel::Extended;
        record_error(&mut state, &cfg, T0);
        record_error(&mut state, &cfg, T0 + 1);
        assert_eq!(state.circuit_breaker.consecutive_errors, 2);

        record_request(&mut state, "landscape", "/e", None, T0 + 2);
        assert_eq!(state.circuit_breaker.consecutive_errors, 0);
        assert_eq!(state.circuit_breaker.first_error_ts, 0);
        assert_eq!(state.circuit_breaker.cooldown, CooldownLevel::Extended);
    }

    #[test]
    fn counting_alone_leaves_breaker_and_telemetry() {
        let cfg = CircuitBreakerConfig::default();
        let mut state = RateState::fresh(T0);
        state.last_api_rate_info = Some(RateLimitInfo::from_counts(7, 100));
        record_error(&mut state, &cfg, T0);

        count_request(&mut state, "landscape", "/v3/mixes", T0 + 1);
        assert_eq!(state.daily.used_by("landscape"), 1);
        assert_eq!(state.last_request_ts, T0 + 1);
        assert_eq!(state.circuit_breaker.consecutive_errors, 1);
        assert_eq!(state.last_api_rate_info.as_ref().map(|i| i.count), Some(7));

        record_outcome(&mut state, Some(RateLimitInfo::from_counts(8, 100)));
        assert_eq!(state.circuit_breaker.consecutive_errors, 0);
        assert_eq!(state.last_api_rate_info.as_ref().map(|i| i.count), Some(8));
        assert_eq!(state.daily.total, 1);
    }

    #[test]
    fn fifth_error_trips() {
        let cfg = CircuitBreakerConfig::default();
        let mut state = RateState::fresh(T0);
        let trips: Vec<bool> = (0..5).map(|i| record_error(&mut state, &cfg, T0 + i)).collect();
        assert_eq!(trips, vec![false, false, false, false, true]);
        assert!(state.circuit_breaker.is_open(T0 + 5));
    }
}
