//! Human-readable snapshot of budget usage for operators.

use crate::config::BudgetTable;
use crate::state::RateState;
use std::fmt;

/// Renders usage in a fixed order: totals, consumers, endpoints, upstream telemetry and,
/// only while it is open, the circuit breaker.
#[derive(Debug, Clone, Copy)]
pub struct StatusReport<'a> {
    state: &'a RateState,
    table: &'a BudgetTable,
    now: u64,
}

impl<'a> StatusReport<'a> {
    pub fn new(state: &'a RateState, table: &'a BudgetTable, now: u64) -> Self {
        Self { state, table, now }
    }
}

impl fmt::Display for StatusReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state;
        let table = self.table;

        writeln!(f, "Budget status for {}", state.daily.date)?;
        writeln!(f, "  daily:   {}/{}", state.daily.total, table.global_daily_limit())?;
        writeln!(f, "  hourly:  {} ({})", state.hourly.total, state.hourly.hour)?;
        writeln!(
            f,
            "  monthly: {}/{} ({})",
            state.monthly.total,
            table.global_monthly_limit(),
            state.monthly.month
        )?;

        writeln!(f, "Consumers:")?;
        for (name, alloc) in table.consumers() {
            writeln!(
                f,
                "  {:<14} {}/{} (priority {}{})",
                name,
                state.daily.used_by(name),
                alloc.daily_limit,
                u8::from(alloc.priority),
                if alloc.can_borrow { ", borrows" } else { "" }
            )?;
        }
        let reserve_limit = table.reserve().daily_limit;
        for (name, used) in &state.daily.by_consumer {
            if table.get(name).is_none() {
                writeln!(f, "  {:<14} {}/{} (reserve tier)", name, used, reserve_limit)?;
            }
        }

        writeln!(f, "Endpoints:")?;
        if state.daily.by_endpoint.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for (endpoint, count) in &state.daily.by_endpoint {
            writeln!(f, "  {:<30} {}", endpoint, count)?;
        }

        match &state.last_api_rate_info {
            Some(info) => writeln!(
                f,
                "Upstream: {}/{} used ({:.1}%), {} remaining",
                info.count, info.limit, info.percent_used, info.remaining
            )?,
            None => writeln!(f, "Upstream: no telemetry yet")?,
        }

        if let Some(wait) = state.circuit_breaker.remaining_cooldown(self.now) {
            writeln!(
                f,
                "Circuit breaker active: {}s remaining",
                wait.as_millis().div_ceil(1000)
            )?;
        }
        Ok(())
    }
}

/// Render the status report to a string.
pub fn format_status(state: &RateState, table: &BudgetTable, now: u64) -> String {
    StatusReport::new(state, table, now).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_info::RateLimitInfo;
    use crate::recorder::record_request;

    const T0: u64 = 1_710_498_600_000;

    fn sample_state() -> RateState {
        let mut state = RateState::fresh(T0);
        record_request(&mut state, "cyber-ops", "/v3/search/contents", None, T0);
        record_request(&mut state, "cyber-ops", "/v3/entries", None, T0);
        record_request(
            &mut state,
            "newcomer",
            "/v3/entries",
            Some(RateLimitInfo::from_counts(120, 1000)),
            T0,
        );
        state
    }

    #[test]
    fn report_lists_sections_in_order() {
        let table = BudgetTable::default();
        let text = format_status(&sample_state(), &table, T0);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "Budget status for 2024-03-15");
        assert_eq!(lines[1], "  daily:   3/1667");
        assert_eq!(lines[2], "  hourly:  3 (2024-03-15T10)");
        assert_eq!(lines[3], "  monthly: 3/50000 (2024-03)");
        assert_eq!(lines[4], "Consumers:");
        assert!(lines[5].starts_with("  cyber-ops") && lines[5].contains("2/1000 (priority 1, borrows)"));
        assert!(lines[6].starts_with("  twitter-bot") && lines[6].contains("0/500 (priority 2)"));
        assert!(lines[9].starts_with("  newcomer") && lines[9].ends_with("1/167 (reserve tier)"));
        assert_eq!(lines[10], "Endpoints:");
        assert!(lines[11].starts_with("  /v3/entries") && lines[11].ends_with(" 2"));
        assert!(lines[12].starts_with("  /v3/search/contents"));
        assert_eq!(lines[13], "Upstream: 120/1000 used (12.0%), 880 remaining");
        assert_eq!(lines.len(), 14);
        assert!(!text.contains("Circuit breaker"));
    }

    #[test]
    fn breaker_line_only_while_open() {
        let table = BudgetTable::default();
        let mut state = sample_state();
        state.circuit_breaker.tripped_until = T0 + 60_000;

        let open = format_status(&state, &table, T0);
        assert!(open.ends_with("Circuit breaker active: 60s remaining\n"));

        let closed = format_status(&state, &table, T0 + 60_000);
        assert!(!closed.contains("Circuit breaker"));
    }

    #[test]
    fn report_is_deterministic() {
        let table = BudgetTable::default();
        let state = sample_state();
        assert_eq!(format_status(&state, &table, T0), format_status(&state, &table, T0));
    }

    #[test]
    fn empty_state_mentions_missing_data() {
        let table = BudgetTable::default();
        let text = format_status(&RateState::fresh(T0), &table, T0);
        assert!(text.contains("  (none)"));
        assert!(text.contains("Upstream: no telemetry yet"));
    }
}
