//! Rate-limit telemetry reported by the upstream API itself.

use serde::{Deserialize, Serialize};

/// Header carrying the number of requests already used in the upstream window.
pub const COUNT_HEADER: &str = "x-ratelimit-count";
/// Header carrying the size of the upstream window.
pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Optional header carrying the requests left in the upstream window.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Last usage figures the upstream reported about itself.
///
/// This is ground truth: it overrides local bookkeeping in the hard-stop rule, and a newer
/// value always replaces an older one even when it reports less usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    /// Requests the upstream has counted in its current window.
    pub count: u32,
    /// Size of the upstream window.
    pub limit: u32,
    pub remaining: u32,
    /// `count / limit` as a percentage; 100 when `limit` is zero.
    pub percent_used: f64,
}

impl RateLimitInfo {
    /// Derive `remaining` and `percent_used` from a used count and a window size.
    pub fn from_counts(count: u32, limit: u32) -> Self {
        let percent_used =
            if limit == 0 { 100.0 } else { f64::from(count) * 100.0 / f64::from(limit) };
        Self { count, limit, remaining: limit.saturating_sub(count), percent_used }
    }

    /// Parse the upstream's `X-RateLimit-*` response headers.
    ///
    /// Header names are matched case-insensitively. Returns `None` unless both the count and
    /// the limit are present and numeric. An explicit remaining header wins over the derived one.
    pub fn from_headers<'a, I>(headers: I) -> Option<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut count = None;
        let mut limit = None;
        let mut remaining = None;
        for (name, value) in headers {
            let parsed = value.trim().parse::<u32>().ok();
            if name.eq_ignore_ascii_case(COUNT_HEADER) {
                count = parsed;
            } else if name.eq_ignore_ascii_case(LIMIT_HEADER) {
                limit = parsed;
            } else if name.eq_ignore_ascii_case(REMAINING_HEADER) {
                remaining = parsed;
            }
        }

        let mut info = Self::from_counts(count?, limit?);
        if let Some(remaining) = remaining {
            info.remaining = remaining;
        }
        Some(info)
    }
}
