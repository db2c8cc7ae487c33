use chrono::{DateTime, Duration, DurationRound, Utc};

/// Returns the first instant of the whole minute following `now`.
///
/// A timestamp that already sits exactly on a minute boundary still moves to
/// the *next* boundary, so the hint is always strictly in the future.
pub fn start_of_next_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = now
        .duration_trunc(Duration::minutes(1))
        .unwrap_or(now);
    floor + Duration::minutes(1)
}

/// Whole seconds from `now` until `target`, rounded up and never below one.
///
/// Used for the `Retry-After` header, which only carries integer seconds.
pub fn seconds_until(now: DateTime<Utc>, target: DateTime<Utc>) -> u64 {
    let millis = (target - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}
