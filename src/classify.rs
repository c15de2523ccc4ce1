use chrono::{DateTime, Duration, Utc};

/// Decide whether an account counts as recently signed in.
///
/// Disabled accounts are never recent, regardless of any recorded timestamp,
/// and accounts with no recorded sign-in are never recent. Otherwise the
/// comparison is strict: a sign-in exactly at `now - threshold_days` does not
/// count.
pub fn is_recent(
    last_sign_in: Option<DateTime<Utc>>,
    account_enabled: bool,
    threshold_days: u32,
    now: DateTime<Utc>,
) -> bool {
    if !account_enabled {
        return false;
    }
    match last_sign_in {
        Some(t) => t > now - Duration::days(threshold_days as i64),
        None => false,
    }
}
