//! Fixed retry backoff tiers

use std::time::Duration;

/// Outbox dispatcher tiers: 5 s, 15 s, 1 min, 5 min, 15 min
pub const OUTBOX_TIERS: [Duration; 5] = [
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
];

/// Outbound mail tiers: 1 min, 5 min, 15 min, 1 h, 6 h, 24 h
pub const MAIL_TIERS: [Duration; 6] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(6 * 60 * 60),
    Duration::from_secs(24 * 60 * 60),
];

/// Delay after the `retry_count`-th failure, capped at the last tier.
///
/// An empty table means no delay.
pub fn delay_for(tiers: &[Duration], retry_count: u32) -> Duration {
    let index = usize::try_from(retry_count).unwrap_or(usize::MAX);
    tiers
        .get(index)
        .or_else(|| tiers.last())
        .copied()
        .unwrap_or(Duration::ZERO)
}

/// Absolute time (Unix ms) of the next attempt after the `retry_count`-th failure
pub fn next_attempt_at(tiers: &[Duration], retry_count: u32, now: i64) -> i64 {
    now.saturating_add(crate::util::duration_ms(delay_for(tiers, retry_count)))
}
