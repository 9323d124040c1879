//! Retry utilities: backoff builders for broker connection attempts.
//!
//! Uses `backon` for exponential backoff. No jitter: delays are exactly
//! `base`, `base * 1.5`, `base * 2.25`, ... capped at the configured maximum.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Growth factor between consecutive connection retry delays.
pub const CONNECT_BACKOFF_FACTOR: f32 = 1.5;

/// Backoff for `connect()`: `max_attempts` attempts in total, so
/// `max_attempts - 1` sleeps.
pub fn connect_backoff(
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_factor(CONNECT_BACKOFF_FACTOR)
        .with_min_delay(base_delay)
        .with_max_delay(max_delay.max(base_delay))
        .with_max_times(max_attempts.saturating_sub(1))
}

/// Backoff for reconnecting after a lost session. Never gives up.
pub fn reconnect_backoff(base_delay: Duration, max_delay: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_factor(CONNECT_BACKOFF_FACTOR)
        .with_min_delay(base_delay)
        .with_max_delay(max_delay.max(base_delay))
        .with_max_times(usize::MAX)
}
