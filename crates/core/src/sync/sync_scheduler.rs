//! Scheduler constants/helpers for balance sync.

use rand::Rng;
use std::time::Duration;

/// Consecutive subscribe failures tolerated before switching to polling.
pub const REWARDS_SYNC_MAX_SUBSCRIBE_ATTEMPTS: u32 = 3;

/// First reconnect delay in milliseconds.
pub const REWARDS_SYNC_BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound for a single reconnect delay.
pub const REWARDS_SYNC_BACKOFF_MAX_MS: u64 = 30_000;

/// Polling cadence once the push channel is abandoned.
pub const REWARDS_SYNC_POLL_INTERVAL_SECS: u64 = 30;

/// Exponential backoff in milliseconds with cap.
pub fn backoff_millis(consecutive_failures: u32, base_ms: u64, max_ms: u64) -> u64 {
    const MAX_EXPONENT: u32 = 8;

    let exp = consecutive_failures.saturating_sub(1).min(MAX_EXPONENT);
    base_ms.saturating_mul(1_u64 << exp).min(max_ms)
}

/// Backoff plus up to 20% random jitter.
pub fn backoff_with_jitter(consecutive_failures: u32, base_ms: u64, max_ms: u64) -> Duration {
    let backoff = backoff_millis(consecutive_failures, base_ms, max_ms);
    let jitter = rand::thread_rng().gen_range(0..=(backoff / 5).max(1));
    Duration::from_millis(backoff.saturating_add(jitter))
}
