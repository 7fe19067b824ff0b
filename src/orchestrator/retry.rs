//! Exponential backoff for transient application failures

use crate::config::RetryConfig;
use std::time::Duration;

/// Delay before the attempt following failed attempt number `attempt` (1-based).
///
/// `min(initial * 2^(attempt - 1), max)`. No jitter: retries are scheduled on
/// the durable task record, so identical delays are reproducible in tests.
pub fn backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let factor = 1u64 << exponent;
    let delay_ms = config.initial_backoff_ms.saturating_mul(factor);
    Duration::from_millis(delay_ms.min(config.max_backoff_ms))
}

/// Returns `true` if another attempt is allowed after `attempts` have run.
pub fn should_retry(attempts: u32, config: &RetryConfig) -> bool {
    attempts < config.max_attempts
}
