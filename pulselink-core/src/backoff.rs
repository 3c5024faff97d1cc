//! Retry delay calculation.
//!
//! The nominal delay ramps linearly over the first attempts and is capped at
//! twice the base timeout: `min((n + 2) / 3, 2) × base` for the 1-indexed
//! attempt `n`. The armed delay is drawn uniformly from `[0.8 × nominal,
//! 1.0 × nominal]` so that a fleet of clients disconnected by the same
//! outage does not resynchronize its retries.
//!
//! Connection retries use `disconnected_retry_timeout` as the base and
//! channel attach retries use `channel_retry_timeout`, each with its own
//! attempt counter. The suspended-state cadence is a fixed timeout and does
//! not go through this module.

use rand::Rng;
use std::time::Duration;

/// Delay before retry attempt `n` (1-indexed), without jitter.
pub fn nominal_retry_delay(attempt: u32, base: Duration) -> Duration {
    let n = attempt.max(1);
    let multiplier = (f64::from(n + 2) / 3.0).min(2.0);
    base.mul_f64(multiplier)
}

/// Delay before retry attempt `n`, jittered into `[0.8, 1.0] × nominal`.
pub fn retry_delay(attempt: u32, base: Duration) -> Duration {
    let nominal = nominal_retry_delay(attempt, base);
    let jitter = rand::thread_rng().gen_range(0.8..=1.0);
    nominal.mul_f64(jitter)
}
