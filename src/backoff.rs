//! Exponential backoff computation for retry waits.
//!
//! Semantics:
//! - Attempt indices are zero-based counts of completed attempts; anything
//!   below 1 is clamped to 1, so the first wait always equals `min`.
//! - The increment doubles per attempt: `min + (2^(attempt-1) - 1) * c`,
//!   where `c` is the coefficient scaled by bounded jitter in
//!   `[0.8, 1.2]` to spread simultaneous retriers.
//! - The result never falls below `min` nor exceeds `max`; computations
//!   that would overflow saturate at `max` instead of panicking.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use forgewire::backoff::exponential_backoff;
//!
//! let min = Duration::from_secs(1);
//! let max = Duration::from_secs(60);
//! let coefficient = Duration::from_secs(1);
//! let delay = exponential_backoff(3, min, max, coefficient);
//! assert!(delay >= min && delay <= max);
//! ```

use rand::{rng, Rng};
use std::time::Duration;

/// Lower bound of the jitter window applied to the coefficient.
pub const JITTER_LOWER: f64 = 0.8;
/// Upper bound of the jitter window applied to the coefficient.
pub const JITTER_UPPER: f64 = 1.2;

// Exponents past this point dwarf any practical `max` anyway.
const MAX_EXPONENT: u32 = 63;

/// Compute the wait before the next retry attempt.
///
/// Pure given the thread-local RNG draw; use
/// [`exponential_backoff_with_rng`] for deterministic tests.
pub fn exponential_backoff(
    attempt: u32,
    min: Duration,
    max: Duration,
    coefficient: Duration,
) -> Duration {
    exponential_backoff_with_rng(attempt, min, max, coefficient, &mut rng())
}

/// Compute the wait before the next retry attempt using the supplied RNG.
pub fn exponential_backoff_with_rng<R: Rng>(
    attempt: u32,
    min: Duration,
    max: Duration,
    coefficient: Duration,
    rng: &mut R,
) -> Duration {
    let factor = if coefficient.is_zero() {
        // Nothing to scale; skip the draw so zero coefficients stay
        // deterministic.
        1.0
    } else {
        rng.random_range(JITTER_LOWER..=JITTER_UPPER)
    };
    delay_for(attempt, min, max, coefficient, factor)
}

fn delay_for(
    attempt: u32,
    min: Duration,
    max: Duration,
    coefficient: Duration,
    factor: f64,
) -> Duration {
    let attempt = attempt.max(1);
    let exponent = (attempt - 1).min(MAX_EXPONENT);
    let multiplier = (2f64).powi(exponent as i32) - 1.0;
    let increment_ms = multiplier * coefficient.as_millis() as f64 * factor;

    let min_ms = min.as_millis() as f64;
    let max_ms = max.as_millis() as f64;
    let delay_ms = (min_ms + increment_ms).max(min_ms).min(max_ms);
    Duration::from_millis(delay_ms as u64)
}
