//! Capped exponential backoff
//!
//! All reconnect and re-registration paths share one growth curve: the delay
//! for attempt `n` is `min(base * 2^n, cap)`. The computation is pure, so the
//! caller owns the attempt counter and decides when it resets.
//!
//! ```rust
//! use agentdesk_phone_core::backoff::Backoff;
//! use std::time::Duration;
//!
//! let backoff = Backoff::registration();
//! assert_eq!(backoff.schedule_retry(0), Duration::from_secs(5));
//! assert_eq!(backoff.schedule_retry(1), Duration::from_secs(10));
//! assert_eq!(backoff.schedule_retry(10), Duration::from_secs(60));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Base delay for signalling reconnects
pub const SIGNALLING_BASE_DELAY: Duration = Duration::from_secs(3);

/// Base delay for device re-registration
pub const REGISTRATION_BASE_DELAY: Duration = Duration::from_secs(5);

/// Upper bound shared by every retry path
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay for attempt zero
    pub base: Duration,
    /// Maximum delay, regardless of attempt number
    pub cap: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Backoff used by the signalling channel (3s base, 60s cap)
    pub const fn signalling() -> Self {
        Self::new(SIGNALLING_BASE_DELAY, MAX_RETRY_DELAY)
    }

    /// Backoff used by device registration (5s base, 60s cap)
    pub const fn registration() -> Self {
        Self::new(REGISTRATION_BASE_DELAY, MAX_RETRY_DELAY)
    }

    /// Delay before retry number `attempt`
    ///
    /// Saturates instead of overflowing, so any attempt count past the point
    /// where the curve crosses the cap simply returns the cap.
    pub fn schedule_retry(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Same as [`Backoff::schedule_retry`] in whole milliseconds
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.schedule_retry(attempt).as_millis() as u64
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::signalling()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_curve() {
        let backoff = Backoff::signalling();
        let delays: Vec<u64> = (0..6).map(|n| backoff.delay_ms(n)).collect();
        assert_eq!(delays, vec![3_000, 6_000, 12_000, 24_000, 48_000, 60_000]);
    }

    #[test]
    fn test_non_decreasing_and_capped() {
        let backoff = Backoff::new(Duration::from_millis(750), Duration::from_secs(60));
        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let delay = backoff.schedule_retry(attempt);
            assert!(delay >= previous, "attempt {} went backwards", attempt);
            assert!(delay <= Duration::from_secs(60));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(60));
    }

    #[test]
    fn test_deterministic() {
        let backoff = Backoff::registration();
        assert_eq!(backoff.schedule_retry(3), backoff.schedule_retry(3));
        assert_eq!(backoff.schedule_retry(2), Duration::from_secs(20));
    }

    #[test]
    fn test_cap_below_base() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(4));
        assert_eq!(backoff.schedule_retry(0), Duration::from_secs(4));
    }
}
