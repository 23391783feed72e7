//! Redial backoff.
//!
//! Dialers wait between failed attempts. The delay starts at
//! `reconnect-time-min` and doubles per failure up to `reconnect-time-max`.
//! A maximum of zero disables growth.

use crate::options::SocketOptions;
use std::time::Duration;

/// Backoff for one dialer.
///
/// ```rust
/// use manifold_core::options::SocketOptions;
/// use manifold_core::reconnect::ReconnectState;
/// use std::time::Duration;
///
/// let mut backoff = ReconnectState::new(&SocketOptions::default());
/// assert_eq!(backoff.next_delay(), Duration::from_millis(100));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(200));
///
/// backoff.reset();
/// assert_eq!(backoff.next_delay(), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectState {
    min: Duration,
    cap: Duration,
    failures: u32,
    upcoming: Duration,
}

impl ReconnectState {
    #[must_use]
    pub fn new(options: &SocketOptions) -> Self {
        Self::from_intervals(options.reconnect_ivl, options.reconnect_ivl_max)
    }

    /// Build from explicit bounds. A `max` below `base` (other than zero)
    /// is raised to `base` so delays never shrink.
    #[must_use]
    pub fn from_intervals(base: Duration, max: Duration) -> Self {
        Self {
            min: base,
            cap: if max.is_zero() { base } else { max.max(base) },
            failures: 0,
            upcoming: base,
        }
    }

    /// Delay before the next attempt; advances the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.upcoming;
        self.failures = self.failures.saturating_add(1);
        self.upcoming = delay.saturating_mul(2).min(self.cap);
        delay
    }

    /// Back to the minimum after a successful connection.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.upcoming = self.min;
    }

    /// Delays handed out since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.failures
    }

    #[must_use]
    pub const fn max_interval(&self) -> Duration {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_exponential_backoff() {
        let mut state = ReconnectState::from_intervals(ms(100), ms(10_000));
        assert_eq!(state.next_delay(), ms(100));
        assert_eq!(state.next_delay(), ms(200));
        assert_eq!(state.next_delay(), ms(400));
        assert_eq!(state.next_delay(), ms(800));
        assert_eq!(state.attempt(), 4);
    }

    #[test]
    fn test_max_interval_cap() {
        let mut state = ReconnectState::from_intervals(ms(100), ms(500));
        assert_eq!(state.next_delay(), ms(100));
        assert_eq!(state.next_delay(), ms(200));
        assert_eq!(state.next_delay(), ms(400));
        assert_eq!(state.next_delay(), ms(500));
        assert_eq!(state.next_delay(), ms(500));
    }

    #[test]
    fn test_zero_max_means_no_growth() {
        let mut state = ReconnectState::from_intervals(ms(250), Duration::ZERO);
        for _ in 0..5 {
            assert_eq!(state.next_delay(), ms(250));
        }
    }

    #[test]
    fn test_monotone_even_with_small_max() {
        let mut state = ReconnectState::from_intervals(ms(300), ms(100));
        let mut last = Duration::ZERO;
        for _ in 0..50 {
            let d = state.next_delay();
            assert!(d >= last);
            assert!(d <= state.max_interval());
            last = d;
        }
    }

    #[test]
    fn test_no_overflow_after_many_attempts() {
        let mut state = ReconnectState::from_intervals(ms(1), Duration::from_secs(60));
        for _ in 0..200 {
            state.next_delay();
        }
        assert_eq!(state.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_reset() {
        let options = SocketOptions::default();
        let mut state = ReconnectState::new(&options);
        state.next_delay();
        state.next_delay();
        state.reset();
        assert_eq!(state.attempt(), 0);
        assert_eq!(state.next_delay(), options.reconnect_ivl);
    }
}
