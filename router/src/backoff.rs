//! Reconnect backoff: exponential with full jitter.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff schedule with full jitter.
///
/// Each attempt doubles the window up to the cap; the actual delay is drawn
/// uniformly from `[0, window]` so a burst of reconnecting peers does not
/// stampede the target in lockstep.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    /// Schedule with the router defaults: base 100 ms, cap 10 s.
    pub fn new() -> Self {
        Self::with_limits(Duration::from_millis(100), Duration::from_secs(10))
    }

    pub fn with_limits(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// The jittered delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let window = self
            .base
            .checked_mul(1u32 << self.attempt.min(16))
            .unwrap_or(self.cap)
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        rand::thread_rng().gen_range(Duration::ZERO..=window)
    }

    /// Attempts taken so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_stay_within_window() {
        let mut backoff = Backoff::new();
        let cap = Duration::from_secs(10);
        for attempt in 0..20 {
            let window = Duration::from_millis(100)
                .checked_mul(1 << attempt.min(16))
                .unwrap_or(cap)
                .min(cap);
            let delay = backoff.next_delay();
            assert!(delay <= window, "attempt {attempt}: {delay:?} > {window:?}");
        }
    }

    #[test]
    fn test_window_caps_out() {
        let mut backoff = Backoff::with_limits(Duration::from_millis(100), Duration::from_secs(1));
        for _ in 0..32 {
            assert!(backoff.next_delay() <= Duration::from_secs(1));
        }
        assert_eq!(backoff.attempts(), 32);
    }
}
