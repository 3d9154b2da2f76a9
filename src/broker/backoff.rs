//! # Reconnection Backoff
//!
//! `delay = min(2^attempts, 32) seconds × jitter`, `jitter ∈ [0.8, 1.2]`
//! uniformly (§4.D). Attempts reset on any successful connection. Shared
//! between the broker client's reconnect loop and the replication
//! publisher's retry policy (§4.H uses the same cap-and-jitter shape for
//! transient publish failures).

use rand::Rng;
use std::time::Duration;

const MAX_DELAY_SECONDS: u64 = 32;
const JITTER_MIN: f64 = 0.8;
const JITTER_MAX: f64 = 1.2;

#[derive(Debug, Clone, Default)]
pub struct Backoff {
    attempts: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempts: 0 }
    }

    /// Duration to wait before the next attempt, incrementing the internal
    /// attempt counter. Jitter is sampled fresh on every call.
    pub fn next_delay(&mut self) -> Duration {
        let capped = 2u64.saturating_pow(self.attempts).min(MAX_DELAY_SECONDS);
        self.attempts = self.attempts.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        Duration::from_secs_f64(capped as f64 * jitter)
    }

    /// Reset the attempt counter on a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_capped_at_32_seconds_times_max_jitter() {
        let mut backoff = Backoff::new();
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay.as_secs_f64() <= MAX_DELAY_SECONDS as f64 * JITTER_MAX + 0.001);
        }
    }

    #[test]
    fn delay_grows_with_attempts_before_capping() {
        let mut backoff = Backoff::new();
        // attempt 0 -> up to 1s*1.2; attempt 1 -> up to 2s*1.2, etc. Check
        // the lower bound of a later attempt exceeds the upper bound of an
        // early one, accounting for jitter range overlap only near the cap.
        let first = backoff.next_delay();
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        let fourth = backoff.next_delay();
        assert!(first.as_secs_f64() <= 1.2 + 0.001);
        assert!(fourth.as_secs_f64() >= 8.0 * JITTER_MIN - 0.001);
    }

    #[test]
    fn reset_returns_to_first_attempt_range() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        let delay = backoff.next_delay();
        assert!(delay.as_secs_f64() <= JITTER_MAX + 0.001);
    }
}
