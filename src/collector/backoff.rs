//! Reconnection backoff
//!
//! Exponential growth between the configured min and max, with symmetric
//! jitter so a fleet of collectors does not reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Exponential backoff state for one connection.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Attempts since the last successful connection.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay: `min × 2^attempt`, capped at max, jittered ±20 %
    /// (or whatever the config's jitter fraction is).
    pub fn next_delay(&mut self) -> Duration {
        let base = self
            .config
            .min_ms
            .saturating_mul(2u64.saturating_pow(self.attempt))
            .min(self.config.max_ms);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_millis(((base as f64) * factor).round().max(1.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            min_ms: 1_000,
            max_ms: 8_000,
            jitter,
        }
    }

    #[test]
    fn test_doubles_up_to_cap() {
        let mut backoff = Backoff::new(config(0.0));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(4_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(8_000));
        // Stays at the cap.
        assert_eq!(backoff.next_delay(), Duration::from_millis(8_000));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = Backoff::new(config(0.0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut backoff = Backoff::new(config(0.2));
        for _ in 0..100 {
            backoff.reset();
            let d = backoff.next_delay().as_millis() as f64;
            assert!((800.0..=1_200.0).contains(&d), "delay {d} out of band");
        }
    }
}
