//! Reconnect backoff
//!
//! `delay = min(cap, base * (attempt + 1)^exponent)`, attempt counting from
//! zero and reset on a successful connection.

use std::time::Duration;

use crate::config::LinkConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    exponent: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, exponent: f64) -> Self {
        Self {
            base,
            cap,
            exponent,
            attempt: 0,
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_cap, config.backoff_exponent)
    }

    /// Delay before retry number `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = f64::from(attempt + 1).powf(self.exponent);
        let secs = (self.base.as_secs_f64() * factor).min(self.cap.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Delay for the current attempt, then advance
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&LinkConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curve_matches_published_delays() {
        let backoff = Backoff::default();
        let expected = [0.6, 1.378, 2.242, 3.167, 4.139];
        let mut previous = Duration::ZERO;
        for (n, want) in expected.iter().enumerate() {
            let delay = backoff.delay_for(n as u32);
            let formula = (0.6 * ((n + 1) as f64).powf(1.2)).min(4.5);
            assert!((delay.as_secs_f64() - formula).abs() < 1e-9);
            assert!((delay.as_secs_f64() - want).abs() < 1e-3, "attempt {}: {:?}", n, delay);
            assert!(delay >= previous);
            previous = delay;
        }
        assert_eq!(backoff.delay_for(5), Duration::from_millis(4500));
        assert_eq!(backoff.delay_for(50), Duration::from_millis(4500));
    }

    #[test]
    fn test_attempts_advance_and_reset() {
        let mut backoff = Backoff::default();
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        assert!(second > first);
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay(), first);
    }
}
