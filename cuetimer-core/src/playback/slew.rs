//! Bounded linear interpolation toward a frozen value

use crate::clock::Nanos;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slew {
    pub from: Nanos,
    pub to: Nanos,
    pub started_at: Nanos,
    pub duration: Nanos,
}

impl Slew {
    pub fn new(from: Nanos, to: Nanos, started_at: Nanos, duration: Nanos) -> Self {
        Self {
            from,
            to,
            started_at,
            duration,
        }
    }

    /// Displayed value at `now`; exactly `to` once the duration has passed
    pub fn value_at(&self, now: Nanos) -> Nanos {
        let t = now - self.started_at;
        if self.duration <= 0 || t >= self.duration {
            return self.to;
        }
        if t <= 0 {
            return self.from;
        }
        let delta = (self.to - self.from) as i128 * t as i128 / self.duration as i128;
        self.from + delta as Nanos
    }

    pub fn is_complete(&self, now: Nanos) -> bool {
        now - self.started_at >= self.duration
    }

    pub fn gap(&self) -> Nanos {
        self.to - self.from
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::millis;

    #[test]
    fn test_slew_is_bounded_and_exact_at_end() {
        for (from, to) in [(millis(5_000), millis(5_060)), (millis(8_000), millis(7_700)), (0, 1)] {
            let slew = Slew::new(from, to, millis(100), millis(120));
            let gap = (to - from).abs();
            let mut previous = from;
            for step in 0..=150 {
                let now = millis(100) + millis(1) * step;
                let value = slew.value_at(now);
                assert!((value - to).abs() <= gap);
                // Never overshoots and never moves backwards
                assert!((value - previous).signum() * (to - from).signum() >= 0);
                previous = value;
            }
            assert_eq!(slew.value_at(millis(220)), to);
            assert!(slew.is_complete(millis(220)));
            assert!(!slew.is_complete(millis(219)));
        }
    }

    #[test]
    fn test_midpoint() {
        let slew = Slew::new(0, millis(120), 0, millis(120));
        assert_eq!(slew.value_at(millis(60)), millis(60));
        assert_eq!(slew.value_at(-5), 0);
    }
}
