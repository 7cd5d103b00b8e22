//! Clock Synchronization
//!
//! Four-timestamp beacon exchange with a peer, producing a smoothed
//! local <-> remote offset so peer-stamped timestamps can be read on the
//! local clock.
//!
//! All timestamps are monotonic nanoseconds ("uptime") on the clock of the
//! device that took them. Protocol logic takes `now` explicitly; only the
//! async actors read the real clock through [`now_ns`].

mod beacon;
mod engine;
mod estimator;

pub use beacon::*;
pub use engine::*;
pub use estimator::*;

use std::sync::OnceLock;
use std::time::Duration;

/// Monotonic nanoseconds
pub type Nanos = i64;

pub const NANOS_PER_MILLI: Nanos = 1_000_000;
pub const NANOS_PER_SEC: Nanos = 1_000_000_000;

static ORIGIN: OnceLock<tokio::time::Instant> = OnceLock::new();

fn origin() -> tokio::time::Instant {
    *ORIGIN.get_or_init(tokio::time::Instant::now)
}

/// Current process uptime in nanoseconds
pub fn now_ns() -> Nanos {
    nanos(origin().elapsed())
}

/// The tokio instant corresponding to an uptime value (for timers)
pub fn instant_at(uptime: Nanos) -> tokio::time::Instant {
    origin() + Duration::from_nanos(uptime.max(0) as u64)
}

/// Convert a duration to nanoseconds, saturating
pub fn nanos(d: Duration) -> Nanos {
    i64::try_from(d.as_nanos()).unwrap_or(Nanos::MAX)
}

/// Convert milliseconds to nanoseconds
pub const fn millis(ms: i64) -> Nanos {
    ms * NANOS_PER_MILLI
}

/// Nanoseconds as fractional seconds
pub fn as_secs_f64(ns: Nanos) -> f64 {
    ns as f64 / NANOS_PER_SEC as f64
}

/// Fractional seconds as nanoseconds
pub fn from_secs_f64(secs: f64) -> Nanos {
    (secs * NANOS_PER_SEC as f64).round() as Nanos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(millis(40), 40_000_000);
        assert_eq!(nanos(Duration::from_millis(250)), millis(250));
        assert_eq!(from_secs_f64(1.5), 1_500_000_000);
        assert!((as_secs_f64(millis(120)) - 0.12).abs() < 1e-12);
    }

    #[test]
    fn test_uptime_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
        assert!(instant_at(b) >= instant_at(a));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_follows_tokio_clock() {
        let before = now_ns();
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(now_ns() - before, millis(50));

        // Sleeping until an uptime wakes there, within the timer wheel's tick
        let target = now_ns() + millis(250);
        tokio::time::sleep_until(instant_at(target)).await;
        let woke = now_ns();
        assert!(woke >= target && woke - target < millis(2), "woke {}ns late", woke - target);
    }
}
