//! Timer sources
//!
//! Clock sync and status broadcasts only need three questions answered
//! about a timer: what it reads now, what it read at some past uptime, and
//! whether it is advancing. Both the parent's [`LocalTimer`] and the
//! child's reconciler answer them.

use crate::clock::{now_ns, Nanos};
use crate::sync::{StopAnchor, TimerPhase};

pub trait TimerSource: Send + Sync {
    /// Elapsed nanoseconds at a local uptime
    fn elapsed_at(&self, uptime: Nanos) -> Nanos;

    fn is_advancing_at(&self, uptime: Nanos) -> bool;

    fn elapsed_now(&self) -> Nanos {
        self.elapsed_at(now_ns())
    }

    fn is_advancing(&self) -> bool {
        self.is_advancing_at(now_ns())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalState {
    Idle,
    Running { start: Nanos },
    Paused { anchor: StopAnchor },
    /// Held at a stop event until `resume_at`
    Stopped { anchor: StopAnchor, resume_at: Nanos },
}

/// The authoritative timer on the parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTimer {
    state: LocalState,
}

impl Default for LocalTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTimer {
    pub fn new() -> Self {
        Self {
            state: LocalState::Idle,
        }
    }

    /// Start or resume. Returns the virtual start instant.
    pub fn start(&mut self, now: Nanos) -> Nanos {
        let start = match self.state {
            LocalState::Idle => now,
            LocalState::Running { start } => start,
            LocalState::Paused { anchor } | LocalState::Stopped { anchor, .. } => {
                now - self.elapsed_at_anchor(anchor, now)
            }
        };
        self.state = LocalState::Running { start };
        start
    }

    fn elapsed_at_anchor(&self, anchor: StopAnchor, now: Nanos) -> Nanos {
        match self.state {
            LocalState::Stopped { resume_at, .. } if now >= resume_at => {
                anchor.elapsed_at_stop_ns + (now - resume_at)
            }
            _ => anchor.elapsed_at_stop_ns,
        }
    }

    /// Freeze until the next explicit start
    pub fn pause(&mut self, now: Nanos) -> StopAnchor {
        let anchor = StopAnchor {
            master_uptime_at_stop: now,
            elapsed_at_stop_ns: self.elapsed_at(now),
        };
        self.state = LocalState::Paused { anchor };
        anchor
    }

    /// Freeze for `hold` then resume on its own
    pub fn hold(&mut self, now: Nanos, hold: Nanos) -> StopAnchor {
        let anchor = StopAnchor {
            master_uptime_at_stop: now,
            elapsed_at_stop_ns: self.elapsed_at(now),
        };
        self.state = LocalState::Stopped {
            anchor,
            resume_at: now + hold.max(0),
        };
        anchor
    }

    pub fn reset(&mut self) {
        self.state = LocalState::Idle;
    }

    pub fn phase_at(&self, now: Nanos) -> TimerPhase {
        match self.state {
            LocalState::Idle => TimerPhase::Idle,
            LocalState::Running { .. } => TimerPhase::Running,
            LocalState::Paused { .. } => TimerPhase::Paused,
            LocalState::Stopped { resume_at, .. } if now >= resume_at => TimerPhase::Running,
            LocalState::Stopped { .. } => TimerPhase::Stopped,
        }
    }

    /// Virtual start instant while running
    pub fn start_epoch(&self, now: Nanos) -> Option<Nanos> {
        match self.state {
            LocalState::Running { start } => Some(start),
            LocalState::Stopped { anchor, resume_at } if now >= resume_at => {
                Some(resume_at - anchor.elapsed_at_stop_ns)
            }
            _ => None,
        }
    }

    /// Anchor of the current freeze, if frozen at `now`
    pub fn anchor_at(&self, now: Nanos) -> Option<StopAnchor> {
        match self.state {
            LocalState::Paused { anchor } => Some(anchor),
            LocalState::Stopped { anchor, resume_at } if now < resume_at => Some(anchor),
            _ => None,
        }
    }

    /// Remaining hold of a stop, if held at `now`
    pub fn hold_remaining(&self, now: Nanos) -> Option<Nanos> {
        match self.state {
            LocalState::Stopped { resume_at, .. } if now < resume_at => Some(resume_at - now),
            _ => None,
        }
    }

    /// Full hold length of the current stop
    pub fn hold_length(&self) -> Option<Nanos> {
        match self.state {
            LocalState::Stopped { anchor, resume_at } => Some(resume_at - anchor.master_uptime_at_stop),
            _ => None,
        }
    }

    /// Fold an elapsed stop into the running state
    pub fn settle(&mut self, now: Nanos) -> bool {
        if let LocalState::Stopped { anchor, resume_at } = self.state {
            if now >= resume_at {
                self.state = LocalState::Running {
                    start: resume_at - anchor.elapsed_at_stop_ns,
                };
                return true;
            }
        }
        false
    }
}

impl TimerSource for LocalTimer {
    fn elapsed_at(&self, uptime: Nanos) -> Nanos {
        match self.state {
            LocalState::Idle => 0,
            LocalState::Running { start } => (uptime - start).max(0),
            LocalState::Paused { anchor } => anchor.elapsed_at_stop_ns,
            LocalState::Stopped { anchor, resume_at } => {
                anchor.elapsed_at_stop_ns + (uptime - resume_at).max(0)
            }
        }
    }

    fn is_advancing_at(&self, uptime: Nanos) -> bool {
        self.phase_at(uptime) == TimerPhase::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::millis;

    #[test]
    fn test_start_pause_resume() {
        let mut timer = LocalTimer::new();
        assert_eq!(timer.elapsed_at(millis(10)), 0);
        assert!(!timer.is_advancing_at(0));

        assert_eq!(timer.start(millis(1_000)), millis(1_000));
        assert_eq!(timer.elapsed_at(millis(3_500)), millis(2_500));
        assert!(timer.is_advancing_at(millis(3_500)));

        let anchor = timer.pause(millis(4_000));
        assert_eq!(anchor.elapsed_at_stop_ns, millis(3_000));
        assert_eq!(timer.elapsed_at(millis(9_000)), millis(3_000));
        assert_eq!(timer.phase_at(millis(9_000)), TimerPhase::Paused);
        assert_eq!(timer.anchor_at(millis(9_000)), Some(anchor));

        let start = timer.start(millis(10_000));
        assert_eq!(start, millis(7_000));
        assert_eq!(timer.elapsed_at(millis(10_500)), millis(3_500));
    }

    #[test]
    fn test_hold_resumes_on_its_own() {
        let mut timer = LocalTimer::new();
        timer.start(0);
        let anchor = timer.hold(millis(5_000), millis(2_000));
        assert_eq!(anchor.elapsed_at_stop_ns, millis(5_000));

        assert_eq!(timer.phase_at(millis(6_000)), TimerPhase::Stopped);
        assert_eq!(timer.elapsed_at(millis(6_000)), millis(5_000));
        assert_eq!(timer.hold_remaining(millis(6_000)), Some(millis(1_000)));
        assert_eq!(timer.hold_length(), Some(millis(2_000)));

        assert_eq!(timer.phase_at(millis(7_000)), TimerPhase::Running);
        assert_eq!(timer.elapsed_at(millis(7_500)), millis(5_500));
        assert_eq!(timer.start_epoch(millis(7_500)), Some(millis(2_000)));

        assert!(timer.settle(millis(7_500)));
        assert_eq!(timer.elapsed_at(millis(8_000)), millis(6_000));
    }

    #[test]
    fn test_reset_zeroes() {
        let mut timer = LocalTimer::new();
        timer.start(0);
        timer.reset();
        assert_eq!(timer.elapsed_at(millis(100)), 0);
        assert_eq!(timer.phase_at(millis(100)), TimerPhase::Idle);
    }
}
