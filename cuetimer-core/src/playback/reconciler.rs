//! Playback Reconciler
//!
//! Turns authoritative timer state from the parent into a local display
//! value without visible discontinuities.
//!
//! Running state is kept as a virtual local start instant. New messages
//! only move the *target* start instant; [`PlaybackReconciler::tick`]
//! walks the real one toward it at a bounded rate, so jitter is absorbed
//! and persistent bias still converges.
//!
//! Frozen state is pinned to a stop anchor. A new anchor close to what is
//! on screen snaps; a distant one is slewed to over a short fixed duration.
//! Re-applying the same anchor does nothing.

use tracing::debug;

use super::schedule::Schedule;
use super::slew::Slew;
use super::source::TimerSource;
use crate::clock::{as_secs_f64, from_secs_f64, nanos, ClockEstimate, Nanos};
use crate::config::SyncConfig;
use crate::sync::{PlaybackPhase, PlaybackState, StopAnchor, TimerAction, TimerMessage, TimerPhase};

/// Start-instant errors beyond this are re-based at once instead of nudged
const RESYNC_THRESHOLD: Nanos = 500_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeOutcome {
    Snapped,
    Slewing { gap_ns: Nanos },
    /// Same anchor as already applied
    Unchanged,
}

/// What applying a message did to the display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Started,
    Resumed,
    /// Target start instant moved; the display will nudge toward it
    Corrected { error_ns: Nanos },
    /// Error too large to nudge; start instant replaced
    Resynced { error_ns: Nanos },
    Froze(FreezeOutcome),
    Reasserted,
    Reset,
    Ignored,
}

impl Reconciled {
    /// A freeze to an anchor that was not already applied
    pub fn is_new_freeze(&self) -> bool {
        matches!(
            self,
            Reconciled::Froze(FreezeOutcome::Snapped) | Reconciled::Froze(FreezeOutcome::Slewing { .. })
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Regime {
    Idle,
    Running {
        /// Local uptime of the displayed start instant
        start: f64,
        /// Start instant implied by the latest message
        target: f64,
        last_nudge: Nanos,
    },
    Frozen {
        anchor: StopAnchor,
        /// Some for a scheduled stop that resumes on its own
        hold: Option<Nanos>,
        slew: Option<Slew>,
        resume_at: Option<Nanos>,
    },
}

/// Side effects of one display tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub resumed: bool,
    pub slew_finished: bool,
    /// Stop event the playhead just reached
    pub reached: Option<String>,
}

impl TickOutcome {
    pub fn is_empty(&self) -> bool {
        !self.resumed && !self.slew_finished && self.reached.is_none()
    }
}

/// What the presentation layer should draw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySnapshot {
    pub phase: TimerPhase,
    pub elapsed_ns: Nanos,
    pub slewing: bool,
    pub current_event_id: Option<String>,
    pub next_event_id: Option<String>,
    pub hold_remaining_ns: Option<Nanos>,
}

#[derive(Debug)]
pub struct PlaybackReconciler {
    slew_threshold: Nanos,
    slew_duration: Nanos,
    max_nudge_rate: f64,
    default_transit: Nanos,
    regime: Regime,
    stop_events: Schedule,
    cursor_current: Option<String>,
    cursor_next: Option<String>,
}

impl PlaybackReconciler {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            slew_threshold: nanos(config.slew_threshold),
            slew_duration: nanos(config.slew_duration),
            max_nudge_rate: config.max_nudge_rate,
            default_transit: nanos(config.default_transit),
            regime: Regime::Idle,
            stop_events: Schedule::new(),
            cursor_current: None,
            cursor_next: None,
        }
    }

    /// Delay between the parent stamping a message and us receiving it
    fn transit(&self, sender_timestamp: Nanos, received_at: Nanos, estimate: Option<&ClockEstimate>) -> Nanos {
        match estimate {
            Some(e) => (received_at - e.local_time_at(sender_timestamp)).max(0),
            None => self.default_transit,
        }
    }

    /// Local uptime of a parent uptime; without an estimate, assume it
    /// happened one default transit before `received_at`
    fn local_instant(&self, remote: Nanos, received_at: Nanos, estimate: Option<&ClockEstimate>) -> Nanos {
        match estimate {
            Some(e) => e.local_time_at(remote),
            None => received_at - self.default_transit,
        }
    }

    /// Running message: `elapsed` at parent time `sender_timestamp`
    pub fn apply_running(
        &mut self,
        elapsed: Nanos,
        sender_timestamp: Nanos,
        received_at: Nanos,
        estimate: Option<&ClockEstimate>,
    ) -> Reconciled {
        let transit = self.transit(sender_timestamp, received_at, estimate);
        let implied = (received_at - (elapsed + transit)) as f64;
        self.retarget(implied, received_at)
    }

    fn retarget(&mut self, implied: f64, now: Nanos) -> Reconciled {
        let outcome = match self.regime {
            Regime::Running { start, .. } => {
                let error_ns = (implied - start).round() as Nanos;
                if error_ns.abs() > RESYNC_THRESHOLD {
                    debug!("Reconciler: resync, start off by {}ms", error_ns / 1_000_000);
                    self.regime = Regime::Running {
                        start: implied,
                        target: implied,
                        last_nudge: now,
                    };
                    Reconciled::Resynced { error_ns }
                } else {
                    self.regime = Regime::Running {
                        start,
                        target: implied,
                        last_nudge: now,
                    };
                    Reconciled::Corrected { error_ns }
                }
            }
            Regime::Idle => {
                self.regime = Regime::Running {
                    start: implied,
                    target: implied,
                    last_nudge: now,
                };
                Reconciled::Started
            }
            Regime::Frozen { .. } => {
                self.regime = Regime::Running {
                    start: implied,
                    target: implied,
                    last_nudge: now,
                };
                Reconciled::Resumed
            }
        };
        self.update_cursor(now);
        outcome
    }

    /// Freeze at `anchor`. `hold` marks a scheduled stop that resumes after
    /// that long; None is a pause that waits for an explicit start.
    pub fn apply_frozen(
        &mut self,
        anchor: StopAnchor,
        hold: Option<Nanos>,
        now: Nanos,
        estimate: Option<&ClockEstimate>,
    ) -> Reconciled {
        if let Regime::Frozen { anchor: applied, .. } = self.regime {
            if applied == anchor {
                return Reconciled::Froze(FreezeOutcome::Unchanged);
            }
        }

        let current = self.display_elapsed(now);
        let gap_ns = anchor.elapsed_at_stop_ns - current;
        let slew = if gap_ns.abs() <= self.slew_threshold {
            None
        } else {
            Some(Slew::new(current, anchor.elapsed_at_stop_ns, now, self.slew_duration))
        };
        let resume_at =
            hold.map(|h| self.local_instant(anchor.master_uptime_at_stop, now, estimate) + h.max(0));

        self.regime = Regime::Frozen {
            anchor,
            hold,
            slew,
            resume_at,
        };
        self.update_cursor(now);

        match slew {
            Some(_) => {
                debug!("Reconciler: slewing {}us to anchor", gap_ns / 1_000);
                Reconciled::Froze(FreezeOutcome::Slewing { gap_ns })
            }
            None => Reconciled::Froze(FreezeOutcome::Snapped),
        }
    }

    /// Re-apply the current anchor with a fresher clock estimate
    pub fn reassert_anchor(&mut self, now: Nanos, estimate: Option<&ClockEstimate>) -> Reconciled {
        let Regime::Frozen {
            anchor,
            hold,
            slew,
            resume_at,
        } = self.regime
        else {
            return Reconciled::Ignored;
        };

        // The display target is estimate-independent; only the auto-resume
        // deadline depends on translating the parent's uptime.
        let resume_at = match (hold, estimate) {
            (Some(h), Some(e)) => Some(e.local_time_at(anchor.master_uptime_at_stop) + h.max(0)),
            _ => resume_at,
        };
        let slew = slew.filter(|s| !s.is_complete(now));
        self.regime = Regime::Frozen {
            anchor,
            hold,
            slew,
            resume_at,
        };
        Reconciled::Reasserted
    }

    /// Back to idle with elapsed zeroed and the schedule cursor cleared
    pub fn apply_reset(&mut self) -> Reconciled {
        self.regime = Regime::Idle;
        self.cursor_current = None;
        self.cursor_next = None;
        Reconciled::Reset
    }

    pub fn apply_timer_message(
        &mut self,
        msg: &TimerMessage,
        received_at: Nanos,
        estimate: Option<&ClockEstimate>,
    ) -> Reconciled {
        if let Some(events) = &msg.stop_events {
            self.set_stop_events(Schedule::from_events(events.iter().cloned()));
        }
        if msg.action == TimerAction::AddEvent {
            return Reconciled::Ignored;
        }

        let anchor = msg.stop_anchor.unwrap_or(StopAnchor {
            master_uptime_at_stop: msg.sender_timestamp,
            elapsed_at_stop_ns: msg.remaining_or_elapsed,
        });

        match msg.phase {
            TimerPhase::Idle => self.apply_reset(),
            TimerPhase::Running => {
                self.apply_running(msg.remaining_or_elapsed, msg.sender_timestamp, received_at, estimate)
            }
            TimerPhase::Paused => self.apply_frozen(anchor, None, received_at, estimate),
            TimerPhase::Stopped => {
                self.apply_frozen(anchor, Some(msg.hold_ns.unwrap_or(0)), received_at, estimate)
            }
        }
    }

    pub fn apply_playback_state(
        &mut self,
        state: &PlaybackState,
        received_at: Nanos,
        estimate: Option<&ClockEstimate>,
    ) -> Reconciled {
        if !state.is_consistent() {
            debug!("Reconciler: ignoring playback state {} with inconsistent anchor", state.seq);
            return Reconciled::Ignored;
        }
        match (state.phase, state.stop_anchor()) {
            (PlaybackPhase::Running, _) => {
                let implied = match estimate {
                    Some(e) => e.local_time_at(state.start_epoch),
                    None => received_at - from_secs_f64(state.elapsed_seconds) - self.default_transit,
                };
                self.retarget(implied as f64, received_at)
            }
            (PlaybackPhase::Paused, Some(anchor)) => self.apply_frozen(anchor, None, received_at, estimate),
            (PlaybackPhase::Idle, _) => self.apply_reset(),
            (PlaybackPhase::Paused, None) => Reconciled::Ignored,
        }
    }

    /// Advance nudging, slews, auto-resume and the schedule cursor
    pub fn tick(&mut self, now: Nanos) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        match &mut self.regime {
            Regime::Idle => {}
            Regime::Running {
                start,
                target,
                last_nudge,
            } => {
                let dt = (now - *last_nudge).max(0) as f64;
                let max_step = self.max_nudge_rate * dt;
                let step = (*target - *start).clamp(-max_step, max_step);
                *start += step;
                *last_nudge = now;
            }
            Regime::Frozen {
                anchor,
                slew,
                resume_at,
                ..
            } => {
                if slew.is_some_and(|s| s.is_complete(now)) {
                    *slew = None;
                    outcome.slew_finished = true;
                }
                if let Some(at) = *resume_at {
                    if now >= at {
                        let start = (at - anchor.elapsed_at_stop_ns) as f64;
                        self.regime = Regime::Running {
                            start,
                            target: start,
                            last_nudge: now,
                        };
                        outcome.resumed = true;
                    }
                }
            }
        }

        outcome.reached = self.update_cursor(now);
        outcome
    }

    /// Recompute current/next stop event; returns a newly reached event
    fn update_cursor(&mut self, now: Nanos) -> Option<String> {
        let elapsed = as_secs_f64(self.display_elapsed(now));
        let current = self.stop_events.current_at(elapsed).map(|e| e.id.clone());
        self.cursor_next = self.stop_events.next_after(elapsed).map(|e| e.id.clone());

        if current == self.cursor_current {
            return None;
        }
        self.cursor_current = current.clone();
        if self.is_advancing_at(now) {
            current
        } else {
            None
        }
    }

    pub fn set_stop_events(&mut self, schedule: Schedule) {
        self.stop_events = schedule;
    }

    pub fn stop_events(&self) -> &Schedule {
        &self.stop_events
    }

    pub fn display_elapsed(&self, now: Nanos) -> Nanos {
        match self.regime {
            Regime::Idle => 0,
            Regime::Running { start, .. } => ((now as f64 - start).round() as Nanos).max(0),
            Regime::Frozen {
                anchor,
                slew,
                resume_at,
                ..
            } => match resume_at {
                Some(at) if now >= at => anchor.elapsed_at_stop_ns + (now - at),
                _ => slew
                    .map(|s| s.value_at(now))
                    .unwrap_or(anchor.elapsed_at_stop_ns),
            },
        }
    }

    pub fn phase_at(&self, now: Nanos) -> TimerPhase {
        match self.regime {
            Regime::Idle => TimerPhase::Idle,
            Regime::Running { .. } => TimerPhase::Running,
            Regime::Frozen { hold: None, .. } => TimerPhase::Paused,
            Regime::Frozen {
                resume_at: Some(at), ..
            } if now >= at => TimerPhase::Running,
            Regime::Frozen { .. } => TimerPhase::Stopped,
        }
    }

    /// Anchor currently applied, if frozen
    pub fn anchor(&self) -> Option<StopAnchor> {
        match self.regime {
            Regime::Frozen { anchor, .. } => Some(anchor),
            _ => None,
        }
    }

    /// Displayed start instant while running
    pub fn start_instant(&self) -> Option<Nanos> {
        match self.regime {
            Regime::Running { start, .. } => Some(start.round() as Nanos),
            _ => None,
        }
    }

    /// Whether the display needs a ticker at `now`
    pub fn is_animating(&self, now: Nanos) -> bool {
        match self.regime {
            Regime::Idle => false,
            Regime::Running { .. } => true,
            Regime::Frozen {
                slew, resume_at, ..
            } => slew.is_some_and(|s| !s.is_complete(now)) || resume_at.is_some(),
        }
    }

    pub fn snapshot(&self, now: Nanos) -> DisplaySnapshot {
        let (slewing, hold_remaining_ns) = match self.regime {
            Regime::Frozen {
                slew, resume_at, ..
            } => (
                slew.is_some_and(|s| !s.is_complete(now)),
                resume_at.filter(|at| *at > now).map(|at| at - now),
            ),
            _ => (false, None),
        };
        DisplaySnapshot {
            phase: self.phase_at(now),
            elapsed_ns: self.display_elapsed(now),
            slewing,
            current_event_id: self.cursor_current.clone(),
            next_event_id: self.cursor_next.clone(),
            hold_remaining_ns,
        }
    }
}

impl TimerSource for PlaybackReconciler {
    fn elapsed_at(&self, uptime: Nanos) -> Nanos {
        self.display_elapsed(uptime)
    }

    fn is_advancing_at(&self, uptime: Nanos) -> bool {
        self.phase_at(uptime) == TimerPhase::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::millis;
    use crate::sync::{Event, EventKind};

    fn reconciler() -> PlaybackReconciler {
        PlaybackReconciler::new(&SyncConfig::default())
    }

    fn estimate(offset: Nanos, round_trip: Nanos) -> ClockEstimate {
        ClockEstimate {
            offset_ns: offset,
            drift: 0.0,
            last_updated: 0,
            round_trip_ns: round_trip,
            samples: 20,
        }
    }

    /// Running with start instant 0 on a zero-offset link
    fn running_from_zero() -> (PlaybackReconciler, ClockEstimate) {
        let mut rec = reconciler();
        let est = estimate(0, millis(20));
        assert_eq!(rec.apply_running(0, 0, millis(10), Some(&est)), Reconciled::Started);
        assert_eq!(rec.start_instant(), Some(0));
        (rec, est)
    }

    #[test]
    fn test_start_reconstructs_parent_start_instant() {
        // Parent clock runs 3s ahead; start stamped at parent uptime 10s,
        // received 50ms later with a 20ms one-way estimate.
        let mut rec = reconciler();
        let est = estimate(millis(3_000), millis(40));
        let mut start = TimerMessage::new(TimerAction::Start, TimerPhase::Running, 0, millis(10_000));
        start.action_seq = Some(1);
        start.state_seq = Some(1);

        let parent_start_local = millis(7_000);
        let received = parent_start_local + millis(50);
        assert_eq!(rec.apply_timer_message(&start, received, Some(&est)), Reconciled::Started);

        let reconstructed = rec.start_instant().unwrap();
        assert!((reconstructed - parent_start_local).abs() < millis(1));
        assert_eq!(rec.display_elapsed(received), millis(50));
    }

    #[test]
    fn test_start_without_estimate_uses_default_transit() {
        let mut rec = reconciler();
        rec.apply_running(millis(1_000), 0, millis(5_000), None);
        assert_eq!(rec.start_instant(), Some(millis(5_000 - 1_000 - 10)));
    }

    #[test]
    fn test_running_corrections_are_rate_limited() {
        let (mut rec, est) = running_from_zero();

        // Parent now implies a start instant 100ms later
        let outcome = rec.apply_running(millis(900), millis(1_000), millis(1_000), Some(&est));
        assert_eq!(outcome, Reconciled::Corrected { error_ns: millis(100) });
        assert_eq!(rec.start_instant(), Some(0));

        let mut now = millis(1_000);
        let mut previous = rec.display_elapsed(now);
        rec.tick(now);
        while now < millis(2_000) {
            now += millis(10);
            rec.tick(now);
            let shown = rec.display_elapsed(now);
            let advance = shown - previous;
            assert!(advance <= millis(10) && advance >= millis(10) - 600_000, "advance {}", advance);
            previous = shown;
        }
        assert!((rec.start_instant().unwrap() - millis(50)).abs() <= 1);

        while now < millis(3_500) {
            now += millis(10);
            rec.tick(now);
        }
        assert_eq!(rec.start_instant(), Some(millis(100)));
    }

    #[test]
    fn test_large_error_resyncs() {
        let (mut rec, est) = running_from_zero();
        let outcome = rec.apply_running(millis(1_000), millis(4_000), millis(4_000), Some(&est));
        assert_eq!(outcome, Reconciled::Resynced { error_ns: millis(3_000) });
        assert_eq!(rec.start_instant(), Some(millis(3_000)));
    }

    #[test]
    fn test_distant_anchor_slews() {
        let (mut rec, est) = running_from_zero();
        let anchor = StopAnchor {
            master_uptime_at_stop: millis(5_000),
            elapsed_at_stop_ns: millis(5_060),
        };

        let outcome = rec.apply_frozen(anchor, None, millis(5_000), Some(&est));
        assert_eq!(outcome, Reconciled::Froze(FreezeOutcome::Slewing { gap_ns: millis(60) }));
        assert!(outcome.is_new_freeze());
        assert_eq!(rec.phase_at(millis(5_000)), TimerPhase::Paused);
        assert_eq!(rec.display_elapsed(millis(5_000)), millis(5_000));
        assert_eq!(rec.display_elapsed(millis(5_060)), millis(5_030));
        assert!(rec.snapshot(millis(5_060)).slewing);

        // Same anchor again mid-slew: no restart
        assert_eq!(
            rec.apply_frozen(anchor, None, millis(5_070), Some(&est)),
            Reconciled::Froze(FreezeOutcome::Unchanged)
        );
        assert_eq!(rec.display_elapsed(millis(5_070)), millis(5_035));

        assert_eq!(rec.display_elapsed(millis(5_120)), millis(5_060));
        assert!(rec.tick(millis(5_120)).slew_finished);
        assert_eq!(rec.display_elapsed(millis(9_000)), millis(5_060));
        assert!(!rec.is_animating(millis(9_000)));
    }

    #[test]
    fn test_close_anchor_snaps() {
        let (mut rec, est) = running_from_zero();
        let anchor = StopAnchor {
            master_uptime_at_stop: millis(5_000),
            elapsed_at_stop_ns: millis(5_008),
        };
        assert_eq!(
            rec.apply_frozen(anchor, None, millis(5_000), Some(&est)),
            Reconciled::Froze(FreezeOutcome::Snapped)
        );
        assert_eq!(rec.display_elapsed(millis(5_000)), millis(5_008));
        assert_eq!(rec.anchor(), Some(anchor));
    }

    #[test]
    fn test_scheduled_stop_auto_resumes() {
        let (mut rec, est) = running_from_zero();
        let anchor = StopAnchor {
            master_uptime_at_stop: millis(4_000),
            elapsed_at_stop_ns: millis(4_000),
        };
        let hold = TimerMessage::new(TimerAction::Update, TimerPhase::Stopped, millis(4_000), millis(4_000))
            .with_anchor(anchor)
            .with_hold(millis(2_000));
        assert!(rec.apply_timer_message(&hold, millis(4_020), Some(&est)).is_new_freeze());
        assert_eq!(rec.phase_at(millis(5_000)), TimerPhase::Stopped);
        assert_eq!(rec.snapshot(millis(5_000)).hold_remaining_ns, Some(millis(1_000)));

        // A fresher estimate says the parent is 100ms ahead: deadline moves up
        let fresher = estimate(millis(100), millis(20));
        assert_eq!(rec.reassert_anchor(millis(5_000), Some(&fresher)), Reconciled::Reasserted);
        assert_eq!(rec.phase_at(millis(5_950)), TimerPhase::Running);

        let outcome = rec.tick(millis(5_950));
        assert!(outcome.resumed);
        assert_eq!(rec.display_elapsed(millis(6_400)), millis(4_500));
    }

    #[test]
    fn test_cursor_and_reset() {
        let (mut rec, _) = running_from_zero();
        rec.set_stop_events(Schedule::from_events(vec![
            Event::new("b", 3.0, EventKind::Stop).with_duration(2.0),
            Event::new("a", 1.0, EventKind::Stop),
        ]));

        assert_eq!(rec.tick(millis(500)).reached, None);
        assert_eq!(rec.snapshot(millis(500)).next_event_id.as_deref(), Some("a"));

        assert_eq!(rec.tick(millis(1_500)).reached.as_deref(), Some("a"));
        assert_eq!(rec.tick(millis(1_600)).reached, None);
        let snap = rec.snapshot(millis(1_600));
        assert_eq!(snap.current_event_id.as_deref(), Some("a"));
        assert_eq!(snap.next_event_id.as_deref(), Some("b"));

        assert_eq!(rec.apply_reset(), Reconciled::Reset);
        let snap = rec.snapshot(millis(1_700));
        assert_eq!(snap.phase, TimerPhase::Idle);
        assert_eq!(snap.elapsed_ns, 0);
        assert_eq!(snap.current_event_id, None);
        assert_eq!(snap.next_event_id, None);
    }

    #[test]
    fn test_playback_state_snapshots() {
        let mut rec = reconciler();
        let est = estimate(millis(1_000), millis(20));

        let running = PlaybackState::running(3, millis(11_000), 2.0, "sheet", 1);
        assert_eq!(rec.apply_playback_state(&running, millis(12_000), Some(&est)), Reconciled::Started);
        assert_eq!(rec.start_instant(), Some(millis(10_000)));

        let anchor = StopAnchor {
            master_uptime_at_stop: millis(14_000),
            elapsed_at_stop_ns: millis(3_000),
        };
        let paused = PlaybackState::frozen(PlaybackPhase::Paused, 4, anchor, "sheet", 1);
        assert!(rec.apply_playback_state(&paused, millis(13_000), Some(&est)).is_new_freeze());
        assert_eq!(
            rec.apply_playback_state(&paused, millis(13_500), Some(&est)),
            Reconciled::Froze(FreezeOutcome::Unchanged)
        );

        let mut broken = running.clone();
        broken.elapsed_at_stop_ns = Some(1);
        assert_eq!(rec.apply_playback_state(&broken, millis(14_000), None), Reconciled::Ignored);
    }

    #[test]
    fn test_timer_source_view() {
        let (rec, _) = running_from_zero();
        assert!(rec.is_advancing_at(millis(100)));
        assert_eq!(rec.elapsed_at(millis(250)), millis(250));
        assert!(!reconciler().is_advancing_at(0));
    }
}
