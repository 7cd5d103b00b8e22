//! Replication Protocol
//!
//! The parent is the single writer of timer truth. [`ControlSequencer`]
//! stamps outbound messages; [`ReplicationReceiver`] decides, per inbound
//! message, whether it may be applied. Control actions are totally ordered
//! by `actionSeq`; continuous updates are ordered relative to them by
//! `stateSeq`; sync envelopes by their own `seq`.
//!
//! Receivers tolerate duplication and reordering. Anything stale is
//! dropped quietly: that is the normal case on the notification channel.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::{
    ControlAck, CueSheet, EventKind, StopAnchor, SyncEnvelope, SyncMessage, TimerAction,
    TimerMessage, TimerPhase,
};
use crate::clock::{nanos, Nanos};
use crate::playback::Schedule;

// ============================================================================
// Sender side
// ============================================================================

/// Owns the parent's sequence counters
#[derive(Debug, Default)]
pub struct ControlSequencer {
    last_action_seq: u64,
    last_sync_seq: i64,
}

impl ControlSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next `actionSeq`
    pub fn next_control(&mut self) -> u64 {
        self.last_action_seq += 1;
        self.last_action_seq
    }

    /// `stateSeq` for a continuous update: the last control it is consistent with
    pub fn stamp_update(&self) -> u64 {
        self.last_action_seq
    }

    /// Fill in the sequence fields of an outbound message
    pub fn stamp(&mut self, msg: &mut TimerMessage) {
        if msg.is_control() {
            let seq = self.next_control();
            msg.action_seq = Some(seq);
            msg.state_seq = Some(seq);
        } else {
            msg.action_seq = None;
            msg.state_seq = Some(self.stamp_update());
        }
    }

    pub fn next_sync_seq(&mut self) -> i64 {
        self.last_sync_seq += 1;
        self.last_sync_seq
    }

    pub fn last_action_seq(&self) -> u64 {
        self.last_action_seq
    }

    /// New epoch: counters restart from zero
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// Receiver side
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// `actionSeq` equal to the last applied control
    DuplicateControl,
    /// `actionSeq` below the last applied control
    StaleControl,
    /// Update whose `stateSeq` predates the last applied control
    PredatesControl,
    /// Running update inside the quench window
    Quenched,
    /// Update older than one already applied in the same epoch
    Superseded,
    /// Envelope `seq` not above the last received
    StaleEnvelope,
    /// Control action without an `actionSeq`
    MissingSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    ApplyControl { action_seq: u64 },
    ApplyUpdate,
    ApplyEnvelope { seq: i64 },
    Drop(DropReason),
}

impl Verdict {
    pub fn is_applied(&self) -> bool {
        !matches!(self, Verdict::Drop(_))
    }
}

/// The receiver's view of the parent's timer, built only from applied messages
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplicaState {
    pub phase: Option<TimerPhase>,
    pub elapsed_ns: Nanos,
    pub sender_timestamp: Nanos,
    pub stop_anchor: Option<StopAnchor>,
    pub hold_ns: Option<Nanos>,
    pub stop_events: Schedule,
    pub cue_events: Schedule,
    pub restart_events: Schedule,
    pub sheet_id: Option<String>,
    pub sheet_label: Option<String>,
    pub sheet_revision: u64,
    pub flash_requested: bool,
}

impl ReplicaState {
    fn apply(&mut self, msg: &TimerMessage) {
        if msg.action == TimerAction::EndCueSheet {
            self.stop_events.clear();
            self.cue_events.clear();
            self.restart_events.clear();
            self.sheet_id = None;
            self.sheet_label = None;
        }

        // Event edits never move the playhead
        if msg.action != TimerAction::AddEvent {
            self.phase = Some(msg.phase);
            self.elapsed_ns = msg.remaining_or_elapsed;
            self.sender_timestamp = msg.sender_timestamp;
            self.stop_anchor = msg.stop_anchor;
            self.hold_ns = msg.hold_ns;
        }

        if let Some(events) = &msg.stop_events {
            self.stop_events = Schedule::from_events(events.iter().cloned());
        }
        if let Some(events) = &msg.cue_events {
            self.cue_events = Schedule::from_events(events.iter().cloned());
        }
        if let Some(events) = &msg.restart_events {
            self.restart_events = Schedule::from_events(events.iter().cloned());
        }
        if msg.sheet_id.is_some() {
            self.sheet_id = msg.sheet_id.clone();
        }
        if msg.sheet_label.is_some() {
            self.sheet_label = msg.sheet_label.clone();
        }
        self.flash_requested = msg.flash_now.unwrap_or(false);
    }

    fn apply_sheet(&mut self, sheet: &CueSheet) {
        self.stop_events = Schedule::from_events(sheet.stop_events.iter().cloned());
        self.cue_events = Schedule::from_events(sheet.cue_events.iter().cloned());
        self.restart_events = Schedule::from_events(sheet.restart_events.iter().cloned());
        self.sheet_id = Some(sheet.id.clone());
        self.sheet_label = Some(sheet.label.clone());
        self.sheet_revision = sheet.revision;
    }

    pub fn schedule(&self, kind: EventKind) -> &Schedule {
        match kind {
            EventKind::Stop => &self.stop_events,
            EventKind::Cue => &self.cue_events,
            EventKind::Restart => &self.restart_events,
        }
    }
}

/// Validates and applies inbound timer messages and sync envelopes
#[derive(Debug)]
pub struct ReplicationReceiver {
    quench_window: Nanos,
    last_applied_control_seq: u64,
    quench_until: Option<Nanos>,
    /// Last applied continuous update, replayed over a control it postdates
    last_update: Option<TimerMessage>,
    last_sync_seq: Option<i64>,
    replica: ReplicaState,
    dropped: u64,
}

impl ReplicationReceiver {
    pub fn new(quench_window: Duration) -> Self {
        Self {
            quench_window: nanos(quench_window),
            last_applied_control_seq: 0,
            quench_until: None,
            last_update: None,
            last_sync_seq: None,
            replica: ReplicaState::default(),
            dropped: 0,
        }
    }

    /// Decide whether `msg` may be applied and, if so, fold it into the replica
    pub fn accept_timer(&mut self, msg: &TimerMessage, now: Nanos) -> Verdict {
        let verdict = self.classify(msg, now);
        match verdict {
            Verdict::ApplyControl { action_seq } => {
                self.last_applied_control_seq = action_seq;
                self.quench_until = Some(now + self.quench_window);
                self.replica.apply(msg);
                // An update stamped at or after this control already reflects it
                if let Some(update) = self.update_covering(action_seq) {
                    debug!("Replication: control {} arrived late, keeping newer update", action_seq);
                    let update = update.clone();
                    self.replica.apply(&update);
                }
            }
            Verdict::ApplyUpdate => {
                if msg.action == TimerAction::Update {
                    self.last_update = Some(msg.clone());
                }
                self.replica.apply(msg);
            }
            Verdict::Drop(reason) => {
                self.dropped += 1;
                debug!("Replication: dropped {:?} ({:?})", msg.action, reason);
            }
            Verdict::ApplyEnvelope { .. } => {}
        }
        verdict
    }

    fn classify(&self, msg: &TimerMessage, now: Nanos) -> Verdict {
        if msg.is_control() {
            let Some(seq) = msg.action_seq else {
                return Verdict::Drop(DropReason::MissingSequence);
            };
            return if seq == self.last_applied_control_seq {
                Verdict::Drop(DropReason::DuplicateControl)
            } else if seq < self.last_applied_control_seq {
                Verdict::Drop(DropReason::StaleControl)
            } else {
                Verdict::ApplyControl { action_seq: seq }
            };
        }

        let state_seq = msg.effective_state_seq();
        if state_seq < self.last_applied_control_seq {
            return Verdict::Drop(DropReason::PredatesControl);
        }
        if msg.action == TimerAction::Update {
            if msg.phase == TimerPhase::Running {
                if let Some(until) = self.quench_until {
                    if now < until {
                        return Verdict::Drop(DropReason::Quenched);
                    }
                }
            }
            if let Some(last) = &self.last_update {
                if (state_seq, msg.sender_timestamp) < (last.effective_state_seq(), last.sender_timestamp) {
                    return Verdict::Drop(DropReason::Superseded);
                }
            }
        }
        Verdict::ApplyUpdate
    }

    /// The applied update stamped at or after control `action_seq`, if any
    pub fn update_covering(&self, action_seq: u64) -> Option<&TimerMessage> {
        self.last_update
            .as_ref()
            .filter(|update| update.effective_state_seq() >= action_seq)
    }

    /// Envelopes carry full snapshots: anything not newer is dropped
    pub fn accept_envelope(&mut self, envelope: &SyncEnvelope) -> Verdict {
        if let Some(last) = self.last_sync_seq {
            if envelope.seq <= last {
                self.dropped += 1;
                debug!("Replication: dropped envelope {} (last {})", envelope.seq, last);
                return Verdict::Drop(DropReason::StaleEnvelope);
            }
        }
        self.last_sync_seq = Some(envelope.seq);
        if let SyncMessage::SheetSnapshot(sheet) = &envelope.message {
            self.replica.apply_sheet(sheet);
        }
        Verdict::ApplyEnvelope { seq: envelope.seq }
    }

    /// Acknowledgement for a control action, whether or not it was applied,
    /// so the sender stops retransmitting duplicates too.
    pub fn ack_for(&self, msg: &TimerMessage, local_id: Uuid) -> Option<ControlAck> {
        if !msg.is_control() {
            return None;
        }
        Some(ControlAck {
            action_seq: msg.action_seq?,
            sender_id: local_id,
        })
    }

    pub fn replica(&self) -> &ReplicaState {
        &self.replica
    }

    pub fn last_applied_control_seq(&self) -> u64 {
        self.last_applied_control_seq
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// New epoch: sequence numbers from before must never be compared
    /// against new ones.
    pub fn reset(&mut self) {
        self.last_applied_control_seq = 0;
        self.quench_until = None;
        self.last_update = None;
        self.last_sync_seq = None;
        self.replica = ReplicaState::default();
    }
}

// ============================================================================
// Retransmission
// ============================================================================

#[derive(Debug)]
struct PendingControl {
    message: TimerMessage,
    next_at: Nanos,
    attempts: u32,
}

/// Unacknowledged control actions sent over the notification channel
#[derive(Debug)]
pub struct RetransmitQueue {
    pending: BTreeMap<u64, PendingControl>,
    interval: Nanos,
    max_attempts: u32,
}

impl RetransmitQueue {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            pending: BTreeMap::new(),
            interval: nanos(interval),
            max_attempts,
        }
    }

    /// Start tracking a control message that was just sent
    pub fn track(&mut self, message: TimerMessage, now: Nanos) {
        let Some(seq) = message.action_seq else {
            return;
        };
        self.pending.insert(
            seq,
            PendingControl {
                message,
                next_at: now + self.interval,
                attempts: 0,
            },
        );
    }

    /// An ack for `n` covers every control up to and including `n`
    pub fn acknowledge(&mut self, action_seq: u64) -> usize {
        let before = self.pending.len();
        self.pending = match action_seq.checked_add(1) {
            Some(next) => self.pending.split_off(&next),
            None => BTreeMap::new(),
        };
        before - self.pending.len()
    }

    /// Messages due for resend; entries that exhausted their attempts are dropped
    pub fn due(&mut self, now: Nanos) -> Vec<TimerMessage> {
        let mut out = Vec::new();
        let mut exhausted = Vec::new();
        for (seq, pending) in self.pending.iter_mut() {
            if pending.next_at > now {
                continue;
            }
            out.push(pending.message.clone());
            pending.attempts += 1;
            pending.next_at = now + self.interval;
            if pending.attempts >= self.max_attempts {
                exhausted.push(*seq);
            }
        }
        for seq in exhausted {
            warn!("Replication: control {} never acknowledged, giving up", seq);
            self.pending.remove(&seq);
        }
        out
    }

    /// Earliest pending resend
    pub fn next_due(&self) -> Option<Nanos> {
        self.pending.values().map(|p| p.next_at).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::millis;
    use crate::sync::Event;

    const QUENCH: Duration = Duration::from_millis(250);

    fn control(seq: u64, action: TimerAction, phase: TimerPhase, elapsed: Nanos, ts: Nanos) -> TimerMessage {
        let mut msg = TimerMessage::new(action, phase, elapsed, ts);
        msg.action_seq = Some(seq);
        msg.state_seq = Some(seq);
        msg
    }

    fn update(state_seq: u64, phase: TimerPhase, elapsed: Nanos, ts: Nanos) -> TimerMessage {
        let mut msg = TimerMessage::new(TimerAction::Update, phase, elapsed, ts);
        msg.state_seq = Some(state_seq);
        msg
    }

    /// Fields that define the applied timer state
    fn projection(rx: &ReplicationReceiver) -> (Option<TimerPhase>, Nanos, Option<StopAnchor>, u64) {
        let r = rx.replica();
        (r.phase, r.elapsed_ns, r.stop_anchor, rx.last_applied_control_seq())
    }

    #[test]
    fn test_sequencer_stamps() {
        let mut seq = ControlSequencer::new();
        let mut start = TimerMessage::new(TimerAction::Start, TimerPhase::Running, 0, 0);
        seq.stamp(&mut start);
        assert_eq!((start.action_seq, start.state_seq), (Some(1), Some(1)));

        let mut tick = TimerMessage::new(TimerAction::Update, TimerPhase::Running, 10, 10);
        seq.stamp(&mut tick);
        assert_eq!((tick.action_seq, tick.state_seq), (None, Some(1)));

        let mut pause = TimerMessage::new(TimerAction::Pause, TimerPhase::Paused, 20, 20);
        seq.stamp(&mut pause);
        assert_eq!(pause.action_seq, Some(2));
        assert_eq!(seq.stamp_update(), 2);

        assert_eq!(seq.next_sync_seq(), 1);
        assert_eq!(seq.next_sync_seq(), 2);
        seq.reset();
        assert_eq!(seq.next_control(), 1);
    }

    #[test]
    fn test_quench_window() {
        let mut rx = ReplicationReceiver::new(QUENCH);
        let pause = control(5, TimerAction::Pause, TimerPhase::Paused, millis(3_000), 0);
        assert_eq!(rx.accept_timer(&pause, 0), Verdict::ApplyControl { action_seq: 5 });

        let late = update(5, TimerPhase::Running, millis(3_010), millis(1));
        assert_eq!(rx.accept_timer(&late, millis(100)), Verdict::Drop(DropReason::Quenched));
        assert_eq!(rx.replica().phase, Some(TimerPhase::Paused));

        assert_eq!(rx.accept_timer(&late, millis(250)), Verdict::ApplyUpdate);
        assert_eq!(rx.replica().phase, Some(TimerPhase::Running));
    }

    #[test]
    fn test_quench_only_affects_running_updates() {
        let mut rx = ReplicationReceiver::new(QUENCH);
        rx.accept_timer(&control(1, TimerAction::Pause, TimerPhase::Paused, 0, 0), 0);
        let paused = update(1, TimerPhase::Paused, 0, millis(1));
        assert_eq!(rx.accept_timer(&paused, millis(10)), Verdict::ApplyUpdate);
    }

    #[test]
    fn test_control_idempotence() {
        let mut rx = ReplicationReceiver::new(QUENCH);
        let start = control(1, TimerAction::Start, TimerPhase::Running, 0, 0);
        assert!(rx.accept_timer(&start, 0).is_applied());
        let once = rx.replica().clone();

        assert_eq!(rx.accept_timer(&start, millis(400)), Verdict::Drop(DropReason::DuplicateControl));
        assert_eq!(rx.replica(), &once);
        assert_eq!(rx.dropped_count(), 1);
    }

    #[test]
    fn test_stale_control_and_predating_update() {
        let mut rx = ReplicationReceiver::new(QUENCH);
        rx.accept_timer(&control(3, TimerAction::Pause, TimerPhase::Paused, 0, 0), 0);
        assert_eq!(
            rx.accept_timer(&control(2, TimerAction::Start, TimerPhase::Running, 0, 0), 0),
            Verdict::Drop(DropReason::StaleControl)
        );
        assert_eq!(
            rx.accept_timer(&update(2, TimerPhase::Running, 0, 0), millis(900)),
            Verdict::Drop(DropReason::PredatesControl)
        );
    }

    #[test]
    fn test_any_delivery_order_converges() {
        let anchor = StopAnchor {
            master_uptime_at_stop: millis(1_000),
            elapsed_at_stop_ns: millis(1_000),
        };
        let messages = vec![
            control(1, TimerAction::Start, TimerPhase::Running, 0, 0),
            update(1, TimerPhase::Running, millis(500), millis(500)),
            control(2, TimerAction::Pause, TimerPhase::Paused, millis(1_000), millis(1_000)).with_anchor(anchor),
            update(2, TimerPhase::Paused, millis(1_000), millis(1_500)).with_anchor(anchor),
        ];

        let mut in_order = ReplicationReceiver::new(QUENCH);
        for (i, msg) in messages.iter().enumerate() {
            in_order.accept_timer(msg, millis(1_000) * i as Nanos);
        }
        let expected = projection(&in_order);
        assert_eq!(expected.0, Some(TimerPhase::Paused));

        let orders: [&[usize]; 4] = [
            &[3, 2, 1, 0],
            &[2, 0, 3, 1, 2, 0],
            &[1, 3, 0, 2, 3],
            &[0, 2, 2, 1, 3, 1, 0],
        ];
        for order in orders {
            let mut rx = ReplicationReceiver::new(QUENCH);
            for (i, idx) in order.iter().enumerate() {
                rx.accept_timer(&messages[*idx], millis(1_000) * i as Nanos);
            }
            assert_eq!(projection(&rx), expected, "order {:?}", order);
        }
    }

    #[test]
    fn test_update_ahead_of_its_control_wins_either_way() {
        let anchor = StopAnchor {
            master_uptime_at_stop: millis(2_000),
            elapsed_at_stop_ns: millis(2_000),
        };
        let start = control(1, TimerAction::Start, TimerPhase::Running, 0, 0);
        let hold = update(1, TimerPhase::Stopped, millis(2_000), millis(2_000))
            .with_anchor(anchor)
            .with_hold(millis(5_000));

        let mut in_order = ReplicationReceiver::new(QUENCH);
        in_order.accept_timer(&start, 0);
        assert_eq!(in_order.accept_timer(&hold, millis(1_000)), Verdict::ApplyUpdate);

        let mut reversed = ReplicationReceiver::new(QUENCH);
        assert_eq!(reversed.accept_timer(&hold, 0), Verdict::ApplyUpdate);
        assert_eq!(
            reversed.accept_timer(&start, millis(1_000)),
            Verdict::ApplyControl { action_seq: 1 }
        );

        let expected = (Some(TimerPhase::Stopped), millis(2_000), Some(anchor), 1);
        assert_eq!(projection(&in_order), expected);
        assert_eq!(projection(&reversed), expected);
        assert_eq!(reversed.replica().hold_ns, Some(millis(5_000)));
        assert_eq!(reversed.update_covering(1), Some(&hold));
        assert_eq!(in_order.update_covering(2), None);

        // A later control is not overridden by the older update
        let pause = control(2, TimerAction::Pause, TimerPhase::Paused, millis(2_500), millis(2_500));
        reversed.accept_timer(&pause, millis(2_000));
        assert_eq!(reversed.replica().phase, Some(TimerPhase::Paused));
        assert_eq!(reversed.replica().hold_ns, None);
    }

    #[test]
    fn test_event_lists_are_sparse() {
        let mut rx = ReplicationReceiver::new(QUENCH);
        let stops = vec![Event::new("b", 20.0, EventKind::Stop), Event::new("a", 10.0, EventKind::Stop)];
        let cues = vec![Event::new("c", 5.0, EventKind::Cue)];
        let first = update(0, TimerPhase::Idle, 0, 0)
            .with_events(EventKind::Stop, stops)
            .with_events(EventKind::Cue, cues);
        rx.accept_timer(&first, 0);
        assert_eq!(rx.replica().stop_events.len(), 2);
        assert_eq!(rx.replica().stop_events.events()[0].id, "a");

        let second = update(0, TimerPhase::Idle, 0, 1).with_events(EventKind::Cue, vec![]);
        rx.accept_timer(&second, 1);
        assert_eq!(rx.replica().stop_events.len(), 2);
        assert!(rx.replica().cue_events.is_empty());
    }

    #[test]
    fn test_add_event_keeps_playhead() {
        let mut rx = ReplicationReceiver::new(QUENCH);
        rx.accept_timer(&control(1, TimerAction::Start, TimerPhase::Running, 0, 0), 0);
        let mut add = TimerMessage::new(TimerAction::AddEvent, TimerPhase::Idle, 0, 5)
            .with_events(EventKind::Restart, vec![Event::new("r", 1.0, EventKind::Restart)]);
        add.state_seq = Some(1);
        assert_eq!(rx.accept_timer(&add, millis(10)), Verdict::ApplyUpdate);
        assert_eq!(rx.replica().phase, Some(TimerPhase::Running));
        assert_eq!(rx.replica().restart_events.len(), 1);
    }

    #[test]
    fn test_envelope_staleness() {
        let mut rx = ReplicationReceiver::new(QUENCH);
        let env = |seq| SyncEnvelope {
            seq,
            message: SyncMessage::SheetSnapshot(CueSheet::new(format!("sheet-{}", seq), "Show")),
        };
        assert_eq!(rx.accept_envelope(&env(3)), Verdict::ApplyEnvelope { seq: 3 });
        assert_eq!(rx.replica().sheet_id.as_deref(), Some("sheet-3"));
        assert_eq!(rx.accept_envelope(&env(3)), Verdict::Drop(DropReason::StaleEnvelope));
        assert_eq!(rx.accept_envelope(&env(2)), Verdict::Drop(DropReason::StaleEnvelope));
        assert_eq!(rx.accept_envelope(&env(4)), Verdict::ApplyEnvelope { seq: 4 });

        rx.reset();
        assert_eq!(rx.accept_envelope(&env(1)), Verdict::ApplyEnvelope { seq: 1 });
    }

    #[test]
    fn test_reset_starts_new_epoch() {
        let mut rx = ReplicationReceiver::new(QUENCH);
        rx.accept_timer(&control(9, TimerAction::Start, TimerPhase::Running, 0, 0), 0);
        rx.reset();
        assert_eq!(
            rx.accept_timer(&control(1, TimerAction::Start, TimerPhase::Running, 0, 0), millis(5)),
            Verdict::ApplyControl { action_seq: 1 }
        );
    }

    #[test]
    fn test_ack_covers_duplicates() {
        let rx = ReplicationReceiver::new(QUENCH);
        let id = Uuid::new_v4();
        let start = control(4, TimerAction::Start, TimerPhase::Running, 0, 0);
        assert_eq!(rx.ack_for(&start, id), Some(ControlAck { action_seq: 4, sender_id: id }));
        assert_eq!(rx.ack_for(&update(4, TimerPhase::Running, 0, 0), id), None);
    }

    #[test]
    fn test_retransmit_queue() {
        let mut queue = RetransmitQueue::new(Duration::from_millis(150), 8);
        for seq in 1..=3 {
            queue.track(control(seq, TimerAction::Start, TimerPhase::Running, 0, 0), 0);
        }
        assert!(queue.due(millis(149)).is_empty());
        assert_eq!(queue.due(millis(150)).len(), 3);
        assert_eq!(queue.next_due(), Some(millis(300)));

        assert_eq!(queue.acknowledge(2), 2);
        assert_eq!(queue.len(), 1);

        let mut sends = 1;
        let mut now = millis(300);
        while !queue.is_empty() {
            sends += queue.due(now).len();
            now += millis(150);
        }
        assert_eq!(sends, 8);
    }

    #[test]
    fn test_ack_at_max_seq_clears_queue() {
        let mut queue = RetransmitQueue::new(Duration::from_millis(150), 8);
        queue.track(control(7, TimerAction::Start, TimerPhase::Running, 0, 0), 0);
        queue.track(control(u64::MAX, TimerAction::Pause, TimerPhase::Paused, 0, 0), 0);
        assert_eq!(queue.acknowledge(u64::MAX), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.acknowledge(u64::MAX), 0);
    }
}
