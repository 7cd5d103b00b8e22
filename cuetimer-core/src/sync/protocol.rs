//! Wire Messages
//!
//! Every frame on every transport is one JSON-encoded [`WireMessage`].
//! Field names are camelCase on the wire so that native peers can decode
//! them without a translation layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Nanos;

/// Which side of the link a peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Drives the timer and owns every sequence counter
    Parent,
    /// Replicates the parent's timer
    Child,
}

impl Role {
    pub fn flipped(self) -> Self {
        match self {
            Role::Parent => Role::Child,
            Role::Child => Role::Parent,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Parent => write!(f, "parent"),
            Role::Child => write!(f, "child"),
        }
    }
}

// ============================================================================
// Clock sync
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeaconKind {
    Beacon,
    Echo,
}

/// One leg of a four-timestamp exchange.
///
/// The originator fills `t_sender_send`; the peer fills the two receiver
/// stamps and returns it as an echo; the originator stamps `t_sender_recv`
/// on arrival. Each timestamp is on the clock of the device that took it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconEnvelope {
    pub kind: BeaconKind,
    /// Originator of the exchange (unchanged on the echo)
    #[serde(rename = "senderID")]
    pub sender_id: Uuid,
    #[serde(rename = "targetID", default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Uuid>,
    pub seq: u64,
    pub t_sender_send: Nanos,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_receiver_recv: Option<Nanos>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_receiver_echo_send: Option<Nanos>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_sender_recv: Option<Nanos>,
}

impl BeaconEnvelope {
    pub fn beacon(sender_id: Uuid, target_id: Option<Uuid>, seq: u64, now: Nanos) -> Self {
        Self {
            kind: BeaconKind::Beacon,
            sender_id,
            target_id,
            seq,
            t_sender_send: now,
            t_receiver_recv: None,
            t_receiver_echo_send: None,
            t_sender_recv: None,
        }
    }

    /// Turn a received beacon into its echo
    pub fn into_echo(mut self, received_at: Nanos, echo_sent_at: Nanos) -> Self {
        self.kind = BeaconKind::Echo;
        self.t_receiver_recv = Some(received_at);
        self.t_receiver_echo_send = Some(echo_sent_at);
        self
    }
}

// ============================================================================
// Timer replication
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimerAction {
    Start,
    Pause,
    Reset,
    Update,
    AddEvent,
    EndCueSheet,
}

impl TimerAction {
    /// Discrete, sequence-numbered actions
    pub fn is_control(self) -> bool {
        matches!(
            self,
            TimerAction::Start | TimerAction::Pause | TimerAction::Reset | TimerAction::EndCueSheet
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerPhase {
    Idle,
    Running,
    Paused,
    /// Held at an in-timeline stop event; resumes on its own
    Stopped,
}

impl TimerPhase {
    pub fn is_frozen(self) -> bool {
        matches!(self, TimerPhase::Paused | TimerPhase::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Stop,
    Cue,
    Restart,
}

/// A scheduled point on the timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    /// Seconds of elapsed time
    pub fire_time: f64,
    pub kind: EventKind,
    /// Hold length in seconds (stop events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl Event {
    pub fn new(id: impl Into<String>, fire_time: f64, kind: EventKind) -> Self {
        Self {
            id: id.into(),
            fire_time,
            kind,
            duration: None,
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }
}

/// A frozen timer: the parent's uptime at the freeze and the elapsed value
/// it froze at. Identical no matter when it is received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopAnchor {
    pub master_uptime_at_stop: Nanos,
    pub elapsed_at_stop_ns: Nanos,
}

/// Control action or continuous status from the parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerMessage {
    pub action: TimerAction,
    /// Parent uptime when the message was built
    pub sender_timestamp: Nanos,
    pub phase: TimerPhase,
    /// Elapsed nanoseconds at `sender_timestamp`
    pub remaining_or_elapsed: Nanos,
    /// Absent lists leave the receiver's cached list untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_events: Option<Vec<Event>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cue_events: Option<Vec<Event>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_events: Option<Vec<Event>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_now: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_label: Option<String>,
    #[serde(rename = "sheetID", default, skip_serializing_if = "Option::is_none")]
    pub sheet_id: Option<String>,
    /// Present when `phase` is paused or stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_anchor: Option<StopAnchor>,
    /// Hold length of the stop event currently holding the timer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_ns: Option<Nanos>,
}

impl TimerMessage {
    pub fn new(action: TimerAction, phase: TimerPhase, elapsed: Nanos, sender_timestamp: Nanos) -> Self {
        Self {
            action,
            sender_timestamp,
            phase,
            remaining_or_elapsed: elapsed,
            stop_events: None,
            cue_events: None,
            restart_events: None,
            action_seq: None,
            state_seq: None,
            flash_now: None,
            sheet_label: None,
            sheet_id: None,
            stop_anchor: None,
            hold_ns: None,
        }
    }

    pub fn with_anchor(mut self, anchor: StopAnchor) -> Self {
        self.stop_anchor = Some(anchor);
        self
    }

    pub fn with_hold(mut self, hold_ns: Nanos) -> Self {
        self.hold_ns = Some(hold_ns);
        self
    }

    /// Attach an event list, replacing the receiver's list of that kind
    pub fn with_events(mut self, kind: EventKind, events: Vec<Event>) -> Self {
        match kind {
            EventKind::Stop => self.stop_events = Some(events),
            EventKind::Cue => self.cue_events = Some(events),
            EventKind::Restart => self.restart_events = Some(events),
        }
        self
    }

    pub fn with_sheet(mut self, id: impl Into<String>, label: impl Into<String>) -> Self {
        self.sheet_id = Some(id.into());
        self.sheet_label = Some(label.into());
        self
    }

    pub fn is_control(&self) -> bool {
        self.action.is_control()
    }

    /// Missing `stateSeq` (older senders) counts as zero
    pub fn effective_state_seq(&self) -> u64 {
        self.state_seq.unwrap_or(0)
    }
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackPhase {
    Idle,
    Running,
    Paused,
}

/// Authoritative playback snapshot.
///
/// The stop anchor fields are present exactly when the phase is not
/// running; the constructors are the only way this crate builds one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub phase: PlaybackPhase,
    pub seq: u64,
    /// Parent uptime of the virtual start instant (running only)
    pub start_epoch: Nanos,
    pub elapsed_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_uptime_at_stop: Option<Nanos>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_at_stop_ns: Option<Nanos>,
    #[serde(rename = "currentEventID", default, skip_serializing_if = "Option::is_none")]
    pub current_event_id: Option<String>,
    #[serde(rename = "nextEventID", default, skip_serializing_if = "Option::is_none")]
    pub next_event_id: Option<String>,
    #[serde(rename = "sheetID")]
    pub sheet_id: String,
    pub revision: u64,
}

impl PlaybackState {
    pub fn running(seq: u64, start_epoch: Nanos, elapsed_seconds: f64, sheet_id: impl Into<String>, revision: u64) -> Self {
        Self {
            phase: PlaybackPhase::Running,
            seq,
            start_epoch,
            elapsed_seconds,
            master_uptime_at_stop: None,
            elapsed_at_stop_ns: None,
            current_event_id: None,
            next_event_id: None,
            sheet_id: sheet_id.into(),
            revision,
        }
    }

    /// Idle or paused snapshot; always carries the anchor
    pub fn frozen(
        phase: PlaybackPhase,
        seq: u64,
        anchor: StopAnchor,
        sheet_id: impl Into<String>,
        revision: u64,
    ) -> Self {
        let phase = if phase == PlaybackPhase::Running {
            PlaybackPhase::Paused
        } else {
            phase
        };
        Self {
            phase,
            seq,
            start_epoch: 0,
            elapsed_seconds: crate::clock::as_secs_f64(anchor.elapsed_at_stop_ns),
            master_uptime_at_stop: Some(anchor.master_uptime_at_stop),
            elapsed_at_stop_ns: Some(anchor.elapsed_at_stop_ns),
            current_event_id: None,
            next_event_id: None,
            sheet_id: sheet_id.into(),
            revision,
        }
    }

    pub fn with_cursor(mut self, current: Option<String>, next: Option<String>) -> Self {
        self.current_event_id = current;
        self.next_event_id = next;
        self
    }

    pub fn stop_anchor(&self) -> Option<StopAnchor> {
        Some(StopAnchor {
            master_uptime_at_stop: self.master_uptime_at_stop?,
            elapsed_at_stop_ns: self.elapsed_at_stop_ns?,
        })
    }

    /// Anchor present iff not running
    pub fn is_consistent(&self) -> bool {
        let has_anchor = self.stop_anchor().is_some();
        let partial = self.master_uptime_at_stop.is_some() != self.elapsed_at_stop_ns.is_some();
        !partial && (has_anchor == (self.phase != PlaybackPhase::Running))
    }
}

/// A complete cue sheet as loaded on the parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CueSheet {
    pub id: String,
    pub label: String,
    pub revision: u64,
    #[serde(default)]
    pub stop_events: Vec<Event>,
    #[serde(default)]
    pub cue_events: Vec<Event>,
    #[serde(default)]
    pub restart_events: Vec<Event>,
}

impl CueSheet {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            revision: 0,
            stop_events: Vec::new(),
            cue_events: Vec::new(),
            restart_events: Vec::new(),
        }
    }

    pub fn events(&self, kind: EventKind) -> &[Event] {
        match kind {
            EventKind::Stop => &self.stop_events,
            EventKind::Cue => &self.cue_events,
            EventKind::Restart => &self.restart_events,
        }
    }
}

/// An event the parent's timeline has passed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CueEvent {
    #[serde(rename = "eventID")]
    pub event_id: String,
    pub kind: EventKind,
    pub fired_at_elapsed_ns: Nanos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum SyncMessage {
    SheetSnapshot(CueSheet),
    PlaybackState(PlaybackState),
    CueEvent(CueEvent),
}

/// Snapshot-carrying envelope; `seq` strictly increases per sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub seq: i64,
    pub message: SyncMessage,
}

// ============================================================================
// Link housekeeping
// ============================================================================

/// Receiver's acknowledgement of a control action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlAck {
    pub action_seq: u64,
    #[serde(rename = "senderID")]
    pub sender_id: Uuid,
}

/// First frame on every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    #[serde(rename = "peerID")]
    pub peer_id: Uuid,
    pub role: Role,
    pub display_name: String,
    /// Changes whenever the sender's sequence counters restart
    pub epoch: Uuid,
}

/// Everything that travels over a link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireMessage {
    Hello(Hello),
    Beacon(BeaconEnvelope),
    Timer(TimerMessage),
    Sync(SyncEnvelope),
    Ack(ControlAck),
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Hello(_) => "hello",
            WireMessage::Beacon(_) => "beacon",
            WireMessage::Timer(_) => "timer",
            WireMessage::Sync(_) => "sync",
            WireMessage::Ack(_) => "ack",
        }
    }
}
