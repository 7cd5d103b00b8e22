//! FFI types exposed via uniffi

use crate::clock::{as_secs_f64, Nanos, NANOS_PER_MILLI};
use crate::network::{FailureCause, LinkError, LinkStatus};
use crate::playback::DisplaySnapshot;
use crate::session::{Diagnostics, SessionError};
use crate::sync::{
    CueSheet, Event, EventKind, Peer, Role, SignalQuality, SyncEnvelope, SyncMessage, TimerMessage, TimerPhase,
};

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Only the parent can do that")]
    NotParent,

    #[error("Link is disabled")]
    LinkDisabled,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

impl From<SessionError> for CoreError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotParent => CoreError::NotParent,
            SessionError::LinkDisabled => CoreError::LinkDisabled,
            SessionError::Closed => CoreError::SessionClosed,
            SessionError::Link(LinkError::InvalidPort(p)) => CoreError::InvalidPort(p),
            SessionError::Link(LinkError::InvalidAddress(a)) => CoreError::InvalidAddress(a),
            SessionError::Link(LinkError::ChannelClosed) => CoreError::SessionClosed,
            SessionError::Link(e) => CoreError::NetworkError(e.to_string()),
        }
    }
}

fn to_millis(ns: Nanos) -> i64 {
    ns / NANOS_PER_MILLI
}

/// Why a link is down
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum LinkFailure {
    NoLocalNetwork,
    RadioOff,
    Timeout,
    Refused,
    InvalidAddress,
}

impl From<FailureCause> for LinkFailure {
    fn from(c: FailureCause) -> Self {
        match c {
            FailureCause::NoLocalNetwork => LinkFailure::NoLocalNetwork,
            FailureCause::RadioOff => LinkFailure::RadioOff,
            FailureCause::Timeout => LinkFailure::Timeout,
            FailureCause::Refused => LinkFailure::Refused,
            FailureCause::InvalidAddress => LinkFailure::InvalidAddress,
        }
    }
}

/// Link status exposed via FFI
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum LinkState {
    NotConnected,
    Connecting,
    Connected,
    Failed { cause: LinkFailure },
}

impl From<LinkStatus> for LinkState {
    fn from(s: LinkStatus) -> Self {
        match s {
            LinkStatus::NotConnected => LinkState::NotConnected,
            LinkStatus::Connecting => LinkState::Connecting,
            LinkStatus::Connected => LinkState::Connected,
            LinkStatus::Failed(cause) => LinkState::Failed { cause: cause.into() },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum SignalLevel {
    Good,
    Degraded,
    Lost,
    Unknown,
}

impl From<SignalQuality> for SignalLevel {
    fn from(q: SignalQuality) -> Self {
        match q {
            SignalQuality::Good => SignalLevel::Good,
            SignalQuality::Degraded => SignalLevel::Degraded,
            SignalQuality::Lost => SignalLevel::Lost,
            SignalQuality::Unknown => SignalLevel::Unknown,
        }
    }
}

impl From<SignalLevel> for SignalQuality {
    fn from(l: SignalLevel) -> Self {
        match l {
            SignalLevel::Good => SignalQuality::Good,
            SignalLevel::Degraded => SignalQuality::Degraded,
            SignalLevel::Lost => SignalQuality::Lost,
            SignalLevel::Unknown => SignalQuality::Unknown,
        }
    }
}

/// Peer exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct PeerInfo {
    pub peer_id: String,
    pub display_name: String,
    pub is_parent: bool,
    pub signal: SignalLevel,
    /// Local uptime at handshake, in milliseconds
    pub joined_at_ms: i64,
}

impl From<&Peer> for PeerInfo {
    fn from(p: &Peer) -> Self {
        Self {
            peer_id: p.id.to_string(),
            display_name: p.display_name.clone(),
            is_parent: p.role == Role::Parent,
            signal: p.signal_quality.into(),
            joined_at_ms: to_millis(p.join_timestamp),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum TimerState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl From<TimerPhase> for TimerState {
    fn from(p: TimerPhase) -> Self {
        match p {
            TimerPhase::Idle => TimerState::Idle,
            TimerPhase::Running => TimerState::Running,
            TimerPhase::Paused => TimerState::Paused,
            TimerPhase::Stopped => TimerState::Stopped,
        }
    }
}

/// What the timer face should show
#[derive(Debug, Clone, uniffi::Record)]
pub struct PlaybackInfo {
    pub state: TimerState,
    pub elapsed_ms: i64,
    pub slewing: bool,
    pub current_event_id: Option<String>,
    pub next_event_id: Option<String>,
    pub hold_remaining_ms: Option<i64>,
}

impl From<&DisplaySnapshot> for PlaybackInfo {
    fn from(d: &DisplaySnapshot) -> Self {
        Self {
            state: d.phase.into(),
            elapsed_ms: to_millis(d.elapsed_ns),
            slewing: d.slewing,
            current_event_id: d.current_event_id.clone(),
            next_event_id: d.next_event_id.clone(),
            hold_remaining_ms: d.hold_remaining_ns.map(to_millis),
        }
    }
}

/// An accepted timer message, for presentation
#[derive(Debug, Clone, uniffi::Record)]
pub struct TimerUpdate {
    pub action: String,
    pub state: TimerState,
    pub elapsed_ms: i64,
    pub action_seq: Option<u64>,
    pub state_seq: Option<u64>,
    pub flash_now: bool,
    pub sheet_label: Option<String>,
}

impl From<&TimerMessage> for TimerUpdate {
    fn from(m: &TimerMessage) -> Self {
        Self {
            action: format!("{:?}", m.action).to_lowercase(),
            state: m.phase.into(),
            elapsed_ms: to_millis(m.remaining_or_elapsed),
            action_seq: m.action_seq,
            state_seq: m.state_seq,
            flash_now: m.flash_now.unwrap_or(false),
            sheet_label: m.sheet_label.clone(),
        }
    }
}

/// An accepted sync envelope, for presentation
#[derive(Debug, Clone, uniffi::Record)]
pub struct SyncUpdate {
    pub seq: i64,
    /// "sheetSnapshot", "playbackState" or "cueEvent"
    pub kind: String,
    /// Sheet id, playback sequence or event id, depending on kind
    pub subject: String,
}

impl From<&SyncEnvelope> for SyncUpdate {
    fn from(e: &SyncEnvelope) -> Self {
        let (kind, subject) = match &e.message {
            SyncMessage::SheetSnapshot(sheet) => ("sheetSnapshot", sheet.id.clone()),
            SyncMessage::PlaybackState(state) => ("playbackState", state.seq.to_string()),
            SyncMessage::CueEvent(event) => ("cueEvent", event.event_id.clone()),
        };
        Self {
            seq: e.seq,
            kind: kind.to_string(),
            subject,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum CueKind {
    Stop,
    Cue,
    Restart,
}

impl From<CueKind> for EventKind {
    fn from(k: CueKind) -> Self {
        match k {
            CueKind::Stop => EventKind::Stop,
            CueKind::Cue => EventKind::Cue,
            CueKind::Restart => EventKind::Restart,
        }
    }
}

/// A scheduled event, times in seconds
#[derive(Debug, Clone, uniffi::Record)]
pub struct CueEventInfo {
    pub id: String,
    pub fire_time_s: f64,
    pub kind: CueKind,
    pub duration_s: Option<f64>,
}

impl From<CueEventInfo> for Event {
    fn from(e: CueEventInfo) -> Self {
        let event = Event::new(e.id, e.fire_time_s, e.kind.into());
        match e.duration_s {
            Some(d) => event.with_duration(d),
            None => event,
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct CueSheetInfo {
    pub id: String,
    pub label: String,
    pub revision: u64,
    pub events: Vec<CueEventInfo>,
}

impl From<CueSheetInfo> for CueSheet {
    fn from(s: CueSheetInfo) -> Self {
        let mut sheet = CueSheet::new(s.id, s.label);
        sheet.revision = s.revision;
        for info in s.events {
            let event = Event::from(info);
            match event.kind {
                EventKind::Stop => sheet.stop_events.push(event),
                EventKind::Cue => sheet.cue_events.push(event),
                EventKind::Restart => sheet.restart_events.push(event),
            }
        }
        sheet
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct BurstResult {
    pub sampled: u32,
    pub timed_out: u32,
}

/// Counters and clock state for a debug screen
#[derive(Debug, Clone, uniffi::Record)]
pub struct DiagnosticsInfo {
    pub frames_in: u64,
    pub frames_out: u64,
    pub malformed_frames: u64,
    pub dropped_stale: u64,
    pub retransmit_pending: u64,
    /// Peer clock minus local clock
    pub clock_offset_ms: Option<f64>,
    pub round_trip_ms: Option<f64>,
    pub clock_samples: u32,
}

impl From<&Diagnostics> for DiagnosticsInfo {
    fn from(d: &Diagnostics) -> Self {
        let ms = |ns: Nanos| as_secs_f64(ns) * 1000.0;
        Self {
            frames_in: d.frames_in,
            frames_out: d.frames_out,
            malformed_frames: d.malformed_frames,
            dropped_stale: d.dropped_stale,
            retransmit_pending: d.retransmit_pending as u64,
            clock_offset_ms: d.clock_estimate.map(|e| ms(e.offset_ns)),
            round_trip_ms: d.clock_estimate.map(|e| ms(e.round_trip_ns)),
            clock_samples: d.clock_estimate.map(|e| e.samples).unwrap_or(0),
        }
    }
}

/// Callback interface for session events
#[uniffi::export(callback_interface)]
pub trait SessionCallback: Send + Sync {
    fn on_link_status_changed(&self, status: LinkState);
    fn on_peers_changed(&self, peers: Vec<PeerInfo>);
    fn on_timer_message(&self, update: TimerUpdate);
    fn on_sync_envelope(&self, update: SyncUpdate);
    fn on_playback_changed(&self, playback: PlaybackInfo);
    fn on_event_reached(&self, event_id: String);
    fn on_error(&self, message: String);
}

/// Host-provided notification channel (for example a BLE characteristic)
#[uniffi::export(callback_interface)]
pub trait NotificationTransport: Send + Sync {
    /// Deliver one frame; false if the host could not queue it
    fn send_frame(&self, frame: Vec<u8>) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{CueEvent, PlaybackState, StopAnchor, TimerAction};

    #[test]
    fn test_session_errors_map_to_core_errors() {
        assert!(matches!(CoreError::from(SessionError::NotParent), CoreError::NotParent));
        assert!(matches!(
            CoreError::from(SessionError::Link(LinkError::InvalidPort("x".into()))),
            CoreError::InvalidPort(p) if p == "x"
        ));
        assert!(matches!(
            CoreError::from(SessionError::Link(LinkError::ChannelClosed)),
            CoreError::SessionClosed
        ));
    }

    #[test]
    fn test_link_status_conversion() {
        assert_eq!(LinkState::from(LinkStatus::Connected), LinkState::Connected);
        assert_eq!(
            LinkState::from(LinkStatus::Failed(FailureCause::Timeout)),
            LinkState::Failed {
                cause: LinkFailure::Timeout
            }
        );
    }

    #[test]
    fn test_cue_sheet_splits_events_by_kind() {
        let info = CueSheetInfo {
            id: "act-1".into(),
            label: "Act One".into(),
            revision: 3,
            events: vec![
                CueEventInfo {
                    id: "s1".into(),
                    fire_time_s: 60.0,
                    kind: CueKind::Stop,
                    duration_s: Some(5.0),
                },
                CueEventInfo {
                    id: "c1".into(),
                    fire_time_s: 10.0,
                    kind: CueKind::Cue,
                    duration_s: None,
                },
            ],
        };
        let sheet = CueSheet::from(info);
        assert_eq!(sheet.revision, 3);
        assert_eq!(sheet.stop_events.len(), 1);
        assert_eq!(sheet.stop_events[0].duration, Some(5.0));
        assert_eq!(sheet.cue_events[0].id, "c1");
        assert!(sheet.restart_events.is_empty());
    }

    #[test]
    fn test_presentation_records() {
        let msg = TimerMessage::new(TimerAction::Pause, TimerPhase::Paused, 2_500_000_000, 0).with_anchor(StopAnchor {
            master_uptime_at_stop: 0,
            elapsed_at_stop_ns: 2_500_000_000,
        });
        let update = TimerUpdate::from(&msg);
        assert_eq!(update.action, "pause");
        assert_eq!(update.elapsed_ms, 2_500);
        assert_eq!(update.state, TimerState::Paused);

        let envelope = SyncEnvelope {
            seq: 7,
            message: SyncMessage::CueEvent(CueEvent {
                event_id: "s1".into(),
                kind: EventKind::Stop,
                fired_at_elapsed_ns: 0,
            }),
        };
        let sync = SyncUpdate::from(&envelope);
        assert_eq!((sync.kind.as_str(), sync.subject.as_str()), ("cueEvent", "s1"));

        let state = PlaybackState::running(4, 0, 1.0, "act-1", 0);
        let sync = SyncUpdate::from(&SyncEnvelope {
            seq: 8,
            message: SyncMessage::PlaybackState(state),
        });
        assert_eq!(sync.subject, "4");
    }
}
