//! Session handle, commands and events

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::clock::{BurstReport, ClockEstimate};
use crate::network::{parse_port, DialTarget, LinkError, LinkStatus, NotificationSink};
use crate::playback::DisplaySnapshot;
use crate::sync::{CueSheet, Event, Peer, Role, SignalQuality, SyncEnvelope, TimerMessage};

/// Session-related errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Only the parent can do that")]
    NotParent,

    #[error("Link is disabled")]
    LinkDisabled,

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Session task closed")]
    Closed,
}

/// Events emitted by the session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    LinkStatusChanged(LinkStatus),
    /// Parent endpoint bound
    Listening { addr: SocketAddr },
    RoleChanged(Role),
    PeersChanged(Vec<Peer>),
    /// A timer message the replication rules accepted
    TimerMessage(TimerMessage),
    /// A sync envelope the replication rules accepted
    SyncEnvelope(SyncEnvelope),
    /// The displayed timer changed regime (not emitted per tick)
    PlaybackChanged(DisplaySnapshot),
    /// The playhead reached a stop event
    EventReached { event_id: String },
    Error(String),
}

/// Counters and clock state for troubleshooting
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    pub frames_in: u64,
    pub frames_out: u64,
    pub malformed_frames: u64,
    /// Oversized notification frames dropped by the codec
    pub discarded_frames: u64,
    pub dropped_stale: u64,
    pub bursts_requested: u64,
    pub retransmit_pending: usize,
    pub clock_estimate: Option<ClockEstimate>,
    pub link_status: Option<LinkStatus>,
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub local_id: Uuid,
    pub display_name: String,
    pub role: Role,
    pub link_enabled: bool,
    pub link_status: LinkStatus,
    pub peers: Vec<Peer>,
    pub display: DisplaySnapshot,
    pub sheet: Option<CueSheet>,
    pub diagnostics: Diagnostics,
}

pub(super) type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Commands sent to the session actor
pub(super) enum SessionCommand {
    EnableParent { port: u16 },
    EnableChild { target: DialTarget },
    Disable,
    SwitchRole { target: Option<DialTarget> },
    StartTimer { reply: Reply<()> },
    PauseTimer { reply: Reply<()> },
    ResetTimer { reply: Reply<()> },
    HoldForStop { hold: Duration, reply: Reply<()> },
    EndCueSheet { reply: Reply<()> },
    LoadCueSheet { sheet: CueSheet, reply: Reply<()> },
    AddEvent { event: Event, reply: Reply<()> },
    RequestBurst {
        count: u32,
        spacing: Duration,
        reply: oneshot::Sender<Result<BurstReport, SessionError>>,
    },
    ReportSignalQuality { peer_id: Uuid, quality: SignalQuality },
    Snapshot { reply: oneshot::Sender<SessionSnapshot> },
    DeliverNotification { bytes: Vec<u8> },
    SetNotificationSink { sink: Option<Arc<dyn NotificationSink>> },
    /// A burst issued after a freeze has finished; reassert the anchor
    BurstSettled { epoch: u64 },
    Shutdown,
}

/// Handle to communicate with the running session
#[derive(Clone)]
pub struct SessionHandle {
    pub(super) command_tx: mpsc::UnboundedSender<SessionCommand>,
    pub(super) display_rx: watch::Receiver<DisplaySnapshot>,
}

impl SessionHandle {
    fn send_command(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.command_tx.send(cmd).map_err(|_| SessionError::Closed)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(make(tx))?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Become the parent and listen on `port`
    pub fn enable_parent(&self, port: &str) -> Result<(), SessionError> {
        let port = parse_port(port)?;
        self.send_command(SessionCommand::EnableParent { port })
    }

    /// Become a child of the parent at `host:port`
    pub fn enable_child(&self, target: &str) -> Result<(), SessionError> {
        let target = target.parse::<DialTarget>()?;
        self.send_command(SessionCommand::EnableChild { target })
    }

    pub fn disable(&self) -> Result<(), SessionError> {
        self.send_command(SessionCommand::Disable)
    }

    /// Flip parent/child. A parent turning child dials `target`, or the last
    /// parent it knew.
    pub fn switch_role(&self, target: Option<&str>) -> Result<(), SessionError> {
        let target = target.map(str::parse::<DialTarget>).transpose()?;
        self.send_command(SessionCommand::SwitchRole { target })
    }

    pub async fn start_timer(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::StartTimer { reply }).await
    }

    pub async fn pause_timer(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::PauseTimer { reply }).await
    }

    pub async fn reset_timer(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::ResetTimer { reply }).await
    }

    /// Hold at a stop event for `hold`, then resume on its own
    pub async fn hold_for_stop(&self, hold: Duration) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::HoldForStop { hold, reply }).await
    }

    pub async fn end_cue_sheet(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::EndCueSheet { reply }).await
    }

    pub async fn load_cue_sheet(&self, sheet: CueSheet) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::LoadCueSheet { sheet, reply }).await
    }

    pub async fn add_event(&self, event: Event) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::AddEvent { event, reply }).await
    }

    /// Burst beacons to every connected peer; resolves when all have settled
    pub async fn request_burst_sync_samples(&self, count: u32, spacing: Duration) -> Result<BurstReport, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(SessionCommand::RequestBurst {
            count,
            spacing,
            reply: tx,
        })?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Signal quality reported by the host's radio stack
    pub fn report_signal_quality(&self, peer_id: Uuid, quality: SignalQuality) -> Result<(), SessionError> {
        self.send_command(SessionCommand::ReportSignalQuality { peer_id, quality })
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(SessionCommand::Snapshot { reply: tx })?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Raw bytes received on the notification channel; may hold partial frames
    pub fn deliver_notification(&self, bytes: Vec<u8>) -> Result<(), SessionError> {
        self.send_command(SessionCommand::DeliverNotification { bytes })
    }

    pub fn set_notification_sink(&self, sink: Option<Arc<dyn NotificationSink>>) -> Result<(), SessionError> {
        self.send_command(SessionCommand::SetNotificationSink { sink })
    }

    /// Latest display value, refreshed every display tick
    pub fn display(&self) -> watch::Receiver<DisplaySnapshot> {
        self.display_rx.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(SessionCommand::Shutdown);
    }
}
