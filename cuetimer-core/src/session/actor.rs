//! The session actor
//!
//! One task owns every piece of per-link state: the clock engines, the
//! sequence counters, the replica and the reconciler. Link events, host
//! commands and timers are all funnelled through its `select!` loop, so the
//! replication rules see messages one at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::*;
use crate::clock::{as_secs_f64, instant_at, nanos, now_ns, BurstReport, ClockEstimate, ClockSyncEngine, Nanos};
use crate::config::{LinkConfig, SyncConfig};
use crate::frame::{decode_message, encode_message, FrameCodec};
use crate::network::{
    ConnectionId, DialTarget, LinkEvent, LinkHandle, LinkManager, LinkStatus, NotificationSink, TransportKind,
};
use crate::playback::{DisplaySnapshot, LocalTimer, PlaybackReconciler, Reconciled, Schedule, TimerSource};
use crate::sync::{
    BeaconEnvelope, ControlSequencer, CueEvent, CueSheet, Event, EventKind, Hello, PeerRegistry, PlaybackPhase,
    PlaybackState, ReplicationReceiver, RetransmitQueue, Role, SignalQuality, StopAnchor, SyncEnvelope, SyncMessage,
    TimerAction, TimerMessage, TimerPhase, Verdict, WireMessage,
};

/// Frames from the notification channel are not tied to a link connection
const NOTIFICATION_CONN: ConnectionId = 0;

/// Timers that have nothing to do park this far out
const IDLE_PARK: Nanos = 3_600_000_000_000;

/// Per-link synchronization state - runs in a background task
pub struct SyncSession {
    local_id: Uuid,
    display_name: String,
    link_config: LinkConfig,
    config: SyncConfig,
    role: Role,
    link_enabled: bool,
    link_status: LinkStatus,
    last_target: Option<DialTarget>,
    /// Bumped whenever the link is torn down; deferred work from an older
    /// epoch is ignored
    epoch: u64,
    /// Announced in Hello so peers can tell our sequence counters restarted
    sequence_epoch: Uuid,
    beaconing: bool,
    engines: HashMap<ConnectionId, ClockSyncEngine>,
    peers: PeerRegistry,
    notifier: Option<Arc<dyn NotificationSink>>,
    notification_codec: FrameCodec,
    deferred: Vec<JoinHandle<()>>,

    // Parent side
    timer: LocalTimer,
    sequencer: ControlSequencer,
    retransmit: RetransmitQueue,
    sheet: Option<CueSheet>,
    stop_schedule: Schedule,
    parent_cursor: Option<String>,

    // Child side
    receiver: ReplicationReceiver,
    reconciler: PlaybackReconciler,
    parent_conn: Option<ConnectionId>,
    parent_epoch: Option<Uuid>,

    diagnostics: Diagnostics,
    last_display: Option<(TimerPhase, bool)>,
}

impl SyncSession {
    pub fn new(display_name: impl Into<String>, link_config: LinkConfig, config: SyncConfig) -> Self {
        let retransmit = RetransmitQueue::new(config.retransmit_interval, config.retransmit_attempts);
        let receiver = ReplicationReceiver::new(config.quench_window);
        let reconciler = PlaybackReconciler::new(&config);
        let notification_codec = FrameCodec::with_max_frame_len(link_config.max_frame_len);
        Self {
            local_id: Uuid::new_v4(),
            display_name: display_name.into(),
            link_config,
            config,
            role: Role::Child,
            link_enabled: false,
            link_status: LinkStatus::NotConnected,
            last_target: None,
            epoch: 0,
            sequence_epoch: Uuid::new_v4(),
            beaconing: false,
            engines: HashMap::new(),
            peers: PeerRegistry::new(),
            notifier: None,
            notification_codec,
            deferred: Vec::new(),
            timer: LocalTimer::new(),
            sequencer: ControlSequencer::new(),
            retransmit,
            sheet: None,
            stop_schedule: Schedule::new(),
            parent_cursor: None,
            receiver,
            reconciler,
            parent_conn: None,
            parent_epoch: None,
            diagnostics: Diagnostics::default(),
            last_display: None,
        }
    }

    /// Role before any link is enabled; a parent can drive its timer offline
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    /// Start the session (and its link manager) and return a handle
    pub fn start(self) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (display_tx, display_rx) = watch::channel(self.reconciler.snapshot(now_ns()));

        let self_tx = command_tx.clone();
        tokio::spawn(async move {
            self.run(event_tx, command_rx, self_tx, display_tx).await;
        });

        (SessionHandle { command_tx, display_rx }, event_rx)
    }

    async fn run(
        mut self,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
        mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
        self_tx: mpsc::UnboundedSender<SessionCommand>,
        display_tx: watch::Sender<DisplaySnapshot>,
    ) {
        let (link, mut link_events) = LinkManager::new(self.link_config.clone()).start();
        let ctx = Ctx {
            events: event_tx,
            self_tx,
            link,
            display: display_tx,
        };

        let mut display_ticker = tokio::time::interval(self.config.display_tick);
        display_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut status_ticker = tokio::time::interval(self.config.status_interval);
        status_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Session {} started", self.local_id);

        loop {
            let now = now_ns();
            let beacon_due = self.next_beacon_due(now).unwrap_or(now + IDLE_PARK);
            let retransmit_due = self.retransmit.next_due().unwrap_or(now + IDLE_PARK);
            let animating = self.is_animating(now);

            tokio::select! {
                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("Session: all handles dropped");
                        break;
                    };
                    if !self.handle_command(cmd, &ctx) {
                        break;
                    }
                }
                Some(event) = link_events.recv() => {
                    self.handle_link_event(event, &ctx);
                }
                _ = tokio::time::sleep_until(instant_at(beacon_due)) => {
                    self.poll_beacons(&ctx);
                }
                _ = tokio::time::sleep_until(instant_at(retransmit_due)) => {
                    self.resend_unacknowledged(&ctx);
                }
                _ = display_ticker.tick(), if animating => {
                    self.tick_display(&ctx);
                }
                _ = status_ticker.tick() => {
                    self.status_tick(&ctx);
                }
            }
        }

        self.teardown(&ctx);
        ctx.link.shutdown();
        info!("Session stopped");
    }

    /// Returns false on shutdown
    fn handle_command(&mut self, cmd: SessionCommand, ctx: &Ctx) -> bool {
        let now = now_ns();
        match cmd {
            SessionCommand::EnableParent { port } => {
                self.teardown(ctx);
                self.set_role(Role::Parent, ctx);
                self.link_enabled = true;
                self.beaconing = true;
                if let Err(e) = ctx.link.listen(port) {
                    ctx.emit(SessionEvent::Error(e.to_string()));
                }
            }
            SessionCommand::EnableChild { target } => {
                self.teardown(ctx);
                self.set_role(Role::Child, ctx);
                self.link_enabled = true;
                self.beaconing = true;
                self.last_target = Some(target.clone());
                if let Err(e) = ctx.link.dial(target) {
                    ctx.emit(SessionEvent::Error(e.to_string()));
                }
            }
            SessionCommand::Disable => {
                info!("Session: disabling link");
                self.teardown(ctx);
            }
            SessionCommand::SwitchRole { target } => self.switch_role(target, ctx),
            SessionCommand::StartTimer { reply } => {
                let _ = reply.send(self.start_timer(now, ctx));
            }
            SessionCommand::PauseTimer { reply } => {
                let _ = reply.send(self.pause_timer(now, ctx));
            }
            SessionCommand::ResetTimer { reply } => {
                let _ = reply.send(self.reset_timer(now, ctx));
            }
            SessionCommand::HoldForStop { hold, reply } => {
                let _ = reply.send(self.hold_for_stop(hold, now, ctx));
            }
            SessionCommand::EndCueSheet { reply } => {
                let _ = reply.send(self.end_cue_sheet(now, ctx));
            }
            SessionCommand::LoadCueSheet { sheet, reply } => {
                let _ = reply.send(self.load_cue_sheet(sheet, ctx));
            }
            SessionCommand::AddEvent { event, reply } => {
                let _ = reply.send(self.add_event(event, now, ctx));
            }
            SessionCommand::RequestBurst { count, spacing, reply } => {
                if !self.link_enabled {
                    let _ = reply.send(Err(SessionError::LinkDisabled));
                    return true;
                }
                let waiters = self.request_bursts(count, spacing);
                tokio::spawn(async move {
                    let _ = reply.send(Ok(sum_reports(waiters).await));
                });
            }
            SessionCommand::ReportSignalQuality { peer_id, quality } => {
                let changed = self
                    .peers
                    .connection_for(peer_id)
                    .is_some_and(|conn| self.peers.update_signal_quality(conn, quality));
                if changed {
                    ctx.emit(SessionEvent::PeersChanged(self.peers.peer_list()));
                }
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot(now));
            }
            SessionCommand::DeliverNotification { bytes } => self.deliver_notification(&bytes, ctx),
            SessionCommand::SetNotificationSink { sink } => {
                self.notifier = sink;
                if self.notifier.is_none() {
                    self.retransmit.clear();
                }
            }
            SessionCommand::BurstSettled { epoch } => {
                if epoch == self.epoch {
                    self.reassert_after_burst(now, ctx);
                }
            }
            SessionCommand::Shutdown => {
                info!("Session shutting down");
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Link lifecycle
    // ------------------------------------------------------------------

    /// Stop beacons, the link, then deferred work, then forget the epoch
    fn teardown(&mut self, ctx: &Ctx) {
        self.beaconing = false;
        if self.link_enabled {
            if let Err(e) = ctx.link.disable() {
                debug!("Session: link already gone: {}", e);
            }
        }
        self.link_enabled = false;
        self.forget_epoch();
        if !self.peers.is_empty() {
            self.peers.clear();
            ctx.emit(SessionEvent::PeersChanged(Vec::new()));
        }
    }

    fn forget_epoch(&mut self) {
        for task in self.deferred.drain(..) {
            task.abort();
        }
        self.epoch += 1;
        for engine in self.engines.values_mut() {
            engine.reset();
        }
        self.engines.clear();
        self.sequencer.reset();
        self.sequence_epoch = Uuid::new_v4();
        self.receiver.reset();
        self.retransmit.clear();
        self.parent_conn = None;
        self.parent_epoch = None;
        self.notification_codec = FrameCodec::with_max_frame_len(self.link_config.max_frame_len);
    }

    fn switch_role(&mut self, target: Option<DialTarget>, ctx: &Ctx) {
        let was_enabled = self.link_enabled;
        self.beaconing = false;
        self.forget_epoch();
        self.peers.clear();
        ctx.emit(SessionEvent::PeersChanged(Vec::new()));

        if let Some(target) = &target {
            self.last_target = Some(target.clone());
        }
        self.set_role(self.role.flipped(), ctx);

        if !was_enabled {
            return;
        }
        if self.role == Role::Child && self.last_target.is_none() {
            warn!("Session: switched to child without a parent address; link disabled");
            if let Err(e) = ctx.link.disable() {
                debug!("Session: link already gone: {}", e);
            }
            self.link_enabled = false;
            return;
        }
        self.beaconing = true;
        if let Err(e) = ctx.link.flip_role(target) {
            ctx.emit(SessionEvent::Error(e.to_string()));
        }
    }

    fn set_role(&mut self, role: Role, ctx: &Ctx) {
        if self.role != role {
            info!("Session: role is now {}", role);
            self.role = role;
            ctx.emit(SessionEvent::RoleChanged(role));
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent, ctx: &Ctx) {
        match event {
            LinkEvent::Listening { addr } => ctx.emit(SessionEvent::Listening { addr }),
            LinkEvent::StatusChanged(status) => {
                self.link_status = status;
                ctx.emit(SessionEvent::LinkStatusChanged(status));
            }
            LinkEvent::PeerConnected { conn, addr } => {
                debug!("Session: connection {} from {}", conn, addr);
                self.engines.insert(conn, ClockSyncEngine::new(self.local_id, &self.config));
                if self.role == Role::Child {
                    self.parent_conn = Some(conn);
                }
                let hello = WireMessage::Hello(Hello {
                    peer_id: self.local_id,
                    role: self.role,
                    display_name: self.display_name.clone(),
                    epoch: self.sequence_epoch,
                });
                self.send_to(conn, hello, ctx);
            }
            LinkEvent::PeerDisconnected { conn } => {
                if let Some(mut engine) = self.engines.remove(&conn) {
                    engine.reset();
                }
                if self.parent_conn == Some(conn) {
                    self.parent_conn = None;
                }
                if let Some(peer) = self.peers.remove_connection(conn) {
                    info!("Peer left: {}", peer.display_name);
                    ctx.emit(SessionEvent::PeersChanged(self.peers.peer_list()));
                }
            }
            LinkEvent::Frame {
                conn,
                via,
                message,
                received_at,
            } => {
                self.diagnostics.frames_in += 1;
                self.handle_message(conn, via, message, received_at, ctx);
            }
            LinkEvent::MalformedFrame { conn, error } => {
                self.diagnostics.malformed_frames += 1;
                debug!("Session: malformed frame on {}: {}", conn, error);
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------

    fn handle_message(
        &mut self,
        conn: ConnectionId,
        via: TransportKind,
        message: WireMessage,
        received_at: Nanos,
        ctx: &Ctx,
    ) {
        match message {
            WireMessage::Hello(hello) => {
                if via != TransportKind::Stream {
                    return;
                }
                if self.role == Role::Child && hello.role == Role::Parent {
                    self.enter_parent_epoch(hello.epoch, received_at, ctx);
                }
                if self.peers.upsert_from_hello(conn, &hello, received_at) {
                    info!("Peer joined: {} ({})", hello.display_name, hello.role);
                    ctx.emit(SessionEvent::PeersChanged(self.peers.peer_list()));
                    if self.role == Role::Parent {
                        self.catch_up(conn, ctx);
                    }
                }
            }
            WireMessage::Beacon(beacon) => self.handle_beacon(conn, beacon, received_at, ctx),
            WireMessage::Timer(msg) => {
                if self.role != Role::Child {
                    debug!("Session: parent ignoring timer message from {}", conn);
                    return;
                }
                self.apply_timer(msg, via, received_at, ctx);
            }
            WireMessage::Sync(envelope) => {
                if self.role != Role::Child {
                    return;
                }
                self.apply_envelope(envelope, received_at, ctx);
            }
            WireMessage::Ack(ack) => {
                if self.role == Role::Parent {
                    let cleared = self.retransmit.acknowledge(ack.action_seq);
                    debug!("Session: ack {} from {} cleared {}", ack.action_seq, ack.sender_id, cleared);
                }
            }
        }
    }

    fn handle_beacon(&mut self, conn: ConnectionId, beacon: BeaconEnvelope, received_at: Nanos, ctx: &Ctx) {
        let Some(engine) = self.engines.get_mut(&conn) else {
            return;
        };
        if let Some(echo) = engine.handle_beacon(&beacon, received_at, now_ns()) {
            self.send_to(conn, WireMessage::Beacon(echo), ctx);
            return;
        }
        if engine.handle_echo(&beacon, received_at).is_none() {
            return;
        }
        let quality = engine
            .estimate()
            .map(|e| SignalQuality::from_round_trip(e.round_trip_ns))
            .unwrap_or(SignalQuality::Unknown);
        if self.peers.update_signal_quality(conn, quality) {
            ctx.emit(SessionEvent::PeersChanged(self.peers.peer_list()));
        }
    }

    /// A parent whose counters restarted makes everything we applied from it
    /// incomparable; start the replica over
    fn enter_parent_epoch(&mut self, epoch: Uuid, now: Nanos, ctx: &Ctx) {
        let previous = self.parent_epoch.replace(epoch);
        if previous.is_none() || previous == Some(epoch) {
            return;
        }
        info!("Session: parent sequence epoch changed, resetting replica");
        self.receiver.reset();
        self.reconciler.apply_reset();
        self.reconciler.set_stop_events(Schedule::new());
        self.publish_playback(now, ctx);
    }

    fn apply_timer(&mut self, msg: TimerMessage, via: TransportKind, received_at: Nanos, ctx: &Ctx) {
        let verdict = self.receiver.accept_timer(&msg, received_at);

        if via == TransportKind::Notification {
            if let Some(ack) = self.receiver.ack_for(&msg, self.local_id) {
                self.notify(&WireMessage::Ack(ack), ctx);
            }
        }
        if !verdict.is_applied() {
            self.diagnostics.dropped_stale += 1;
            return;
        }

        // A late control is displayed as the newer update that already covers it
        let shown = match verdict {
            Verdict::ApplyControl { action_seq } => self.receiver.update_covering(action_seq).cloned(),
            _ => None,
        };
        let estimate = self.parent_estimate();
        let outcome = self
            .reconciler
            .apply_timer_message(shown.as_ref().unwrap_or(&msg), received_at, estimate.as_ref());
        self.reconciler
            .set_stop_events(self.receiver.replica().stop_events.clone());
        debug!("Session: applied {:?} -> {:?}", msg.action, outcome);

        if outcome.is_new_freeze() {
            self.burst_then_reassert(ctx);
        }
        ctx.emit(SessionEvent::TimerMessage(msg));
        self.publish_playback(received_at, ctx);
    }

    fn apply_envelope(&mut self, envelope: SyncEnvelope, received_at: Nanos, ctx: &Ctx) {
        if let SyncMessage::PlaybackState(state) = &envelope.message {
            // Snapshots taken before the last applied control would regress it
            if state.seq < self.receiver.last_applied_control_seq() {
                self.diagnostics.dropped_stale += 1;
                return;
            }
        }
        let Verdict::ApplyEnvelope { .. } = self.receiver.accept_envelope(&envelope) else {
            self.diagnostics.dropped_stale += 1;
            return;
        };

        match &envelope.message {
            SyncMessage::SheetSnapshot(_) => {
                self.reconciler
                    .set_stop_events(self.receiver.replica().stop_events.clone());
            }
            SyncMessage::PlaybackState(state) => {
                let estimate = self.parent_estimate();
                let outcome = self.reconciler.apply_playback_state(state, received_at, estimate.as_ref());
                if outcome.is_new_freeze() {
                    self.burst_then_reassert(ctx);
                }
                if outcome != Reconciled::Ignored {
                    self.publish_playback(received_at, ctx);
                }
            }
            SyncMessage::CueEvent(event) => {
                debug!("Session: parent passed {}", event.event_id);
            }
        }
        ctx.emit(SessionEvent::SyncEnvelope(envelope));
    }

    fn deliver_notification(&mut self, bytes: &[u8], ctx: &Ctx) {
        if !self.link_enabled {
            debug!("Session: notification while disabled, ignoring");
            return;
        }
        self.notification_codec.feed(bytes);
        while let Some(frame) = self.notification_codec.next_frame() {
            let received_at = now_ns();
            match decode_message(&frame) {
                Ok(message) => {
                    self.diagnostics.frames_in += 1;
                    self.handle_message(NOTIFICATION_CONN, TransportKind::Notification, message, received_at, ctx);
                }
                Err(e) => {
                    self.diagnostics.malformed_frames += 1;
                    debug!("Session: malformed notification: {}", e);
                }
            }
        }
        self.diagnostics.discarded_frames = self.notification_codec.discarded_frames();
    }

    fn parent_estimate(&self) -> Option<ClockEstimate> {
        self.parent_conn
            .and_then(|conn| self.engines.get(&conn))
            .and_then(ClockSyncEngine::estimate)
    }

    // ------------------------------------------------------------------
    // Parent controls
    // ------------------------------------------------------------------

    fn require_parent(&self) -> Result<(), SessionError> {
        if self.role == Role::Parent {
            Ok(())
        } else {
            Err(SessionError::NotParent)
        }
    }

    fn start_timer(&mut self, now: Nanos, ctx: &Ctx) -> Result<(), SessionError> {
        self.require_parent()?;
        self.timer.start(now);
        info!("Timer started at {:.3}s", as_secs_f64(self.timer.elapsed_at(now)));
        self.publish_control(TimerAction::Start, now, ctx);
        Ok(())
    }

    fn pause_timer(&mut self, now: Nanos, ctx: &Ctx) -> Result<(), SessionError> {
        self.require_parent()?;
        let anchor = self.timer.pause(now);
        info!("Timer paused at {:.3}s", as_secs_f64(anchor.elapsed_at_stop_ns));
        self.publish_control(TimerAction::Pause, now, ctx);
        self.burst_then_reassert(ctx);
        Ok(())
    }

    fn reset_timer(&mut self, now: Nanos, ctx: &Ctx) -> Result<(), SessionError> {
        self.require_parent()?;
        self.timer.reset();
        self.parent_cursor = None;
        info!("Timer reset");
        self.publish_control(TimerAction::Reset, now, ctx);
        Ok(())
    }

    /// A scheduled stop is a continuous update: the status broadcast keeps
    /// repeating its anchor, so it needs no acknowledgement.
    fn hold_for_stop(&mut self, hold: Duration, now: Nanos, ctx: &Ctx) -> Result<(), SessionError> {
        self.require_parent()?;
        let anchor = self.timer.hold(now, nanos(hold));
        info!(
            "Timer held at {:.3}s for {:?}",
            as_secs_f64(anchor.elapsed_at_stop_ns),
            hold
        );
        let msg = self.status_message(TimerAction::Update, now);
        self.publish_timer(msg, now, ctx);
        self.publish_playback(now, ctx);
        self.burst_then_reassert(ctx);
        Ok(())
    }

    fn end_cue_sheet(&mut self, now: Nanos, ctx: &Ctx) -> Result<(), SessionError> {
        self.require_parent()?;
        self.sheet = None;
        self.stop_schedule.clear();
        self.parent_cursor = None;
        self.publish_control(TimerAction::EndCueSheet, now, ctx);
        Ok(())
    }

    fn load_cue_sheet(&mut self, mut sheet: CueSheet, ctx: &Ctx) -> Result<(), SessionError> {
        self.require_parent()?;
        for kind in [EventKind::Stop, EventKind::Cue, EventKind::Restart] {
            let sorted = Schedule::from_events(sheet.events(kind).iter().cloned()).to_vec();
            *events_mut(&mut sheet, kind) = sorted;
        }
        info!("Loaded cue sheet {} ({} stops)", sheet.label, sheet.stop_events.len());
        self.stop_schedule = Schedule::from_events(sheet.stop_events.iter().cloned());
        self.sheet = Some(sheet.clone());

        let seq = self.sequencer.next_sync_seq();
        self.broadcast(
            WireMessage::Sync(SyncEnvelope {
                seq,
                message: SyncMessage::SheetSnapshot(sheet),
            }),
            ctx,
        );
        Ok(())
    }

    fn add_event(&mut self, event: Event, now: Nanos, ctx: &Ctx) -> Result<(), SessionError> {
        self.require_parent()?;
        let kind = event.kind;
        let sheet = self
            .sheet
            .get_or_insert_with(|| CueSheet::new(Uuid::new_v4().to_string(), "Untitled"));
        let mut schedule = Schedule::from_events(sheet.events(kind).iter().cloned());
        schedule.insert(event);
        *events_mut(sheet, kind) = schedule.to_vec();
        sheet.revision += 1;
        if kind == EventKind::Stop {
            self.stop_schedule = schedule.clone();
        }

        let msg = self
            .status_message(TimerAction::AddEvent, now)
            .with_events(kind, schedule.to_vec());
        self.publish_timer(msg, now, ctx);
        Ok(())
    }

    /// Stamp and send a control action, plus a fresh playback snapshot
    fn publish_control(&mut self, action: TimerAction, now: Nanos, ctx: &Ctx) {
        let mut msg = self.status_message(action, now);
        if let Some(sheet) = &self.sheet {
            for kind in [EventKind::Stop, EventKind::Cue, EventKind::Restart] {
                msg = msg.with_events(kind, sheet.events(kind).to_vec());
            }
        }
        self.publish_timer(msg, now, ctx);

        let seq = self.sequencer.next_sync_seq();
        let state = self.playback_state(now);
        self.broadcast(
            WireMessage::Sync(SyncEnvelope {
                seq,
                message: SyncMessage::PlaybackState(state),
            }),
            ctx,
        );
        self.publish_playback(now, ctx);
    }

    /// Current timer as a message; sequence fields are stamped on send
    fn status_message(&self, action: TimerAction, now: Nanos) -> TimerMessage {
        let phase = self.timer.phase_at(now);
        let mut msg = TimerMessage::new(action, phase, self.timer.elapsed_at(now), now);
        if let Some(anchor) = self.timer.anchor_at(now) {
            msg = msg.with_anchor(anchor);
        }
        if phase == TimerPhase::Stopped {
            if let Some(hold) = self.timer.hold_length() {
                msg = msg.with_hold(hold);
            }
        }
        if let Some(sheet) = &self.sheet {
            msg = msg.with_sheet(sheet.id.clone(), sheet.label.clone());
        }
        msg
    }

    fn playback_state(&self, now: Nanos) -> PlaybackState {
        let seq = self.sequencer.last_action_seq();
        let (sheet_id, revision) = match &self.sheet {
            Some(sheet) => (sheet.id.clone(), sheet.revision),
            None => (String::new(), 0),
        };
        let elapsed = self.timer.elapsed_at(now);
        let state = match (self.timer.start_epoch(now), self.timer.phase_at(now)) {
            (Some(start), _) => PlaybackState::running(seq, start, as_secs_f64(elapsed), sheet_id, revision),
            (None, phase) => {
                let anchor = self.timer.anchor_at(now).unwrap_or(StopAnchor {
                    master_uptime_at_stop: now,
                    elapsed_at_stop_ns: elapsed,
                });
                let phase = if phase == TimerPhase::Idle {
                    PlaybackPhase::Idle
                } else {
                    PlaybackPhase::Paused
                };
                PlaybackState::frozen(phase, seq, anchor, sheet_id, revision)
            }
        };
        let (current, next) = self.parent_cursor_at(now);
        state.with_cursor(current, next)
    }

    fn parent_cursor_at(&self, now: Nanos) -> (Option<String>, Option<String>) {
        let elapsed = as_secs_f64(self.timer.elapsed_at(now));
        (
            self.stop_schedule.current_at(elapsed).map(|e| e.id.clone()),
            self.stop_schedule.next_after(elapsed).map(|e| e.id.clone()),
        )
    }

    /// Bring a newly joined child up to date
    fn catch_up(&mut self, conn: ConnectionId, ctx: &Ctx) {
        let now = now_ns();
        if let Some(sheet) = self.sheet.clone() {
            let seq = self.sequencer.next_sync_seq();
            self.send_to(
                conn,
                WireMessage::Sync(SyncEnvelope {
                    seq,
                    message: SyncMessage::SheetSnapshot(sheet),
                }),
                ctx,
            );
        }
        let seq = self.sequencer.next_sync_seq();
        let state = self.playback_state(now);
        self.send_to(
            conn,
            WireMessage::Sync(SyncEnvelope {
                seq,
                message: SyncMessage::PlaybackState(state),
            }),
            ctx,
        );
        let mut status = self.status_message(TimerAction::Update, now);
        self.sequencer.stamp(&mut status);
        self.send_to(conn, WireMessage::Timer(status), ctx);
    }

    // ------------------------------------------------------------------
    // Bursts and reassertion
    // ------------------------------------------------------------------

    fn request_bursts(&mut self, count: u32, spacing: Duration) -> Vec<oneshot::Receiver<BurstReport>> {
        self.diagnostics.bursts_requested += 1;
        let conns: Vec<ConnectionId> = match self.role {
            Role::Parent => self.engines.keys().copied().collect(),
            Role::Child => self.parent_conn.into_iter().collect(),
        };
        let mut waiters = Vec::with_capacity(conns.len());
        for conn in conns {
            if let Some(engine) = self.engines.get_mut(&conn) {
                waiters.push(engine.request_burst_sync_samples(count, spacing));
            }
        }
        waiters
    }

    /// Tighten the clock estimate around a freeze, then apply the anchor again
    fn burst_then_reassert(&mut self, ctx: &Ctx) {
        let waiters = self.request_bursts(self.config.burst_count, self.config.burst_spacing);
        let epoch = self.epoch;
        let self_tx = ctx.self_tx.clone();
        self.deferred.retain(|task| !task.is_finished());
        self.deferred.push(tokio::spawn(async move {
            sum_reports(waiters).await;
            let _ = self_tx.send(SessionCommand::BurstSettled { epoch });
        }));
    }

    fn reassert_after_burst(&mut self, now: Nanos, ctx: &Ctx) {
        match self.role {
            Role::Child => {
                let estimate = self.parent_estimate();
                if self.reconciler.reassert_anchor(now, estimate.as_ref()) == Reconciled::Reasserted {
                    debug!("Session: anchor reasserted");
                    self.publish_playback(now, ctx);
                }
            }
            Role::Parent => {
                if self.timer.anchor_at(now).is_some() {
                    debug!("Session: rebroadcasting anchor");
                    let msg = self.status_message(TimerAction::Update, now);
                    self.publish_timer(msg, now, ctx);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn next_beacon_due(&self, now: Nanos) -> Option<Nanos> {
        if !self.beaconing {
            return None;
        }
        self.engines.values().map(|e| e.next_due(now)).min()
    }

    fn poll_beacons(&mut self, ctx: &Ctx) {
        if !self.beaconing {
            return;
        }
        let now = now_ns();
        let mut outbound = Vec::new();
        for (conn, engine) in self.engines.iter_mut() {
            let target = self.peers.peer_for(*conn).map(|p| p.id);
            if let Some(beacon) = engine.poll_beacon(now, target) {
                outbound.push((*conn, beacon));
            }
        }
        for (conn, beacon) in outbound {
            self.send_to(conn, WireMessage::Beacon(beacon), ctx);
        }
    }

    fn resend_unacknowledged(&mut self, ctx: &Ctx) {
        let now = now_ns();
        for msg in self.retransmit.due(now) {
            debug!("Session: resending control {:?}", msg.action_seq);
            self.notify(&WireMessage::Timer(msg), ctx);
        }
    }

    fn status_tick(&mut self, ctx: &Ctx) {
        let now = now_ns();
        if self.role != Role::Parent || !self.link_status.is_established() {
            return;
        }
        if self.timer.settle(now) {
            debug!("Session: hold elapsed, running again");
        }
        let msg = self.status_message(TimerAction::Update, now);
        self.publish_timer(msg, now, ctx);
    }

    fn tick_display(&mut self, ctx: &Ctx) {
        let now = now_ns();
        match self.role {
            Role::Child => {
                let outcome = self.reconciler.tick(now);
                if let Some(event_id) = outcome.reached {
                    ctx.emit(SessionEvent::EventReached { event_id });
                }
                if outcome.resumed || outcome.slew_finished {
                    self.publish_playback(now, ctx);
                }
            }
            Role::Parent => {
                let (current, _) = self.parent_cursor_at(now);
                if current != self.parent_cursor {
                    self.parent_cursor = current.clone();
                    if let (Some(event_id), true) = (current, self.timer.is_advancing_at(now)) {
                        self.announce_reached(event_id, now, ctx);
                    }
                }
                let phase = self.timer.phase_at(now);
                if self.last_display.map(|(p, _)| p) != Some(phase) {
                    self.publish_playback(now, ctx);
                }
            }
        }
        let _ = ctx.display.send(self.display_snapshot(now));
    }

    fn announce_reached(&mut self, event_id: String, now: Nanos, ctx: &Ctx) {
        ctx.emit(SessionEvent::EventReached {
            event_id: event_id.clone(),
        });
        let seq = self.sequencer.next_sync_seq();
        self.broadcast(
            WireMessage::Sync(SyncEnvelope {
                seq,
                message: SyncMessage::CueEvent(CueEvent {
                    event_id,
                    kind: EventKind::Stop,
                    fired_at_elapsed_ns: self.timer.elapsed_at(now),
                }),
            }),
            ctx,
        );
    }

    fn is_animating(&self, now: Nanos) -> bool {
        match self.role {
            Role::Child => self.reconciler.is_animating(now),
            Role::Parent => matches!(self.timer.phase_at(now), TimerPhase::Running | TimerPhase::Stopped),
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn publish_timer(&mut self, mut msg: TimerMessage, now: Nanos, ctx: &Ctx) {
        self.sequencer.stamp(&mut msg);
        let control = msg.is_control();
        let wire = WireMessage::Timer(msg.clone());
        self.broadcast(wire.clone(), ctx);
        if self.notify(&wire, ctx) && control {
            self.retransmit.track(msg, now);
        }
    }

    fn broadcast(&mut self, message: WireMessage, ctx: &Ctx) {
        if !self.link_enabled {
            return;
        }
        self.diagnostics.frames_out += self.engines.len() as u64;
        if let Err(e) = ctx.link.broadcast(message) {
            warn!("Session: broadcast failed: {}", e);
        }
    }

    fn send_to(&mut self, conn: ConnectionId, message: WireMessage, ctx: &Ctx) {
        self.diagnostics.frames_out += 1;
        if let Err(e) = ctx.link.send(conn, message) {
            warn!("Session: send failed: {}", e);
        }
    }

    /// Send on the notification channel; false if there is none or it failed
    fn notify(&mut self, message: &WireMessage, ctx: &Ctx) -> bool {
        if !self.link_enabled {
            return false;
        }
        let Some(sink) = &self.notifier else {
            return false;
        };
        let frame = match encode_message(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Session: cannot encode {}: {}", message.kind(), e);
                return false;
            }
        };
        match sink.notify(frame) {
            Ok(()) => {
                self.diagnostics.frames_out += 1;
                true
            }
            Err(e) => {
                warn!("Session: notification failed: {}", e);
                ctx.emit(SessionEvent::Error(e.to_string()));
                false
            }
        }
    }

    fn publish_playback(&mut self, now: Nanos, ctx: &Ctx) {
        let snapshot = self.display_snapshot(now);
        self.last_display = Some((snapshot.phase, snapshot.slewing));
        let _ = ctx.display.send(snapshot.clone());
        ctx.emit(SessionEvent::PlaybackChanged(snapshot));
    }

    fn display_snapshot(&self, now: Nanos) -> DisplaySnapshot {
        match self.role {
            Role::Child => self.reconciler.snapshot(now),
            Role::Parent => {
                let (current_event_id, next_event_id) = self.parent_cursor_at(now);
                DisplaySnapshot {
                    phase: self.timer.phase_at(now),
                    elapsed_ns: self.timer.elapsed_at(now),
                    slewing: false,
                    current_event_id,
                    next_event_id,
                    hold_remaining_ns: self.timer.hold_remaining(now),
                }
            }
        }
    }

    fn snapshot(&self, now: Nanos) -> SessionSnapshot {
        let clock_estimate = match self.role {
            Role::Child => self.parent_estimate(),
            Role::Parent => self.engines.values().find_map(ClockSyncEngine::estimate),
        };
        SessionSnapshot {
            local_id: self.local_id,
            display_name: self.display_name.clone(),
            role: self.role,
            link_enabled: self.link_enabled,
            link_status: self.link_status,
            peers: self.peers.peer_list(),
            display: self.display_snapshot(now),
            sheet: self.sheet.clone(),
            diagnostics: Diagnostics {
                retransmit_pending: self.retransmit.len(),
                clock_estimate,
                link_status: Some(self.link_status),
                ..self.diagnostics.clone()
            },
        }
    }
}

/// Channels the actor talks through
struct Ctx {
    events: mpsc::UnboundedSender<SessionEvent>,
    self_tx: mpsc::UnboundedSender<SessionCommand>,
    link: LinkHandle,
    display: watch::Sender<DisplaySnapshot>,
}

impl Ctx {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

fn events_mut(sheet: &mut CueSheet, kind: EventKind) -> &mut Vec<Event> {
    match kind {
        EventKind::Stop => &mut sheet.stop_events,
        EventKind::Cue => &mut sheet.cue_events,
        EventKind::Restart => &mut sheet.restart_events,
    }
}

async fn sum_reports(waiters: Vec<oneshot::Receiver<BurstReport>>) -> BurstReport {
    join_all(waiters)
        .await
        .into_iter()
        .flatten()
        .fold(BurstReport::default(), |acc, r| BurstReport {
            sampled: acc.sampled + r.sampled,
            timed_out: acc.timed_out + r.timed_out,
        })
}
