//! Session event forwarding

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::session::SessionEvent;

use super::types::{LinkState, PeerInfo, PlaybackInfo, SessionCallback, SyncUpdate, TimerUpdate};

pub(super) type SharedCallback = Arc<RwLock<Option<Arc<dyn SessionCallback>>>>;

/// Forward one session event to the host callback, if one is set
pub(super) fn handle_session_event(event: SessionEvent, callback: &SharedCallback) {
    let cb = callback.read().clone();
    let Some(cb) = cb else {
        debug!("No callback set, dropping {:?}", event);
        return;
    };

    match event {
        SessionEvent::LinkStatusChanged(status) => {
            info!("Link status: {}", status);
            cb.on_link_status_changed(LinkState::from(status));
        }

        SessionEvent::Listening { addr } => {
            info!("Parent listening on {}", addr);
        }

        SessionEvent::RoleChanged(role) => {
            info!("Role is now {:?}", role);
        }

        SessionEvent::PeersChanged(peers) => {
            cb.on_peers_changed(peers.iter().map(PeerInfo::from).collect());
        }

        SessionEvent::TimerMessage(msg) => {
            cb.on_timer_message(TimerUpdate::from(&msg));
        }

        SessionEvent::SyncEnvelope(envelope) => {
            cb.on_sync_envelope(SyncUpdate::from(&envelope));
        }

        SessionEvent::PlaybackChanged(display) => {
            cb.on_playback_changed(PlaybackInfo::from(&display));
        }

        SessionEvent::EventReached { event_id } => {
            cb.on_event_reached(event_id);
        }

        SessionEvent::Error(message) => {
            warn!("Session error: {}", message);
            cb.on_error(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LinkStatus;
    use crate::playback::DisplaySnapshot;
    use crate::sync::TimerPhase;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl SessionCallback for Recorder {
        fn on_link_status_changed(&self, status: LinkState) {
            self.calls.lock().push(format!("link {:?}", status));
        }
        fn on_peers_changed(&self, peers: Vec<PeerInfo>) {
            self.calls.lock().push(format!("peers {}", peers.len()));
        }
        fn on_timer_message(&self, update: TimerUpdate) {
            self.calls.lock().push(format!("timer {}", update.action));
        }
        fn on_sync_envelope(&self, update: SyncUpdate) {
            self.calls.lock().push(format!("sync {}", update.kind));
        }
        fn on_playback_changed(&self, playback: PlaybackInfo) {
            self.calls.lock().push(format!("playback {:?}", playback.state));
        }
        fn on_event_reached(&self, event_id: String) {
            self.calls.lock().push(format!("reached {}", event_id));
        }
        fn on_error(&self, message: String) {
            self.calls.lock().push(format!("error {}", message));
        }
    }

    #[test]
    fn test_events_reach_callback() {
        let recorder = Arc::new(Recorder::default());
        let callback: SharedCallback = Arc::new(RwLock::new(Some(recorder.clone() as Arc<dyn SessionCallback>)));

        handle_session_event(SessionEvent::LinkStatusChanged(LinkStatus::Connected), &callback);
        handle_session_event(SessionEvent::PeersChanged(Vec::new()), &callback);
        handle_session_event(
            SessionEvent::PlaybackChanged(DisplaySnapshot {
                phase: TimerPhase::Running,
                elapsed_ns: 0,
                slewing: false,
                current_event_id: None,
                next_event_id: None,
                hold_remaining_ns: None,
            }),
            &callback,
        );
        handle_session_event(SessionEvent::EventReached { event_id: "s1".into() }, &callback);

        let calls = recorder.calls.lock().clone();
        assert_eq!(
            calls,
            vec!["link Connected", "peers 0", "playback Running", "reached s1"]
        );
    }

    #[test]
    fn test_no_callback_is_fine() {
        let callback: SharedCallback = Arc::new(RwLock::new(None));
        handle_session_event(SessionEvent::Error("boom".into()), &callback);
    }
}
