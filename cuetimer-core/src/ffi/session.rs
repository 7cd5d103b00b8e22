//! Session implementation for FFI

use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{LinkConfig, SyncConfig};
use crate::network::{LinkError, NotificationSink};
use crate::session::{SessionHandle, SessionSnapshot, SyncSession};
use crate::sync::{CueSheet, Event, Role};

use super::handlers::{handle_session_event, SharedCallback};
use super::types::*;

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cuetimer_core=debug"));
        let _ = tracing_subscriber::fmt()
            .with_ansi(false) // Disable colors for Xcode console
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Adapts the host's notification transport to the core sink
struct HostTransport(Box<dyn NotificationTransport>);

impl NotificationSink for HostTransport {
    fn notify(&self, frame: Vec<u8>) -> Result<(), LinkError> {
        if self.0.send_frame(frame) {
            Ok(())
        } else {
            Err(LinkError::Notification("host transport rejected frame".to_string()))
        }
    }
}

/// Main session interface
#[derive(uniffi::Object)]
pub struct Session {
    runtime: Runtime,
    handle: SessionHandle,
    callback: SharedCallback,
    local_peer_id: Uuid,
}

impl Session {
    fn snapshot(&self) -> Result<SessionSnapshot, CoreError> {
        Ok(self.runtime.block_on(self.handle.snapshot())?)
    }
}

#[uniffi::export]
impl Session {
    /// Create a new session; it starts as a child with the link disabled
    #[uniffi::constructor]
    pub fn new(display_name: String) -> Result<Arc<Self>, CoreError> {
        init_tracing();
        info!("Initializing cuetimer-core session");

        let runtime = Runtime::new().map_err(|e| CoreError::RuntimeError(e.to_string()))?;
        let session = SyncSession::new(display_name, LinkConfig::default(), SyncConfig::default());
        let local_peer_id = session.local_id();

        let (handle, mut events) = {
            let _guard = runtime.enter();
            session.start()
        };

        let callback: SharedCallback = Arc::new(RwLock::new(None));
        let forward_to = callback.clone();
        runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                handle_session_event(event, &forward_to);
            }
        });

        Ok(Arc::new(Self {
            runtime,
            handle,
            callback,
            local_peer_id,
        }))
    }

    /// Set the event callback
    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        *self.callback.write() = Some(Arc::from(callback));
    }

    /// Set the notification channel used alongside the stream link
    pub fn set_notification_transport(&self, transport: Box<dyn NotificationTransport>) -> Result<(), CoreError> {
        let sink: Arc<dyn NotificationSink> = Arc::new(HostTransport(transport));
        Ok(self.handle.set_notification_sink(Some(sink))?)
    }

    pub fn clear_notification_transport(&self) -> Result<(), CoreError> {
        Ok(self.handle.set_notification_sink(None)?)
    }

    /// Bytes the host received on the notification channel
    pub fn deliver_notification(&self, bytes: Vec<u8>) -> Result<(), CoreError> {
        Ok(self.handle.deliver_notification(bytes)?)
    }

    pub fn local_peer_id(&self) -> String {
        self.local_peer_id.to_string()
    }

    /// Become the parent and listen on `port`
    pub fn enable_parent(&self, port: String) -> Result<(), CoreError> {
        info!("Enabling parent on port {}", port);
        Ok(self.handle.enable_parent(&port)?)
    }

    /// Become a child of the parent at `host:port`
    pub fn enable_child(&self, address: String) -> Result<(), CoreError> {
        info!("Enabling child of {}", address);
        Ok(self.handle.enable_child(&address)?)
    }

    pub fn disable(&self) -> Result<(), CoreError> {
        Ok(self.handle.disable()?)
    }

    pub fn switch_role(&self, address: Option<String>) -> Result<(), CoreError> {
        Ok(self.handle.switch_role(address.as_deref())?)
    }

    pub fn is_parent(&self) -> Result<bool, CoreError> {
        Ok(self.snapshot()?.role == Role::Parent)
    }

    pub fn start_timer(&self) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.handle.start_timer())?)
    }

    pub fn pause_timer(&self) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.handle.pause_timer())?)
    }

    pub fn reset_timer(&self) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.handle.reset_timer())?)
    }

    /// Hold at a stop event for `hold_ms`, then resume everywhere
    pub fn hold_for_stop(&self, hold_ms: u64) -> Result<(), CoreError> {
        let hold = Duration::from_millis(hold_ms);
        Ok(self.runtime.block_on(self.handle.hold_for_stop(hold))?)
    }

    pub fn end_cue_sheet(&self) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.handle.end_cue_sheet())?)
    }

    pub fn load_cue_sheet(&self, sheet: CueSheetInfo) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.handle.load_cue_sheet(CueSheet::from(sheet)))?)
    }

    pub fn add_event(&self, event: CueEventInfo) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.handle.add_event(Event::from(event)))?)
    }

    /// Burst beacons to every peer; blocks until the burst settles
    pub fn request_burst_sync_samples(&self, count: u32, spacing_ms: u64) -> Result<BurstResult, CoreError> {
        let spacing = Duration::from_millis(spacing_ms);
        let report = self
            .runtime
            .block_on(self.handle.request_burst_sync_samples(count, spacing))?;
        Ok(BurstResult {
            sampled: report.sampled,
            timed_out: report.timed_out,
        })
    }

    /// Signal quality as seen by the host's radio stack
    pub fn report_signal_quality(&self, peer_id: String, signal: SignalLevel) -> Result<(), CoreError> {
        let id = Uuid::parse_str(&peer_id).map_err(|_| CoreError::UnknownPeer(peer_id.clone()))?;
        Ok(self.handle.report_signal_quality(id, signal.into())?)
    }

    /// Latest displayed value; cheap enough to call every frame
    pub fn playback(&self) -> PlaybackInfo {
        PlaybackInfo::from(&*self.handle.display().borrow())
    }

    pub fn peers(&self) -> Result<Vec<PeerInfo>, CoreError> {
        Ok(self.snapshot()?.peers.iter().map(PeerInfo::from).collect())
    }

    pub fn link_status(&self) -> Result<LinkState, CoreError> {
        Ok(self.snapshot()?.link_status.into())
    }

    pub fn diagnostics(&self) -> Result<DiagnosticsInfo, CoreError> {
        Ok(DiagnosticsInfo::from(&self.snapshot()?.diagnostics))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.handle.disable().is_err() {
            warn!("Session already closed on drop");
        }
        self.handle.shutdown();
    }
}
