//! Notification transport
//!
//! A second, unordered channel to the same peer (for example a BLE
//! characteristic). Frames arrive via the host, may be duplicated or
//! reordered, and are never trusted to be delivered; control actions sent
//! this way are acked and retransmitted.

use std::sync::Arc;

use parking_lot::Mutex;

use super::LinkError;

/// Outbound side of a notification channel, provided by the host
pub trait NotificationSink: Send + Sync {
    /// Hand one encoded frame to the host for delivery
    fn notify(&self, frame: Vec<u8>) -> Result<(), LinkError>;
}

/// Collects frames in memory. Used by tests and by loopback setups that
/// feed one session's notifications straight into another.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock())
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, frame: Vec<u8>) -> Result<(), LinkError> {
        self.frames.lock().push(frame);
        Ok(())
    }
}
