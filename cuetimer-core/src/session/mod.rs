//! Sync Session
//!
//! The serialized apply path for one link. A parent session owns the
//! authoritative [`LocalTimer`](crate::playback::LocalTimer) and publishes
//! it; a child session validates what arrives and reconciles its display.

mod actor;
mod types;

pub use actor::SyncSession;
pub use types::{Diagnostics, SessionError, SessionEvent, SessionHandle, SessionSnapshot};
