//! CueTimer - Core Library
//!
//! Keeps a performance timer in step across a parent device and its
//! children over a local link: clock offset estimation, sequenced timer
//! replication and a reconciler that turns both into a smooth display.

pub mod clock;
pub mod config;
pub mod ffi;
pub mod frame;
pub mod network;
pub mod playback;
pub mod session;
pub mod sync;

// Re-exports for convenience
pub use config::{LinkConfig, SyncConfig};
pub use session::{SessionEvent, SessionHandle, SyncSession};
pub use sync::{CueSheet, Event, EventKind, Role, TimerMessage, WireMessage};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
