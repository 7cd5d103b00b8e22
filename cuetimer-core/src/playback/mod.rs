//! Playback
//!
//! Child-side reconciliation of replicated timer state into a smoothly
//! animating display value, plus the parent's authoritative local timer.

mod reconciler;
mod schedule;
mod slew;
mod source;

pub use reconciler::*;
pub use schedule::Schedule;
pub use slew::Slew;
pub use source::{LocalTimer, TimerSource};
