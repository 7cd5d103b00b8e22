//! Link layer
//!
//! One logical link between a parent and its children over a framed TCP
//! stream, plus an optional host-provided notification channel.

mod backoff;
mod link;
mod notify;

pub use backoff::Backoff;
pub use link::{
    parse_port, ConnectionId, DialTarget, FailureCause, LinkCommand, LinkError, LinkEvent,
    LinkHandle, LinkManager, LinkStatus, TransportKind,
};
pub use notify::{NotificationSink, RecordingSink};
