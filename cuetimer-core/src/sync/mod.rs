//! Sync protocol
//!
//! Wire messages, the peer registry, and the sequencing rules that keep
//! replicas convergent under reordering and duplication.

mod peers;
mod protocol;
mod replication;

pub use peers::*;
pub use protocol::*;
pub use replication::*;
