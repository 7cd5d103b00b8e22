//! Peer Registry
//!
//! Peers are learned from the `Hello` handshake on each connection and
//! forgotten when that connection closes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::protocol::{Hello, Role};
use crate::clock::{millis, Nanos};
use crate::network::ConnectionId;

/// Radio conditions as seen from beacon round trips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalQuality {
    Good,
    Degraded,
    Lost,
    /// No round trip measured yet
    Unknown,
}

impl SignalQuality {
    pub fn from_round_trip(round_trip: Nanos) -> Self {
        if round_trip < millis(50) {
            SignalQuality::Good
        } else if round_trip < millis(100) {
            SignalQuality::Degraded
        } else {
            SignalQuality::Lost
        }
    }
}

/// A device on the other end of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: Uuid,
    pub role: Role,
    pub display_name: String,
    /// Local uptime when the handshake arrived
    pub join_timestamp: Nanos,
    pub signal_quality: SignalQuality,
}

/// Known peers keyed by the connection they arrived on
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<ConnectionId, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a handshake. A repeated hello on the same connection keeps the
    /// original identity and join time; only the display name may change.
    /// Returns true if the peer list changed.
    pub fn upsert_from_hello(&mut self, conn: ConnectionId, hello: &Hello, now: Nanos) -> bool {
        match self.peers.get_mut(&conn) {
            Some(existing) if existing.id == hello.peer_id => {
                if existing.display_name == hello.display_name {
                    return false;
                }
                existing.display_name = hello.display_name.clone();
                true
            }
            _ => {
                // Same device reconnecting on a new connection replaces the stale entry
                self.peers.retain(|_, p| p.id != hello.peer_id);
                self.peers.insert(
                    conn,
                    Peer {
                        id: hello.peer_id,
                        role: hello.role,
                        display_name: hello.display_name.clone(),
                        join_timestamp: now,
                        signal_quality: SignalQuality::Unknown,
                    },
                );
                true
            }
        }
    }

    pub fn remove_connection(&mut self, conn: ConnectionId) -> Option<Peer> {
        self.peers.remove(&conn)
    }

    pub fn peer_for(&self, conn: ConnectionId) -> Option<&Peer> {
        self.peers.get(&conn)
    }

    pub fn connection_for(&self, id: Uuid) -> Option<ConnectionId> {
        self.peers
            .iter()
            .find(|(_, p)| p.id == id)
            .map(|(conn, _)| *conn)
    }

    /// Returns true if the quality changed
    pub fn update_signal_quality(&mut self, conn: ConnectionId, quality: SignalQuality) -> bool {
        match self.peers.get_mut(&conn) {
            Some(peer) if peer.signal_quality != quality => {
                peer.signal_quality = quality;
                true
            }
            _ => false,
        }
    }

    /// Parent first, then by display name
    pub fn peer_list(&self) -> Vec<Peer> {
        let mut list: Vec<Peer> = self.peers.values().cloned().collect();
        list.sort_by(|a, b| match (a.role, b.role) {
            (Role::Parent, Role::Child) => std::cmp::Ordering::Less,
            (Role::Child, Role::Parent) => std::cmp::Ordering::Greater,
            _ => a
                .display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase()),
        });
        list
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
