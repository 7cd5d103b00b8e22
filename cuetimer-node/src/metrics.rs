//! Metrics tracking for the timer node

use chrono::{DateTime, Local};
use cuetimer_core::playback::DisplaySnapshot;
use cuetimer_core::session::Diagnostics;
use cuetimer_core::sync::{Peer, SignalQuality, TimerPhase};
use std::collections::VecDeque;

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, PartialEq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Connection,
    Timer,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Connection => "CONN",
            LogLevel::Timer => "TIMER",
        }
    }
}

/// Node metrics
pub struct Metrics {
    /// Node start time
    pub start_time: DateTime<Local>,

    /// Our peer ID
    pub peer_id: Option<String>,

    pub display_name: String,

    /// "parent" or "child"
    pub role: &'static str,

    /// Bound address (parent) or dial target (child)
    pub address: Option<String>,

    pub link_status: String,

    /// Total handshakes since start
    pub total_connections: u64,

    /// Peak simultaneous peers
    pub peak_peers: usize,

    /// Connected peers (for display)
    pub peer_list: Vec<PeerInfo>,

    /// Latest displayed timer value
    pub timer: TimerInfo,

    /// Stop events the playhead has reached
    pub events_reached: u64,

    pub diagnostics: Diagnostics,

    /// Log entries
    pub logs: VecDeque<LogEntry>,

    /// Node status
    pub status: NodeStatus,
}

#[derive(Clone)]
pub struct PeerInfo {
    pub peer_id: String,
    pub display_name: String,
    pub signal: SignalQuality,
    pub connected_at: DateTime<Local>,
}

#[derive(Clone)]
pub struct TimerInfo {
    pub phase: TimerPhase,
    pub elapsed_ns: i64,
    pub slewing: bool,
    pub next_event_id: Option<String>,
    pub hold_remaining_ns: Option<i64>,
}

#[derive(Clone, Copy, PartialEq)]
pub enum NodeStatus {
    Starting,
    Running,
    Error,
}

impl Metrics {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            start_time: Local::now(),
            peer_id: None,
            display_name: display_name.into(),
            role: "child",
            address: None,
            link_status: "not connected".to_string(),
            total_connections: 0,
            peak_peers: 0,
            peer_list: Vec::new(),
            timer: TimerInfo {
                phase: TimerPhase::Idle,
                elapsed_ns: 0,
                slewing: false,
                next_event_id: None,
                hold_remaining_ns: None,
            },
            events_reached: 0,
            diagnostics: Diagnostics::default(),
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            status: NodeStatus::Starting,
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    /// Replace the peer list, logging arrivals and departures
    pub fn peers_changed(&mut self, peers: &[Peer]) {
        for peer in peers {
            let id = peer.id.to_string();
            if let Some(known) = self.peer_list.iter_mut().find(|p| p.peer_id == id) {
                known.signal = peer.signal_quality;
                continue;
            }

            self.total_connections += 1;
            self.log(
                LogLevel::Connection,
                format!("Connected: {} ({})", peer.display_name, truncate_peer_id(&id)),
            );
            self.peer_list.push(PeerInfo {
                peer_id: id,
                display_name: peer.display_name.clone(),
                signal: peer.signal_quality,
                connected_at: Local::now(),
            });
        }

        let gone: Vec<PeerInfo> = self
            .peer_list
            .iter()
            .filter(|known| !peers.iter().any(|p| p.id.to_string() == known.peer_id))
            .cloned()
            .collect();
        for peer in gone {
            self.peer_list.retain(|p| p.peer_id != peer.peer_id);
            self.log(
                LogLevel::Connection,
                format!("Disconnected: {} ({})", peer.display_name, truncate_peer_id(&peer.peer_id)),
            );
        }

        self.peak_peers = self.peak_peers.max(self.peer_list.len());
    }

    /// Record the latest displayed value
    pub fn update_timer(&mut self, display: &DisplaySnapshot) {
        if display.phase != self.timer.phase {
            self.log(
                LogLevel::Timer,
                format!("{:?} at {}", display.phase, format_elapsed(display.elapsed_ns)),
            );
        }
        self.timer = TimerInfo {
            phase: display.phase,
            elapsed_ns: display.elapsed_ns,
            slewing: display.slewing,
            next_event_id: display.next_event_id.clone(),
            hold_remaining_ns: display.hold_remaining_ns,
        };
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        let secs = duration.num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            let hours = secs / 3600;
            let mins = (secs % 3600) / 60;
            format!("{}h {}m", hours, mins)
        }
    }
}

/// Truncate peer ID for display (show first and last few chars)
pub fn truncate_peer_id(peer_id: &str) -> String {
    if peer_id.len() > 16 {
        format!("{}...{}", &peer_id[..8], &peer_id[peer_id.len() - 4..])
    } else {
        peer_id.to_string()
    }
}

/// Elapsed nanoseconds as `MM:SS.mmm`, or `H:MM:SS.mmm` past an hour
pub fn format_elapsed(ns: i64) -> String {
    let sign = if ns < 0 { "-" } else { "" };
    let total_ms = ns.unsigned_abs() / 1_000_000;
    let ms = total_ms % 1000;
    let secs = (total_ms / 1000) % 60;
    let mins = (total_ms / 60_000) % 60;
    let hours = total_ms / 3_600_000;
    if hours > 0 {
        format!("{}{}:{:02}:{:02}.{:03}", sign, hours, mins, secs, ms)
    } else {
        format!("{}{:02}:{:02}.{:03}", sign, mins, secs, ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuetimer_core::sync::Role;

    fn peer(name: &str) -> Peer {
        Peer {
            id: uuid_for(name),
            role: Role::Child,
            display_name: name.to_string(),
            join_timestamp: 0,
            signal_quality: SignalQuality::Unknown,
        }
    }

    fn uuid_for(name: &str) -> uuid::Uuid {
        let mut bytes = [0u8; 16];
        for (i, b) in name.bytes().take(16).enumerate() {
            bytes[i] = b;
        }
        uuid::Uuid::from_bytes(bytes)
    }

    #[test]
    fn test_peers_changed_tracks_arrivals_and_departures() {
        let mut m = Metrics::new("Stage");
        m.peers_changed(&[peer("Booth"), peer("Pit")]);
        assert_eq!(m.peer_list.len(), 2);
        assert_eq!(m.total_connections, 2);

        m.peers_changed(&[peer("Pit")]);
        assert_eq!(m.peer_list.len(), 1);
        assert_eq!(m.peak_peers, 2);
        assert!(m.logs.back().is_some_and(|e| e.message.starts_with("Disconnected: Booth")));

        // Same peer again only refreshes signal
        let mut pit = peer("Pit");
        pit.signal_quality = SignalQuality::Good;
        m.peers_changed(&[pit]);
        assert_eq!(m.total_connections, 2);
        assert_eq!(m.peer_list[0].signal, SignalQuality::Good);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0), "00:00.000");
        assert_eq!(format_elapsed(61_250_000_000), "01:01.250");
        assert_eq!(format_elapsed(3_723_004_000_000), "1:02:03.004");
        assert_eq!(format_elapsed(-1_500_000_000), "-00:01.500");
    }

    #[test]
    fn test_log_is_bounded() {
        let mut m = Metrics::new("Stage");
        for i in 0..(MAX_LOG_ENTRIES + 10) {
            m.log(LogLevel::Info, format!("entry {}", i));
        }
        assert_eq!(m.logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(m.logs.front().map(|e| e.message.as_str()), Some("entry 10"));
    }
}
