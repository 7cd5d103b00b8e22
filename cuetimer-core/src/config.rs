//! Link and sync configuration
//!
//! Defaults mirror the timings the surrounding app has been tuned against;
//! every field can be overridden before a session is started.

use std::time::Duration;

/// Default TCP port the parent listens on
pub const DEFAULT_LISTEN_PORT: u16 = 47_820;

/// Largest frame accepted before the codec starts discarding bytes
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Connection manager configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Port the parent binds (0 = any free port)
    pub listen_port: u16,
    /// Dials that take longer than this are cancelled and treated as failures
    pub dial_timeout: Duration,
    /// Backoff base: delay = min(cap, base * (attempt + 1)^exponent)
    pub backoff_base: Duration,
    /// Backoff ceiling
    pub backoff_cap: Duration,
    pub backoff_exponent: f64,
    /// Keep-alive re-dial cadence while enabled but not established
    pub keep_alive_interval: Duration,
    pub max_frame_len: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            dial_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(600),
            backoff_cap: Duration::from_millis(4500),
            backoff_exponent: 1.2,
            keep_alive_interval: Duration::from_millis(2500),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Clock sync, replication and reconciliation timings
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Periodic beacon cadence (20 Hz)
    pub beacon_interval: Duration,
    /// Beacons without an echo after this long are discarded
    pub beacon_timeout: Duration,
    /// Burst size used around freezes
    pub burst_count: u32,
    pub burst_spacing: Duration,
    /// Anchor gaps at or below this snap instead of slewing
    pub slew_threshold: Duration,
    pub slew_duration: Duration,
    /// Running updates are ignored for this long after a control action
    pub quench_window: Duration,
    /// Seconds of start-instant correction per second of real time
    pub max_nudge_rate: f64,
    /// Transit assumed when no clock estimate exists yet
    pub default_transit: Duration,
    /// Display ticker period while the timer animates
    pub display_tick: Duration,
    /// Continuous update cadence while a parent link is established
    pub status_interval: Duration,
    /// Resend cadence for unacknowledged control actions
    pub retransmit_interval: Duration,
    pub retransmit_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            beacon_interval: Duration::from_millis(50),
            beacon_timeout: Duration::from_secs(1),
            burst_count: 3,
            burst_spacing: Duration::from_millis(40),
            slew_threshold: Duration::from_millis(10),
            slew_duration: Duration::from_millis(120),
            quench_window: Duration::from_millis(250),
            max_nudge_rate: 0.05,
            default_transit: Duration::from_millis(10),
            display_tick: Duration::from_micros(8_333),
            status_interval: Duration::from_millis(500),
            retransmit_interval: Duration::from_millis(150),
            retransmit_attempts: 8,
        }
    }
}
