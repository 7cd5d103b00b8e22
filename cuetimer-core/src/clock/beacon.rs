//! Beacon bookkeeping
//!
//! Outstanding beacons are correlated with their echoes by `seq`, never by
//! arrival order: a new beacon can go out before an older echo returns.
//! Each beacon moves through `Idle -> AwaitingEcho -> (Sampled | TimedOut)`.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use tokio::sync::oneshot;

use super::Nanos;

/// Where the most recent beacon exchange stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconPhase {
    /// Nothing sent since the last reset
    Idle,
    /// At least one beacon is waiting for its echo
    AwaitingEcho,
    /// The last resolved beacon produced a sample
    Sampled,
    /// The last resolved beacon expired without an echo
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct PendingBeacon {
    pub sent_at: Nanos,
    pub burst: bool,
}

/// Tracks beacons awaiting echoes
#[derive(Debug)]
pub struct BeaconTracker {
    pending: HashMap<u64, PendingBeacon>,
    next_seq: u64,
    timeout: Nanos,
    phase: BeaconPhase,
}

impl BeaconTracker {
    pub fn new(timeout: Nanos) -> Self {
        Self {
            pending: HashMap::new(),
            next_seq: random_seq_base(),
            timeout,
            phase: BeaconPhase::Idle,
        }
    }

    pub fn phase(&self) -> BeaconPhase {
        self.phase
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// When the oldest outstanding beacon will expire
    pub fn next_expiry(&self) -> Option<Nanos> {
        self.pending.values().map(|p| p.sent_at + self.timeout).min()
    }

    /// Register a beacon about to be sent; returns its seq
    pub fn issue(&mut self, now: Nanos, burst: bool) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.pending.insert(seq, PendingBeacon { sent_at: now, burst });
        self.phase = BeaconPhase::AwaitingEcho;
        seq
    }

    /// Match an echo to its beacon. Unknown seqs (late, duplicated, or from a
    /// previous epoch) return None.
    pub fn resolve(&mut self, seq: u64) -> Option<PendingBeacon> {
        let pending = self.pending.remove(&seq)?;
        self.phase = if self.pending.is_empty() {
            BeaconPhase::Sampled
        } else {
            BeaconPhase::AwaitingEcho
        };
        Some(pending)
    }

    /// Drop beacons whose echo is overdue
    pub fn expire(&mut self, now: Nanos) -> Vec<(u64, PendingBeacon)> {
        let timeout = self.timeout;
        let expired: Vec<(u64, PendingBeacon)> = self
            .pending
            .iter()
            .filter(|(_, p)| now - p.sent_at >= timeout)
            .map(|(seq, p)| (*seq, *p))
            .collect();

        for (seq, _) in &expired {
            self.pending.remove(seq);
        }
        if !expired.is_empty() && self.pending.is_empty() {
            self.phase = BeaconPhase::TimedOut;
        }
        expired
    }

    /// Forget all outstanding beacons and start a fresh seq space
    pub fn reset(&mut self) {
        self.pending.clear();
        self.next_seq = random_seq_base();
        self.phase = BeaconPhase::Idle;
    }
}

/// A fresh epoch starts from a random seq so stray echoes from a previous
/// epoch cannot correlate with new beacons.
fn random_seq_base() -> u64 {
    u64::from(rand::thread_rng().gen::<u32>()) << 16
}

/// Result of a completed burst
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurstReport {
    pub sampled: u32,
    pub timed_out: u32,
}

/// An out-of-band burst of beacons
#[derive(Debug)]
pub struct BurstState {
    remaining: u32,
    spacing: Nanos,
    last_sent: Option<Nanos>,
    outstanding: HashSet<u64>,
    report: BurstReport,
    waiters: Vec<oneshot::Sender<BurstReport>>,
}

impl BurstState {
    pub fn new(count: u32, spacing: Nanos) -> Self {
        Self {
            remaining: count,
            spacing,
            last_sent: None,
            outstanding: HashSet::new(),
            report: BurstReport::default(),
            waiters: Vec::new(),
        }
    }

    /// Fold another request into a burst already in progress
    pub fn extend(&mut self, count: u32, spacing: Nanos) {
        self.remaining = self.remaining.max(count);
        self.spacing = self.spacing.min(spacing);
    }

    pub fn add_waiter(&mut self, waiter: oneshot::Sender<BurstReport>) {
        self.waiters.push(waiter);
    }

    /// Sends still owed by this burst
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// When the next burst beacon is due (now, if none sent yet)
    pub fn next_due(&self, now: Nanos) -> Option<Nanos> {
        if self.remaining == 0 {
            return None;
        }
        Some(self.last_sent.map(|t| t + self.spacing).unwrap_or(now))
    }

    pub fn record_send(&mut self, seq: u64, now: Nanos) {
        self.remaining = self.remaining.saturating_sub(1);
        self.last_sent = Some(now);
        self.outstanding.insert(seq);
    }

    /// Note the fate of a beacon; returns true if it belonged to this burst
    pub fn resolve(&mut self, seq: u64, sampled: bool) -> bool {
        if !self.outstanding.remove(&seq) {
            return false;
        }
        if sampled {
            self.report.sampled += 1;
        } else {
            self.report.timed_out += 1;
        }
        true
    }

    /// All sends done and every burst beacon resolved
    pub fn is_complete(&self) -> bool {
        self.remaining == 0 && self.outstanding.is_empty()
    }

    /// Notify everyone waiting on this burst
    pub fn finish(self) -> BurstReport {
        for waiter in self.waiters {
            let _ = waiter.send(self.report);
        }
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::millis;

    #[test]
    fn test_tracker_phases() {
        let mut tracker = BeaconTracker::new(millis(1000));
        assert_eq!(tracker.phase(), BeaconPhase::Idle);

        let a = tracker.issue(0, false);
        let b = tracker.issue(millis(50), false);
        assert_ne!(a, b);
        assert_eq!(tracker.phase(), BeaconPhase::AwaitingEcho);

        // Echo for the newer beacon arrives first
        assert!(tracker.resolve(b).is_some());
        assert_eq!(tracker.phase(), BeaconPhase::AwaitingEcho);
        assert!(tracker.resolve(a).is_some());
        assert_eq!(tracker.phase(), BeaconPhase::Sampled);

        // Duplicate echo is ignored
        assert!(tracker.resolve(a).is_none());
    }

    #[test]
    fn test_tracker_expiry() {
        let mut tracker = BeaconTracker::new(millis(1000));
        let seq = tracker.issue(0, false);

        assert!(tracker.expire(millis(999)).is_empty());
        let expired = tracker.expire(millis(1000));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, seq);
        assert_eq!(tracker.phase(), BeaconPhase::TimedOut);

        // A late echo after expiry is simply unknown
        assert!(tracker.resolve(seq).is_none());
    }

    #[tokio::test]
    async fn test_burst_completion_notifies_waiters() {
        let mut burst = BurstState::new(2, millis(40));
        let (tx, rx) = oneshot::channel();
        burst.add_waiter(tx);

        assert_eq!(burst.next_due(millis(5)), Some(millis(5)));
        burst.record_send(10, millis(5));
        assert_eq!(burst.next_due(millis(6)), Some(millis(45)));
        burst.record_send(11, millis(45));
        assert_eq!(burst.next_due(millis(50)), None);

        assert!(burst.resolve(10, true));
        assert!(!burst.is_complete());
        assert!(!burst.resolve(99, true));
        assert!(burst.resolve(11, false));
        assert!(burst.is_complete());

        burst.finish();
        let report = rx.await.unwrap();
        assert_eq!(report, BurstReport { sampled: 1, timed_out: 1 });
    }
}
