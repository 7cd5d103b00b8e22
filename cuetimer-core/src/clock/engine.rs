//! Per-peer beacon scheduling
//!
//! `ClockSyncEngine` is sans-IO: the owning actor asks it for the next
//! beacon to send, hands it every beacon or echo that arrives, and sleeps
//! until [`ClockSyncEngine::next_due`].

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use super::beacon::{BeaconPhase, BeaconTracker, BurstReport, BurstState};
use super::estimator::{ClockEstimate, ClockEstimator, ClockSample, SampleWeight};
use super::{nanos, Nanos};
use crate::config::SyncConfig;
use crate::sync::{BeaconEnvelope, BeaconKind};

/// Clock synchronization with a single peer
#[derive(Debug)]
pub struct ClockSyncEngine {
    local_id: Uuid,
    interval: Nanos,
    estimator: ClockEstimator,
    tracker: BeaconTracker,
    burst: Option<BurstState>,
    last_periodic: Option<Nanos>,
}

impl ClockSyncEngine {
    pub fn new(local_id: Uuid, config: &SyncConfig) -> Self {
        Self {
            local_id,
            interval: nanos(config.beacon_interval),
            estimator: ClockEstimator::new(),
            tracker: BeaconTracker::new(nanos(config.beacon_timeout)),
            burst: None,
            last_periodic: None,
        }
    }

    /// Earliest instant at which `poll_beacon` has work to do
    pub fn next_due(&self, now: Nanos) -> Nanos {
        let send_due = match self.burst.as_ref().and_then(|b| b.next_due(now)) {
            Some(due) => due,
            None => self.last_periodic.map(|t| t + self.interval).unwrap_or(now),
        };
        match self.tracker.next_expiry() {
            Some(expiry) => send_due.min(expiry),
            None => send_due,
        }
    }

    /// Expire overdue beacons, then return a beacon if one is due.
    ///
    /// A burst that still owes sends suppresses the periodic beacon.
    pub fn poll_beacon(&mut self, now: Nanos, target: Option<Uuid>) -> Option<BeaconEnvelope> {
        self.expire_pending(now);

        if let Some(burst) = self.burst.as_mut() {
            if let Some(due) = burst.next_due(now) {
                if due > now {
                    return None;
                }
                let seq = self.tracker.issue(now, true);
                burst.record_send(seq, now);
                if burst.remaining() == 0 {
                    // Periodic cadence resumes one interval after the last burst send
                    self.last_periodic = Some(now);
                }
                return Some(BeaconEnvelope::beacon(self.local_id, target, seq, now));
            }
        }

        let due = self.last_periodic.map(|t| t + self.interval).unwrap_or(now);
        if due > now {
            return None;
        }
        let seq = self.tracker.issue(now, false);
        self.last_periodic = Some(now);
        Some(BeaconEnvelope::beacon(self.local_id, target, seq, now))
    }

    /// Answer a peer's beacon.
    ///
    /// `received_at` is when the frame was read; `now` is the echo send time.
    pub fn handle_beacon(&self, beacon: &BeaconEnvelope, received_at: Nanos, now: Nanos) -> Option<BeaconEnvelope> {
        if beacon.kind != BeaconKind::Beacon || beacon.sender_id == self.local_id {
            return None;
        }
        if let Some(target) = beacon.target_id {
            if target != self.local_id {
                return None;
            }
        }
        Some(beacon.clone().into_echo(received_at, now))
    }

    /// Fold an echo of one of our beacons into the estimate
    pub fn handle_echo(&mut self, echo: &BeaconEnvelope, received_at: Nanos) -> Option<ClockSample> {
        if echo.kind != BeaconKind::Echo || echo.sender_id != self.local_id {
            return None;
        }
        let (Some(t2), Some(t3)) = (echo.t_receiver_recv, echo.t_receiver_echo_send) else {
            debug!("Clock: echo {} missing receiver stamps", echo.seq);
            return None;
        };
        let Some(pending) = self.tracker.resolve(echo.seq) else {
            debug!("Clock: ignoring unknown or expired echo {}", echo.seq);
            return None;
        };

        let sample = ClockSample::from_exchange(echo.seq, pending.sent_at, t2, t3, received_at);
        let weight = self.estimator.add_sample(sample);

        if pending.burst {
            self.resolve_burst(echo.seq, weight != SampleWeight::Rejected);
        }

        match weight {
            SampleWeight::Rejected => None,
            _ => Some(sample),
        }
    }

    /// Discard beacons whose echo never came; returns how many expired
    pub fn expire_pending(&mut self, now: Nanos) -> usize {
        let expired = self.tracker.expire(now);
        for (seq, pending) in &expired {
            debug!("Clock: beacon {} timed out", seq);
            if pending.burst {
                self.resolve_burst(*seq, false);
            }
        }
        expired.len()
    }

    fn resolve_burst(&mut self, seq: u64, sampled: bool) {
        let complete = match self.burst.as_mut() {
            Some(burst) => burst.resolve(seq, sampled) && burst.is_complete(),
            None => false,
        };
        if complete {
            if let Some(burst) = self.burst.take() {
                let report = burst.finish();
                debug!(
                    "Clock: burst complete ({} sampled, {} timed out)",
                    report.sampled, report.timed_out
                );
            }
        }
    }

    /// Send `count` beacons `spacing` apart, starting immediately.
    ///
    /// The receiver resolves once every burst beacon has been echoed or has
    /// timed out. A request made while a burst is running joins it.
    pub fn request_burst_sync_samples(&mut self, count: u32, spacing: Duration) -> oneshot::Receiver<BurstReport> {
        let (tx, rx) = oneshot::channel();
        if count == 0 {
            let _ = tx.send(BurstReport::default());
            return rx;
        }

        let spacing = nanos(spacing);
        match self.burst.as_mut() {
            Some(burst) => burst.extend(count, spacing),
            None => {
                info!("Clock: burst of {} beacons every {}ms", count, spacing / 1_000_000);
                self.burst = Some(BurstState::new(count, spacing));
            }
        }
        if let Some(burst) = self.burst.as_mut() {
            burst.add_waiter(tx);
        }
        rx
    }

    pub fn is_bursting(&self) -> bool {
        self.burst.is_some()
    }

    pub fn estimate(&self) -> Option<ClockEstimate> {
        self.estimator.estimate()
    }

    pub fn phase(&self) -> BeaconPhase {
        self.tracker.phase()
    }

    /// Start a new synchronization epoch. Burst waiters are released with
    /// whatever they had collected.
    pub fn reset(&mut self) {
        self.estimator.reset();
        self.tracker.reset();
        self.last_periodic = None;
        if let Some(burst) = self.burst.take() {
            burst.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::millis;

    /// Peer clock runs `offset` ahead; both legs take `leg`
    fn round_trip(
        local: &mut ClockSyncEngine,
        remote: &ClockSyncEngine,
        beacon: BeaconEnvelope,
        offset: Nanos,
        leg: Nanos,
    ) -> Option<ClockSample> {
        let t1 = beacon.t_sender_send;
        let t2 = t1 + leg + offset;
        let echo = remote.handle_beacon(&beacon, t2, t2 + millis(1))?;
        let t4 = t2 + millis(1) - offset + leg;
        local.handle_echo(&echo, t4)
    }

    fn engines() -> (ClockSyncEngine, ClockSyncEngine) {
        let config = SyncConfig::default();
        (
            ClockSyncEngine::new(Uuid::new_v4(), &config),
            ClockSyncEngine::new(Uuid::new_v4(), &config),
        )
    }

    #[test]
    fn test_periodic_cadence() {
        let (mut engine, _) = engines();
        assert!(engine.poll_beacon(0, None).is_some());
        assert!(engine.poll_beacon(millis(49), None).is_none());
        assert_eq!(engine.next_due(millis(49)), millis(50));
        assert!(engine.poll_beacon(millis(50), None).is_some());
    }

    #[test]
    fn test_converges_to_true_offset() {
        let (mut local, remote) = engines();
        let offset = millis(3_700);
        let mut now = 0;

        for _ in 0..50 {
            let beacon = local.poll_beacon(now, None).unwrap();
            round_trip(&mut local, &remote, beacon, offset, millis(7));
            now += millis(50);
        }

        let estimate = local.estimate().unwrap();
        assert!((estimate.offset_ns - offset).abs() < millis(1));
        assert_eq!(local.phase(), BeaconPhase::Sampled);
    }

    #[test]
    fn test_burst_suppresses_periodic_and_self_terminates() {
        let (mut local, remote) = engines();
        assert!(local.poll_beacon(0, None).is_some());

        let mut report = local.request_burst_sync_samples(3, Duration::from_millis(40));
        assert!(local.is_bursting());

        let mut sent = Vec::new();
        let mut now = millis(10);
        while now <= millis(200) {
            if let Some(beacon) = local.poll_beacon(now, None) {
                sent.push((now, beacon));
            }
            now += millis(10);
        }

        // Three burst beacons at 10/50/90ms, then periodic resumes at 140ms
        let times: Vec<Nanos> = sent.iter().map(|(t, _)| *t).collect();
        assert_eq!(times[..3], [millis(10), millis(50), millis(90)]);
        assert_eq!(times[3], millis(140));

        assert!(report.try_recv().is_err());
        for (_, beacon) in sent.into_iter().take(3) {
            round_trip(&mut local, &remote, beacon, millis(20), millis(5));
        }
        assert!(!local.is_bursting());
        assert_eq!(report.try_recv().unwrap(), BurstReport { sampled: 3, timed_out: 0 });
    }

    #[test]
    fn test_burst_completes_on_timeouts() {
        let (mut local, _) = engines();
        let mut report = local.request_burst_sync_samples(2, Duration::from_millis(40));
        assert!(local.poll_beacon(0, None).is_some());
        assert!(local.poll_beacon(millis(40), None).is_some());

        // Nothing echoes; both expire after the one second timeout
        assert_eq!(local.expire_pending(millis(1_040)), 2);
        assert_eq!(report.try_recv().unwrap(), BurstReport { sampled: 0, timed_out: 2 });
        assert_eq!(local.phase(), BeaconPhase::TimedOut);
        assert!(local.estimate().is_none());
    }

    #[test]
    fn test_out_of_order_echoes_correlate_by_seq() {
        let (mut local, remote) = engines();
        let first = local.poll_beacon(0, None).unwrap();
        let second = local.poll_beacon(millis(50), None).unwrap();

        let echo_second = remote.handle_beacon(&second, millis(60), millis(61)).unwrap();
        let echo_first = remote.handle_beacon(&first, millis(62), millis(63)).unwrap();

        let s2 = local.handle_echo(&echo_second, millis(71)).unwrap();
        let s1 = local.handle_echo(&echo_first, millis(73)).unwrap();
        assert_eq!(s2.seq, second.seq);
        assert_eq!(s1.seq, first.seq);
        assert_eq!(s2.round_trip_ns, millis(20));
        assert_eq!(s1.round_trip_ns, millis(72));

        // Replayed echo is ignored
        assert!(local.handle_echo(&echo_first, millis(80)).is_none());
    }

    #[test]
    fn test_ignores_own_and_misdirected_beacons() {
        let (local, remote) = engines();
        let own = BeaconEnvelope::beacon(local.local_id, None, 1, 0);
        assert!(local.handle_beacon(&own, 1, 2).is_none());

        let other = BeaconEnvelope::beacon(remote.local_id, Some(Uuid::new_v4()), 1, 0);
        assert!(local.handle_beacon(&other, 1, 2).is_none());
    }

    #[tokio::test]
    async fn test_reset_releases_burst_waiters() {
        let (mut local, _) = engines();
        let report = local.request_burst_sync_samples(3, Duration::from_millis(40));
        local.poll_beacon(0, None);
        local.reset();
        assert_eq!(report.await.unwrap(), BurstReport { sampled: 0, timed_out: 0 });
        assert!(!local.is_bursting());
    }
}
