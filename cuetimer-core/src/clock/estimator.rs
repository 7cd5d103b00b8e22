//! Offset estimation from beacon round trips
//!
//! Each completed round trip yields one sample. Samples feed an EMA of the
//! offset; samples whose round trip is far above the recent median are
//! treated as outliers and learned from very slowly instead of being
//! applied directly, since short-range radios deliver latency in bursts.

use std::collections::VecDeque;

use super::Nanos;

/// Number of recent round trips kept for the median
const RTT_WINDOW: usize = 9;

/// Minimum samples before the median is trusted for outlier detection
const MIN_SAMPLES_FOR_MEDIAN: usize = 3;

/// Round trips above `median * OUTLIER_FACTOR` are outliers
const OUTLIER_FACTOR: f64 = 3.0;

/// ...and must also exceed the median by at least this much
const OUTLIER_MIN_EXCESS: Nanos = 5_000_000;

/// Faster learning while the estimate is young
const FAST_ALPHA: f64 = 0.4;
const FAST_SAMPLES: u32 = 5;

/// Steady-state EMA smoothing factor
const EMA_ALPHA: f64 = 0.15;

/// Outliers still teach us something, just much more slowly
const OUTLIER_ALPHA: f64 = 0.02;

/// Drift is measured over at least this much local time
const DRIFT_BASELINE: Nanos = 2_000_000_000;

const DRIFT_ALPHA: f64 = 0.2;

/// Crystal oscillators stay well inside this; anything larger is noise
const MAX_DRIFT: f64 = 200e-6;

/// One completed beacon exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub seq: u64,
    /// Round trip minus the peer's turnaround time
    pub round_trip_ns: Nanos,
    /// Peer clock minus local clock
    pub offset_ns: Nanos,
    /// Local time the echo arrived
    pub local_time: Nanos,
}

impl ClockSample {
    /// Build a sample from the four timestamps of one exchange.
    ///
    /// t1 = local send, t2 = peer receive, t3 = peer echo send, t4 = local receive
    pub fn from_exchange(seq: u64, t1: Nanos, t2: Nanos, t3: Nanos, t4: Nanos) -> Self {
        let round_trip_ns = (t4 - t1) - (t3 - t2);
        let offset_ns = ((t2 - t1) + (t3 - t4)) / 2;
        Self {
            seq,
            round_trip_ns,
            offset_ns,
            local_time: t4,
        }
    }
}

/// Read-only view of the current estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockEstimate {
    /// Peer clock minus local clock at `last_updated`
    pub offset_ns: Nanos,
    /// Rate of change of the offset (ns per ns)
    pub drift: f64,
    /// Local time of the last accepted sample
    pub last_updated: Nanos,
    /// Smoothed round trip
    pub round_trip_ns: Nanos,
    pub samples: u32,
}

impl ClockEstimate {
    /// Estimated peer time at a local instant
    pub fn remote_time_at(&self, local: Nanos) -> Nanos {
        let dt = (local - self.last_updated) as f64;
        local + self.offset_ns + (self.drift * dt).round() as Nanos
    }

    /// Local instant corresponding to a peer timestamp
    pub fn local_time_at(&self, remote: Nanos) -> Nanos {
        let numerator =
            remote as f64 - self.offset_ns as f64 + self.drift * self.last_updated as f64;
        (numerator / (1.0 + self.drift)).round() as Nanos
    }

    /// Estimated one-way latency (half the smoothed round trip)
    pub fn one_way_delay_ns(&self) -> Nanos {
        self.round_trip_ns / 2
    }
}

/// How a sample was weighted
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleWeight {
    /// First sample, taken as-is
    Initial,
    /// Regular EMA update with the given alpha
    Normal(f64),
    /// Round trip far above the median; damped
    Outlier(f64),
    /// Negative round trip (clock went backwards); ignored
    Rejected,
}

/// Smoothed offset/drift filter
#[derive(Debug, Default)]
pub struct ClockEstimator {
    offset: Option<f64>,
    drift: f64,
    last_updated: Nanos,
    smoothed_rtt: f64,
    sample_count: u32,
    rtt_window: VecDeque<Nanos>,
    drift_anchor: Option<(Nanos, f64)>,
}

impl ClockEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Median of the recent round trips, if enough samples exist
    pub fn median_round_trip(&self) -> Option<Nanos> {
        if self.rtt_window.len() < MIN_SAMPLES_FOR_MEDIAN {
            return None;
        }
        let mut sorted: Vec<Nanos> = self.rtt_window.iter().copied().collect();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }

    fn is_outlier(&self, round_trip: Nanos) -> bool {
        match self.median_round_trip() {
            Some(median) => {
                let limit = (median as f64 * OUTLIER_FACTOR).max((median + OUTLIER_MIN_EXCESS) as f64);
                round_trip as f64 > limit
            }
            None => false,
        }
    }

    fn record_round_trip(&mut self, round_trip: Nanos) {
        if self.rtt_window.len() >= RTT_WINDOW {
            self.rtt_window.pop_front();
        }
        self.rtt_window.push_back(round_trip);
    }

    /// Feed one sample into the filter
    pub fn add_sample(&mut self, sample: ClockSample) -> SampleWeight {
        if sample.round_trip_ns < 0 {
            tracing::debug!("Clock: rejecting sample {} with negative RTT", sample.seq);
            return SampleWeight::Rejected;
        }

        let outlier = self.is_outlier(sample.round_trip_ns);
        self.record_round_trip(sample.round_trip_ns);
        self.sample_count = self.sample_count.saturating_add(1);

        let Some(previous) = self.offset else {
            self.offset = Some(sample.offset_ns as f64);
            self.smoothed_rtt = sample.round_trip_ns as f64;
            self.last_updated = sample.local_time;
            self.drift_anchor = Some((sample.local_time, sample.offset_ns as f64));
            return SampleWeight::Initial;
        };

        let alpha = if outlier {
            OUTLIER_ALPHA
        } else if self.sample_count <= FAST_SAMPLES {
            FAST_ALPHA
        } else {
            EMA_ALPHA
        };

        let dt = (sample.local_time - self.last_updated).max(0) as f64;
        let predicted = previous + self.drift * dt;
        let updated = predicted + alpha * (sample.offset_ns as f64 - predicted);

        self.offset = Some(updated);
        self.last_updated = self.last_updated.max(sample.local_time);
        self.smoothed_rtt += alpha * (sample.round_trip_ns as f64 - self.smoothed_rtt);

        if !outlier {
            self.update_drift(sample.local_time, updated);
        }

        tracing::trace!(
            "Clock: sample {} rtt={}us offset={}us -> {}us (alpha={}, outlier={})",
            sample.seq,
            sample.round_trip_ns / 1_000,
            sample.offset_ns / 1_000,
            (updated / 1_000.0).round(),
            alpha,
            outlier
        );

        if outlier {
            SampleWeight::Outlier(alpha)
        } else {
            SampleWeight::Normal(alpha)
        }
    }

    fn update_drift(&mut self, local_time: Nanos, offset: f64) {
        let Some((anchor_time, anchor_offset)) = self.drift_anchor else {
            self.drift_anchor = Some((local_time, offset));
            return;
        };
        let baseline = local_time - anchor_time;
        if baseline < DRIFT_BASELINE {
            return;
        }
        let observed = (offset - anchor_offset) / baseline as f64;
        self.drift += DRIFT_ALPHA * (observed - self.drift);
        self.drift = self.drift.clamp(-MAX_DRIFT, MAX_DRIFT);
        self.drift_anchor = Some((local_time, offset));
    }

    /// Current estimate, or None before the first sample
    pub fn estimate(&self) -> Option<ClockEstimate> {
        let offset = self.offset?;
        Some(ClockEstimate {
            offset_ns: offset.round() as Nanos,
            drift: self.drift,
            last_updated: self.last_updated,
            round_trip_ns: self.smoothed_rtt.round() as Nanos,
            samples: self.sample_count,
        })
    }

    pub fn has_estimate(&self) -> bool {
        self.offset.is_some()
    }

    /// Forget everything (link disabled or role switched)
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
