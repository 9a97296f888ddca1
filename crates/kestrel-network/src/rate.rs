//! Per-channel download throughput sampling.
//!
//! Each peer protocol owns one tracker and samples it on every inbound
//! `headers` message. A channel younger than its grace window is never
//! judged against the floor, and elapsed time is clamped to at least one
//! second so short-lived channels cannot produce division spikes.

use std::time::{Duration, Instant};

/// Throughput accounting for one channel.
#[derive(Debug)]
pub struct RateTracker {
    /// When the channel came up.
    started: Instant,
    /// Cumulative headers received.
    delivered: u64,
    /// When the last batch arrived.
    last_sample: Instant,
    /// Age below which the floor is not applied.
    grace: Duration,
}

impl RateTracker {
    /// Start tracking a channel that just came up.
    pub fn new(grace: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            delivered: 0,
            last_sample: now,
            grace,
        }
    }

    /// Record a delivered batch.
    pub fn record(&mut self, headers: u64) {
        self.delivered = self.delivered.saturating_add(headers);
        self.last_sample = Instant::now();
    }

    /// Cumulative headers received.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Time since the last batch arrived (or since startup).
    pub fn last_sample_age(&self) -> Duration {
        self.last_sample.elapsed()
    }

    /// Current throughput in headers per second.
    ///
    /// Elapsed time is clamped to ≥ 1 second.
    pub fn current_rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64().max(1.0);
        self.delivered as f64 / elapsed
    }

    /// True iff the channel has outlived its grace window and its rate is
    /// below `floor`.
    pub fn below_floor(&self, floor: f64) -> bool {
        self.started.elapsed() >= self.grace && self.current_rate() < floor
    }
}
