//! Pipeline metrics export
//!
//! Publishes `MetricsSnapshot`s through the `metrics` facade and keeps
//! running throughput statistics between snapshots.

use std::time::Instant;

use dispatcher::{DestinationState, MetricsSnapshot};
use metrics::{counter, gauge};

/// Publish a snapshot as `logpipe_*` series
///
/// Counters are set to the snapshot's cumulative values, so calling this
/// repeatedly with fresh snapshots is safe.
pub fn export_snapshot(snapshot: &MetricsSnapshot) {
    counter!("logpipe_records_submitted_total").absolute(snapshot.submitted);
    counter!("logpipe_records_enqueued_total").absolute(snapshot.enqueued);
    counter!("logpipe_records_dequeued_total").absolute(snapshot.dequeued);
    counter!("logpipe_records_dropped_by_queue_total").absolute(snapshot.dropped_by_queue);
    counter!("logpipe_records_rate_limited_total").absolute(snapshot.rate_limited);
    counter!("logpipe_records_rejected_total").absolute(snapshot.rejected);
    counter!("logpipe_records_abandoned_total").absolute(snapshot.abandoned_on_shutdown);
    counter!("logpipe_sync_dispatched_total").absolute(snapshot.sync_dispatched);
    counter!("logpipe_sync_timeouts_total").absolute(snapshot.sync_timeouts);
    counter!("logpipe_diagnostic_events_total").absolute(snapshot.diagnostic_events);

    gauge!("logpipe_queue_depth").set(snapshot.current_queue_depth as f64);
    gauge!("logpipe_queue_capacity").set(snapshot.queue_capacity as f64);
    gauge!("logpipe_open_resources").set(snapshot.open_resources as f64);

    for destination in &snapshot.destinations {
        let name = destination.name.clone();
        let kind = destination.kind.as_str();

        counter!(
            "logpipe_destination_delivered_total",
            "destination" => name.clone(),
            "kind" => kind
        )
        .absolute(destination.delivered);
        counter!(
            "logpipe_destination_failed_total",
            "destination" => name.clone(),
            "kind" => kind
        )
        .absolute(destination.failed);
        counter!(
            "logpipe_destination_dropped_total",
            "destination" => name.clone(),
            "kind" => kind
        )
        .absolute(destination.dropped_by_destination);
        counter!(
            "logpipe_destination_abandoned_total",
            "destination" => name.clone(),
            "kind" => kind
        )
        .absolute(destination.abandoned);

        gauge!("logpipe_destination_consecutive_failures", "destination" => name.clone())
            .set(destination.consecutive_failures as f64);
        gauge!("logpipe_destination_healthy", "destination" => name.clone()).set(
            if matches!(
                destination.state,
                DestinationState::Active | DestinationState::Configured
            ) {
                1.0
            } else {
                0.0
            },
        );
        gauge!("logpipe_destination_state", "destination" => name)
            .set(f64::from(destination.state as u8));
    }
}

/// Delivered-records rate between successive snapshots
#[derive(Debug)]
pub struct ThroughputTracker {
    last_delivered: u64,
    last_at: Instant,
    stats: RunningStats,
}

impl Default for ThroughputTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self {
            last_delivered: 0,
            last_at: Instant::now(),
            stats: RunningStats::default(),
        }
    }

    /// Feed a snapshot; returns records/s since the previous one
    pub fn observe(&mut self, snapshot: &MetricsSnapshot) -> f64 {
        self.observe_at(snapshot.total_delivered(), Instant::now())
    }

    fn observe_at(&mut self, delivered: u64, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.last_at).as_secs_f64();
        let delta = delivered.saturating_sub(self.last_delivered);
        self.last_delivered = delivered;
        self.last_at = now;

        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        let rate = delta as f64 / elapsed;
        self.stats.push(rate);
        gauge!("logpipe_delivered_per_second").set(rate);
        rate
    }

    pub fn stats(&self) -> &RunningStats {
        &self.stats
    }
}

/// Online statistics (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            let delta2 = value - self.mean;
            self.m2 += delta * delta2;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

impl std::fmt::Display for RunningStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.1}, max={:.1}, mean={:.1}, std={:.1} (n={})",
                self.min,
                self.max,
                self.mean(),
                self.std_dev(),
                self.count
            )
        }
    }
}
