//! Pipeline metrics for observability
//!
//! Everything here is written by pipeline internals with relaxed atomics and
//! read by [`MetricsSnapshot`] without taking any lock shared with producers
//! or workers.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use contracts::DestinationKind;

use crate::health::DestinationState;

/// Counters of a single destination
///
/// `routed == delivered + failed + dropped + abandoned` once the destination
/// has been shut down.
#[derive(Debug)]
pub struct DestinationMetrics {
    name: String,
    kind: DestinationKind,
    /// Task generation in the high bits, [`DestinationState`] in the low byte
    state: AtomicU64,
    /// Records matched by the destination filter
    routed: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    /// Skipped while unhealthy or dropped on a full destination queue
    dropped: AtomicU64,
    /// Left undelivered at shutdown
    abandoned: AtomicU64,
    consecutive_failures: AtomicU64,
}

impl DestinationMetrics {
    pub fn new(name: impl Into<String>, kind: DestinationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            state: AtomicU64::new(DestinationState::Configured as u64),
            routed: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn state(&self) -> DestinationState {
        unpack_state(self.state.load(Ordering::Acquire))
    }

    /// Store a new state, returning the previous one
    pub fn set_state(&self, state: DestinationState) -> DestinationState {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(pack(word >> 8, state))
            })
            .unwrap_or_else(|word| word);
        unpack_state(previous)
    }

    /// Generation of the task currently serving this destination
    pub fn generation(&self) -> u64 {
        self.state.load(Ordering::Acquire) >> 8
    }

    /// Retire the running task: bump the generation and reset to `Configured`
    ///
    /// Returns the new generation.
    pub fn begin_generation(&self) -> u64 {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(pack((word >> 8) + 1, DestinationState::Configured))
            })
            .unwrap_or_else(|word| word);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        (previous >> 8) + 1
    }

    /// Store `state` on behalf of task `generation`
    ///
    /// Returns the previous state, or `None` when that task has been retired
    /// and nothing was changed.
    pub fn set_state_for(
        &self,
        generation: u64,
        state: DestinationState,
    ) -> Option<DestinationState> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (word >> 8 == generation).then(|| pack(generation, state))
            })
            .ok()
            .map(unpack_state)
    }

    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    pub fn add_routed(&self, n: u64) {
        self.routed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn add_delivered(&self, n: u64) {
        self.delivered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn add_failed(&self, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    pub fn add_abandoned(&self, n: u64) {
        self.abandoned.fetch_add(n, Ordering::Relaxed);
    }

    /// Attribute every record not otherwise accounted for to `abandoned`
    ///
    /// Called once the destination worker is gone; returns the records added.
    pub fn settle_abandoned(&self) -> u64 {
        let accounted = self.delivered() + self.failed() + self.dropped() + self.abandoned();
        let residual = self.routed().saturating_sub(accounted);
        if residual > 0 {
            self.add_abandoned(residual);
        }
        residual
    }

    pub fn set_consecutive_failures(&self, n: u32) {
        self.consecutive_failures
            .store(u64::from(n), Ordering::Relaxed);
    }

    /// Publish the failure streak of task `generation`, unless retired
    pub fn set_consecutive_failures_for(&self, generation: u64, n: u32) {
        if self.generation() == generation {
            self.set_consecutive_failures(n);
        }
    }

    pub fn snapshot(&self) -> DestinationSnapshot {
        DestinationSnapshot {
            name: self.name.clone(),
            kind: self.kind,
            state: self.state(),
            routed: self.routed(),
            delivered: self.delivered(),
            failed: self.failed(),
            dropped_by_destination: self.dropped(),
            abandoned: self.abandoned(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

fn pack(generation: u64, state: DestinationState) -> u64 {
    (generation << 8) | u64::from(state as u8)
}

fn unpack_state(word: u64) -> DestinationState {
    DestinationState::from((word & 0xff) as u8)
}

/// Pipeline-wide counters not owned by the queue or a destination
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Records accepted by `submit` (past threshold, rate limit and closure)
    submitted: AtomicU64,
    rate_limited: AtomicU64,
    /// Submitted after shutdown started
    rejected: AtomicU64,
    /// Records left in the dispatch queue at shutdown
    abandoned_in_queue: AtomicU64,
    /// Sink resources currently held
    open_resources: AtomicU64,
    /// Records dispatched on the caller's thread
    sync_dispatched: AtomicU64,
    /// Synchronous submits that gave up waiting
    sync_timeouts: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_abandoned_in_queue(&self, n: u64) {
        self.abandoned_in_queue.fetch_add(n, Ordering::Relaxed);
    }

    pub fn abandoned_in_queue(&self) -> u64 {
        self.abandoned_in_queue.load(Ordering::Relaxed)
    }

    pub fn inc_sync_dispatched(&self) {
        self.sync_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sync_timeouts(&self) {
        self.sync_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn open_resources(&self) -> u64 {
        self.open_resources.load(Ordering::Relaxed)
    }

    fn resource_opened(&self) {
        self.open_resources.fetch_add(1, Ordering::Relaxed);
    }

    fn resource_closed(&self) {
        // saturating decrement
        let _ = self
            .open_resources
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

/// RAII accounting of one acquired sink resource
#[derive(Debug)]
pub struct OpenResource {
    metrics: Arc<PipelineMetrics>,
}

impl OpenResource {
    pub fn acquire(metrics: &Arc<PipelineMetrics>) -> Self {
        metrics.resource_opened();
        Self {
            metrics: Arc::clone(metrics),
        }
    }
}

impl Drop for OpenResource {
    fn drop(&mut self) {
        self.metrics.resource_closed();
    }
}

/// Queue counters as seen at snapshot time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounters {
    /// Records offered to the queue
    pub enqueued: u64,
    pub dequeued: u64,
    /// Evicted (drop_oldest) plus refused (drop_newest, block timeout)
    pub dropped: u64,
    pub depth: usize,
    pub capacity: usize,
}

/// Snapshot of one destination
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationSnapshot {
    pub name: String,
    pub kind: DestinationKind,
    pub state: DestinationState,
    pub routed: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped_by_destination: u64,
    pub abandoned: u64,
    pub consecutive_failures: u64,
}

/// Point-in-time copy of all pipeline metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped_by_queue: u64,
    pub current_queue_depth: usize,
    pub queue_capacity: usize,
    /// Records still queued (dispatch queue or destination queues) at shutdown
    pub abandoned_on_shutdown: u64,
    pub rate_limited: u64,
    pub rejected: u64,
    pub open_resources: u64,
    pub diagnostic_events: u64,
    pub sync_dispatched: u64,
    pub sync_timeouts: u64,
    pub destinations: Vec<DestinationSnapshot>,
}

impl MetricsSnapshot {
    pub(crate) fn collect(
        queue: QueueCounters,
        pipeline: &PipelineMetrics,
        diagnostic_events: u64,
        destinations: &[Arc<DestinationMetrics>],
    ) -> Self {
        let destinations: Vec<DestinationSnapshot> =
            destinations.iter().map(|d| d.snapshot()).collect();
        let abandoned_in_destinations: u64 = destinations.iter().map(|d| d.abandoned).sum();

        Self {
            submitted: pipeline.submitted.load(Ordering::Relaxed),
            enqueued: queue.enqueued,
            dequeued: queue.dequeued,
            dropped_by_queue: queue.dropped,
            current_queue_depth: queue.depth,
            queue_capacity: queue.capacity,
            abandoned_on_shutdown: pipeline.abandoned_in_queue() + abandoned_in_destinations,
            rate_limited: pipeline.rate_limited.load(Ordering::Relaxed),
            rejected: pipeline.rejected.load(Ordering::Relaxed),
            open_resources: pipeline.open_resources(),
            diagnostic_events,
            sync_dispatched: pipeline.sync_dispatched.load(Ordering::Relaxed),
            sync_timeouts: pipeline.sync_timeouts.load(Ordering::Relaxed),
            destinations,
        }
    }

    /// Destination snapshot by name
    pub fn destination(&self, name: &str) -> Option<&DestinationSnapshot> {
        self.destinations.iter().find(|d| d.name == name)
    }

    /// Sum of delivered records over all destinations
    pub fn total_delivered(&self) -> u64 {
        self.destinations.iter().map(|d| d.delivered).sum()
    }
}
