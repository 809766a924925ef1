//! DispatchQueue - bounded buffer between producers and dispatch workers
//!
//! Producers enqueue synchronously from any thread; workers pull sequenced
//! batches asynchronously. Capacity, overflow policy and block timeout can be
//! changed while running (reconfigure). Shrinking the capacity never evicts
//! records that were already accepted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use contracts::{LogRecord, OverflowPolicy};

use crate::metrics::QueueCounters;

/// Result of offering a record to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// Accepted after evicting `n` older records
    AcceptedWithEviction(usize),
    /// Incoming record discarded by the overflow policy
    Dropped,
    /// Queue closed for shutdown; the record was not counted as enqueued
    Closed,
}

/// A batch of records with its position in dequeue order
#[derive(Debug)]
pub struct Batch {
    pub seq: u64,
    pub records: Vec<LogRecord>,
}

/// Result of [`DispatchQueue::dequeue_batch`]
#[derive(Debug)]
pub enum Dequeued {
    Batch(Batch),
    /// Nothing arrived within `max_wait`
    Empty,
    /// Closed and fully drained
    Closed,
}

struct Inner {
    records: VecDeque<LogRecord>,
    next_seq: u64,
}

/// Bounded MPMC record queue with a configurable overflow policy
pub struct DispatchQueue {
    inner: Mutex<Inner>,
    capacity: AtomicUsize,
    policy: AtomicU8,
    block_timeout_ms: AtomicU64,
    closed: AtomicBool,
    not_empty: Notify,
    not_full: Condvar,
    /// Mirror of `records.len()`, written under the lock, read without it
    depth: AtomicUsize,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    evicted: AtomicU64,
    refused: AtomicU64,
}

impl DispatchQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy, block_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: VecDeque::with_capacity(capacity.min(4096)),
                next_seq: 0,
            }),
            capacity: AtomicUsize::new(capacity.max(1)),
            policy: AtomicU8::new(policy.as_u8()),
            block_timeout_ms: AtomicU64::new(block_timeout.as_millis() as u64),
            closed: AtomicBool::new(false),
            not_empty: Notify::new(),
            not_full: Condvar::new(),
            depth: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panic while holding the lock leaves the deque itself consistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer a record according to the current overflow policy
    ///
    /// Blocks the calling thread only under `block_with_timeout`, and never
    /// longer than the configured timeout.
    pub fn enqueue(&self, record: LogRecord) -> EnqueueOutcome {
        let mut inner = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return EnqueueOutcome::Closed;
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);

        let capacity = self.capacity.load(Ordering::Relaxed);
        let mut evicted = 0;

        if inner.records.len() >= capacity {
            match OverflowPolicy::from_u8(self.policy.load(Ordering::Relaxed)) {
                OverflowPolicy::DropOldest => {
                    while inner.records.len() >= capacity {
                        inner.records.pop_front();
                        evicted += 1;
                    }
                    self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
                }
                OverflowPolicy::DropNewest => {
                    self.refused.fetch_add(1, Ordering::Relaxed);
                    return EnqueueOutcome::Dropped;
                }
                OverflowPolicy::BlockWithTimeout => {
                    let timeout =
                        Duration::from_millis(self.block_timeout_ms.load(Ordering::Relaxed));
                    let deadline = Instant::now() + timeout;
                    loop {
                        let now = Instant::now();
                        if now >= deadline {
                            self.refused.fetch_add(1, Ordering::Relaxed);
                            return EnqueueOutcome::Dropped;
                        }
                        inner = self
                            .not_full
                            .wait_timeout(inner, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                        if self.closed.load(Ordering::Acquire) {
                            self.refused.fetch_add(1, Ordering::Relaxed);
                            return EnqueueOutcome::Dropped;
                        }
                        if inner.records.len() < self.capacity.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                }
            }
        }

        inner.records.push_back(record);
        self.depth.store(inner.records.len(), Ordering::Release);
        drop(inner);
        self.not_empty.notify_one();

        if evicted > 0 {
            EnqueueOutcome::AcceptedWithEviction(evicted)
        } else {
            EnqueueOutcome::Accepted
        }
    }

    /// Take up to `max_size` records, waiting at most `max_wait` while empty
    pub async fn dequeue_batch(&self, max_size: usize, max_wait: Duration) -> Dequeued {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            // register before checking so a close between check and await is seen
            notified.as_mut().enable();

            if let Some(batch) = self.try_take(max_size) {
                return Dequeued::Batch(batch);
            }
            if self.closed.load(Ordering::Acquire) {
                return Dequeued::Closed;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return match self.try_take(max_size) {
                    Some(batch) => Dequeued::Batch(batch),
                    None if self.closed.load(Ordering::Acquire) => Dequeued::Closed,
                    None => Dequeued::Empty,
                };
            }
        }
    }

    fn try_take(&self, max_size: usize) -> Option<Batch> {
        let mut inner = self.lock();
        if inner.records.is_empty() {
            return None;
        }
        let n = max_size.max(1).min(inner.records.len());
        let records: Vec<LogRecord> = inner.records.drain(..n).collect();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let more = !inner.records.is_empty();
        self.depth.store(inner.records.len(), Ordering::Release);
        drop(inner);

        self.dequeued.fetch_add(n as u64, Ordering::Relaxed);
        self.not_full.notify_all();
        if more {
            // hand the remainder to another idle worker
            self.not_empty.notify_one();
        }
        Some(Batch { seq, records })
    }

    /// Stop accepting records and wake every waiter
    pub fn close(&self) {
        // taken under the lock so blocked producers observe it on wake-up
        let _inner = self.lock();
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_waiters();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Discard everything still queued, returning the count
    pub fn abandon_remaining(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.records.len();
        inner.records.clear();
        self.depth.store(0, Ordering::Release);
        n
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
        self.not_full.notify_all();
    }

    pub fn set_policy(&self, policy: OverflowPolicy) {
        self.policy.store(policy.as_u8(), Ordering::Relaxed);
    }

    pub fn set_block_timeout(&self, timeout: Duration) {
        self.block_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Current depth; never waits for the queue lock
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> OverflowPolicy {
        OverflowPolicy::from_u8(self.policy.load(Ordering::Relaxed))
    }

    /// Evicted plus refused records
    pub fn dropped_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed) + self.refused.load(Ordering::Relaxed)
    }

    pub fn enqueued_count(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dequeued_count(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> QueueCounters {
        QueueCounters {
            enqueued: self.enqueued_count(),
            dequeued: self.dequeued_count(),
            dropped: self.dropped_count(),
            depth: self.len(),
            capacity: self.capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{Category, Severity};
    use std::sync::Arc;

    fn record(i: usize) -> LogRecord {
        LogRecord::new(Severity::Info, Category::General, format!("record {i}")).with_field("i", i)
    }

    fn messages(batch: &Batch) -> Vec<String> {
        batch.records.iter().map(|r| r.message().to_string()).collect()
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest_in_order() {
        let queue = DispatchQueue::new(10, OverflowPolicy::DropOldest, Duration::ZERO);
        for i in 0..15 {
            queue.enqueue(record(i));
        }

        assert_eq!(queue.dropped_count(), 5);
        assert_eq!(queue.len(), 10);

        let Dequeued::Batch(batch) = queue.dequeue_batch(100, Duration::ZERO).await else {
            panic!("expected a batch");
        };
        let expected: Vec<String> = (5..15).map(|i| format!("record {i}")).collect();
        assert_eq!(messages(&batch), expected);
    }

    #[test]
    fn test_drop_newest_leaves_queue_unchanged() {
        let queue = DispatchQueue::new(2, OverflowPolicy::DropNewest, Duration::ZERO);
        assert_eq!(queue.enqueue(record(0)), EnqueueOutcome::Accepted);
        assert_eq!(queue.enqueue(record(1)), EnqueueOutcome::Accepted);
        assert_eq!(queue.enqueue(record(2)), EnqueueOutcome::Dropped);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.enqueued_count(), 3);
    }

    #[test]
    fn test_block_with_timeout_drops_incoming_after_wait() {
        let queue = DispatchQueue::new(1, OverflowPolicy::BlockWithTimeout, Duration::from_millis(30));
        queue.enqueue(record(0));

        let started = Instant::now();
        assert_eq!(queue.enqueue(record(1)), EnqueueOutcome::Dropped);
        let waited = started.elapsed();

        assert!(waited >= Duration::from_millis(25), "waited {waited:?}");
        assert!(waited < Duration::from_secs(2));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_block_with_timeout_admits_when_space_frees() {
        let queue = Arc::new(DispatchQueue::new(
            1,
            OverflowPolicy::BlockWithTimeout,
            Duration::from_secs(5),
        ));
        queue.enqueue(record(0));

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.enqueue(record(1)))
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let first = queue.dequeue_batch(1, Duration::ZERO).await;
        assert!(matches!(first, Dequeued::Batch(_)));

        assert_eq!(producer.join().unwrap(), EnqueueOutcome::Accepted);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_waits_then_returns_empty() {
        let queue = DispatchQueue::new(4, OverflowPolicy::DropNewest, Duration::ZERO);
        let started = tokio::time::Instant::now();
        let result = queue.dequeue_batch(4, Duration::from_millis(20)).await;
        assert!(matches!(result, Dequeued::Empty));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(DispatchQueue::new(4, OverflowPolicy::DropNewest, Duration::ZERO));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue_batch(4, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(record(7));

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        let Dequeued::Batch(batch) = result else {
            panic!("expected a batch");
        };
        assert_eq!(messages(&batch), vec!["record 7".to_string()]);
    }

    #[tokio::test]
    async fn test_batches_are_sequenced_and_bounded() {
        let queue = DispatchQueue::new(100, OverflowPolicy::DropNewest, Duration::ZERO);
        for i in 0..25 {
            queue.enqueue(record(i));
        }
        let mut seqs = Vec::new();
        let mut sizes = Vec::new();
        while let Dequeued::Batch(batch) = queue.dequeue_batch(10, Duration::ZERO).await {
            seqs.push(batch.seq);
            sizes.push(batch.records.len());
        }
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(queue.dequeued_count(), 25);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let queue = Arc::new(DispatchQueue::new(4, OverflowPolicy::DropNewest, Duration::ZERO));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue_batch(4, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Dequeued::Closed));
        assert_eq!(queue.enqueue(record(0)), EnqueueOutcome::Closed);
    }

    #[tokio::test]
    async fn test_closed_queue_drains_before_reporting_closed() {
        let queue = DispatchQueue::new(4, OverflowPolicy::DropNewest, Duration::ZERO);
        queue.enqueue(record(0));
        queue.close();
        assert!(matches!(
            queue.dequeue_batch(4, Duration::ZERO).await,
            Dequeued::Batch(_)
        ));
        assert!(matches!(
            queue.dequeue_batch(4, Duration::ZERO).await,
            Dequeued::Closed
        ));
    }

    #[test]
    fn test_shrinking_capacity_keeps_accepted_records() {
        let queue = DispatchQueue::new(5, OverflowPolicy::DropOldest, Duration::ZERO);
        for i in 0..5 {
            queue.enqueue(record(i));
        }
        queue.set_capacity(2);
        assert_eq!(queue.len(), 5);

        assert_eq!(queue.enqueue(record(5)), EnqueueOutcome::AcceptedWithEviction(4));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_conservation_of_counters() {
        let queue = DispatchQueue::new(3, OverflowPolicy::DropOldest, Duration::ZERO);
        for i in 0..10 {
            queue.enqueue(record(i));
        }
        let counters = queue.counters();
        assert_eq!(
            counters.enqueued,
            counters.dequeued + counters.dropped + counters.depth as u64
        );
        assert_eq!(queue.abandon_remaining(), 3);
    }

    #[test]
    fn test_counters_read_while_queue_locked() {
        let queue = Arc::new(DispatchQueue::new(8, OverflowPolicy::DropNewest, Duration::ZERO));
        queue.enqueue(record(0));
        queue.enqueue(record(1));

        let guard = queue.lock();
        let (tx, rx) = std::sync::mpsc::channel();
        let reader = Arc::clone(&queue);
        std::thread::spawn(move || {
            let _ = tx.send(reader.counters());
        });
        let counters = rx.recv_timeout(Duration::from_secs(1));
        drop(guard);

        let counters = counters.expect("counters waited for the queue lock");
        assert_eq!(counters.depth, 2);
        assert_eq!(counters.enqueued, 2);
        assert_eq!(queue.len(), 2);
    }
}
