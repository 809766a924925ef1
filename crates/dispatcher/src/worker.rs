//! Dispatch workers - pull batches from the queue and fan them out
//!
//! Several workers may run at once. Batches carry their dequeue position and
//! are handed to destinations strictly in that order, so each destination
//! sees records in dequeue order whatever the worker count.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::pipeline::Shared;
use crate::queue::{Batch, Dequeued};

pub(crate) fn spawn_workers(shared: &Arc<Shared>, count: usize) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|id| tokio::spawn(run_worker(id, Arc::clone(shared))))
        .collect()
}

#[instrument(name = "dispatch_worker", skip(shared))]
async fn run_worker(id: usize, shared: Arc<Shared>) {
    debug!(worker = id, "Dispatch worker started");
    let mut batches: u64 = 0;

    loop {
        if shared.cancelled() || shared.deadline_passed() {
            break;
        }

        let (batch_size, batch_timeout) = {
            let config = shared.config();
            (
                config.batch_size,
                Duration::from_millis(config.batch_timeout_ms),
            )
        };

        match shared.queue.dequeue_batch(batch_size, batch_timeout).await {
            Dequeued::Closed => break,
            Dequeued::Empty => continue,
            Dequeued::Batch(batch) => {
                dispatch_batch(&shared, batch).await;
                batches += 1;
            }
        }
    }

    debug!(worker = id, batches, "Dispatch worker stopped");
}

/// Format and offer one batch to every destination
async fn dispatch_batch(shared: &Shared, batch: Batch) {
    let n = batch.records.len() as u64;
    shared.in_flight.fetch_add(n, Ordering::AcqRel);

    let destinations = shared.destinations();
    // formatting runs before taking the turn so workers overlap on it
    let encoded: Vec<Vec<Vec<u8>>> = destinations
        .iter()
        .map(|destination| destination.encode_matching(&batch.records))
        .collect();

    let mut turn = shared.turn.subscribe();
    // the sender lives in `shared`, so this only returns once it is our turn
    let _ = turn.wait_for(|next| *next >= batch.seq).await;

    // a full destination holds the worker, which lets the dispatch queue fill
    // up and apply its overflow policy
    let give_up = Instant::now() + Duration::from_millis(shared.config().block_timeout_ms);
    for (destination, records) in destinations.iter().zip(encoded) {
        destination
            .offer(records, give_up, shared.deadline_reached())
            .await;
    }
    shared.turn.send_modify(|next| *next += 1);
    shared.in_flight.fetch_sub(n, Ordering::AcqRel);
}
