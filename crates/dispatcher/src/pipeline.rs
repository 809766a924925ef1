//! Pipeline - facade owning the queue, workers and destinations

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use contracts::{
    ComponentName, DestinationSpec, LogRecord, LogSink, PipelineConfiguration, Severity,
    validate_configuration,
};

use crate::destination::{
    ActorEnv, DestinationSet, PendingDestination, SinkFactory, assemble, launcher,
};
use crate::error::PipelineError;
use crate::fallback::Diagnostics;
use crate::logger::Logger;
use crate::metrics::{DestinationMetrics, MetricsSnapshot, PipelineMetrics};
use crate::queue::{DispatchQueue, EnqueueOutcome};
use crate::rate_limit::RateLimiter;
use crate::worker::spawn_workers;

/// Upper bound for destinations to finish their first acquisition attempt
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Time past the deadline for tasks to notice it and wind down
const STOP_GRACE: Duration = Duration::from_millis(25);

/// Wait for an aborted task before leaving it behind
const ABORT_GRACE: Duration = Duration::from_millis(20);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by the pipeline handle, loggers and dispatch workers
pub(crate) struct Shared {
    config: RwLock<Arc<PipelineConfiguration>>,
    min_severity: AtomicU8,
    async_mode: AtomicBool,
    destinations: RwLock<Arc<DestinationSet>>,
    pub(crate) queue: DispatchQueue,
    metrics: Arc<PipelineMetrics>,
    registry: Mutex<HashMap<String, Arc<DestinationMetrics>>>,
    rate_limiter: RateLimiter,
    diagnostics: Arc<Diagnostics>,
    /// Sequence number of the next batch allowed to reach destinations
    pub(crate) turn: watch::Sender<u64>,
    /// Records taken from the queue but not yet handed to destinations
    pub(crate) in_flight: AtomicU64,
    closed: AtomicBool,
    cancel: AtomicBool,
    deadline: Arc<OnceLock<tokio::time::Instant>>,
    /// Woken when the deadline is set
    stopping: Notify,
    actors: Mutex<Vec<JoinHandle<()>>>,
    factories: HashMap<String, SinkFactory>,
    reconfiguring: tokio::sync::Mutex<()>,
}

impl Shared {
    pub(crate) fn config(&self) -> Arc<PipelineConfiguration> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn destinations(&self) -> Arc<DestinationSet> {
        Arc::clone(
            &self
                .destinations
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn replace_destinations(&self, set: DestinationSet) -> Arc<DestinationSet> {
        let mut current = self
            .destinations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, Arc::new(set))
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn deadline_passed(&self) -> bool {
        self.deadline
            .get()
            .is_some_and(|deadline| tokio::time::Instant::now() >= *deadline)
    }

    /// Resolves once the shutdown deadline has passed
    pub(crate) async fn deadline_reached(&self) {
        loop {
            let notified = self.stopping.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(deadline) = self.deadline.get() {
                tokio::time::sleep_until(*deadline).await;
                return;
            }
            notified.await;
        }
    }

    /// Severity check done before any other work on a record
    #[inline]
    pub(crate) fn is_enabled(&self, severity: Severity) -> bool {
        severity.as_u8() >= self.min_severity.load(Ordering::Relaxed)
    }

    fn actor_env(&self, config: &PipelineConfiguration) -> ActorEnv {
        ActorEnv {
            health: config.health.clone(),
            pipeline: Arc::clone(&self.metrics),
            diagnostics: Arc::clone(&self.diagnostics),
            deadline: Arc::clone(&self.deadline),
        }
    }

    /// Never fails and never blocks beyond the configured bounds
    pub(crate) fn submit(&self, record: LogRecord) {
        if !self.is_enabled(record.severity()) {
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            self.metrics.inc_rejected();
            return;
        }
        if !self.rate_limiter.allow() {
            self.metrics.inc_rate_limited();
            return;
        }
        self.metrics.inc_submitted();

        if self.async_mode.load(Ordering::Relaxed) {
            if self.queue.enqueue(record) == EnqueueOutcome::Closed {
                self.metrics.inc_rejected();
            }
        } else {
            self.dispatch_sync(record);
        }
    }

    /// Fan a record out on the caller's thread and wait for the attempts
    fn dispatch_sync(&self, record: LogRecord) {
        let timeout = Duration::from_millis(self.config().sync_timeout_ms);
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        {
            let destinations = self.destinations();
            let records = std::slice::from_ref(&record);
            for destination in destinations.iter() {
                let encoded = destination.encode_matching(records);
                if !encoded.is_empty() {
                    destination.try_offer(encoded, Some(done_tx.clone()));
                }
            }
        }
        drop(done_tx);
        self.metrics.inc_sync_dispatched();

        // every destination drops its sender once its attempt is over
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match done_rx.recv_timeout(remaining) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    self.metrics.inc_sync_timeouts();
                    debug!(timeout_ms = timeout.as_millis() as u64, "Synchronous dispatch timed out");
                    break;
                }
            }
        }
    }

    /// Spawn destination tasks and wait for their first acquisition attempt
    async fn launch(&self, pending: Vec<PendingDestination>, env: ActorEnv) {
        let mut ready = Vec::with_capacity(pending.len());
        {
            let mut actors = lock(&self.actors);
            for destination in pending {
                let (handle, ready_rx) = destination.spawn(env.clone());
                actors.push(handle);
                ready.push(ready_rx);
            }
        }

        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        for ready_rx in ready {
            if tokio::time::timeout_at(deadline, ready_rx).await.is_err() {
                warn!("Destinations still acquiring resources, continuing");
                break;
            }
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let config = self.config();
        let destinations: Vec<Arc<DestinationMetrics>> = {
            let registry = lock(&self.registry);
            config
                .destinations
                .iter()
                .filter(|d| d.enabled)
                .filter_map(|d| registry.get(&d.name).cloned())
                .collect()
        };
        MetricsSnapshot::collect(
            self.queue.counters(),
            &self.metrics,
            self.diagnostics.events(),
            &destinations,
        )
    }
}

/// Builder for a [`Pipeline`]
pub struct PipelineBuilder {
    config: PipelineConfiguration,
    factories: HashMap<String, SinkFactory>,
    diagnostics_echo: bool,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfiguration) -> Self {
        Self {
            config,
            factories: HashMap::new(),
            diagnostics_echo: true,
        }
    }

    /// Use a custom sink for the destination named `destination`
    ///
    /// The factory is called again on every reconfigure that keeps the
    /// destination.
    pub fn with_sink<S, F>(mut self, destination: impl Into<String>, factory: F) -> Self
    where
        S: LogSink + Send + 'static,
        F: Fn(&DestinationSpec) -> S + Send + Sync + 'static,
    {
        let factory: SinkFactory = Arc::new(move |spec: &DestinationSpec| launcher(factory(spec)));
        self.factories.insert(destination.into(), factory);
        self
    }

    /// Echo destination state changes on stderr (default on)
    pub fn with_diagnostics_echo(mut self, echo: bool) -> Self {
        self.diagnostics_echo = echo;
        self
    }

    /// Validate the configuration and start workers and destinations
    #[instrument(name = "pipeline_build", skip(self))]
    pub async fn build(self) -> Result<Pipeline, PipelineError> {
        validate_configuration(&self.config).map_err(PipelineError::ConfigInvalid)?;

        let config = Arc::new(self.config);
        let mut registry = HashMap::new();
        let (set, pending) = assemble(&config, &mut registry, &self.factories);
        let destination_count = set.len();
        let (turn, _) = watch::channel(0u64);

        let shared = Arc::new(Shared {
            min_severity: AtomicU8::new(config.min_severity.as_u8()),
            async_mode: AtomicBool::new(config.async_mode),
            destinations: RwLock::new(Arc::new(set)),
            queue: DispatchQueue::new(
                config.queue_capacity,
                config.overflow_policy,
                Duration::from_millis(config.block_timeout_ms),
            ),
            metrics: Arc::new(PipelineMetrics::new()),
            registry: Mutex::new(registry),
            rate_limiter: RateLimiter::new(config.rate_limit),
            diagnostics: Arc::new(Diagnostics::new(self.diagnostics_echo)),
            turn,
            in_flight: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            deadline: Arc::new(OnceLock::new()),
            stopping: Notify::new(),
            actors: Mutex::new(Vec::new()),
            factories: self.factories,
            reconfiguring: tokio::sync::Mutex::new(()),
            config: RwLock::new(Arc::clone(&config)),
        });

        shared.launch(pending, shared.actor_env(&config)).await;
        let workers = spawn_workers(&shared, config.worker_count);

        info!(
            destinations = destination_count,
            workers = workers.len(),
            async_mode = config.async_mode,
            queue_capacity = config.queue_capacity,
            "Pipeline started"
        );

        Ok(Pipeline {
            shared,
            workers,
            finished: false,
        })
    }
}

/// Outcome of [`Pipeline::shutdown`]
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub elapsed: Duration,
    /// Whether everything finished before the deadline
    pub deadline_met: bool,
    /// Records still in the dispatch queue (or in flight) at the deadline
    pub abandoned_in_queue: u64,
    /// Records still in destination queues at the deadline
    pub abandoned_in_destinations: u64,
    pub aborted_workers: usize,
    pub aborted_destinations: usize,
    /// Final metrics, taken after all resources were released
    pub metrics: MetricsSnapshot,
}

impl ShutdownReport {
    pub fn abandoned(&self) -> u64 {
        self.abandoned_in_queue + self.abandoned_in_destinations
    }
}

/// Running log pipeline
///
/// Producers submit through [`Pipeline::submit`] or a [`Logger`]; operators
/// call [`Pipeline::reconfigure`], [`Pipeline::snapshot_metrics`] and finally
/// [`Pipeline::shutdown`].
pub struct Pipeline {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    finished: bool,
}

impl Pipeline {
    pub fn builder(config: PipelineConfiguration) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Validate `config` and start a pipeline with the built-in sinks
    pub async fn configure(config: PipelineConfiguration) -> Result<Self, PipelineError> {
        PipelineBuilder::new(config).build().await
    }

    /// Submit a record; never fails, losses show up in metrics
    #[inline]
    pub fn submit(&self, record: LogRecord) {
        self.shared.submit(record);
    }

    /// Whether a record of `severity` would pass the threshold
    #[inline]
    pub fn is_enabled(&self, severity: Severity) -> bool {
        self.shared.is_enabled(severity)
    }

    /// Producer handle stamping records with `component`
    pub fn logger(&self, component: impl Into<ComponentName>) -> Logger {
        Logger::new(Arc::clone(&self.shared), component.into())
    }

    /// Active configuration
    pub fn config(&self) -> Arc<PipelineConfiguration> {
        self.shared.config()
    }

    pub fn snapshot_metrics(&self) -> MetricsSnapshot {
        self.shared.snapshot()
    }

    /// Swap in a new configuration
    ///
    /// Records already handed to the old destinations are written by them
    /// before their resources are released; records still in the dispatch
    /// queue are routed by the new configuration. On error nothing changes.
    #[instrument(name = "pipeline_reconfigure", skip(self, config))]
    pub async fn reconfigure(&self, config: PipelineConfiguration) -> Result<(), PipelineError> {
        if let Err(e) = validate_configuration(&config) {
            warn!(error = %e, "Rejected configuration, keeping the active one");
            return Err(PipelineError::ConfigInvalid(e));
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(PipelineError::ShutDown);
        }

        let shared = &self.shared;
        let _guard = shared.reconfiguring.lock().await;

        let (set, pending) = {
            let mut registry = lock(&shared.registry);
            assemble(&config, &mut registry, &shared.factories)
        };
        let config = Arc::new(config);
        let env = shared.actor_env(&config);

        *shared.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&config);
        let old_set = shared.replace_destinations(set);
        shared.queue.set_capacity(config.queue_capacity);
        shared.queue.set_policy(config.overflow_policy);
        shared
            .queue
            .set_block_timeout(Duration::from_millis(config.block_timeout_ms));
        shared
            .min_severity
            .store(config.min_severity.as_u8(), Ordering::Relaxed);
        shared.async_mode.store(config.async_mode, Ordering::Relaxed);
        shared.rate_limiter.set_limit(config.rate_limit);

        // old destinations drain once the last batch referencing them is offered
        drop(old_set);
        let old_actors = std::mem::take(&mut *lock(&shared.actors));
        let retired = old_actors.len();
        for actor in old_actors {
            if let Err(e) = actor.await {
                error!(error = ?e, "Destination task panicked");
            }
        }

        let started = pending.len();
        shared.launch(pending, env).await;
        info!(retired, started, "Pipeline reconfigured");
        Ok(())
    }

    /// Stop accepting records, drain until `deadline`, release everything
    ///
    /// Always returns shortly after `deadline`. Whatever could not be written
    /// in time is counted as abandoned. A destination stuck in a write keeps
    /// its resource until the write returns.
    #[instrument(name = "pipeline_shutdown", skip(self))]
    pub async fn shutdown(mut self, deadline: Duration) -> ShutdownReport {
        let started = Instant::now();
        let deadline_at = tokio::time::Instant::now() + deadline;
        let shared = Arc::clone(&self.shared);
        self.finished = true;

        shared.closed.store(true, Ordering::Release);
        let _ = shared.deadline.set(deadline_at);
        shared.stopping.notify_waiters();
        shared.queue.close();
        let stop_by = deadline_at + STOP_GRACE;

        let mut aborted_workers = 0;
        for mut worker in std::mem::take(&mut self.workers) {
            match tokio::time::timeout_at(stop_by, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = ?e, "Dispatch worker panicked"),
                Err(_) => {
                    worker.abort();
                    aborted_workers += 1;
                }
            }
        }
        shared.cancel.store(true, Ordering::Release);

        let in_flight = shared.in_flight.swap(0, Ordering::AcqRel);
        let abandoned_in_queue = shared.queue.abandon_remaining() as u64 + in_flight;
        shared.metrics.add_abandoned_in_queue(abandoned_in_queue);

        // destinations see their channel close after the last queued batch
        drop(shared.replace_destinations(DestinationSet::default()));

        let mut aborted_destinations = 0;
        let actors = std::mem::take(&mut *lock(&shared.actors));
        for mut actor in actors {
            match tokio::time::timeout_at(stop_by, &mut actor).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = ?e, "Destination task panicked"),
                Err(_) => {
                    actor.abort();
                    aborted_destinations += 1;
                    // a task stuck in a blocking call only sees the abort later
                    if tokio::time::timeout(ABORT_GRACE, actor).await.is_err() {
                        warn!("Destination task still running after abort");
                    }
                }
            }
        }

        for destination in lock(&shared.registry).values() {
            destination.settle_abandoned();
        }

        let metrics = shared.snapshot();
        let abandoned_in_destinations = metrics.destinations.iter().map(|d| d.abandoned).sum();
        let elapsed = started.elapsed();
        let report = ShutdownReport {
            elapsed,
            deadline_met: elapsed <= deadline,
            abandoned_in_queue,
            abandoned_in_destinations,
            aborted_workers,
            aborted_destinations,
            metrics,
        };

        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            delivered = report.metrics.total_delivered(),
            abandoned = report.abandoned(),
            "Pipeline shut down"
        );
        report
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // dropped without shutdown: stop dispatching, let destinations close
        self.shared.closed.store(true, Ordering::Release);
        self.shared.cancel.store(true, Ordering::Release);
        self.shared.queue.close();
        drop(self.shared.replace_destinations(DestinationSet::default()));
        debug!("Pipeline dropped without shutdown");
    }
}
