//! Destinations - one isolated worker task per configured sink
//!
//! Dispatch workers format records and hand the encoded batch to the
//! destination's bounded channel; the destination task owns the sink, drives
//! the health state machine and is the only writer of its resource.

use std::collections::HashMap;
use std::future::Future;
use std::sync::mpsc::Sender as CompletionSender;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use contracts::{
    DestinationKind, DestinationSpec, FormatterSpec, HealthPolicy, LogRecord, LogSink,
    PipelineConfiguration,
};

use crate::fallback::Diagnostics;
use crate::format::RecordFormatter;
use crate::health::{DestinationState, FailureOutcome, HealthTracker, RecoveryOutcome};
use crate::metrics::{DestinationMetrics, OpenResource, PipelineMetrics};
use crate::sinks::{ConsoleSink, FileSink, NetworkSink};

/// Encoded records on their way to a destination task
///
/// A synchronous submit attaches a completion sender; dropping the delivery
/// after the write attempt is the acknowledgement.
pub(crate) struct Delivery {
    pub batch: Vec<Vec<u8>>,
    pub completion: Option<CompletionSender<()>>,
}

/// Spawns the task of one destination around an already constructed sink
pub(crate) type LaunchFn = Box<
    dyn FnOnce(mpsc::Receiver<Delivery>, Arc<DestinationMetrics>, ActorContext) -> JoinHandle<()>
        + Send,
>;

/// Builds the sink of a destination from its spec
pub(crate) type SinkFactory = Arc<dyn Fn(&DestinationSpec) -> LaunchFn + Send + Sync>;

/// Wrap a concrete sink into a [`LaunchFn`]
pub(crate) fn launcher<S: LogSink + Send + 'static>(sink: S) -> LaunchFn {
    Box::new(move |rx, metrics, ctx| tokio::spawn(run_destination(sink, rx, metrics, ctx)))
}

/// Built-in sink for the destination kind
pub(crate) fn default_sink(spec: &DestinationSpec) -> LaunchFn {
    match spec.kind {
        DestinationKind::File => launcher(FileSink::from_spec(spec)),
        DestinationKind::Console => launcher(ConsoleSink::from_spec(spec)),
        DestinationKind::Network => launcher(NetworkSink::from_spec(spec)),
    }
}

/// Pipeline-wide state shared with every destination task
#[derive(Clone)]
pub(crate) struct ActorEnv {
    pub health: HealthPolicy,
    pub pipeline: Arc<PipelineMetrics>,
    pub diagnostics: Arc<Diagnostics>,
    /// Set once when shutdown starts
    pub deadline: Arc<OnceLock<Instant>>,
}

impl ActorEnv {
    fn deadline_passed(&self) -> bool {
        self.deadline
            .get()
            .is_some_and(|deadline| Instant::now() >= *deadline)
    }

    fn shutting_down(&self) -> bool {
        self.deadline.get().is_some()
    }
}

pub(crate) struct ActorContext {
    spec: DestinationSpec,
    env: ActorEnv,
    /// Generation this task writes destination state for
    generation: u64,
    /// Signalled after the first acquisition attempt
    ready: oneshot::Sender<()>,
}

// ===== dispatch side =====

/// How a batch left the dispatch side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handoff {
    Sent,
    /// Destination queue stayed full or closed; counted as dropped
    Dropped,
    /// Shutdown deadline passed or the task stopped; counted as abandoned
    Abandoned,
}

/// Dispatch-side handle of a running destination
pub(crate) struct DestinationHandle {
    spec: DestinationSpec,
    formatter: Arc<RecordFormatter>,
    metrics: Arc<DestinationMetrics>,
    tx: mpsc::Sender<Delivery>,
}

impl DestinationHandle {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Format the records this destination accepts
    ///
    /// Matching records are counted as routed and dropped right away while
    /// the destination cannot take batches.
    pub fn encode_matching(&self, records: &[LogRecord]) -> Vec<Vec<u8>> {
        if !self.metrics.state().accepts_batches() {
            let matching = records.iter().filter(|r| self.spec.accepts(r)).count() as u64;
            if matching > 0 {
                self.metrics.add_routed(matching);
                self.metrics.add_dropped(matching);
            }
            return Vec::new();
        }

        records
            .iter()
            .filter(|r| self.spec.accepts(r))
            .map(|r| self.formatter.format(r))
            .collect()
    }

    /// Hand an encoded batch to the destination task, waiting for room
    ///
    /// Waits until `give_up` at most, and stops waiting as soon as
    /// `deadline_reached` resolves. A dispatch worker waiting here stops
    /// pulling from the dispatch queue, so a slow destination makes the queue
    /// apply its overflow policy.
    pub async fn offer(
        &self,
        batch: Vec<Vec<u8>>,
        give_up: Instant,
        deadline_reached: impl Future<Output = ()>,
    ) -> Handoff {
        if batch.is_empty() {
            return Handoff::Sent;
        }
        let n = batch.len() as u64;
        self.metrics.add_routed(n);
        let delivery = Delivery {
            batch,
            completion: None,
        };

        tokio::select! {
            biased;
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(delivery);
                    Handoff::Sent
                }
                // the task only stops early once the shutdown deadline passed
                Err(_) => {
                    self.metrics.add_abandoned(n);
                    debug!(destination = %self.name(), records = n, "Destination stopped before hand-off");
                    Handoff::Abandoned
                }
            },
            _ = deadline_reached => {
                self.metrics.add_abandoned(n);
                debug!(destination = %self.name(), records = n, "Shutdown deadline reached before hand-off");
                Handoff::Abandoned
            }
            _ = tokio::time::sleep_until(give_up) => {
                self.metrics.add_dropped(n);
                debug!(destination = %self.name(), records = n, "Destination queue full, batch dropped");
                Handoff::Dropped
            }
        }
    }

    /// Hand an encoded batch to the destination task without waiting
    ///
    /// Used by synchronous submits, which bound their wait on the
    /// acknowledgement instead.
    pub fn try_offer(&self, batch: Vec<Vec<u8>>, completion: Option<CompletionSender<()>>) -> bool {
        if batch.is_empty() {
            return true;
        }
        let n = batch.len() as u64;
        self.metrics.add_routed(n);

        match self.tx.try_send(Delivery { batch, completion }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.add_dropped(n);
                debug!(destination = %self.name(), records = n, "Destination queue full, batch dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.add_dropped(n);
                debug!(destination = %self.name(), records = n, "Destination closed, batch dropped");
                false
            }
        }
    }
}

/// Destinations of one configuration generation
#[derive(Default)]
pub(crate) struct DestinationSet {
    handles: Vec<DestinationHandle>,
}

impl DestinationSet {
    pub fn iter(&self) -> impl Iterator<Item = &DestinationHandle> {
        self.handles.iter()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }
}

/// A destination whose task has not been spawned yet
pub(crate) struct PendingDestination {
    spec: DestinationSpec,
    generation: u64,
    launch: LaunchFn,
    rx: mpsc::Receiver<Delivery>,
    metrics: Arc<DestinationMetrics>,
}

impl PendingDestination {
    pub fn spawn(self, env: ActorEnv) -> (JoinHandle<()>, oneshot::Receiver<()>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let ctx = ActorContext {
            spec: self.spec,
            env,
            generation: self.generation,
            ready: ready_tx,
        };
        ((self.launch)(self.rx, self.metrics, ctx), ready_rx)
    }
}

/// Build the destination set of `config`
///
/// Metrics are kept per destination name across generations so counters
/// survive a reconfigure. Each destination starts a new generation in
/// `Configured`; tasks of the previous generation can no longer change its
/// state while they drain.
pub(crate) fn assemble(
    config: &PipelineConfiguration,
    registry: &mut HashMap<String, Arc<DestinationMetrics>>,
    factories: &HashMap<String, SinkFactory>,
) -> (DestinationSet, Vec<PendingDestination>) {
    let mut formatters: HashMap<String, Arc<RecordFormatter>> = HashMap::new();
    let mut handles = Vec::new();
    let mut pending = Vec::new();

    for spec in config.destinations.iter().filter(|d| d.enabled) {
        let formatter_name = config.formatter_name(spec);
        let formatter = formatters
            .entry(formatter_name.to_string())
            .or_insert_with(|| {
                let formatter_spec = config
                    .resolve_formatter(formatter_name)
                    .unwrap_or_else(FormatterSpec::structured);
                Arc::new(RecordFormatter::new(formatter_spec))
            })
            .clone();

        let metrics = match registry.get(&spec.name) {
            Some(existing) if existing.kind() == spec.kind => Arc::clone(existing),
            _ => {
                let created = Arc::new(DestinationMetrics::new(&spec.name, spec.kind));
                registry.insert(spec.name.clone(), Arc::clone(&created));
                created
            }
        };
        let generation = metrics.begin_generation();

        let launch = match factories.get(&spec.name) {
            Some(factory) => factory(spec),
            None => default_sink(spec),
        };

        let (tx, rx) = mpsc::channel(spec.queue_capacity.max(1));
        handles.push(DestinationHandle {
            spec: spec.clone(),
            formatter,
            metrics: Arc::clone(&metrics),
            tx,
        });
        pending.push(PendingDestination {
            spec: spec.clone(),
            generation,
            launch,
            rx,
            metrics,
        });
    }

    (DestinationSet { handles }, pending)
}

// ===== destination task =====

struct DestinationWorker<S> {
    sink: S,
    name: String,
    metrics: Arc<DestinationMetrics>,
    generation: u64,
    /// This task's view of the state; published while the generation is current
    state: DestinationState,
    env: ActorEnv,
    tracker: HealthTracker,
    resource: Option<OpenResource>,
    retry_at: Option<Instant>,
}

impl<S: LogSink + Send> DestinationWorker<S> {
    /// Record a state change and report it on the diagnostics channel
    fn transition(&mut self, to: DestinationState, detail: &str) {
        let from = std::mem::replace(&mut self.state, to);
        self.metrics.set_state_for(self.generation, to);
        if from != to {
            self.env
                .diagnostics
                .state_changed(&self.name, from, to, detail);
        }
    }

    /// State change not worth a diagnostics notice
    fn set_state_quiet(&mut self, to: DestinationState) {
        let from = std::mem::replace(&mut self.state, to);
        self.metrics.set_state_for(self.generation, to);
        if from != to {
            debug!(destination = %self.name, from = %from, to = %to, "Destination state");
        }
    }

    fn publish_failures(&self) {
        self.metrics
            .set_consecutive_failures_for(self.generation, self.tracker.consecutive_failures());
    }

    fn schedule_recovery(&mut self, retry_in: Duration) {
        self.retry_at = Some(Instant::now() + retry_in);
    }

    async fn acquire(&mut self) {
        match self.sink.open().await {
            Ok(()) => {
                self.resource = Some(OpenResource::acquire(&self.env.pipeline));
                self.set_state_quiet(DestinationState::Active);
            }
            Err(e) => {
                warn!(destination = %self.name, error = %e, "Destination open failed");
                let retry_in = self.tracker.on_open_failure();
                self.transition(DestinationState::Failed, &e.to_string());
                self.schedule_recovery(retry_in);
            }
        }
    }

    #[instrument(name = "destination_recover", skip(self), fields(destination = %self.name))]
    async fn recover(&mut self) {
        self.retry_at = None;
        self.set_state_quiet(DestinationState::Recovering);

        match self.sink.open().await {
            Ok(()) => {
                self.resource = Some(OpenResource::acquire(&self.env.pipeline));
                self.tracker.on_recovered();
                self.publish_failures();
                self.transition(DestinationState::Active, "resource reacquired");
            }
            Err(e) => match self.tracker.on_recovery_failure() {
                RecoveryOutcome::RetryIn(retry_in) => {
                    self.transition(DestinationState::Failed, &e.to_string());
                    self.schedule_recovery(retry_in);
                }
                RecoveryOutcome::GiveUp => {
                    self.transition(
                        DestinationState::Inactive,
                        &format!("recovery attempts exhausted: {e}"),
                    );
                }
            },
        }
    }

    async fn release(&mut self) {
        if self.resource.is_none() {
            return;
        }
        if let Err(e) = self.sink.close().await {
            warn!(destination = %self.name, error = %e, "Close failed");
        }
        self.resource = None;
    }

    async fn deliver(&mut self, deliveries: Vec<Delivery>) {
        let n: usize = deliveries.iter().map(|d| d.batch.len()).sum();
        let n = n as u64;

        if self.resource.is_none() || !self.state.accepts_batches() {
            self.metrics.add_dropped(n);
            return;
        }

        let mut batch = Vec::with_capacity(n as usize);
        // completions are released once the attempt is over
        let mut completions = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            batch.extend(delivery.batch);
            completions.extend(delivery.completion);
        }

        match self.sink.write_batch(&batch).await {
            Ok(()) => {
                self.metrics.add_delivered(n);
                self.tracker.on_success();
                self.publish_failures();
                if self.state == DestinationState::Degraded {
                    self.transition(DestinationState::Active, "delivery succeeded");
                }
            }
            Err(e) => {
                self.metrics.add_failed(n);
                warn!(destination = %self.name, records = n, error = %e, "Delivery failed");

                let outcome = self.tracker.on_failure(e.is_transient());
                self.publish_failures();
                match outcome {
                    FailureOutcome::Degraded => {
                        self.transition(DestinationState::Degraded, &e.to_string());
                    }
                    FailureOutcome::Failed { retry_in } => {
                        self.release().await;
                        self.transition(DestinationState::Failed, &e.to_string());
                        self.schedule_recovery(retry_in);
                    }
                }
            }
        }
        drop(completions);
    }

    async fn finish(&mut self) {
        if self.resource.is_none() {
            return;
        }
        if let Err(e) = self.sink.flush().await {
            error!(destination = %self.name, error = %e, "Flush failed on shutdown");
        }
        self.release().await;
    }
}

/// Frame size and wait of a batching destination
fn coalescing(spec: &DestinationSpec) -> Option<(usize, Duration)> {
    if spec.kind != DestinationKind::Network {
        return None;
    }
    let network = spec.network.clone().unwrap_or_default();
    Some((
        network.batch_size.max(1),
        Duration::from_millis(network.batch_timeout_ms),
    ))
}

/// Destination task loop
#[instrument(
    name = "destination_loop",
    skip(sink, rx, metrics, ctx),
    fields(destination = %ctx.spec.name)
)]
async fn run_destination<S: LogSink + Send>(
    sink: S,
    mut rx: mpsc::Receiver<Delivery>,
    metrics: Arc<DestinationMetrics>,
    ctx: ActorContext,
) {
    let ActorContext {
        spec,
        env,
        generation,
        ready,
    } = ctx;
    let mut worker = DestinationWorker {
        sink,
        name: spec.name.clone(),
        metrics,
        generation,
        state: DestinationState::Configured,
        tracker: HealthTracker::new(env.health.clone()),
        env,
        resource: None,
        retry_at: None,
    };
    let frame = coalescing(&spec);

    worker.set_state_quiet(DestinationState::Configured);
    worker.acquire().await;
    // nobody waiting is fine
    let _ = ready.send(());
    debug!(destination = %worker.name, state = %worker.state, generation, "Destination started");

    loop {
        let retry_at = worker.retry_at;
        let next = tokio::select! {
            biased;
            _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => None,
            delivery = rx.recv() => Some(delivery),
        };

        let delivery = match next {
            None => {
                worker.recover().await;
                continue;
            }
            Some(None) => break,
            Some(Some(delivery)) => delivery,
        };

        if worker.env.deadline_passed() {
            let mut abandoned = delivery.batch.len() as u64;
            while let Ok(rest) = rx.try_recv() {
                abandoned += rest.batch.len() as u64;
            }
            worker.metrics.add_abandoned(abandoned);
            info!(destination = %worker.name, abandoned, "Shutdown deadline reached");
            break;
        }

        let mut deliveries = vec![delivery];
        if let Some((frame_size, wait)) = frame {
            collect_frame(&mut rx, &mut deliveries, frame_size, wait, &worker.env).await;
        }
        worker.deliver(deliveries).await;
    }

    rx.close();
    worker.finish().await;
    debug!(destination = %worker.name, "Destination stopped");
}

/// Pull further deliveries until `frame_size` records are gathered
///
/// Waits at most `wait` for more; never waits while a synchronous submit is
/// pending or shutdown has started.
async fn collect_frame(
    rx: &mut mpsc::Receiver<Delivery>,
    deliveries: &mut Vec<Delivery>,
    frame_size: usize,
    wait: Duration,
    env: &ActorEnv,
) {
    let mut count: usize = deliveries.iter().map(|d| d.batch.len()).sum();
    let wait_until = Instant::now() + wait;

    while count < frame_size {
        match rx.try_recv() {
            Ok(delivery) => {
                count += delivery.batch.len();
                deliveries.push(delivery);
            }
            Err(mpsc::error::TryRecvError::Disconnected) => break,
            Err(mpsc::error::TryRecvError::Empty) => {
                let sync_pending = deliveries.iter().any(|d| d.completion.is_some());
                if sync_pending || env.shutting_down() {
                    break;
                }
                match tokio::time::timeout_at(wait_until, rx.recv()).await {
                    Ok(Some(delivery)) => {
                        count += delivery.batch.len();
                        deliveries.push(delivery);
                    }
                    _ => break,
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use contracts::{Category, ContractError, Severity};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Shared view of what a [`MockSink`] received
    #[derive(Clone, Default)]
    pub(crate) struct MockRecorder {
        pub written: Arc<Mutex<Vec<Vec<u8>>>>,
        pub writes: Arc<AtomicUsize>,
        /// Record count of every write attempt
        pub batch_sizes: Arc<Mutex<Vec<usize>>>,
        pub opens: Arc<AtomicUsize>,
        /// Fail every write while set
        pub broken: Arc<AtomicBool>,
        /// Fail every open while set
        pub unreachable: Arc<AtomicBool>,
    }

    impl MockRecorder {
        pub fn lines(&self) -> Vec<String> {
            self.written
                .lock()
                .unwrap()
                .iter()
                .map(|r| String::from_utf8_lossy(r).trim_end().to_string())
                .collect()
        }

        pub fn count(&self) -> usize {
            self.written.lock().unwrap().len()
        }
    }

    /// In-memory sink for pipeline tests
    pub(crate) struct MockSink {
        pub name: String,
        pub recorder: MockRecorder,
        /// Failures after this many successful writes
        pub fail_after: Option<usize>,
        pub delay_per_record: Duration,
        /// Blocks the calling thread on every write
        pub stall: Duration,
    }

    impl MockSink {
        pub fn new(name: &str, recorder: MockRecorder) -> Self {
            Self {
                name: name.to_string(),
                recorder,
                fail_after: None,
                delay_per_record: Duration::ZERO,
                stall: Duration::ZERO,
            }
        }
    }

    impl LogSink for MockSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn open(&mut self) -> Result<(), ContractError> {
            self.recorder.opens.fetch_add(1, Ordering::SeqCst);
            if self.recorder.unreachable.load(Ordering::SeqCst) {
                return Err(ContractError::sink_transient(&self.name, "unreachable"));
            }
            Ok(())
        }

        async fn write_batch(&mut self, batch: &[Vec<u8>]) -> Result<(), ContractError> {
            if !self.delay_per_record.is_zero() {
                tokio::time::sleep(self.delay_per_record * batch.len() as u32).await;
            }
            self.recorder.batch_sizes.lock().unwrap().push(batch.len());
            let attempt = self.recorder.writes.fetch_add(1, Ordering::SeqCst);
            if !self.stall.is_zero() {
                std::thread::sleep(self.stall);
            }
            let exhausted = self.fail_after.is_some_and(|ok| attempt >= ok);
            if exhausted || self.recorder.broken.load(Ordering::SeqCst) {
                return Err(ContractError::sink_transient(&self.name, "mock write failure"));
            }
            self.recorder.written.lock().unwrap().extend_from_slice(batch);
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), ContractError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ContractError> {
            Ok(())
        }
    }

    fn env(policy: HealthPolicy) -> ActorEnv {
        ActorEnv {
            health: policy,
            pipeline: Arc::new(PipelineMetrics::new()),
            diagnostics: Arc::new(Diagnostics::new(false)),
            deadline: Arc::new(OnceLock::new()),
        }
    }

    fn start(
        sink: MockSink,
        env: ActorEnv,
        capacity: usize,
    ) -> (mpsc::Sender<Delivery>, Arc<DestinationMetrics>, JoinHandle<()>) {
        let spec = DestinationSpec::console("mock", "stdout");
        let metrics = Arc::new(DestinationMetrics::new("mock", DestinationKind::Console));
        let (tx, rx) = mpsc::channel(capacity);
        let (ready, _) = oneshot::channel();
        let ctx = ActorContext {
            spec,
            env,
            generation: metrics.begin_generation(),
            ready,
        };
        let handle = launcher(sink)(rx, Arc::clone(&metrics), ctx);
        (tx, metrics, handle)
    }

    fn delivery(records: &[&str]) -> Delivery {
        Delivery {
            batch: records.iter().map(|r| format!("{r}\n").into_bytes()).collect(),
            completion: None,
        }
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let recorder = MockRecorder::default();
        let env = env(HealthPolicy::default());
        let pipeline = Arc::clone(&env.pipeline);
        let (tx, metrics, handle) = start(MockSink::new("mock", recorder.clone()), env, 8);

        tx.send(delivery(&["a", "b"])).await.unwrap();
        tx.send(delivery(&["c"])).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(recorder.lines(), vec!["a", "b", "c"]);
        assert_eq!(metrics.delivered(), 3);
        assert_eq!(metrics.state(), DestinationState::Active);
        // resource released on exit
        assert_eq!(pipeline.open_resources(), 0);
    }

    #[tokio::test]
    async fn test_failure_threshold_moves_to_failed() {
        let recorder = MockRecorder::default();
        let mut sink = MockSink::new("mock", recorder.clone());
        sink.fail_after = Some(2);
        let policy = HealthPolicy {
            failure_threshold: 3,
            backoff_initial_ms: 60_000,
            backoff_max_ms: 60_000,
            max_recovery_attempts: 3,
        };
        let (tx, metrics, handle) = start(sink, env(policy), 16);

        for i in 0..2 {
            tx.send(delivery(&[&format!("ok{i}")])).await.unwrap();
        }
        for i in 0..3 {
            tx.send(delivery(&[&format!("bad{i}")])).await.unwrap();
        }
        // skipped while failed
        tx.send(delivery(&["skipped"])).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(recorder.writes.load(Ordering::SeqCst), 5);
        assert_eq!(metrics.delivered(), 2);
        assert_eq!(metrics.failed(), 3);
        assert_eq!(metrics.dropped(), 1);
        assert_eq!(metrics.state(), DestinationState::Failed);
        assert_eq!(metrics.snapshot().consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_recovers_after_backoff() {
        let recorder = MockRecorder::default();
        recorder.unreachable.store(true, Ordering::SeqCst);
        let policy = HealthPolicy {
            failure_threshold: 1,
            backoff_initial_ms: 10,
            backoff_max_ms: 10,
            max_recovery_attempts: 100,
        };
        let (tx, metrics, handle) = start(MockSink::new("mock", recorder.clone()), env(policy), 8);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!metrics.state().accepts_batches());

        recorder.unreachable.store(false, Ordering::SeqCst);
        let mut waited = 0;
        while metrics.state() != DestinationState::Active && waited < 200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            waited += 1;
        }
        assert_eq!(metrics.state(), DestinationState::Active);

        tx.send(delivery(&["after recovery"])).await.unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(recorder.lines(), vec!["after recovery"]);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let recorder = MockRecorder::default();
        recorder.unreachable.store(true, Ordering::SeqCst);
        let policy = HealthPolicy {
            failure_threshold: 1,
            backoff_initial_ms: 1,
            backoff_max_ms: 2,
            max_recovery_attempts: 2,
        };
        let (tx, metrics, handle) = start(MockSink::new("mock", recorder.clone()), env(policy), 8);

        let mut waited = 0;
        while metrics.state() != DestinationState::Inactive && waited < 200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            waited += 1;
        }
        assert_eq!(metrics.state(), DestinationState::Inactive);
        // initial open plus two recovery attempts
        assert_eq!(recorder.opens.load(Ordering::SeqCst), 3);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_abandons_after_deadline() {
        let recorder = MockRecorder::default();
        let env = env(HealthPolicy::default());
        let deadline = Arc::clone(&env.deadline);
        let (tx, metrics, handle) = start(MockSink::new("mock", recorder.clone()), env, 8);

        deadline.set(Instant::now()).unwrap();
        for _ in 0..3 {
            metrics.add_routed(2);
            tx.send(delivery(&["x", "y"])).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(metrics.abandoned(), 6);
        assert_eq!(recorder.count(), 0);
        assert_eq!(metrics.settle_abandoned(), 0);
    }

    #[tokio::test]
    async fn test_handle_routes_and_drops_when_full() {
        let spec = DestinationSpec::console("trades", "stdout").with_categories([Category::Trade]);
        let metrics = Arc::new(DestinationMetrics::new("trades", DestinationKind::Console));
        let (tx, _rx) = mpsc::channel(1);
        let handle = DestinationHandle {
            spec,
            formatter: Arc::new(RecordFormatter::new(FormatterSpec::structured())),
            metrics: Arc::clone(&metrics),
            tx,
        };

        let records = vec![
            LogRecord::new(Severity::Info, Category::Trade, "filled"),
            LogRecord::new(Severity::Info, Category::General, "tick"),
        ];
        let encoded = handle.encode_matching(&records);
        assert_eq!(encoded.len(), 1);
        assert!(handle.try_offer(encoded.clone(), None));
        // channel of one is now full
        assert!(!handle.try_offer(encoded, None));
        assert_eq!(metrics.routed(), 2);
        assert_eq!(metrics.dropped(), 1);

        metrics.set_state(DestinationState::Failed);
        assert!(handle.encode_matching(&records).is_empty());
        assert_eq!(metrics.routed(), 3);
        assert_eq!(metrics.dropped(), 2);
    }

    #[tokio::test]
    async fn test_assemble_reuses_metrics_by_name() {
        let config = PipelineConfiguration::default()
            .with_destination(DestinationSpec::console("out", "stdout"))
            .with_destination(DestinationSpec::console("err", "stderr").with_formatter("human"));
        let mut registry = HashMap::new();
        let factories = HashMap::new();

        let (first, _pending) = assemble(&config, &mut registry, &factories);
        assert_eq!(first.len(), 2);
        let out = Arc::clone(&first.iter().next().unwrap().metrics);
        out.set_state(DestinationState::Inactive);

        let (second, _pending) = assemble(&config, &mut registry, &factories);
        let reused = &second.iter().next().unwrap().metrics;
        assert!(Arc::ptr_eq(&out, reused));
        assert_eq!(reused.state(), DestinationState::Configured);
        assert_eq!(second.iter().nth(1).unwrap().name(), "err");
    }

    #[tokio::test]
    async fn test_offer_waits_for_room_then_gives_up() {
        let metrics = Arc::new(DestinationMetrics::new("slow", DestinationKind::Console));
        let (tx, mut rx) = mpsc::channel(1);
        let handle = DestinationHandle {
            spec: DestinationSpec::console("slow", "stdout"),
            formatter: Arc::new(RecordFormatter::new(FormatterSpec::structured())),
            metrics: Arc::clone(&metrics),
            tx,
        };
        let batch = || vec![b"line\n".to_vec()];
        let never = std::future::pending::<()>;
        let far = || Instant::now() + Duration::from_secs(5);

        assert_eq!(handle.offer(batch(), far(), never()).await, Handoff::Sent);

        // full until the give-up time
        let give_up = Instant::now() + Duration::from_millis(30);
        assert_eq!(handle.offer(batch(), give_up, never()).await, Handoff::Dropped);
        assert!(Instant::now() >= give_up);

        // room freed while waiting
        let (handoff, _) = tokio::join!(handle.offer(batch(), far(), never()), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            rx.recv().await
        });
        assert_eq!(handoff, Handoff::Sent);

        // deadline already reached
        let started = Instant::now();
        assert_eq!(handle.offer(batch(), far(), async {}).await, Handoff::Abandoned);
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(metrics.routed(), 4);
        assert_eq!(metrics.dropped(), 1);
        assert_eq!(metrics.abandoned(), 1);
    }

    #[tokio::test]
    async fn test_retired_task_leaves_successor_state_alone() {
        let recorder = MockRecorder::default();
        let mut sink = MockSink::new("mock", recorder.clone());
        sink.fail_after = Some(0);
        let policy = HealthPolicy {
            failure_threshold: 1,
            backoff_initial_ms: 60_000,
            backoff_max_ms: 60_000,
            max_recovery_attempts: 3,
        };
        let (tx, metrics, handle) = start(sink, env(policy), 8);

        // a reconfigure hands the name to a new generation
        metrics.begin_generation();
        tx.send(delivery(&["late"])).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(metrics.failed(), 1);
        assert_eq!(metrics.state(), DestinationState::Configured);
        assert_eq!(metrics.snapshot().consecutive_failures, 0);
    }
}
