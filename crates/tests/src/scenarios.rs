//! End-to-end scenarios over the public pipeline API.

use std::fs;
use std::time::{Duration, Instant};

use config_loader::{ConfigFormat, ConfigLoader};
use contracts::{
    Category, DestinationSpec, HealthPolicy, OverflowPolicy, RotationSpec, Severity,
};
use dispatcher::queue::Dequeued;
use dispatcher::sinks::rotation::backup_path;
use dispatcher::{DestinationState, DispatchQueue, EnqueueOutcome};

use crate::support::{fast_config, info, message_of, quiet, wait_until, Recorder, RecordingSink};

/// A stalled queue under drop_oldest keeps the newest records in order
#[tokio::test]
async fn test_drop_oldest_keeps_newest_in_order() {
    let queue = DispatchQueue::new(10, OverflowPolicy::DropOldest, Duration::from_millis(50));

    let mut evicted = 0;
    for i in 0..15 {
        match queue.enqueue(info(Category::General, format!("record {i}"))) {
            EnqueueOutcome::Accepted => {}
            EnqueueOutcome::AcceptedWithEviction(n) => evicted += n,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(evicted, 5);
    assert_eq!(queue.counters().dropped, 5);
    assert_eq!(queue.len(), 10);

    let Dequeued::Batch(batch) = queue.dequeue_batch(100, Duration::from_millis(10)).await else {
        panic!("expected a batch");
    };
    let messages: Vec<&str> = batch.records.iter().map(|r| r.message()).collect();
    let expected: Vec<String> = (5..15).map(|i| format!("record {i}")).collect();
    assert_eq!(messages, expected);
}

/// Rotation keeps one active file plus `backup_count` backups and never
/// splits or repeats a record
#[tokio::test]
async fn test_rotation_keeps_contiguous_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    let config = fast_config().with_destination(
        DestinationSpec::file("main", path.to_string_lossy()).with_rotation(RotationSpec {
            max_size_bytes: 1024,
            backup_count: 2,
            compress_backups: false,
        }),
    );
    let pipeline = quiet(config).build().await.unwrap();

    // structured records are well over 100 bytes each, so 40 of them overflow
    // three 1 KiB files
    let submitted: Vec<String> = (0..40).map(|i| format!("order {i:04}")).collect();
    for message in &submitted {
        pipeline.submit(info(Category::General, message.clone()));
    }
    let report = pipeline.shutdown(Duration::from_secs(2)).await;
    assert_eq!(report.metrics.destination("main").unwrap().delivered, 40);

    assert!(path.exists());
    assert!(backup_path(&path, 1, false).exists());
    assert!(backup_path(&path, 2, false).exists());
    assert!(!backup_path(&path, 3, false).exists());

    let mut recovered = Vec::new();
    for file in [backup_path(&path, 2, false), backup_path(&path, 1, false), path.clone()] {
        let content = fs::read_to_string(&file).unwrap();
        assert!(content.len() <= 1024, "{} exceeds the size limit", file.display());
        assert!(content.ends_with('\n'));
        recovered.extend(content.lines().map(message_of));
    }

    // oldest records were evicted; what is left is an unbroken tail
    assert!(recovered.len() < submitted.len());
    let tail = &submitted[submitted.len() - recovered.len()..];
    assert_eq!(recovered, tail);
}

/// A category filter routes only matching records; no filter sees all
#[tokio::test]
async fn test_category_filter_routing() {
    let config = fast_config()
        .with_destination(
            DestinationSpec::console("trades", "stdout").with_categories([Category::Trade]),
        )
        .with_destination(DestinationSpec::console("all", "stdout"));
    let trades = Recorder::default();
    let all = Recorder::default();
    let (t, a) = (trades.clone(), all.clone());
    let pipeline = quiet(config)
        .with_sink("trades", move |_| RecordingSink::new("trades", &t))
        .with_sink("all", move |_| RecordingSink::new("all", &a))
        .build()
        .await
        .unwrap();

    let log = pipeline.logger("router");
    for i in 0..5 {
        log.trade(&format!("fill {i}"), [("qty", i as u64)]);
        log.info(&format!("heartbeat {i}"));
    }
    let report = pipeline.shutdown(Duration::from_secs(2)).await;

    assert_eq!(trades.count(), 5);
    assert_eq!(all.count(), 10);
    assert!(trades.messages().iter().all(|m| m.starts_with("fill")));
    assert_eq!(report.metrics.destination("trades").unwrap().routed, 5);
    assert_eq!(report.metrics.destination("all").unwrap().routed, 10);
}

/// A sink that breaks after two deliveries fails on the third consecutive
/// error; the other destination keeps receiving everything
#[tokio::test]
async fn test_failing_destination_is_isolated() {
    let config = fast_config()
        .with_destination(DestinationSpec::console("flaky", "stdout"))
        .with_destination(DestinationSpec::console("healthy", "stdout"));
    let config = contracts::PipelineConfiguration {
        batch_size: 1,
        health: HealthPolicy {
            failure_threshold: 3,
            backoff_initial_ms: 60_000,
            backoff_max_ms: 60_000,
            max_recovery_attempts: 1,
        },
        ..config
    };
    let flaky = Recorder::default();
    let healthy = Recorder::default();
    let (f, h) = (flaky.clone(), healthy.clone());
    let pipeline = quiet(config)
        .with_sink("flaky", move |_| RecordingSink::new("flaky", &f).failing_after(2))
        .with_sink("healthy", move |_| RecordingSink::new("healthy", &h))
        .build()
        .await
        .unwrap();

    // one record at a time so every attempt is its own batch
    for i in 0..5 {
        pipeline.submit(info(Category::General, format!("before {i}")));
        assert!(wait_until(|| flaky.attempts() == i + 1).await);
    }
    assert!(
        wait_until(|| {
            pipeline.snapshot_metrics().destination("flaky").unwrap().state
                == DestinationState::Failed
        })
        .await
    );

    for i in 0..5 {
        pipeline.submit(info(Category::General, format!("after {i}")));
    }
    let report = pipeline.shutdown(Duration::from_secs(2)).await;

    assert_eq!(flaky.count(), 2);
    assert_eq!(flaky.attempts(), 5);
    assert_eq!(healthy.count(), 10);

    let flaky_metrics = report.metrics.destination("flaky").unwrap();
    assert_eq!(flaky_metrics.delivered, 2);
    assert_eq!(flaky_metrics.failed, 3);
    assert_eq!(flaky_metrics.dropped_by_destination, 5);
}

/// Shutdown returns at its deadline and accounts for every queued record
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_deadline_with_slow_sink() {
    let config = fast_config().with_destination(
        DestinationSpec::console("slow", "stdout").with_queue_capacity(1_000),
    );
    let config = contracts::PipelineConfiguration {
        batch_size: 10,
        queue_capacity: 2_000,
        ..config
    };
    let recorder = Recorder::default();
    let r = recorder.clone();
    let pipeline = quiet(config)
        .with_sink("slow", move |_| {
            RecordingSink::new("slow", &r).with_delay(Duration::from_millis(1))
        })
        .build()
        .await
        .unwrap();

    for i in 0..1_000 {
        pipeline.submit(info(Category::General, format!("queued {i}")));
    }

    let deadline = Duration::from_millis(100);
    let started = Instant::now();
    let report = pipeline.shutdown(deadline).await;
    let elapsed = started.elapsed();

    assert!(elapsed <= deadline + Duration::from_millis(100), "took {elapsed:?}");
    let delivered = report.metrics.total_delivered();
    assert!(delivered > 0);
    assert!(delivered < 1_000);
    assert_eq!(delivered + report.abandoned(), 1_000);
    assert_eq!(report.metrics.abandoned_on_shutdown, report.abandoned());
    assert_eq!(recorder.count() as u64, delivered);
    assert_eq!(report.metrics.open_resources, 0);
}

/// A configuration file drives severity thresholds per destination
#[tokio::test]
async fn test_config_file_thresholds() {
    let content = r#"
min_severity = "debug"
batch_timeout_ms = 5

[[destinations]]
name = "errors"
kind = "console"
target = "stderr"
min_severity = "error"

[[destinations]]
name = "everything"
kind = "console"
target = "stdout"
"#;
    let config = ConfigLoader::load_from_str(content, ConfigFormat::Toml).unwrap();
    let errors = Recorder::default();
    let everything = Recorder::default();
    let (e, a) = (errors.clone(), everything.clone());
    let pipeline = quiet(config)
        .with_sink("errors", move |_| RecordingSink::new("errors", &e))
        .with_sink("everything", move |_| RecordingSink::new("everything", &a))
        .build()
        .await
        .unwrap();

    for severity in [
        Severity::Debug,
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
    ] {
        pipeline.submit(contracts::LogRecord::new(
            severity,
            Category::General,
            severity.as_str(),
        ));
    }
    pipeline.shutdown(Duration::from_secs(2)).await;

    assert_eq!(errors.messages(), vec!["ERROR", "CRITICAL"]);
    assert_eq!(everything.count(), 5);
}
