//! Pipeline-wide properties.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use contracts::{
    Category, DestinationSpec, FormatterSpec, OverflowPolicy, PipelineConfiguration, RotationSpec,
};
use dispatcher::sinks::rotation::backup_path;
use dispatcher::RecordFormatter;

use crate::support::{fast_config, info, message_of, quiet, wait_until, Recorder, RecordingSink};

/// submit stays fast with a full queue and a stalled destination
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submit_never_blocks_under_overflow() {
    for policy in [OverflowPolicy::DropOldest, OverflowPolicy::DropNewest] {
        let config = PipelineConfiguration {
            queue_capacity: 4,
            overflow_policy: policy,
            ..fast_config()
        }
        .with_destination(DestinationSpec::console("stalled", "stdout").with_queue_capacity(1));
        let recorder = Recorder::default();
        let r = recorder.clone();
        let pipeline = quiet(config)
            .with_sink("stalled", move |_| {
                RecordingSink::new("stalled", &r).with_delay(Duration::from_millis(50))
            })
            .build()
            .await
            .unwrap();

        let started = Instant::now();
        for i in 0..10_000 {
            pipeline.submit(info(Category::General, format!("burst {i}")));
        }
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(1), "{policy:?} took {elapsed:?}");

        let report = pipeline.shutdown(Duration::from_millis(200)).await;
        let stalled = report.metrics.destination("stalled").unwrap();
        assert!(report.metrics.dropped_by_queue + stalled.dropped_by_destination > 0);
        assert_eq!(report.metrics.submitted, 10_000);
    }
}

/// A failed batch is never written again
#[tokio::test]
async fn test_failed_batches_are_not_replayed() {
    let config = PipelineConfiguration {
        batch_size: 7,
        health: contracts::HealthPolicy {
            failure_threshold: 1_000,
            ..contracts::HealthPolicy::default()
        },
        ..fast_config()
    }
    .with_destination(DestinationSpec::console("flaky", "stdout").with_queue_capacity(1_000));
    let recorder = Recorder::default();
    let r = recorder.clone();
    let pipeline = quiet(config)
        .with_sink("flaky", move |_| RecordingSink::new("flaky", &r).failing_every(3))
        .build()
        .await
        .unwrap();

    for i in 0..200 {
        pipeline.submit(info(Category::General, format!("unique {i}")));
    }
    let report = pipeline.shutdown(Duration::from_secs(2)).await;
    let metrics = report.metrics.destination("flaky").unwrap();

    let messages = recorder.messages();
    let distinct: HashSet<&String> = messages.iter().collect();
    assert_eq!(distinct.len(), messages.len());
    assert!(metrics.failed > 0);
    assert_eq!(metrics.delivered, messages.len() as u64);
    assert_eq!(metrics.delivered + metrics.failed, 200);
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|content| content.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Bytes across the active file and backups equal the bytes formatted, and
/// every line is a complete record
#[tokio::test]
async fn test_rotation_preserves_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trades.log");
    let config = fast_config().with_destination(
        DestinationSpec::file("trades", path.to_string_lossy()).with_rotation(RotationSpec {
            max_size_bytes: 1024,
            backup_count: 50,
            compress_backups: false,
        }),
    );
    let pipeline = quiet(config).build().await.unwrap();
    let formatter = RecordFormatter::new(FormatterSpec::structured());

    let mut expected_bytes = 0;
    for i in 0..60 {
        let record = info(Category::Trade, format!("fill {i}")).with_field("price", 100.5 + i as f64);
        expected_bytes += formatter.format(&record).len();
        pipeline.submit(record);
    }
    pipeline.shutdown(Duration::from_secs(2)).await;

    let mut files = vec![path.clone()];
    let mut index = 1;
    while backup_path(&path, index, false).exists() {
        files.push(backup_path(&path, index, false));
        index += 1;
    }
    assert!(files.len() > 1, "expected at least one rotation");

    let mut total_bytes = 0;
    let mut lines = 0;
    for file in files.iter().rev() {
        let size = fs::metadata(file).unwrap().len() as usize;
        assert!(size <= 1024, "{} holds {size} bytes", file.display());
        total_bytes += size;
        for line in read_lines(file) {
            serde_json::from_str::<serde_json::Value>(&line).unwrap();
            lines += 1;
        }
    }
    assert_eq!(total_bytes, expected_bytes);
    assert_eq!(lines, 60);
}

/// One producer, several workers: a destination sees submission order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_order_within_producer() {
    let config = PipelineConfiguration {
        worker_count: 4,
        batch_size: 3,
        queue_capacity: 10_000,
        ..fast_config()
    }
    .with_destination(DestinationSpec::console("ordered", "stdout").with_queue_capacity(10_000));
    let recorder = Recorder::default();
    let r = recorder.clone();
    let pipeline = quiet(config)
        .with_sink("ordered", move |_| RecordingSink::new("ordered", &r))
        .build()
        .await
        .unwrap();

    let log = pipeline.logger("producer");
    for i in 0..2_000u64 {
        log.log(
            contracts::Severity::Info,
            Category::General,
            &format!("{i:05}"),
            [("seq", i)],
        );
    }
    pipeline.shutdown(Duration::from_secs(5)).await;

    let expected: Vec<String> = (0..2_000).map(|i| format!("{i:05}")).collect();
    assert_eq!(recorder.messages(), expected);
}

/// Reconfiguring with the same configuration leaks nothing
#[tokio::test]
async fn test_reconfigure_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config()
        .with_destination(DestinationSpec::file(
            "expert",
            dir.path().join("expert.log").to_string_lossy(),
        ))
        .with_destination(
            DestinationSpec::file("trades", dir.path().join("trades.log").to_string_lossy())
                .with_categories([Category::Trade]),
        );
    let pipeline = quiet(config.clone()).build().await.unwrap();

    pipeline.submit(info(Category::Trade, "first"));
    assert!(
        wait_until(|| pipeline.snapshot_metrics().destination("trades").unwrap().delivered == 1)
            .await
    );
    let before = pipeline.snapshot_metrics();
    assert_eq!(before.open_resources, 2);

    pipeline.reconfigure(config.clone()).await.unwrap();
    pipeline.reconfigure(config).await.unwrap();

    let after = pipeline.snapshot_metrics();
    assert_eq!(after.open_resources, before.open_resources);
    let names = |s: &dispatcher::MetricsSnapshot| {
        s.destinations.iter().map(|d| d.name.clone()).collect::<Vec<_>>()
    };
    assert_eq!(names(&after), names(&before));
    assert_eq!(after.destination("trades").unwrap().delivered, 1);
    assert_eq!(after.destination("expert").unwrap().delivered, 1);

    pipeline.submit(info(Category::Trade, "second"));
    let report = pipeline.shutdown(Duration::from_secs(2)).await;
    assert_eq!(report.metrics.open_resources, 0);

    let trades = read_lines(&dir.path().join("trades.log"));
    let messages: Vec<String> = trades.iter().map(|l| message_of(l)).collect();
    assert_eq!(messages, vec!["first", "second"]);
}

/// Every enqueued record ends up delivered, dropped or abandoned, and
/// shutdown honours its deadline
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_conservation_on_shutdown() {
    let config = PipelineConfiguration {
        queue_capacity: 50,
        overflow_policy: OverflowPolicy::DropOldest,
        batch_size: 5,
        ..fast_config()
    }
    .with_destination(DestinationSpec::console("slow", "stdout").with_queue_capacity(4));
    let recorder = Recorder::default();
    let r = recorder.clone();
    let pipeline = quiet(config)
        .with_sink("slow", move |_| {
            RecordingSink::new("slow", &r).with_delay(Duration::from_millis(2))
        })
        .build()
        .await
        .unwrap();

    for i in 0..500 {
        pipeline.submit(info(Category::General, format!("record {i}")));
    }

    let deadline = Duration::from_millis(50);
    let started = Instant::now();
    let report = pipeline.shutdown(deadline).await;
    assert!(started.elapsed() <= deadline + Duration::from_millis(100));

    let m = &report.metrics;
    let dest = m.destination("slow").unwrap();
    assert_eq!(
        dest.routed,
        dest.delivered + dest.failed + dest.dropped_by_destination + dest.abandoned
    );
    assert_eq!(
        m.enqueued,
        m.dropped_by_queue + dest.dropped_by_destination + dest.delivered + m.abandoned_on_shutdown
    );
    assert_eq!(m.submitted, 500);
    assert_eq!(m.enqueued, 500);
    assert_eq!(m.open_resources, 0);
    assert_eq!(recorder.count() as u64, dest.delivered);
}
