//! `run` command implementation.

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Interval;
use tracing::{debug, info, warn};

use config_loader::ConfigLoader;
use dispatcher::{LogRecord, Pipeline};
use observability::{export_snapshot, ThroughputTracker};

use crate::cli::RunArgs;
use crate::input::parse_line;
use crate::report::RunSummary;

/// Execute the `run` command
pub async fn run_pipeline(args: &RunArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration");

    if !args.config.exists() {
        anyhow::bail!("Configuration file not found: {}", args.config.display());
    }

    let config = ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    info!(
        destinations = config.destinations.len(),
        workers = config.worker_count,
        queue_capacity = config.queue_capacity,
        async_mode = config.async_mode,
        "Configuration loaded"
    );

    let blocking_submit = !config.async_mode;
    let started = Instant::now();
    let pipeline = Pipeline::configure(config)
        .await
        .context("Failed to start pipeline")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tracker = ThroughputTracker::new();
    let mut ticker = (args.metrics_interval > 0)
        .then(|| tokio::time::interval(Duration::from_secs(args.metrics_interval)));
    let signal = shutdown_signal();
    tokio::pin!(signal);

    let mut lines_read: u64 = 0;
    let mut lines_rejected: u64 = 0;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    lines_read += 1;
                    match parse_line(&line, args.input, &args.component) {
                        Ok(Some(record)) => submit(&pipeline, record, blocking_submit),
                        Ok(None) => {}
                        Err(e) => {
                            lines_rejected += 1;
                            warn!(line = lines_read, error = %e, "Skipping malformed line");
                        }
                    }
                }
                Ok(None) => {
                    info!(lines = lines_read, "End of input");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            },
            _ = tick(&mut ticker) => {
                let snapshot = pipeline.snapshot_metrics();
                export_snapshot(&snapshot);
                let rate = tracker.observe(&snapshot);
                debug!(
                    rate = format!("{rate:.1}"),
                    depth = snapshot.current_queue_depth,
                    "Metrics exported"
                );
            }
            _ = &mut signal => {
                warn!("Received shutdown signal, stopping pipeline...");
                break;
            }
        }
    }

    let report = pipeline
        .shutdown(Duration::from_millis(args.shutdown_timeout_ms))
        .await;
    export_snapshot(&report.metrics);
    tracker.observe(&report.metrics);

    info!(
        delivered = report.metrics.total_delivered(),
        abandoned = report.abandoned(),
        deadline_met = report.deadline_met,
        "Pipeline stopped"
    );

    let summary = RunSummary {
        lines_read,
        lines_rejected,
        duration: started.elapsed(),
        shutdown: report,
        throughput: tracker.stats().clone(),
    };
    if args.json {
        let json = serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?;
        println!("{json}");
    } else {
        summary.print();
    }

    Ok(())
}

/// Synchronous pipelines block the caller until delivery, so keep that off
/// the runtime's scheduler
fn submit(pipeline: &Pipeline, record: LogRecord, blocking: bool) {
    if blocking {
        tokio::task::block_in_place(|| pipeline.submit(record));
    } else {
        pipeline.submit(record);
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
