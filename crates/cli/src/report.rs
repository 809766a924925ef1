//! Run summary printed after shutdown.

use std::time::Duration;

use dispatcher::ShutdownReport;
use observability::RunningStats;
use serde::Serialize;

/// Statistics from a `run` invocation
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Lines read from stdin
    pub lines_read: u64,
    /// Lines that could not be parsed
    pub lines_rejected: u64,
    /// Time from pipeline start to the end of shutdown
    pub duration: Duration,
    pub shutdown: ShutdownReport,
    #[serde(skip)]
    pub throughput: RunningStats,
}

impl RunSummary {
    /// Delivered records per second over the whole run
    pub fn records_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.shutdown.metrics.total_delivered() as f64 / secs
        } else {
            0.0
        }
    }

    pub fn print(&self) {
        let metrics = &self.shutdown.metrics;

        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                      logpipe summary                         ║");
        println!("╚══════════════════════════════════════════════════════════════╝\n");

        println!("Input");
        println!("   ├─ Lines read: {}", self.lines_read);
        println!("   ├─ Lines rejected: {}", self.lines_rejected);
        println!("   ├─ Duration: {:.2}s", self.duration.as_secs_f64());
        println!("   ├─ Delivered/s: {:.2}", self.records_per_second());
        println!("   └─ Sampled rate: {}", self.throughput);

        println!("\nQueue");
        println!("   ├─ Submitted: {}", metrics.submitted);
        println!("   ├─ Enqueued: {}", metrics.enqueued);
        println!("   ├─ Dequeued: {}", metrics.dequeued);
        println!("   ├─ Dropped (overflow): {}", metrics.dropped_by_queue);
        println!("   ├─ Rate limited: {}", metrics.rate_limited);
        println!("   └─ Rejected after close: {}", metrics.rejected);

        println!("\nShutdown");
        println!(
            "   ├─ Deadline met: {} ({:.3}s)",
            self.shutdown.deadline_met,
            self.shutdown.elapsed.as_secs_f64()
        );
        println!("   ├─ Abandoned in queue: {}", self.shutdown.abandoned_in_queue);
        println!(
            "   ├─ Abandoned in destinations: {}",
            self.shutdown.abandoned_in_destinations
        );
        println!("   └─ Open resources: {}", metrics.open_resources);

        if !metrics.destinations.is_empty() {
            println!("\nDestinations ({})", metrics.destinations.len());
            for (i, dest) in metrics.destinations.iter().enumerate() {
                let is_last = i == metrics.destinations.len() - 1;
                let prefix = if is_last { "└─" } else { "├─" };
                println!(
                    "   {} {} [{} / {}] delivered={} failed={} dropped={} abandoned={}",
                    prefix,
                    dest.name,
                    dest.kind.as_str(),
                    dest.state,
                    dest.delivered,
                    dest.failed,
                    dest.dropped_by_destination,
                    dest.abandoned
                );
            }
        }

        println!();
    }
}
