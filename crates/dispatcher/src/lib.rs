//! # Dispatcher
//!
//! Core of the log pipeline.
//!
//! Responsibilities:
//! - Accept records from producers without blocking them
//! - Fan-out to destinations, each isolated behind its own queue and task
//! - Track destination health and recover failed resources
//! - Drain within a deadline on shutdown, accounting for every record

mod destination;
pub mod error;
pub mod fallback;
pub mod format;
pub mod health;
mod logger;
pub mod metrics;
mod pipeline;
pub mod queue;
pub mod rate_limit;
pub mod sinks;
mod worker;

pub use contracts::{LogRecord, LogSink};
pub use error::PipelineError;
pub use fallback::Diagnostics;
pub use format::RecordFormatter;
pub use health::{DestinationState, HealthTracker};
pub use logger::{Logger, OperationTimer};
pub use metrics::{DestinationSnapshot, MetricsSnapshot, QueueCounters};
pub use pipeline::{Pipeline, PipelineBuilder, ShutdownReport};
pub use queue::{DispatchQueue, EnqueueOutcome};
pub use sinks::{ConsoleSink, FileSink, NetworkSink};
