//! # Contracts
//!
//! Shared data model of the log pipeline: records, configuration and the sink
//! interface. Every other crate depends on this one, never the reverse.
//!
//! ## Time Model
//! - Record timestamps are wall-clock UTC (`chrono::DateTime<Utc>`)
//! - Ordering guarantees come from queue position, not from timestamps

mod component;
mod config;
mod error;
mod field;
mod record;
mod severity;
mod sink;
mod validation;

pub use component::ComponentName;
pub use config::*;
pub use error::*;
pub use field::{FieldValue, Fields};
pub use record::*;
pub use severity::{Category, Severity};
pub use sink::*;
pub use validation::validate_configuration;
