//! LogSink trait - Destination output interface
//!
//! A sink is owned by exactly one destination worker and receives batches of
//! already formatted records, one encoded record per element.

use crate::ContractError;

/// Record output trait
///
/// All sink implementations must implement this trait.
#[trait_variant::make(LogSink: Send)]
pub trait LocalLogSink {
    /// Sink name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Acquire the underlying resource (open file, connect socket)
    async fn open(&mut self) -> Result<(), ContractError>;

    /// Write a batch of encoded records
    ///
    /// # Errors
    /// `SinkTransient` when the next batch may succeed, `SinkFatal` when the
    /// resource must be reacquired first. A failed batch is never replayed.
    async fn write_batch(&mut self, batch: &[Vec<u8>]) -> Result<(), ContractError>;

    /// Flush buffer (if any)
    async fn flush(&mut self) -> Result<(), ContractError>;

    /// Release the resource; the sink may be opened again afterwards
    async fn close(&mut self) -> Result<(), ContractError>;
}
