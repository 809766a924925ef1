//! Sink implementations
//!
//! Contains FileSink, ConsoleSink, and NetworkSink.

use std::time::Duration;

use contracts::ContractError;

mod console;
mod file;
mod network;
pub mod rotation;

pub use self::console::{ConsoleStream, ConsoleSink};
pub use self::file::FileSink;
pub use self::network::NetworkSink;

/// Upper bound for one blocking file or console call
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Run blocking std I/O on the blocking pool, giving up after `limit`
///
/// A call that times out keeps running on its thread and its result is
/// discarded; the error is transient so the destination retries.
pub(crate) async fn off_thread<T, F>(sink: &str, limit: Duration, call: F) -> Result<T, ContractError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(call)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ContractError::sink_fatal(
            sink,
            format!("blocking I/O task failed: {e}"),
        )),
        Err(_) => Err(ContractError::sink_transient(
            sink,
            format!("I/O did not finish within {}ms", limit.as_millis()),
        )),
    }
}
