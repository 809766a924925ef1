//! ConsoleSink - writes records to stdout or stderr

use std::io::Write;
use std::time::Duration;

use tracing::{debug, instrument};

use contracts::{ContractError, DestinationSpec, LogSink};

use super::{off_thread, DEFAULT_IO_TIMEOUT};

/// Standard stream selected by the destination target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

impl ConsoleStream {
    /// `"stderr"` selects stderr, anything else stdout
    pub fn from_target(target: &str) -> Self {
        if target.eq_ignore_ascii_case("stderr") {
            ConsoleStream::Stderr
        } else {
            ConsoleStream::Stdout
        }
    }

    /// Write a batch under a single stream lock
    fn write_batch(self, batch: &[Vec<u8>]) -> std::io::Result<()> {
        match self {
            ConsoleStream::Stdout => write_locked(std::io::stdout().lock(), batch),
            ConsoleStream::Stderr => write_locked(std::io::stderr().lock(), batch),
        }
    }

    fn flush(self) -> std::io::Result<()> {
        match self {
            ConsoleStream::Stdout => std::io::stdout().flush(),
            ConsoleStream::Stderr => std::io::stderr().flush(),
        }
    }
}

fn write_locked(mut out: impl Write, batch: &[Vec<u8>]) -> std::io::Result<()> {
    for record in batch {
        out.write_all(record)?;
    }
    out.flush()
}

/// Sink writing to the process's standard streams
///
/// Each batch is written under a single stream lock so records from other
/// writers in the process never interleave with a batch. Writes run on the
/// blocking pool; a stream nobody drains fails the write after the timeout.
pub struct ConsoleSink {
    name: String,
    stream: ConsoleStream,
    io_timeout: Duration,
    open: bool,
}

impl ConsoleSink {
    pub fn new(name: impl Into<String>, stream: ConsoleStream) -> Self {
        Self {
            name: name.into(),
            stream,
            io_timeout: DEFAULT_IO_TIMEOUT,
            open: false,
        }
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn from_spec(spec: &DestinationSpec) -> Self {
        Self::new(&spec.name, ConsoleStream::from_target(&spec.target))
    }

    pub fn stream(&self) -> ConsoleStream {
        self.stream
    }
}

impl LogSink for ConsoleSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> Result<(), ContractError> {
        self.open = true;
        debug!(sink = %self.name, stream = ?self.stream, "ConsoleSink opened");
        Ok(())
    }

    #[instrument(
        name = "console_sink_write",
        skip(self, batch),
        fields(sink = %self.name, records = batch.len())
    )]
    async fn write_batch(&mut self, batch: &[Vec<u8>]) -> Result<(), ContractError> {
        if !self.open {
            return Err(ContractError::sink_fatal(&self.name, "console sink not open"));
        }
        let stream = self.stream;
        let batch = batch.to_vec();
        off_thread(&self.name, self.io_timeout, move || stream.write_batch(&batch))
            .await?
            .map_err(|e| ContractError::from_sink_io(&self.name, &e))
    }

    async fn flush(&mut self) -> Result<(), ContractError> {
        let stream = self.stream;
        off_thread(&self.name, self.io_timeout, move || stream.flush())
            .await?
            .map_err(|e| ContractError::from_sink_io(&self.name, &e))
    }

    async fn close(&mut self) -> Result<(), ContractError> {
        self.flush().await?;
        self.open = false;
        Ok(())
    }
}
