//! Shared fixtures: an in-memory sink and polling helpers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use contracts::{
    Category, ContractError, LogRecord, LogSink, PipelineConfiguration, Severity,
};
use dispatcher::{Pipeline, PipelineBuilder};

/// What a [`RecordingSink`] saw
#[derive(Clone, Default)]
pub struct Recorder {
    pub written: Arc<Mutex<Vec<String>>>,
    pub attempts: Arc<AtomicUsize>,
    pub opens: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn count(&self) -> usize {
        self.written.lock().unwrap().len()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// `message` of every written structured record
    pub fn messages(&self) -> Vec<String> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|line| message_of(line))
            .collect()
    }
}

/// In-memory sink with configurable failures and latency
pub struct RecordingSink {
    name: String,
    recorder: Recorder,
    /// Every write after this many attempts fails
    fail_after: Option<usize>,
    /// Every n-th write attempt fails
    fail_every: Option<usize>,
    delay_per_record: Duration,
}

impl RecordingSink {
    pub fn new(name: &str, recorder: &Recorder) -> Self {
        Self {
            name: name.to_string(),
            recorder: recorder.clone(),
            fail_after: None,
            fail_every: None,
            delay_per_record: Duration::ZERO,
        }
    }

    pub fn failing_after(mut self, attempts: usize) -> Self {
        self.fail_after = Some(attempts);
        self
    }

    pub fn failing_every(mut self, n: usize) -> Self {
        self.fail_every = Some(n);
        self
    }

    pub fn with_delay(mut self, per_record: Duration) -> Self {
        self.delay_per_record = per_record;
        self
    }
}

impl LogSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> Result<(), ContractError> {
        self.recorder.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_batch(&mut self, batch: &[Vec<u8>]) -> Result<(), ContractError> {
        if !self.delay_per_record.is_zero() {
            tokio::time::sleep(self.delay_per_record * batch.len() as u32).await;
        }
        let attempt = self.recorder.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let exhausted = self.fail_after.is_some_and(|ok| attempt > ok);
        let unlucky = self.fail_every.is_some_and(|n| attempt % n == 0);
        if exhausted || unlucky {
            return Err(ContractError::sink_transient(&self.name, "write refused"));
        }

        let mut written = self.recorder.written.lock().unwrap();
        for record in batch {
            written.push(String::from_utf8_lossy(record).trim_end().to_string());
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ContractError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ContractError> {
        Ok(())
    }
}

/// Builder with stderr diagnostics off
pub fn quiet(config: PipelineConfiguration) -> PipelineBuilder {
    Pipeline::builder(config).with_diagnostics_echo(false)
}

/// Defaults with a short batch timeout so tests do not idle
pub fn fast_config() -> PipelineConfiguration {
    PipelineConfiguration {
        batch_timeout_ms: 5,
        ..PipelineConfiguration::default()
    }
}

pub fn info(category: Category, message: impl Into<String>) -> LogRecord {
    LogRecord::new(Severity::Info, category, message)
}

pub fn message_of(line: &str) -> String {
    let json: serde_json::Value = serde_json::from_str(line).unwrap();
    json["message"].as_str().unwrap().to_string()
}

/// Poll `condition` every few milliseconds for up to two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
