//! Logger - cloneable producer handle with bound context

use std::error::Error;
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, Instant};

use contracts::{Category, ComponentName, FieldValue, Fields, LogRecord, Severity};

use crate::pipeline::Shared;

/// Operations taking longer are reported at warning severity
pub const DEFAULT_SLOW_OPERATION: Duration = Duration::from_millis(10);

/// Producer-side handle of a pipeline
///
/// Every record is stamped with the logger's component and merged with its
/// bound context; fields given on the call win over bound ones. Calls below
/// the severity threshold return after a single comparison.
///
/// ```ignore
/// let log = pipeline.logger("binance").bind([("exchange", "binance")]);
/// log.trade("order filled", [("symbol", "BTCUSDT".into()), ("qty", 0.5.into())]);
/// ```
#[derive(Clone)]
pub struct Logger {
    shared: Arc<Shared>,
    component: ComponentName,
    context: Arc<Fields>,
}

impl Logger {
    pub(crate) fn new(shared: Arc<Shared>, component: ComponentName) -> Self {
        Self {
            shared,
            component,
            context: Arc::new(Fields::new()),
        }
    }

    pub fn component(&self) -> &ComponentName {
        &self.component
    }

    pub fn context(&self) -> &Fields {
        &self.context
    }

    /// New logger with `fields` added to the bound context
    pub fn bind<K, V, I>(&self, fields: I) -> Logger
    where
        K: Into<String>,
        V: Into<FieldValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut context = (*self.context).clone();
        context.extend(fields.into_iter().map(|(k, v)| (k.into(), v.into())));
        Logger {
            shared: Arc::clone(&self.shared),
            component: self.component.clone(),
            context: Arc::new(context),
        }
    }

    /// Logger for a sub-component sharing the bound context
    pub fn named(&self, component: impl Into<ComponentName>) -> Logger {
        Logger {
            shared: Arc::clone(&self.shared),
            component: component.into(),
            context: Arc::clone(&self.context),
        }
    }

    #[inline]
    pub fn is_enabled(&self, severity: Severity) -> bool {
        self.shared.is_enabled(severity)
    }

    /// Submit a prepared record, stamping component and context
    pub fn submit(&self, record: LogRecord) {
        if !self.is_enabled(record.severity()) {
            return;
        }
        let record = record
            .with_component(self.component.clone())
            .with_context(&self.context);
        self.shared.submit(record);
    }

    #[track_caller]
    pub fn log<K, V, I>(&self, severity: Severity, category: Category, message: &str, fields: I)
    where
        K: Into<String>,
        V: Into<FieldValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        if !self.is_enabled(severity) {
            return;
        }
        let record = LogRecord::new(severity, category, message).with_fields(fields);
        self.submit(record);
    }

    #[track_caller]
    pub fn debug(&self, message: &str) {
        self.log(Severity::Debug, Category::General, message, no_fields());
    }

    #[track_caller]
    pub fn info(&self, message: &str) {
        self.log(Severity::Info, Category::General, message, no_fields());
    }

    #[track_caller]
    pub fn warning(&self, message: &str) {
        self.log(Severity::Warning, Category::General, message, no_fields());
    }

    #[track_caller]
    pub fn error(&self, message: &str) {
        self.log(Severity::Error, Category::Error, message, no_fields());
    }

    #[track_caller]
    pub fn critical(&self, message: &str) {
        self.log(Severity::Critical, Category::Error, message, no_fields());
    }

    /// Trade event, routed by the `trade` category
    #[track_caller]
    pub fn trade<K, V, I>(&self, message: &str, fields: I)
    where
        K: Into<String>,
        V: Into<FieldValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.log(Severity::Info, Category::Trade, message, fields);
    }

    /// Performance measurement
    #[track_caller]
    pub fn performance<K, V, I>(&self, message: &str, fields: I)
    where
        K: Into<String>,
        V: Into<FieldValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.log(Severity::Info, Category::Performance, message, fields);
    }

    /// Time `operation` until the returned guard is dropped
    ///
    /// ```ignore
    /// let _timer = log.time("place_order");
    /// exchange.place(order).await?;
    /// ```
    #[track_caller]
    pub fn time(&self, operation: impl Into<String>) -> OperationTimer {
        OperationTimer {
            logger: self.clone(),
            operation: operation.into(),
            started: Instant::now(),
            success: true,
            slow_after: DEFAULT_SLOW_OPERATION,
            call_site: Location::caller(),
        }
    }

    /// Error record carrying the causal chain of `err`
    #[track_caller]
    pub fn error_with<E: Error + 'static>(&self, err: &E, message: &str) {
        if !self.is_enabled(Severity::Error) {
            return;
        }
        let record = LogRecord::new(Severity::Error, Category::Error, message).with_error(err);
        self.submit(record);
    }
}

fn no_fields() -> [(&'static str, FieldValue); 0] {
    []
}

/// Scoped timer returned by [`Logger::time`]
///
/// Dropping it submits one `performance` record with `operation`,
/// `duration_ms` and `success` fields. Dropping while unwinding counts as a
/// failure.
#[must_use = "the operation is timed until the timer is dropped"]
pub struct OperationTimer {
    logger: Logger,
    operation: String,
    started: Instant,
    success: bool,
    slow_after: Duration,
    call_site: &'static Location<'static>,
}

impl OperationTimer {
    pub fn slow_after(mut self, threshold: Duration) -> Self {
        self.slow_after = threshold;
        self
    }

    pub fn fail(&mut self) {
        self.success = false;
    }

    /// Stop the timer now with the given outcome
    pub fn finish(mut self, success: bool) {
        self.success = success;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let slow = elapsed > self.slow_after;
        let severity = if slow { Severity::Warning } else { Severity::Info };
        if !self.logger.is_enabled(severity) {
            return;
        }

        let success = self.success && !std::thread::panicking();
        let duration_ms = elapsed.as_secs_f64() * 1_000.0;
        let message = if slow {
            format!("Slow operation: {} took {duration_ms:.2}ms", self.operation)
        } else {
            format!("{} took {duration_ms:.2}ms", self.operation)
        };
        let record = LogRecord::new(severity, Category::Performance, message)
            .with_call_site(self.call_site)
            .with_field("operation", self.operation.as_str())
            .with_field("duration_ms", duration_ms)
            .with_field("success", success);
        self.logger.submit(record);
    }
}
