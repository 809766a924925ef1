//! LogRecord - the unit flowing through the pipeline
//!
//! A record is assembled with consuming builders and never mutated after it
//! is submitted.

use chrono::{DateTime, Utc};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error;
use std::panic::Location;

use crate::{Category, ComponentName, FieldValue, Fields, Severity};

/// Originating component and call site
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation {
    pub component: ComponentName,
    pub module: Option<String>,
    pub file: &'static str,
    pub line: u32,
}

impl SourceLocation {
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self {
            component: ComponentName::default(),
            module: None,
            file: location.file(),
            line: location.line(),
        }
    }
}

/// Thread and process identifiers captured at construction
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadInfo {
    pub id: String,
    pub name: Option<String>,
    pub process_id: u32,
}

impl ThreadInfo {
    pub fn current() -> Self {
        let thread = std::thread::current();
        // ThreadId only exposes Debug ("ThreadId(7)")
        let raw = format!("{:?}", thread.id());
        let id = raw
            .strip_prefix("ThreadId(")
            .and_then(|s| s.strip_suffix(')'))
            .map(str::to_string)
            .unwrap_or(raw);
        Self {
            id,
            name: thread.name().map(str::to_string),
            process_id: std::process::id(),
        }
    }
}

/// Error details attached to a record
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CausalInfo {
    /// Error type name
    pub kind: String,
    pub message: String,
    /// Messages of the `source()` chain, outermost first
    pub chain: Vec<String>,
    pub backtrace: Option<String>,
}

impl CausalInfo {
    pub fn from_error<E: Error + 'static>(err: &E) -> Self {
        let mut chain = Vec::new();
        let mut current = err.source();
        while let Some(cause) = current {
            chain.push(cause.to_string());
            current = cause.source();
        }

        let backtrace = Backtrace::capture();
        let backtrace = match backtrace.status() {
            BacktraceStatus::Captured => Some(backtrace.to_string()),
            _ => None,
        };

        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
            chain,
            backtrace,
        }
    }
}

/// Structured log record
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    timestamp: DateTime<Utc>,
    severity: Severity,
    category: Category,
    message: String,
    fields: Fields,
    source: SourceLocation,
    thread: ThreadInfo,
    cause: Option<CausalInfo>,
}

impl LogRecord {
    /// Create a record stamped with the current time and the caller's location
    #[track_caller]
    pub fn new(severity: Severity, category: Category, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            category,
            message: message.into(),
            fields: Fields::new(),
            source: SourceLocation::caller(),
            thread: ThreadInfo::current(),
            cause: None,
        }
    }

    pub fn with_component(mut self, component: impl Into<ComponentName>) -> Self {
        self.source.component = component.into();
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.source.module = Some(module.into());
        self
    }

    /// Attribute the record to `location` instead of where it was built
    pub fn with_call_site(mut self, location: &'static Location<'static>) -> Self {
        self.source.file = location.file();
        self.source.line = location.line();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_fields<K, V, I>(mut self, fields: I) -> Self
    where
        K: Into<String>,
        V: Into<FieldValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.fields
            .extend(fields.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Merge bound context; keys already present on the record win
    pub fn with_context(mut self, context: &Fields) -> Self {
        for (key, value) in context {
            self.fields
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    /// Attach causal info extracted from an error
    pub fn with_error<E: Error + 'static>(mut self, err: &E) -> Self {
        self.cause = Some(CausalInfo::from_error(err));
        self
    }

    pub fn with_cause(mut self, cause: CausalInfo) -> Self {
        self.cause = Some(cause);
        self
    }

    // ===== accessors =====

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[inline]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    #[inline]
    pub fn category(&self) -> Category {
        self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn source(&self) -> &SourceLocation {
        &self.source
    }

    pub fn thread(&self) -> &ThreadInfo {
        &self.thread
    }

    pub fn cause(&self) -> Option<&CausalInfo> {
        self.cause.as_ref()
    }
}
