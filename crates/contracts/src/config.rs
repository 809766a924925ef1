//! PipelineConfiguration - Config Loader output
//!
//! Describes the whole pipeline: thresholds, queueing, batching,
//! destinations, formatters and the destination health policy.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use validator::Validate;

use crate::{Category, LogRecord, Severity};

/// Name of the built-in structured formatter
pub const STRUCTURED_FORMATTER: &str = "structured";
/// Name of the built-in human formatter
pub const HUMAN_FORMATTER: &str = "human";

/// Default list of field keys whose values are masked
pub const DEFAULT_REDACT_KEYS: [&str; 9] = [
    "password",
    "token",
    "api_key",
    "secret",
    "private_key",
    "apikey",
    "api_secret",
    "access_token",
    "refresh_token",
];

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PipelineConfiguration {
    /// Records below this severity are discarded at submit
    #[serde(default)]
    pub min_severity: Severity,

    /// Selects the default formatter of destinations naming none
    #[serde(default = "default_true")]
    pub structured_mode: bool,

    /// Dispatch through the queue; `false` dispatches on the caller's thread
    #[serde(default = "default_true")]
    pub async_mode: bool,

    #[validate(range(min = 1))]
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Wait bound of `block_with_timeout`
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    #[validate(nested)]
    #[serde(default)]
    pub destinations: Vec<DestinationSpec>,

    /// User formatters; `structured` and `human` always resolve
    #[serde(default)]
    pub formatters: BTreeMap<String, FormatterSpec>,

    /// Maximum records per dequeued batch
    #[validate(range(min = 1))]
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum wait for a batch when the queue is empty
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Records per second ceiling
    #[validate(range(min = 1))]
    #[serde(default)]
    pub rate_limit: Option<u32>,

    #[validate(range(min = 1, max = 64))]
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Upper bound of a synchronous submit
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    #[validate(nested)]
    #[serde(default)]
    pub health: HealthPolicy,
}

impl Default for PipelineConfiguration {
    fn default() -> Self {
        Self {
            min_severity: Severity::default(),
            structured_mode: true,
            async_mode: true,
            queue_capacity: default_queue_capacity(),
            overflow_policy: OverflowPolicy::default(),
            block_timeout_ms: default_block_timeout_ms(),
            destinations: Vec::new(),
            formatters: BTreeMap::new(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            rate_limit: None,
            worker_count: default_worker_count(),
            sync_timeout_ms: default_sync_timeout_ms(),
            health: HealthPolicy::default(),
        }
    }
}

impl PipelineConfiguration {
    pub fn with_destination(mut self, destination: DestinationSpec) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Name of the formatter used by a destination
    pub fn formatter_name<'a>(&self, destination: &'a DestinationSpec) -> &'a str {
        match destination.formatter.as_deref() {
            Some(name) => name,
            None if self.structured_mode => STRUCTURED_FORMATTER,
            None => HUMAN_FORMATTER,
        }
    }

    /// Resolve a formatter by name, user definitions shadowing built-ins
    pub fn resolve_formatter(&self, name: &str) -> Option<FormatterSpec> {
        if let Some(spec) = self.formatters.get(name) {
            return Some(spec.clone());
        }
        match name {
            STRUCTURED_FORMATTER => Some(FormatterSpec::structured()),
            HUMAN_FORMATTER => Some(FormatterSpec::human()),
            _ => None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_block_timeout_ms() -> u64 {
    50
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    1_000
}

fn default_worker_count() -> usize {
    1
}

fn default_sync_timeout_ms() -> u64 {
    1_000
}

/// Behavior of a full dispatch queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued record
    DropOldest,
    /// Discard the incoming record
    #[default]
    DropNewest,
    /// Wait up to `block_timeout_ms`, then discard the incoming record
    BlockWithTimeout,
}

impl OverflowPolicy {
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            OverflowPolicy::DropOldest => 0,
            OverflowPolicy::DropNewest => 1,
            OverflowPolicy::BlockWithTimeout => 2,
        }
    }

    #[inline]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => OverflowPolicy::DropOldest,
            2 => OverflowPolicy::BlockWithTimeout,
            _ => OverflowPolicy::DropNewest,
        }
    }
}

/// Destination health policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct HealthPolicy {
    /// Consecutive failures before a destination is marked failed
    #[validate(range(min = 1))]
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Reacquisition attempts before a destination goes inactive
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_recovery_attempts: default_max_recovery_attempts(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_max_recovery_attempts() -> u32 {
    10
}

/// Destination type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    File,
    Console,
    Network,
}

impl DestinationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DestinationKind::File => "file",
            DestinationKind::Console => "console",
            DestinationKind::Network => "network",
        }
    }
}

/// One output route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DestinationSpec {
    /// Unique destination name
    #[validate(length(min = 1))]
    pub name: String,

    pub kind: DestinationKind,

    /// File path, `stdout`/`stderr`, or `host:port`
    pub target: String,

    #[serde(default = "default_destination_severity")]
    pub min_severity: Severity,

    /// Accepted categories; empty accepts all
    #[serde(default)]
    pub category_filter: BTreeSet<Category>,

    /// Formatter name; the pipeline default applies when absent
    #[serde(default)]
    pub formatter: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Capacity of the destination's own batch queue
    #[validate(range(min = 1))]
    #[serde(default = "default_destination_queue")]
    pub queue_capacity: usize,

    #[validate(nested)]
    #[serde(default)]
    pub rotation: Option<RotationSpec>,

    #[validate(nested)]
    #[serde(default)]
    pub network: Option<NetworkSpec>,
}

fn default_destination_severity() -> Severity {
    Severity::Debug
}

fn default_destination_queue() -> usize {
    64
}

impl DestinationSpec {
    pub fn new(name: impl Into<String>, kind: DestinationKind, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            min_severity: default_destination_severity(),
            category_filter: BTreeSet::new(),
            formatter: None,
            enabled: true,
            queue_capacity: default_destination_queue(),
            rotation: None,
            network: None,
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(name, DestinationKind::File, path)
    }

    pub fn console(name: impl Into<String>, stream: impl Into<String>) -> Self {
        Self::new(name, DestinationKind::Console, stream)
    }

    pub fn network(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self::new(name, DestinationKind::Network, address)
    }

    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }

    pub fn with_categories(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.category_filter = categories.into_iter().collect();
        self
    }

    pub fn with_formatter(mut self, formatter: impl Into<String>) -> Self {
        self.formatter = Some(formatter.into());
        self
    }

    pub fn with_rotation(mut self, rotation: RotationSpec) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_network(mut self, network: NetworkSpec) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Routing predicate
    #[inline]
    pub fn accepts_parts(&self, severity: Severity, category: Category) -> bool {
        severity >= self.min_severity
            && (self.category_filter.is_empty() || self.category_filter.contains(&category))
    }

    #[inline]
    pub fn accepts(&self, record: &LogRecord) -> bool {
        self.accepts_parts(record.severity(), record.category())
    }
}

/// Size-based rotation of a file destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RotationSpec {
    #[validate(range(min = 1))]
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,

    /// Backups kept besides the active file
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,

    /// Gzip rotated backups
    #[serde(default)]
    pub compress_backups: bool,
}

impl Default for RotationSpec {
    fn default() -> Self {
        Self {
            max_size_bytes: default_max_size_bytes(),
            backup_count: default_backup_count(),
            compress_backups: false,
        }
    }
}

fn default_max_size_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_backup_count() -> usize {
    5
}

/// Transport protection of a network destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportSecurity {
    #[default]
    Plain,
    Tls,
}

/// Network destination settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct NetworkSpec {
    #[serde(default)]
    pub transport_security: TransportSecurity,

    /// Records per frame
    #[validate(range(min = 1))]
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    #[serde(default = "default_io_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_io_timeout_ms")]
    pub write_timeout_ms: u64,

    /// TLS server name; the target host when absent
    #[serde(default)]
    pub server_name: Option<String>,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            transport_security: TransportSecurity::default(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            connect_timeout_ms: default_io_timeout_ms(),
            write_timeout_ms: default_io_timeout_ms(),
            server_name: None,
        }
    }
}

fn default_io_timeout_ms() -> u64 {
    5_000
}

/// Output encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Structured,
    Human,
}

/// Record attribute selectable by a formatter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    Timestamp,
    Severity,
    Category,
    Source,
    Message,
    Fields,
    Cause,
    Thread,
    Process,
}

impl RecordField {
    pub const ALL: [RecordField; 9] = [
        RecordField::Timestamp,
        RecordField::Severity,
        RecordField::Category,
        RecordField::Source,
        RecordField::Message,
        RecordField::Fields,
        RecordField::Cause,
        RecordField::Thread,
        RecordField::Process,
    ];
}

/// Timestamp rendering
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// RFC 3339 with millisecond precision, UTC
    #[default]
    Rfc3339,
    /// Milliseconds since the Unix epoch
    EpochMillis,
    /// strftime pattern
    Pattern(String),
}

/// Formatter definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatterSpec {
    #[serde(default)]
    pub encoding: Encoding,

    /// Emitted attributes, in order
    #[serde(default = "default_record_fields")]
    pub fields: Vec<RecordField>,

    #[serde(default)]
    pub timestamp_format: TimestampFormat,

    /// ANSI colors, human encoding only
    #[serde(default)]
    pub colors: bool,

    /// Field keys (case-insensitive substrings) whose values are masked
    #[serde(default = "default_redact_keys")]
    pub redact_keys: Vec<String>,
}

fn default_record_fields() -> Vec<RecordField> {
    RecordField::ALL.to_vec()
}

fn default_redact_keys() -> Vec<String> {
    DEFAULT_REDACT_KEYS.iter().map(|k| k.to_string()).collect()
}

impl FormatterSpec {
    /// Built-in machine-parseable formatter
    pub fn structured() -> Self {
        Self {
            encoding: Encoding::Structured,
            fields: default_record_fields(),
            timestamp_format: TimestampFormat::Rfc3339,
            colors: false,
            redact_keys: default_redact_keys(),
        }
    }

    /// Built-in single-line formatter
    pub fn human() -> Self {
        Self {
            encoding: Encoding::Human,
            fields: vec![
                RecordField::Timestamp,
                RecordField::Severity,
                RecordField::Category,
                RecordField::Source,
                RecordField::Message,
                RecordField::Fields,
                RecordField::Cause,
            ],
            timestamp_format: TimestampFormat::Rfc3339,
            colors: false,
            redact_keys: default_redact_keys(),
        }
    }
}
