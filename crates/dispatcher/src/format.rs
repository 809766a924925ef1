//! RecordFormatter - `LogRecord -> bytes`
//!
//! Pure and stateless apart from its immutable spec, so one instance is
//! shared by every destination referencing the same formatter. Output is one
//! newline-terminated line per record in both encodings.

use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use contracts::{
    Encoding, FieldValue, Fields, FormatterSpec, LogRecord, RecordField, Severity,
    TimestampFormat,
};

/// Version tag of the structured field set
pub const STRUCTURED_VERSION: u32 = 1;

const MASK: &str = "***";

/// Encodes records per a [`FormatterSpec`]
#[derive(Debug, Clone)]
pub struct RecordFormatter {
    spec: FormatterSpec,
    /// Lower-cased redaction keys
    redact: Vec<String>,
}

impl RecordFormatter {
    pub fn new(spec: FormatterSpec) -> Self {
        let redact = spec
            .redact_keys
            .iter()
            .map(|k| k.to_ascii_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { spec, redact }
    }

    pub fn spec(&self) -> &FormatterSpec {
        &self.spec
    }

    /// Encode one record; never fails
    pub fn format(&self, record: &LogRecord) -> Vec<u8> {
        match self.spec.encoding {
            Encoding::Structured => self.format_structured(record),
            Encoding::Human => self.format_human(record).into_bytes(),
        }
    }

    fn format_structured(&self, record: &LogRecord) -> Vec<u8> {
        match self.try_structured(record) {
            Ok(mut out) => {
                out.push(b'\n');
                out
            }
            Err(err) => {
                // keep the record, drop only what could not be encoded
                let fallback = serde_json::json!({
                    "v": STRUCTURED_VERSION,
                    "ts": record.timestamp().to_rfc3339_opts(SecondsFormat::Millis, true),
                    "severity": record.severity().as_str(),
                    "category": record.category().as_str(),
                    "message": record.message(),
                    "format_error": err.to_string(),
                });
                let mut out = fallback.to_string().into_bytes();
                out.push(b'\n');
                out
            }
        }
    }

    fn try_structured(&self, record: &LogRecord) -> serde_json::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(256);
        let mut ser = serde_json::Serializer::new(&mut out);
        let mut map = ser.serialize_map(None)?;
        map.serialize_entry("v", &STRUCTURED_VERSION)?;

        for field in &self.spec.fields {
            match field {
                RecordField::Timestamp => match &self.spec.timestamp_format {
                    TimestampFormat::EpochMillis => {
                        map.serialize_entry("ts", &record.timestamp().timestamp_millis())?
                    }
                    _ => map.serialize_entry("ts", &self.timestamp(record.timestamp()))?,
                },
                RecordField::Severity => {
                    map.serialize_entry("severity", record.severity().as_str())?
                }
                RecordField::Category => {
                    map.serialize_entry("category", record.category().as_str())?
                }
                RecordField::Source => {
                    let source = record.source();
                    map.serialize_entry(
                        "source",
                        &SourceOut {
                            component: source.component.as_str(),
                            module: source.module.as_deref(),
                            file: source.file,
                            line: source.line,
                        },
                    )?
                }
                RecordField::Message => map.serialize_entry("message", record.message())?,
                RecordField::Fields => map.serialize_entry(
                    "fields",
                    &MaskedFields {
                        fields: record.fields(),
                        redact: &self.redact,
                    },
                )?,
                RecordField::Cause => {
                    if let Some(cause) = record.cause() {
                        map.serialize_entry(
                            "cause",
                            &CauseOut {
                                kind: &cause.kind,
                                message: &cause.message,
                                chain: &cause.chain,
                                backtrace: cause.backtrace.as_deref(),
                            },
                        )?
                    }
                }
                RecordField::Thread => {
                    let thread = record.thread();
                    map.serialize_entry(
                        "thread",
                        &ThreadOut {
                            id: &thread.id,
                            name: thread.name.as_deref(),
                        },
                    )?
                }
                RecordField::Process => {
                    map.serialize_entry("process", &record.thread().process_id)?
                }
            }
        }

        map.end()?;
        Ok(out)
    }

    fn format_human(&self, record: &LogRecord) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.spec.fields.len());

        for field in &self.spec.fields {
            match field {
                RecordField::Timestamp => parts.push(self.timestamp(record.timestamp())),
                RecordField::Severity => parts.push(self.severity(record.severity())),
                RecordField::Category => parts.push(format!("[{}]", record.category())),
                RecordField::Source => parts.push(format!("{}:", record.source().component)),
                RecordField::Message => parts.push(single_line(record.message())),
                RecordField::Fields => {
                    if !record.fields().is_empty() {
                        let rendered: Vec<String> = record
                            .fields()
                            .iter()
                            .map(|(key, value)| {
                                format!("{key}={}", self.masked(key, value).as_ref())
                            })
                            .collect();
                        parts.push(single_line(&rendered.join(" ")));
                    }
                }
                RecordField::Cause => {
                    if let Some(cause) = record.cause() {
                        let mut text = format!("| {}: {}", cause.kind, cause.message);
                        for inner in &cause.chain {
                            let _ = write!(text, " <- {inner}");
                        }
                        parts.push(single_line(&text));
                    }
                }
                RecordField::Thread => {
                    let thread = record.thread();
                    parts.push(format!(
                        "thread={}",
                        thread.name.as_deref().unwrap_or(&thread.id)
                    ));
                }
                RecordField::Process => parts.push(format!("pid={}", record.thread().process_id)),
            }
        }

        let mut line = parts.join(" ");
        line.push('\n');
        line
    }

    fn timestamp(&self, ts: DateTime<Utc>) -> String {
        match &self.spec.timestamp_format {
            TimestampFormat::Rfc3339 => ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            TimestampFormat::EpochMillis => ts.timestamp_millis().to_string(),
            TimestampFormat::Pattern(pattern) => {
                let mut out = String::new();
                // chrono reports bad patterns through fmt::Error
                match write!(out, "{}", ts.format(pattern)) {
                    Ok(()) => out,
                    Err(_) => ts.to_rfc3339_opts(SecondsFormat::Millis, true),
                }
            }
        }
    }

    fn severity(&self, severity: Severity) -> String {
        if !self.spec.colors {
            return format!("{:<8}", severity.as_str());
        }
        let color = match severity {
            Severity::Debug => "\x1b[36m",
            Severity::Info => "\x1b[32m",
            Severity::Warning => "\x1b[33m",
            Severity::Error => "\x1b[31m",
            Severity::Critical => "\x1b[1;31m",
        };
        format!("{color}{:<8}\x1b[0m", severity.as_str())
    }

    fn masked<'a>(&self, key: &str, value: &'a FieldValue) -> std::borrow::Cow<'a, FieldValue> {
        if is_sensitive(key, &self.redact) {
            std::borrow::Cow::Owned(mask_value(value))
        } else {
            std::borrow::Cow::Borrowed(value)
        }
    }
}

/// Case-insensitive substring match against lower-cased redaction keys
pub fn is_sensitive(key: &str, redact: &[String]) -> bool {
    if redact.is_empty() {
        return false;
    }
    let key = key.to_ascii_lowercase();
    redact.iter().any(|r| key.contains(r.as_str()))
}

/// `***` plus the last four characters of strings longer than four, `***` otherwise
pub fn mask_value(value: &FieldValue) -> FieldValue {
    match value {
        FieldValue::Str(s) => {
            let count = s.chars().count();
            if count > 4 {
                let tail: String = s.chars().skip(count - 4).collect();
                FieldValue::Str(format!("{MASK}{tail}"))
            } else {
                FieldValue::Str(MASK.to_string())
            }
        }
        _ => FieldValue::Str(MASK.to_string()),
    }
}

/// Human output must stay on one line
fn single_line(text: &str) -> String {
    if text.contains(['\n', '\r']) {
        text.replace('\r', "\\r").replace('\n', "\\n")
    } else {
        text.to_string()
    }
}

#[derive(Serialize)]
struct SourceOut<'a> {
    component: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    module: Option<&'a str>,
    file: &'a str,
    line: u32,
}

#[derive(Serialize)]
struct CauseOut<'a> {
    kind: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    chain: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    backtrace: Option<&'a str>,
}

#[derive(Serialize)]
struct ThreadOut<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

/// Serializes a field map, masking sensitive values on the fly
struct MaskedFields<'a> {
    fields: &'a Fields,
    redact: &'a [String],
}

impl Serialize for MaskedFields<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in self.fields {
            if is_sensitive(key, self.redact) {
                map.serialize_entry(key, &mask_value(value))?;
            } else {
                map.serialize_entry(key, value)?;
            }
        }
        map.end()
    }
}
