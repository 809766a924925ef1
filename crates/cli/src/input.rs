//! Stdin line parsing
//!
//! A JSON line is an object with optional `severity` (or `level`),
//! `category`, `message` (or `msg`), `component`, `timestamp` and `fields`
//! keys. Any other top-level key becomes a field as well.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use contracts::{Category, FieldValue, LogRecord, Severity};

use crate::cli::InputFormat;

/// Parse one input line; `None` for blank lines
pub fn parse_line(line: &str, format: InputFormat, component: &str) -> Result<Option<LogRecord>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }

    let record = match format {
        InputFormat::Text => text_record(line, component),
        InputFormat::Json => json_record(line, component)?,
        InputFormat::Auto if line.trim_start().starts_with('{') => {
            json_record(line, component).unwrap_or_else(|_| text_record(line, component))
        }
        InputFormat::Auto => text_record(line, component),
    };
    Ok(Some(record))
}

fn text_record(line: &str, component: &str) -> LogRecord {
    LogRecord::new(Severity::Info, Category::General, line).with_component(component)
}

fn json_record(line: &str, component: &str) -> Result<LogRecord> {
    let value: Value = serde_json::from_str(line).context("invalid JSON record")?;
    let Value::Object(mut object) = value else {
        bail!("JSON record must be an object");
    };

    let severity = match take_str(&mut object, &["severity", "level"]) {
        Some(s) => s.parse::<Severity>()?,
        None => Severity::Info,
    };
    let category = match take_str(&mut object, &["category"]) {
        Some(s) => s.parse::<Category>()?,
        None => Category::General,
    };
    let message = take_str(&mut object, &["message", "msg"]).unwrap_or_default();

    let component = take_str(&mut object, &["component"]).unwrap_or_else(|| component.to_string());

    let mut record = LogRecord::new(severity, category, message).with_component(component);
    if let Some(ts) = take_str(&mut object, &["timestamp"]) {
        let parsed = DateTime::parse_from_rfc3339(&ts)
            .with_context(|| format!("invalid timestamp '{ts}'"))?;
        record = record.with_timestamp(parsed.with_timezone(&Utc));
    }

    let nested = match object.remove("fields") {
        Some(Value::Object(fields)) => fields,
        Some(Value::Null) | None => Map::new(),
        Some(_) => bail!("'fields' must be an object"),
    };
    let fields = object
        .into_iter()
        .chain(nested)
        .map(|(key, value)| (key, to_field_value(value)));
    Ok(record.with_fields(fields))
}

fn take_str(object: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match object.remove(*key)? {
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

fn to_field_value(value: Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(b),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                FieldValue::U64(u)
            } else if let Some(i) = n.as_i64() {
                FieldValue::I64(i)
            } else {
                FieldValue::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => FieldValue::Str(s),
        Value::Array(items) => FieldValue::List(items.into_iter().map(to_field_value).collect()),
        Value::Object(map) => FieldValue::Map(
            map.into_iter()
                .map(|(k, v)| (k, to_field_value(v)))
                .collect(),
        ),
    }
}
