//! Environment overrides
//!
//! Applied after parsing and before validation:
//! - `LOGPIPE_MIN_SEVERITY`: pipeline severity threshold
//! - `LOGPIPE_QUEUE_CAPACITY`: dispatch queue capacity
//! - `LOGPIPE_ASYNC`: async dispatch on/off
//! - `LOGPIPE_STRUCTURED`: default formatter selection
//! - `LOGPIPE_LOG_DIRECTORY`: base directory of relative file targets

use std::path::Path;

use contracts::{ContractError, DestinationKind, PipelineConfiguration, Severity};

pub const ENV_MIN_SEVERITY: &str = "LOGPIPE_MIN_SEVERITY";
pub const ENV_QUEUE_CAPACITY: &str = "LOGPIPE_QUEUE_CAPACITY";
pub const ENV_ASYNC: &str = "LOGPIPE_ASYNC";
pub const ENV_STRUCTURED: &str = "LOGPIPE_STRUCTURED";
pub const ENV_LOG_DIRECTORY: &str = "LOGPIPE_LOG_DIRECTORY";

/// Apply overrides read through `lookup`
pub fn apply_overrides<F>(
    mut config: PipelineConfiguration,
    lookup: F,
) -> Result<PipelineConfiguration, ContractError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(ENV_MIN_SEVERITY) {
        config.min_severity = value
            .parse::<Severity>()
            .map_err(|_| ContractError::config_invalid(ENV_MIN_SEVERITY, format!("unknown severity '{value}'")))?;
        tracing::debug!(severity = %config.min_severity, "min_severity overridden from environment");
    }

    if let Some(value) = lookup(ENV_QUEUE_CAPACITY) {
        config.queue_capacity = value.trim().parse::<usize>().map_err(|e| {
            ContractError::config_invalid(ENV_QUEUE_CAPACITY, format!("'{value}': {e}"))
        })?;
    }

    if let Some(value) = lookup(ENV_ASYNC) {
        config.async_mode = parse_bool(ENV_ASYNC, &value)?;
    }

    if let Some(value) = lookup(ENV_STRUCTURED) {
        config.structured_mode = parse_bool(ENV_STRUCTURED, &value)?;
    }

    if let Some(dir) = lookup(ENV_LOG_DIRECTORY) {
        let dir = Path::new(&dir);
        for dest in config
            .destinations
            .iter_mut()
            .filter(|d| d.kind == DestinationKind::File)
        {
            if Path::new(&dest.target).is_relative() {
                dest.target = dir.join(&dest.target).to_string_lossy().into_owned();
            }
        }
    }

    Ok(config)
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ContractError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ContractError::config_invalid(
            var,
            format!("expected a boolean, got '{other}'"),
        )),
    }
}
