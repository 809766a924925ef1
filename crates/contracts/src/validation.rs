//! Configuration validation
//!
//! Rules:
//! - per-field ranges (derived `Validate`)
//! - block_with_timeout needs a positive timeout
//! - backoff_initial_ms <= backoff_max_ms
//! - destination names non-empty and unique
//! - targets well-formed per destination kind
//! - rotation only on file, network settings only on network
//! - every referenced formatter exists, formatter field lists non-empty

use std::collections::HashSet;
use std::net::SocketAddr;

use validator::Validate;

use crate::{ContractError, DestinationKind, OverflowPolicy, PipelineConfiguration};

/// Validate a PipelineConfiguration
///
/// Returns the first error encountered, or Ok(()).
pub fn validate_configuration(config: &PipelineConfiguration) -> Result<(), ContractError> {
    validate_ranges(config)?;
    validate_pipeline(config)?;
    validate_destinations(config)?;
    validate_formatters(config)?;
    Ok(())
}

/// Derived range checks
fn validate_ranges(config: &PipelineConfiguration) -> Result<(), ContractError> {
    config.validate().map_err(|errors| {
        let field = errors
            .errors()
            .keys()
            .min()
            .map(|key| key.to_string())
            .unwrap_or_else(|| "configuration".to_string());
        ContractError::config_invalid(field, errors.to_string())
    })
}

fn validate_pipeline(config: &PipelineConfiguration) -> Result<(), ContractError> {
    if config.overflow_policy == OverflowPolicy::BlockWithTimeout && config.block_timeout_ms == 0 {
        return Err(ContractError::config_invalid(
            "block_timeout_ms",
            "block_with_timeout requires block_timeout_ms >= 1",
        ));
    }

    let health = &config.health;
    if health.backoff_initial_ms > health.backoff_max_ms {
        return Err(ContractError::config_invalid(
            "health.backoff_initial_ms / health.backoff_max_ms",
            format!(
                "backoff_initial_ms ({}) must be <= backoff_max_ms ({})",
                health.backoff_initial_ms, health.backoff_max_ms
            ),
        ));
    }

    Ok(())
}

fn validate_destinations(config: &PipelineConfiguration) -> Result<(), ContractError> {
    let mut seen = HashSet::new();

    for (idx, dest) in config.destinations.iter().enumerate() {
        if dest.name.trim().is_empty() {
            return Err(ContractError::config_invalid(
                format!("destinations[{idx}].name"),
                "destination name cannot be empty",
            ));
        }
        if !seen.insert(dest.name.as_str()) {
            return Err(ContractError::config_invalid(
                format!("destinations[{idx}].name"),
                format!("duplicate destination name '{}'", dest.name),
            ));
        }

        let path = |field: &str| format!("destinations[{}].{field}", dest.name);

        match dest.kind {
            DestinationKind::File => {
                if dest.target.trim().is_empty() {
                    return Err(ContractError::config_invalid(
                        path("target"),
                        "file target cannot be empty",
                    ));
                }
            }
            DestinationKind::Console => {
                if !matches!(dest.target.as_str(), "stdout" | "stderr") {
                    return Err(ContractError::config_invalid(
                        path("target"),
                        format!("console target must be stdout or stderr, got '{}'", dest.target),
                    ));
                }
            }
            DestinationKind::Network => {
                if !is_host_port(&dest.target) {
                    return Err(ContractError::config_invalid(
                        path("target"),
                        format!("network target must be host:port, got '{}'", dest.target),
                    ));
                }
            }
        }

        if dest.rotation.is_some() && dest.kind != DestinationKind::File {
            return Err(ContractError::config_invalid(
                path("rotation"),
                format!("rotation is only valid for file destinations, not {}", dest.kind.as_str()),
            ));
        }
        if dest.network.is_some() && dest.kind != DestinationKind::Network {
            return Err(ContractError::config_invalid(
                path("network"),
                format!("network settings are only valid for network destinations, not {}", dest.kind.as_str()),
            ));
        }

        let formatter = config.formatter_name(dest);
        if config.resolve_formatter(formatter).is_none() {
            return Err(ContractError::config_invalid(
                path("formatter"),
                format!("unknown formatter '{formatter}'"),
            ));
        }
    }

    Ok(())
}

fn validate_formatters(config: &PipelineConfiguration) -> Result<(), ContractError> {
    for (name, spec) in &config.formatters {
        if spec.fields.is_empty() {
            return Err(ContractError::config_invalid(
                format!("formatters.{name}.fields"),
                "formatter must emit at least one field",
            ));
        }
    }
    Ok(())
}

/// `host:port` with a non-empty host and a numeric port
fn is_host_port(target: &str) -> bool {
    if target.parse::<SocketAddr>().is_ok() {
        return true;
    }
    match target.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty() && !host.contains(char::is_whitespace) && port.parse::<u16>().is_ok()
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DestinationSpec, FormatterSpec, NetworkSpec, RotationSpec};

    fn base() -> PipelineConfiguration {
        PipelineConfiguration::default()
            .with_destination(DestinationSpec::console("console", "stdout"))
            .with_destination(DestinationSpec::file("main", "logs/app.log"))
    }

    fn invalid_field(config: &PipelineConfiguration) -> String {
        match validate_configuration(config) {
            Err(ContractError::ConfigInvalid { field, .. }) => field,
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate_configuration(&base()).is_ok());
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let mut config = base();
        config.queue_capacity = 0;
        assert_eq!(invalid_field(&config), "queue_capacity");
    }

    #[test]
    fn test_worker_count_range() {
        let mut config = base();
        config.worker_count = 65;
        assert_eq!(invalid_field(&config), "worker_count");
    }

    #[test]
    fn test_block_timeout_required() {
        let mut config = base();
        config.overflow_policy = OverflowPolicy::BlockWithTimeout;
        config.block_timeout_ms = 0;
        assert_eq!(invalid_field(&config), "block_timeout_ms");
    }

    #[test]
    fn test_duplicate_destination_name() {
        let config = base().with_destination(DestinationSpec::console("main", "stderr"));
        assert_eq!(invalid_field(&config), "destinations[2].name");
    }

    #[test]
    fn test_console_target_checked() {
        let config = PipelineConfiguration::default()
            .with_destination(DestinationSpec::console("tty", "/dev/tty"));
        assert_eq!(invalid_field(&config), "destinations[tty].target");
    }

    #[test]
    fn test_network_target_checked() {
        let ok = PipelineConfiguration::default()
            .with_destination(DestinationSpec::network("ship", "logs.example.com:6514"));
        assert!(validate_configuration(&ok).is_ok());

        let bad = PipelineConfiguration::default()
            .with_destination(DestinationSpec::network("ship", "logs.example.com"));
        assert_eq!(invalid_field(&bad), "destinations[ship].target");
    }

    #[test]
    fn test_settings_must_match_kind() {
        let config = PipelineConfiguration::default().with_destination(
            DestinationSpec::console("out", "stdout").with_rotation(RotationSpec::default()),
        );
        assert_eq!(invalid_field(&config), "destinations[out].rotation");

        let config = PipelineConfiguration::default().with_destination(
            DestinationSpec::file("main", "app.log").with_network(NetworkSpec::default()),
        );
        assert_eq!(invalid_field(&config), "destinations[main].network");
    }

    #[test]
    fn test_unknown_formatter_rejected() {
        let config = PipelineConfiguration::default()
            .with_destination(DestinationSpec::console("out", "stdout").with_formatter("fancy"));
        assert_eq!(invalid_field(&config), "destinations[out].formatter");
    }

    #[test]
    fn test_empty_formatter_fields_rejected() {
        let mut config = base();
        let mut spec = FormatterSpec::human();
        spec.fields.clear();
        config.formatters.insert("bare".into(), spec);
        assert_eq!(invalid_field(&config), "formatters.bare.fields");
    }

    #[test]
    fn test_backoff_bounds() {
        let mut config = base();
        config.health.backoff_initial_ms = 60_000;
        assert!(invalid_field(&config).starts_with("health.backoff_initial_ms"));
    }
}
