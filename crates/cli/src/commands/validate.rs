//! `validate` command implementation.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use contracts::{DestinationKind, PipelineConfiguration, TransportSecurity};

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    min_severity: String,
    queue_capacity: usize,
    overflow_policy: String,
    worker_count: usize,
    destination_count: usize,
    formatter_count: usize,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: None,
            summary: None,
        };
    }

    match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(config) => {
            let warnings = collect_warnings(&config);
            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: if warnings.is_empty() {
                    None
                } else {
                    Some(warnings)
                },
                summary: Some(ConfigSummary {
                    min_severity: config.min_severity.to_string(),
                    queue_capacity: config.queue_capacity,
                    overflow_policy: format!("{:?}", config.overflow_policy),
                    worker_count: config.worker_count,
                    destination_count: config.destinations.len(),
                    formatter_count: config.formatters.len(),
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(config: &PipelineConfiguration) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.destinations.is_empty() {
        warnings.push("No destinations configured - every record will be discarded".to_string());
    } else if config.destinations.iter().all(|d| !d.enabled) {
        warnings.push("All destinations are disabled".to_string());
    }

    for dest in &config.destinations {
        if dest.kind == DestinationKind::File && dest.rotation.is_none() {
            warnings.push(format!(
                "File destination '{}' has no rotation - it grows without bound",
                dest.name
            ));
        }
        let plain_network = dest.kind == DestinationKind::Network
            && dest
                .network
                .as_ref()
                .map_or(true, |n| n.transport_security == TransportSecurity::Plain);
        if plain_network {
            warnings.push(format!(
                "Network destination '{}' sends records unencrypted",
                dest.name
            ));
        }
        if dest.min_severity < config.min_severity {
            warnings.push(format!(
                "Destination '{}' threshold {} is below the pipeline threshold {}",
                dest.name, dest.min_severity, config.min_severity
            ));
        }
    }

    if !config.async_mode {
        warnings.push("async_mode is off - submit blocks until delivery".to_string());
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Min severity: {}", summary.min_severity);
            println!(
                "  Queue: {} ({})",
                summary.queue_capacity, summary.overflow_policy
            );
            println!("  Workers: {}", summary.worker_count);
            println!("  Destinations: {}", summary.destination_count);
            println!("  Custom formatters: {}", summary.formatter_count);
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}
