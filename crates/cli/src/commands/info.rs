//! `info` command implementation.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use contracts::{DestinationKind, PipelineConfiguration};

use crate::cli::InfoArgs;

/// Category-separated files: everything but trades, trades alone, errors
/// alone, plus a human-readable console.
pub const EXAMPLE_CONFIG: &str = r#"# logpipe example configuration
min_severity = "debug"
structured_mode = true
async_mode = true
queue_capacity = 10000
overflow_policy = "drop_oldest"
batch_size = 100
batch_timeout_ms = 100
worker_count = 1

[health]
failure_threshold = 3
backoff_initial_ms = 100
backoff_max_ms = 30000
max_recovery_attempts = 10

[[destinations]]
name = "expert"
kind = "file"
target = "logs/expert.log"
category_filter = ["general", "error", "performance"]

[destinations.rotation]
max_size_bytes = 10485760
backup_count = 5
compress_backups = true

[[destinations]]
name = "trades"
kind = "file"
target = "logs/trades.log"
category_filter = ["trade"]

[destinations.rotation]
max_size_bytes = 10485760
backup_count = 5

[[destinations]]
name = "errors"
kind = "file"
target = "logs/errors.log"
min_severity = "error"

[destinations.rotation]
max_size_bytes = 10485760
backup_count = 5

[[destinations]]
name = "console"
kind = "console"
target = "stdout"
formatter = "human"
min_severity = "info"
"#;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    min_severity: String,
    structured_mode: bool,
    async_mode: bool,
    queue_capacity: usize,
    overflow_policy: String,
    batch_size: usize,
    batch_timeout_ms: u64,
    worker_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    rate_limit: Option<u32>,
    destinations: Vec<DestinationInfo>,
}

#[derive(Serialize)]
struct DestinationInfo {
    name: String,
    kind: String,
    target: String,
    enabled: bool,
    min_severity: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    categories: Vec<String>,
    formatter: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rotation: Option<String>,
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    if args.example {
        print!("{EXAMPLE_CONFIG}");
        return Ok(());
    }

    info!(config = %args.config.display(), "Loading configuration info");

    if !args.config.exists() {
        anyhow::bail!("Configuration file not found: {}", args.config.display());
    }

    let config = config_loader::ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    let info = build_config_info(&config);
    if args.json {
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&info);
    }

    Ok(())
}

fn build_config_info(config: &PipelineConfiguration) -> ConfigInfo {
    let destinations = config
        .destinations
        .iter()
        .map(|d| DestinationInfo {
            name: d.name.clone(),
            kind: d.kind.as_str().to_string(),
            target: d.target.clone(),
            enabled: d.enabled,
            min_severity: d.min_severity.to_string(),
            categories: d
                .category_filter
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
            formatter: config.formatter_name(d).to_string(),
            rotation: match (&d.rotation, d.kind) {
                (Some(r), DestinationKind::File) => Some(format!(
                    "{} bytes x {}{}",
                    r.max_size_bytes,
                    r.backup_count,
                    if r.compress_backups { " (gzip)" } else { "" }
                )),
                _ => None,
            },
        })
        .collect();

    ConfigInfo {
        min_severity: config.min_severity.to_string(),
        structured_mode: config.structured_mode,
        async_mode: config.async_mode,
        queue_capacity: config.queue_capacity,
        overflow_policy: format!("{:?}", config.overflow_policy),
        batch_size: config.batch_size,
        batch_timeout_ms: config.batch_timeout_ms,
        worker_count: config.worker_count,
        rate_limit: config.rate_limit,
        destinations,
    }
}

fn print_config_info(info: &ConfigInfo) {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                  logpipe configuration                       ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    println!("Pipeline");
    println!("   ├─ Min severity: {}", info.min_severity);
    println!(
        "   ├─ Mode: {}, {}",
        if info.async_mode { "async" } else { "sync" },
        if info.structured_mode { "structured" } else { "human" }
    );
    println!(
        "   ├─ Queue: {} ({})",
        info.queue_capacity, info.overflow_policy
    );
    println!(
        "   ├─ Batching: {} records / {} ms",
        info.batch_size, info.batch_timeout_ms
    );
    println!("   ├─ Workers: {}", info.worker_count);
    match info.rate_limit {
        Some(limit) => println!("   └─ Rate limit: {limit} records/s"),
        None => println!("   └─ Rate limit: none"),
    }

    println!("\nDestinations ({})", info.destinations.len());
    for (i, dest) in info.destinations.iter().enumerate() {
        let is_last = i == info.destinations.len() - 1;
        let prefix = if is_last { "└─" } else { "├─" };
        let child_prefix = if is_last { "   " } else { "│  " };

        println!(
            "   {} {} ({} -> {}){}",
            prefix,
            dest.name,
            dest.kind,
            dest.target,
            if dest.enabled { "" } else { " [disabled]" }
        );
        let categories = if dest.categories.is_empty() {
            "all".to_string()
        } else {
            dest.categories.join(", ")
        };
        println!(
            "   {}  ├─ >= {} / categories: {}",
            child_prefix, dest.min_severity, categories
        );
        match &dest.rotation {
            Some(rotation) => {
                println!("   {}  ├─ formatter: {}", child_prefix, dest.formatter);
                println!("   {}  └─ rotation: {}", child_prefix, rotation);
            }
            None => println!("   {}  └─ formatter: {}", child_prefix, dest.formatter),
        }
    }

    println!();
}
