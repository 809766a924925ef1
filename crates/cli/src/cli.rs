//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// logpipe - structured log dispatch pipeline
#[derive(Parser, Debug)]
#[command(
    name = "logpipe",
    author,
    version,
    about = "Structured log dispatch pipeline",
    long_about = "Reads log records from stdin and dispatches them to the file, console \n\
                  and network destinations named in a configuration file, with \n\
                  per-destination filtering, rotation and health tracking."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "LOGPIPE_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Format of logpipe's own diagnostics (written to stderr)
    #[arg(
        long,
        value_enum,
        default_value = "compact",
        global = true,
        env = "LOGPIPE_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn default_log_level(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Dispatch records read from stdin
    Run(RunArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display configuration information
    Info(InfoArgs),
}

/// Arguments for the `run` command
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, default_value = "logpipe.toml", env = "LOGPIPE_CONFIG")]
    pub config: PathBuf,

    /// How stdin lines are interpreted
    #[arg(long, value_enum, default_value = "auto", env = "LOGPIPE_INPUT")]
    pub input: InputFormat,

    /// Component name stamped on records read from stdin
    #[arg(long, default_value = "stdin")]
    pub component: String,

    /// Shutdown deadline in milliseconds
    #[arg(long, default_value = "5000", env = "LOGPIPE_SHUTDOWN_TIMEOUT_MS")]
    pub shutdown_timeout_ms: u64,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "0", env = "LOGPIPE_METRICS_PORT")]
    pub metrics_port: u16,

    /// Seconds between metrics exports (0 = only at shutdown)
    #[arg(long, default_value = "10", env = "LOGPIPE_METRICS_INTERVAL")]
    pub metrics_interval: u64,

    /// Print the shutdown report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "logpipe.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "logpipe.toml")]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Print an example configuration with category-separated files instead
    #[arg(long)]
    pub example: bool,
}

/// Diagnostics output format
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    Pretty,
    /// Compact single-line format
    #[default]
    Compact,
}

impl From<LogFormat> for observability::LogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Json => observability::LogFormat::Json,
            LogFormat::Pretty => observability::LogFormat::Pretty,
            LogFormat::Compact => observability::LogFormat::Compact,
        }
    }
}

/// Interpretation of stdin lines
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InputFormat {
    /// JSON objects when a line starts with `{`, plain text otherwise
    #[default]
    Auto,
    /// One JSON object per line
    Json,
    /// Each line is an info message
    Text,
}
