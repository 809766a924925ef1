//! # Config Loader
//!
//! Configuration loading and parsing module.
//!
//! Responsibilities:
//! - Parse TOML/JSON configuration files
//! - Apply `LOGPIPE_*` environment overrides
//! - Validate the result (rules live in `contracts`)
//!
//! # Example
//!
//! ```no_run
//! use config_loader::ConfigLoader;
//! use std::path::Path;
//!
//! let config = ConfigLoader::load_from_path(Path::new("logpipe.toml")).unwrap();
//! println!("destinations: {}", config.destinations.len());
//! ```

mod env;
mod parser;

pub use contracts::PipelineConfiguration;
pub use env::{
    ENV_ASYNC, ENV_LOG_DIRECTORY, ENV_MIN_SEVERITY, ENV_QUEUE_CAPACITY, ENV_STRUCTURED,
};
pub use parser::ConfigFormat;

use contracts::{validate_configuration, ContractError};
use std::path::Path;

/// Configuration loader
///
/// Provides static methods to load configuration from files or strings.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file path
    ///
    /// Automatically detects format from file extension (.toml / .json).
    /// Environment overrides are applied before validation.
    ///
    /// # Errors
    /// - File read failure
    /// - Unsupported format
    /// - Parse failure
    /// - Validation failure
    pub fn load_from_path(path: &Path) -> Result<PipelineConfiguration, ContractError> {
        let format = Self::detect_format(path)?;
        let content = Self::read_file(path)?;
        let config = parser::parse(&content, format)?;
        let config = Self::apply_env_overrides(config)?;
        validate_configuration(&config)?;
        tracing::debug!(
            path = %path.display(),
            destinations = config.destinations.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Load configuration from string
    ///
    /// No environment overrides are applied.
    ///
    /// # Errors
    /// - Parse failure
    /// - Validation failure
    pub fn load_from_str(
        content: &str,
        format: ConfigFormat,
    ) -> Result<PipelineConfiguration, ContractError> {
        let config = parser::parse(content, format)?;
        validate_configuration(&config)?;
        Ok(config)
    }

    /// Apply `LOGPIPE_*` variables from the process environment
    pub fn apply_env_overrides(
        config: PipelineConfiguration,
    ) -> Result<PipelineConfiguration, ContractError> {
        env::apply_overrides(config, |key| std::env::var(key).ok())
    }

    /// Apply overrides from an explicit lookup (tests, embedding)
    pub fn apply_overrides_with<F>(
        config: PipelineConfiguration,
        lookup: F,
    ) -> Result<PipelineConfiguration, ContractError>
    where
        F: Fn(&str) -> Option<String>,
    {
        env::apply_overrides(config, lookup)
    }

    /// Serialize PipelineConfiguration to TOML string
    pub fn to_toml(config: &PipelineConfiguration) -> Result<String, ContractError> {
        toml::to_string_pretty(config)
            .map_err(|e| ContractError::config_parse(format!("TOML serialize error: {e}")))
    }

    /// Serialize PipelineConfiguration to JSON string
    pub fn to_json(config: &PipelineConfiguration) -> Result<String, ContractError> {
        serde_json::to_string_pretty(config)
            .map_err(|e| ContractError::config_parse(format!("JSON serialize error: {e}")))
    }
}

impl ConfigLoader {
    /// Infer configuration format from file extension
    fn detect_format(path: &Path) -> Result<ConfigFormat, ContractError> {
        let ext = path.extension().and_then(|e| e.to_str()).ok_or_else(|| {
            ContractError::config_parse("cannot determine file format from extension")
        })?;

        ConfigFormat::from_extension(ext).ok_or_else(|| {
            ContractError::config_parse(format!("unsupported config format: .{ext}"))
        })
    }

    /// Read configuration file content
    fn read_file(path: &Path) -> Result<String, ContractError> {
        Ok(std::fs::read_to_string(path)?)
    }
}
