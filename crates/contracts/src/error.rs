//! Layered error definitions
//!
//! Categorized by source: config / sink / general

use thiserror::Error;

/// Unified error type
#[derive(Debug, Error)]
pub enum ContractError {
    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration rejected by validation
    #[error("invalid config at '{field}': {message}")]
    ConfigInvalid { field: String, message: String },

    // ===== Sink Errors =====
    /// Delivery failed but the sink may succeed on the next batch
    #[error("sink '{sink_name}' transient failure: {message}")]
    SinkTransient { sink_name: String, message: String },

    /// Sink resource is unusable until reacquired
    #[error("sink '{sink_name}' fatal failure: {message}")]
    SinkFatal { sink_name: String, message: String },

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl ContractError {
    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration parse error keeping the underlying cause
    pub fn config_parse_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create configuration validation error
    pub fn config_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn sink_transient(sink_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkTransient {
            sink_name: sink_name.into(),
            message: message.into(),
        }
    }

    pub fn sink_fatal(sink_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkFatal {
            sink_name: sink_name.into(),
            message: message.into(),
        }
    }

    /// Classify an io error raised by a sink.
    ///
    /// Missing paths and permission problems will not heal on retry.
    pub fn from_sink_io(sink_name: impl Into<String>, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied | ErrorKind::NotFound | ErrorKind::InvalidInput => {
                Self::sink_fatal(sink_name, err.to_string())
            }
            _ => Self::sink_transient(sink_name, err.to_string()),
        }
    }

    /// Whether a destination should keep accepting batches after this error
    pub fn is_transient(&self) -> bool {
        match self {
            Self::SinkTransient { .. } => true,
            Self::SinkFatal { .. } | Self::ConfigParse { .. } | Self::ConfigInvalid { .. } => false,
            Self::Io(err) => !matches!(
                err.kind(),
                std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound
            ),
            Self::Other(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_sink_io_classification() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "read-only");
        assert!(!ContractError::from_sink_io("file", &denied).is_transient());

        let full = io::Error::other("no space left on device");
        assert!(ContractError::from_sink_io("file", &full).is_transient());
    }

    #[test]
    fn test_config_invalid_display() {
        let err = ContractError::config_invalid("destinations[0].name", "must not be empty");
        assert_eq!(
            err.to_string(),
            "invalid config at 'destinations[0].name': must not be empty"
        );
    }
}
