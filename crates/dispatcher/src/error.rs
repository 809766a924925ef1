//! Dispatcher error types

use thiserror::Error;

/// Errors returned by the administrative pipeline calls
///
/// `submit` never fails; losses only show up in metrics.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration rejected; the previous configuration stays active
    #[error("invalid configuration: {0}")]
    ConfigInvalid(#[source] contracts::ContractError),

    /// Operation attempted after shutdown started
    #[error("pipeline is shut down")]
    ShutDown,
}

impl PipelineError {
    /// Field path of a rejected configuration, if any
    pub fn invalid_field(&self) -> Option<&str> {
        match self {
            Self::ConfigInvalid(contracts::ContractError::ConfigInvalid { field, .. }) => {
                Some(field)
            }
            _ => None,
        }
    }
}
