//! Runner error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Runner errors.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("core error: {0}")]
    Core(#[from] gmfsim_core::CoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("person {index}: no accepted outcome after {attempts} attempts")]
    RetriesExhausted { index: usize, attempts: u32 },

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RunnerError {
    /// Returns whether this error should abort the whole run rather than
    /// one person.
    pub fn is_configuration(&self) -> bool {
        match self {
            RunnerError::Core(e) => e.is_configuration(),
            RunnerError::Config(_) | RunnerError::RetriesExhausted { .. } => true,
            RunnerError::Join(_) => false,
        }
    }
}
