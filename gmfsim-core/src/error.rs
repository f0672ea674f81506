//! Core error types.

use thiserror::Error;

/// Errors from module loading and interpretation.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid module definition '{module}': {reason}")]
    InvalidDefinition { module: String, reason: String },

    #[error("unsupported unit '{unit}' in {context}")]
    UnsupportedUnit { unit: String, context: String },

    #[error("module not found: {module}")]
    ModuleNotFound { module: String },

    #[error("module already loaded with different content: {module}")]
    ModuleConflict { module: String },

    #[error("state not found: {module}.{state}")]
    StateNotFound { module: String, state: String },

    #[error("logic evaluation failed: {reason}")]
    LogicEvaluation { reason: String },

    #[error("attribute '{attribute}' referenced by state '{state}' is not set")]
    MissingAttribute { attribute: String, state: String },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn invalid(module: &str, reason: impl Into<String>) -> Self {
        CoreError::InvalidDefinition {
            module: module.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn logic(reason: impl Into<String>) -> Self {
        CoreError::LogicEvaluation {
            reason: reason.into(),
        }
    }

    /// Returns whether this error comes from a malformed module or setting,
    /// as opposed to data missing while one person was being simulated.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidDefinition { .. }
                | CoreError::UnsupportedUnit { .. }
                | CoreError::ModuleNotFound { .. }
                | CoreError::ModuleConflict { .. }
                | CoreError::StateNotFound { .. }
                | CoreError::Io { .. }
                | CoreError::Json(_)
        )
    }

    /// Returns a stable code for logs and tooling output.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::UnsupportedUnit { .. } => "INVALID_DEFINITION",
            CoreError::ModuleNotFound { .. } => "MODULE_NOT_FOUND",
            CoreError::ModuleConflict { .. } => "MODULE_CONFLICT",
            CoreError::StateNotFound { .. } => "STATE_NOT_FOUND",
            CoreError::LogicEvaluation { .. } => "LOGIC_EVALUATION",
            CoreError::MissingAttribute { .. } => "LOGIC_EVALUATION",
            CoreError::Io { .. } => "IO_ERROR",
            CoreError::Json(_) => "INVALID_DEFINITION",
        }
    }
}
