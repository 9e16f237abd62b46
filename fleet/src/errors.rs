//! Error types for fleetd

use thiserror::Error;

use crate::models::progress::Stage;

/// Main error type for fleetd
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A target field failed validation. Raised before any network activity.
    #[error("Invalid {field}: {message}")]
    ValidationError { field: &'static str, message: String },

    /// Host unreachable or credentials rejected.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A pipeline stage failed on the remote host.
    #[error("{stage} stage failed: {message}")]
    StageExecutionError { stage: Stage, message: String },

    /// The progress feed itself was lost; terminal status of the affected
    /// targets is unknown.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// A compensating action failed during rollback.
    #[error("Rollback stage {stage} failed: {message}")]
    RollbackError { stage: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        FleetError::ValidationError {
            field,
            message: message.into(),
        }
    }

    pub fn stage(stage: Stage, message: impl Into<String>) -> Self {
        FleetError::StageExecutionError {
            stage,
            message: message.into(),
        }
    }

    /// Short message suitable for a progress record. Stage errors report just
    /// the remote diagnostic, everything else its display form.
    pub fn summary(&self) -> String {
        match self {
            FleetError::StageExecutionError { message, .. } => message.clone(),
            FleetError::ConnectionError(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<anyhow::Error> for FleetError {
    fn from(err: anyhow::Error) -> Self {
        FleetError::Internal(err.to_string())
    }
}
