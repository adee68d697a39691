//! Error types for dbdeck-core

use thiserror::Error;

/// Result type for manager-internal operations
pub type Result<T> = std::result::Result<T, ManagerError>;

/// Errors raised inside the manager before they are folded into results
#[derive(Error, Debug)]
pub enum ManagerError {
    /// Normalized driver error
    #[error(transparent)]
    Driver(#[from] dbdeck_rdbc::Error),

    /// No registered connection with this id
    #[error("Connection not found: {0}")]
    NotFound(String),

    /// Operation name not recognized
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Arguments did not match the operation's shape
    #[error("Invalid arguments for {op}: {message}")]
    InvalidArguments {
        /// Operation name
        op: String,
        /// What was wrong
        message: String,
    },

    /// No saved profile with this name
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Result could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ManagerError {
    /// Driver error code, if this wraps a driver error that carries one
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Driver(e) => e.code(),
            _ => None,
        }
    }

    /// Normalized category for driver errors
    pub fn category(&self) -> Option<dbdeck_rdbc::error::ErrorCategory> {
        match self {
            Self::Driver(e) => Some(e.category()),
            _ => None,
        }
    }

    /// Create an invalid-arguments error
    pub fn invalid_arguments(op: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidArguments {
            op: op.into(),
            message: message.to_string(),
        }
    }
}
