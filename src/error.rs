//! Error types for sandrun

use thiserror::Error;

/// Result type alias using sandrun's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sandrun
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request rejected before any sandbox resource was allocated
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Docker/container runtime error
    #[error("Container error: {0}")]
    Container(String),

    /// Workspace filesystem error
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if the error originates in the engine's environment rather than the request
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Error::Container(_) | Error::Workspace(_) | Error::Io(_))
    }

    /// Check if error is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::InvalidInput(_) | Error::NotFound(_)
        )
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::Container(err.to_string())
    }
}

/// Reasons a request is rejected synchronously, before reaching the driver
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("unsupported language '{language}' (supported: {supported})")]
    UnknownLanguage { language: String, supported: String },

    #[error("source text is empty")]
    EmptySource,

    #[error("timeout of {requested}s is outside the allowed range 1..={max}s")]
    TimeoutOutOfRange { requested: u64, max: u64 },

    #[error("invalid file name '{0}'")]
    InvalidFileName(String),

    #[error("invalid session key '{0}'")]
    InvalidSessionKey(String),

    #[error("invalid memory limit '{0}'")]
    InvalidMemoryLimit(String),

    #[error("invalid cpu limit {0}")]
    InvalidCpuLimit(f64),

    /// A request may narrow the policy, never widen it
    #[error("{resource} of {requested} exceeds the policy limit of {limit}")]
    ExceedsPolicy {
        resource: &'static str,
        requested: String,
        limit: String,
    },
}
