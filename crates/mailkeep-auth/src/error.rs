//! Error types for the auth module

use thiserror::Error;

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors that can occur while obtaining a credential
#[derive(Debug, Error)]
pub enum AuthError {
    /// The credential helper could not be started
    #[error("Failed to run credential helper: {0}")]
    HelperFailed(String),

    /// The credential helper exited unsuccessfully
    #[error("Credential helper exited with {status}: {stderr}")]
    HelperExited { status: String, stderr: String },

    /// The helper produced no token
    #[error("Credential helper returned an empty token")]
    EmptyToken,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
