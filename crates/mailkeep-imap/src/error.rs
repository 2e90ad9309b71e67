//! Error types for IMAP operations

use crate::Status;
use thiserror::Error;

/// Result type for IMAP operations
pub type ImapResult<T> = Result<T, ImapError>;

/// Errors that can occur during IMAP operations
#[derive(Debug, Error)]
pub enum ImapError {
    /// Connection failed
    #[error("Failed to connect to IMAP server: {0}")]
    ConnectionFailed(String),

    /// TLS error
    #[error("TLS error: {0}")]
    TlsError(String),

    /// Authentication failed
    #[error("IMAP authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server closed the session (`* BYE`)
    #[error("IMAP server closed the connection: {0}")]
    Bye(String),

    /// A command completed with NO or BAD
    #[error("IMAP {command} failed ({status}): {text}")]
    CommandFailed {
        command: String,
        status: Status,
        text: String,
    },

    /// Server lacks the Gmail IMAP extensions
    #[error("This server does not support the Gmail IMAP extensions (X-GM-EXT-1)")]
    MissingVendorExtension,

    /// Server would not list its capabilities
    #[error("Server refused CAPABILITY ({status}): {text}")]
    CapabilityRefused { status: Status, text: String },

    /// Folder not found
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// Parse error
    #[error("Failed to parse IMAP response: {0}")]
    ParseError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Session is not connected
    #[error("IMAP session is not connected")]
    NotConnected,
}

impl ImapError {
    /// Connection-level faults that a fresh connection may cure
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ImapError::ConnectionFailed(_)
                | ImapError::TlsError(_)
                | ImapError::Bye(_)
                | ImapError::IoError(_)
                | ImapError::NotConnected
        )
    }

    /// The server answered, but not with OK
    pub fn is_command_failure(&self) -> bool {
        matches!(self, ImapError::CommandFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let io = ImapError::IoError(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(io.is_transient());
        assert!(ImapError::Bye("going away".into()).is_transient());

        let failed = ImapError::CommandFailed {
            command: "UID FETCH".into(),
            status: Status::No,
            text: "Some messages could not be FETCHed".into(),
        };
        assert!(!failed.is_transient());
        assert!(failed.is_command_failure());

        assert!(!ImapError::MissingVendorExtension.is_transient());
        assert!(!ImapError::ParseError("x".into()).is_command_failure());
    }
}
