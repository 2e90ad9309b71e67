//! Error types for the core module

use mailkeep_imap::ImapError;
use thiserror::Error;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Catalog predates the oldest schema we can migrate
    #[error("Backup catalog schema version {found} is too old (minimum supported is {minimum})")]
    SchemaTooOld { found: u32, minimum: u32 },

    /// Catalog was written by a newer release
    #[error("Backup catalog schema version {found} is newer than this release supports ({current})")]
    SchemaTooNew { found: u32, current: u32 },

    /// Catalog belongs to another account
    #[error("Backup catalog belongs to {stored}, not {requested}; only restore may use another account's backup")]
    OwnerMismatch { stored: String, requested: String },

    /// Folder not found
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// Labels could not be applied to a restored message
    #[error("Failed to store labels: {0}")]
    LabelStoreFailed(String),

    /// Fetching messages kept failing
    #[error("Failed to fetch messages: {0}")]
    FetchFailed(String),

    /// Server broke the protocol or lacks required extensions
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Authentication error
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// IMAP error
    #[error("IMAP error: {0}")]
    ImapError(ImapError),

    /// The mailbox was renumbered while we were working on it
    #[error("UIDVALIDITY changed from {before} to {after} during the run; run again to rebuild the index")]
    UidValidityChanged { before: u32, after: u32 },

    /// The user asked us to stop
    #[error("Interrupted")]
    Interrupted,

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CoreError {
    /// Whether a fresh connection may cure this
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::ImapError(e) if e.is_transient())
    }

    /// Process exit status for this failure class
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::SchemaTooOld { .. } | CoreError::SchemaTooNew { .. } => 2,
            CoreError::OwnerMismatch { .. } => 3,
            CoreError::FolderNotFound(_) => 4,
            CoreError::LabelStoreFailed(_) => 5,
            CoreError::FetchFailed(_) => 6,
            CoreError::ProtocolError(_) => 7,
            CoreError::Interrupted => 130,
            _ => 1,
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::DatabaseError(e.to_string())
    }
}

impl From<mailkeep_auth::AuthError> for CoreError {
    fn from(e: mailkeep_auth::AuthError) -> Self {
        CoreError::AuthError(e.to_string())
    }
}

impl From<ImapError> for CoreError {
    fn from(e: ImapError) -> Self {
        match e {
            ImapError::FolderNotFound(folder) => CoreError::FolderNotFound(folder),
            ImapError::MissingVendorExtension
            | ImapError::CapabilityRefused { .. }
            | ImapError::ParseError(_) => {
                CoreError::ProtocolError(e.to_string())
            }
            ImapError::AuthenticationFailed(text) => CoreError::AuthError(text),
            e => CoreError::ImapError(e),
        }
    }
}
