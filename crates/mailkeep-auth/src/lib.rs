//! Authentication module for mailkeep
//!
//! Token acquisition (browser consent, refresh) lives outside this crate.
//! What it provides is the seam the sync engine consumes: a provider that
//! hands out a fresh, single-use XOAUTH2 credential for every connection
//! attempt.

mod error;
mod provider;
mod xoauth2;

pub use error::{AuthError, AuthResult};
pub use provider::{CommandCredentials, CredentialProvider, StaticCredentials};
pub use xoauth2::XOAuth2Token;

/// Gmail server constants
pub mod gmail {
    /// Gmail IMAP server
    pub const IMAP_HOST: &str = "imap.gmail.com";
    pub const IMAP_PORT: u16 = 993;
}
