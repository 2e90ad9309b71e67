//! XOAUTH2 SASL mechanism for IMAP
//!
//! Implements the XOAUTH2 authentication mechanism as specified at:
//! https://developers.google.com/workspace/gmail/imap/xoauth2-protocol

use base64::prelude::*;
use std::fmt;

/// Single-use XOAUTH2 credential for one connection attempt
#[derive(Clone)]
pub struct XOAuth2Token {
    /// Email address
    email: String,
    /// OAuth2 access token
    access_token: String,
}

impl XOAuth2Token {
    /// Create a new XOAUTH2 token
    pub fn new(email: &str, access_token: &str) -> Self {
        Self {
            email: email.to_string(),
            access_token: access_token.to_string(),
        }
    }

    /// Get the email address
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Get the access token
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Generate the XOAUTH2 authentication string
    ///
    /// Format: "user={email}\x01auth=Bearer {token}\x01\x01"
    pub fn auth_string(&self) -> String {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.email, self.access_token
        )
    }

    /// Generate the base64-encoded XOAUTH2 authentication string
    ///
    /// This is what gets sent to the IMAP server
    pub fn auth_string_base64(&self) -> String {
        BASE64_STANDARD.encode(self.auth_string())
    }
}

// Keep the bearer token out of logs.
impl fmt::Debug for XOAuth2Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XOAuth2Token")
            .field("email", &self.email)
            .field("access_token", &"<redacted>")
            .finish()
    }
}
