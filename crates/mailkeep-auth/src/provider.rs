//! Sources of fresh credentials
//!
//! Every connection attempt asks its provider for a new credential. Access
//! tokens are only good for a bounded window, so a reconnect deep into a long
//! backup must never reuse the token the run started with.

use crate::{AuthError, AuthResult, XOAuth2Token};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Supplies a single-use credential for each connection attempt
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Account the credentials belong to
    fn email(&self) -> &str;

    /// Produce a credential for the next connection
    async fn fresh_credential(&self) -> AuthResult<XOAuth2Token>;
}

/// Hands out the same access token every time
///
/// Useful for runs shorter than a token lifetime and for tests.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    email: String,
    access_token: String,
}

impl StaticCredentials {
    pub fn new(email: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            access_token: access_token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    fn email(&self) -> &str {
        &self.email
    }

    async fn fresh_credential(&self) -> AuthResult<XOAuth2Token> {
        Ok(XOAuth2Token::new(&self.email, &self.access_token))
    }
}

/// Runs an external helper (e.g. `oauth2l fetch ...`) for every credential
///
/// The helper's trimmed standard output is used as the access token.
#[derive(Debug, Clone)]
pub struct CommandCredentials {
    email: String,
    command: String,
}

impl CommandCredentials {
    pub fn new(email: impl Into<String>, command: impl Into<String>) -> AuthResult<Self> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(AuthError::InvalidConfig(
                "credential command is empty".to_string(),
            ));
        }
        Ok(Self {
            email: email.into(),
            command,
        })
    }
}

#[async_trait]
impl CredentialProvider for CommandCredentials {
    fn email(&self) -> &str {
        &self.email
    }

    async fn fresh_credential(&self) -> AuthResult<XOAuth2Token> {
        debug!("Requesting fresh credential for {}", self.email);

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("MAILKEEP_EMAIL", &self.email)
            .output()
            .await
            .map_err(|e| AuthError::HelperFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(AuthError::HelperExited {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }

        Ok(XOAuth2Token::new(&self.email, &token))
    }
}
