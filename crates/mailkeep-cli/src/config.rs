//! Configuration file handling

use anyhow::{Context, Result};
use mailkeep_core::{AccountConfig, SyncOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Contents of a `mailkeep.toml`
///
/// ```toml
/// [account]
/// email = "someone@gmail.com"
/// token_command = "oauth2l fetch --scope https://mail.google.com/"
///
/// [sync]
/// batch_size = 50
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    pub account: AccountConfig,
    pub sync: SyncOptions,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Apply the account address, deriving the default backup directory
    /// unless one was configured
    pub fn set_email(&mut self, email: &str) {
        let default_dir = AccountConfig::gmail(self.account.email.as_str()).backup_dir;
        if self.account.backup_dir == default_dir {
            self.account.backup_dir = AccountConfig::gmail(email).backup_dir;
        }
        self.account.email = email.to_string();
    }
}
