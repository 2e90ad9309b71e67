//! Account and run configuration

use mailkeep_auth::gmail;
use serde::{Deserialize, Serialize};

/// Default number of messages per backup fetch
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Which account to back up and where
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccountConfig {
    /// Account address; also the catalog owner
    pub email: String,
    /// IMAP server hostname
    pub imap_host: String,
    /// IMAP server port
    pub imap_port: u16,
    /// Directory holding the catalog and message files
    pub backup_dir: String,
    /// Helper command printing a fresh access token, run on every connect
    pub token_command: Option<String>,
}

impl AccountConfig {
    /// Gmail configuration
    pub fn gmail(email: impl Into<String>) -> Self {
        let email = email.into();
        Self {
            backup_dir: format!("GYB-GMail-Backup-{}", email),
            email,
            imap_host: gmail::IMAP_HOST.to_string(),
            imap_port: gmail::IMAP_PORT,
            token_command: None,
        }
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self::gmail("")
    }
}

/// Knobs for a single backup, restore, estimate or reindex run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncOptions {
    /// Messages per backup fetch; refresh and size fetches use 100x this
    pub batch_size: usize,
    /// Negotiate COMPRESS=DEFLATE
    pub compress: bool,
    /// Refresh labels and flags of already captured messages
    pub refresh: bool,
    /// Gmail search (X-GM-RAW); relative dates like `*7d*` are expanded
    pub search: Option<String>,
    /// Restore only messages carrying one of these labels
    pub labels: Vec<String>,
    /// Continue an interrupted restore instead of starting over
    pub resume: bool,
    /// Extra label applied to every restored message
    pub restore_label: Option<String>,
    /// Estimate only what a backup would download
    pub skip_captured: bool,
}

impl SyncOptions {
    /// Batch size for label/flag refresh and size estimates
    pub fn refresh_batch_size(&self) -> usize {
        self.batch_size.max(1) * 100
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            compress: true,
            refresh: true,
            search: None,
            labels: Vec::new(),
            resume: false,
            restore_label: None,
            skip_captured: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gmail_defaults() {
        let config = AccountConfig::gmail("someone@gmail.com");
        assert_eq!(config.imap_host, "imap.gmail.com");
        assert_eq!(config.imap_port, 993);
        assert_eq!(config.backup_dir, "GYB-GMail-Backup-someone@gmail.com");
    }

    #[test]
    fn test_options_from_partial_toml() {
        let options: SyncOptions = toml::from_str("batch_size = 25\nrefresh = false\n").unwrap();
        assert_eq!(options.batch_size, 25);
        assert!(!options.refresh);
        assert!(options.compress);
        assert_eq!(options.refresh_batch_size(), 2500);
    }
}
