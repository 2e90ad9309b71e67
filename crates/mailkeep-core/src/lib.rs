//! Core of mailkeep
//!
//! Holds the backup catalog, the account and run configuration, and the sync
//! engine that drives backup, restore, estimate and reindex runs against a
//! Gmail mailbox.

mod account;
mod catalog;
mod error;
mod headers;
mod retry;
mod sync;

pub use account::{AccountConfig, SyncOptions, DEFAULT_BATCH_SIZE};
pub use catalog::{
    Catalog, CatalogBatch, IndexEntry, Purpose, RebuildReport, RestoreEntry, CATALOG_FILE,
    MIN_SCHEMA_VERSION, SCHEMA_VERSION,
};
pub use error::{CoreError, CoreResult};
pub use headers::{header_message_id, MessageMeta};
pub use retry::{RetryController, RetryDecision, RetryPolicy, MAX_ATTEMPTS};
pub use sync::{
    expand_date_tokens, format_bytes, message_path, restore_label_alias, BackupReport,
    Connector, EstimateReport, GmailConnector, Interrupt, RestoreReport, Session, SyncEvent,
};
