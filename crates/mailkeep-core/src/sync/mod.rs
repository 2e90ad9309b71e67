//! Sync engine: backup, restore, estimate and reindex
//!
//! A [`Session`] is built once per run. It owns the catalog, knows how to
//! (re)connect through a [`Connector`], and carries the run options, the
//! progress channel and the interrupt handle through every phase. All remote
//! calls go through the retry wrappers below, so connection faults are
//! absorbed here and only fatal errors reach the caller.

mod backup;
mod estimate;
mod reindex;
mod restore;

#[cfg(test)]
mod fake;

pub use backup::{expand_date_tokens, message_path, BackupReport};
pub use estimate::{format_bytes, EstimateReport};
pub use restore::{restore_label_alias, RestoreReport};

use crate::account::{AccountConfig, SyncOptions};
use crate::catalog::{Catalog, Purpose};
use crate::retry::{self, RetryController, RetryDecision, RetryPolicy};
use crate::{CoreError, CoreResult};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use mailkeep_auth::CredentialProvider;
use mailkeep_imap::{
    ConnectOptions, FetchItems, FetchedMessage, GmailClient, ImapError, RemoteMailbox,
    SelectedFolder, SpecialFolder, TransportStats, Uid,
};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Wait between failed connection attempts
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

/// Progress reported while a run is going
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Mailbox selected (again, after a reconnect)
    Connected {
        folder: String,
        uidvalidity: u32,
        messages: u32,
    },
    /// Search done and split into new and already captured messages
    Searched {
        matched: usize,
        new: usize,
        captured: usize,
    },
    BackupProgress { done: usize, total: usize },
    RefreshProgress { done: usize, total: usize },
    RestoreProgress { done: usize, total: usize },
    EstimateProgress { done: usize, total: usize, bytes: u64 },
    ReindexProgress { done: usize, total: usize },
    /// A command failed and will be retried after `wait`
    Retrying {
        operation: String,
        attempt: u32,
        wait: Duration,
    },
    /// The connection dropped and is being re-established
    Reconnecting { reason: String },
    /// Something was skipped
    Warning { message: String },
}

/// Cancellation handle shared between the engine and whoever handles Ctrl-C
///
/// The engine stops at the next safe point, commits what it has, and returns
/// [`CoreError::Interrupted`].
#[derive(Debug, Clone)]
pub struct Interrupt {
    tx: Arc<watch::Sender<bool>>,
}

impl Interrupt {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once triggered
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens authenticated sessions; asked again after every connection loss
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> CoreResult<Box<dyn RemoteMailbox>>;
}

/// Connects to Gmail over TLS with a fresh credential each time
pub struct GmailConnector {
    host: String,
    port: u16,
    credentials: Arc<dyn CredentialProvider>,
    options: ConnectOptions,
}

impl GmailConnector {
    pub fn new(
        config: &AccountConfig,
        credentials: Arc<dyn CredentialProvider>,
        compress: bool,
    ) -> Self {
        Self {
            host: config.imap_host.clone(),
            port: config.imap_port,
            credentials,
            options: ConnectOptions {
                compress,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl Connector for GmailConnector {
    async fn connect(&self) -> CoreResult<Box<dyn RemoteMailbox>> {
        let token = self.credentials.fresh_credential().await?;
        let client = GmailClient::establish(&self.host, self.port, &token, &self.options).await?;
        Ok(Box::new(client))
    }
}

/// Remote calls, named for logs and fatal errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Search,
    Fetch,
    Append,
    StoreLabels,
}

impl Operation {
    fn fatal(self, error: ImapError) -> CoreError {
        match error {
            ImapError::CommandFailed { text, .. } if self == Operation::Fetch => {
                CoreError::FetchFailed(text)
            }
            ImapError::CommandFailed { text, .. } if self == Operation::StoreLabels => {
                CoreError::LabelStoreFailed(text)
            }
            error => CoreError::from(error),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Search => "search",
            Operation::Fetch => "fetch",
            Operation::Append => "append",
            Operation::StoreLabels => "label store",
        })
    }
}

/// State of one run
pub struct Session {
    catalog: Catalog,
    connector: Box<dyn Connector>,
    remote: Option<Box<dyn RemoteMailbox>>,
    options: SyncOptions,
    retry_policy: RetryPolicy,
    events: Option<mpsc::Sender<SyncEvent>>,
    interrupt: Interrupt,
    /// All Mail, once discovered
    folder: Option<String>,
    readonly: bool,
    mailbox: Option<SelectedFolder>,
}

impl Session {
    /// Open the catalog in `root` and check it may be used for `purpose`
    pub async fn open(
        root: impl AsRef<Path>,
        account: &str,
        purpose: Purpose,
        connector: impl Connector + 'static,
        options: SyncOptions,
    ) -> CoreResult<Self> {
        let catalog = match purpose {
            Purpose::Restore | Purpose::Reindex => Catalog::open_existing(root, account).await?,
            Purpose::Backup | Purpose::Estimate => Catalog::open_or_create(root, account).await?,
        };
        catalog.check_compatible(purpose, account)?;
        Ok(Self::new(catalog, connector, options))
    }

    pub fn new(catalog: Catalog, connector: impl Connector + 'static, options: SyncOptions) -> Self {
        Self {
            catalog,
            connector: Box::new(connector),
            remote: None,
            options,
            retry_policy: RetryPolicy::default(),
            events: None,
            interrupt: Interrupt::new(),
            folder: None,
            readonly: true,
            mailbox: None,
        }
    }

    /// Send progress events to `tx`
    pub fn with_events(mut self, tx: mpsc::Sender<SyncEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Log out, if connected
    pub async fn close(&mut self) -> Option<TransportStats> {
        let mut remote = self.remote.take()?;
        match remote.logout().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                debug!("Logout failed: {}", e);
                None
            }
        }
    }

    async fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    async fn warn_skip(&self, message: String) {
        warn!("{}", message);
        self.emit(SyncEvent::Warning { message }).await;
    }

    fn check_interrupt(&self) -> CoreResult<()> {
        if self.interrupt.is_triggered() {
            return Err(CoreError::Interrupted);
        }
        Ok(())
    }

    /// UIDVALIDITY of the selected mailbox
    fn uidvalidity(&self) -> CoreResult<u32> {
        self.mailbox
            .as_ref()
            .map(|m| m.uidvalidity)
            .ok_or(CoreError::ImapError(ImapError::NotConnected))
    }

    fn folder(&self) -> CoreResult<String> {
        self.folder
            .clone()
            .ok_or(CoreError::ImapError(ImapError::NotConnected))
    }

    async fn connect(&mut self, readonly: bool) -> CoreResult<()> {
        self.readonly = readonly;
        self.reconnect().await
    }

    /// Drop the current connection and open a new one with All Mail selected
    ///
    /// Connection failures are retried until one succeeds or the run is
    /// interrupted; anything else (bad credentials, missing extensions) is
    /// fatal.
    async fn reconnect(&mut self) -> CoreResult<()> {
        self.remote = None;
        let mut failures = 0u32;

        loop {
            self.check_interrupt()?;
            match self.open_remote().await {
                Ok((remote, selected)) => {
                    if let Some(previous) = &self.mailbox {
                        if previous.uidvalidity != selected.uidvalidity {
                            return Err(CoreError::UidValidityChanged {
                                before: previous.uidvalidity,
                                after: selected.uidvalidity,
                            });
                        }
                    }
                    self.emit(SyncEvent::Connected {
                        folder: selected.full_path.clone(),
                        uidvalidity: selected.uidvalidity,
                        messages: selected.message_count,
                    })
                    .await;
                    self.remote = Some(remote);
                    self.mailbox = Some(selected);
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    warn!("Connection attempt {} failed: {}", failures, e);
                    self.emit(SyncEvent::Reconnecting {
                        reason: e.to_string(),
                    })
                    .await;
                    retry::pause(RECONNECT_PAUSE, &self.interrupt).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn open_remote(&mut self) -> CoreResult<(Box<dyn RemoteMailbox>, SelectedFolder)> {
        let mut remote = self.connector.connect().await?;

        let folder = match &self.folder {
            Some(folder) => folder.clone(),
            None => {
                let found = remote
                    .discover_special_folder(SpecialFolder::AllMail)
                    .await?
                    .ok_or_else(|| CoreError::FolderNotFound("All Mail".to_string()))?;
                info!("All Mail folder is {:?}", found.full_path);
                found.full_path
            }
        };

        let selected = remote.select(&folder, self.readonly).await?;
        self.folder = Some(folder);
        Ok((remote, selected))
    }

    /// Decide how to go on after `error`; returns once reconnected
    async fn recover(
        &mut self,
        retry: &mut RetryController,
        operation: Operation,
        error: ImapError,
    ) -> CoreResult<()> {
        match retry.on_failure(&error) {
            RetryDecision::Reconnect => {
                warn!("Connection lost during {} ({}); reconnecting", operation, error);
                self.emit(SyncEvent::Reconnecting {
                    reason: error.to_string(),
                })
                .await;
            }
            RetryDecision::Backoff { attempt, wait } => {
                warn!(
                    "{} failed ({}); attempt {} of {}, retrying in {:?}",
                    operation, error, attempt, self.retry_policy.max_attempts, wait
                );
                self.emit(SyncEvent::Retrying {
                    operation: operation.to_string(),
                    attempt,
                    wait,
                })
                .await;
                retry::pause(wait, &self.interrupt).await?;
            }
            RetryDecision::GiveUp => return Err(operation.fatal(error)),
        }

        self.reconnect().await
    }

    async fn search(&mut self, query: Option<&str>) -> CoreResult<Vec<Uid>> {
        let mut retry = RetryController::new(self.retry_policy);
        loop {
            let interrupt = self.interrupt.clone();
            let result = match self.remote.as_mut() {
                Some(remote) => tokio::select! {
                    r = remote.search(query) => r,
                    _ = interrupt.triggered() => return Err(CoreError::Interrupted),
                },
                None => Err(ImapError::NotConnected),
            };
            match result {
                Ok(uids) => return Ok(uids),
                Err(e) => self.recover(&mut retry, Operation::Search, e).await?,
            }
        }
    }

    async fn fetch(&mut self, uids: &[Uid], items: FetchItems) -> CoreResult<Vec<FetchedMessage>> {
        let mut retry = RetryController::new(self.retry_policy);
        loop {
            let interrupt = self.interrupt.clone();
            let result = match self.remote.as_mut() {
                Some(remote) => tokio::select! {
                    r = remote.fetch(uids, items) => r,
                    _ = interrupt.triggered() => return Err(CoreError::Interrupted),
                },
                None => Err(ImapError::NotConnected),
            };
            match result {
                Ok(messages) => return Ok(messages),
                Err(e) => self.recover(&mut retry, Operation::Fetch, e).await?,
            }
        }
    }

    /// Not cancellable: an abandoned upload may still land on the server
    async fn append(
        &mut self,
        folder: &str,
        flags: &[String],
        internal_date: Option<&DateTime<FixedOffset>>,
        body: &[u8],
    ) -> CoreResult<Option<Uid>> {
        let mut retry = RetryController::new(self.retry_policy);
        loop {
            let result = match self.remote.as_mut() {
                Some(remote) => remote.append(folder, flags, internal_date, body).await,
                None => Err(ImapError::NotConnected),
            };
            match result {
                Ok(uid) => return Ok(uid),
                Err(e) => self.recover(&mut retry, Operation::Append, e).await?,
            }
        }
    }

    async fn store_labels(&mut self, uid: &Uid, labels: &[String]) -> CoreResult<()> {
        let mut retry = RetryController::new(self.retry_policy);
        loop {
            let result = match self.remote.as_mut() {
                Some(remote) => remote.set_labels(uid, labels).await,
                None => Err(ImapError::NotConnected),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => self.recover(&mut retry, Operation::StoreLabels, e).await?,
            }
        }
    }

    /// Split UIDs into (not yet captured, captured)
    async fn partition(&self, uids: Vec<Uid>) -> CoreResult<(Vec<Uid>, Vec<Uid>)> {
        let mut new = Vec::new();
        let mut captured = Vec::new();
        for uid in uids {
            if self.catalog.is_captured(&uid).await? {
                captured.push(uid);
            } else {
                new.push(uid);
            }
        }
        Ok((new, captured))
    }
}
