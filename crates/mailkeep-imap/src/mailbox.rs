//! The remote mailbox as the sync engine sees it

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use futures::io::{AsyncRead, AsyncWrite};

use crate::client::GmailClient;
use crate::folder::{Folder, SelectedFolder, SpecialFolder};
use crate::message::{FetchItems, FetchedMessage, Uid};
use crate::transport::TransportStats;
use crate::ImapResult;

/// Operations the sync engine runs against one authenticated session
#[async_trait]
pub trait RemoteMailbox: Send {
    async fn discover_special_folder(&mut self, kind: SpecialFolder)
        -> ImapResult<Option<Folder>>;

    async fn select(&mut self, folder: &str, readonly: bool) -> ImapResult<SelectedFolder>;

    /// Vendor raw search in the selected folder; `None` matches everything
    async fn search(&mut self, query: Option<&str>) -> ImapResult<Vec<Uid>>;

    async fn fetch(&mut self, uids: &[Uid], items: FetchItems)
        -> ImapResult<Vec<FetchedMessage>>;

    async fn get_labels(&mut self, uid: &Uid) -> ImapResult<Vec<String>>;

    /// Add labels without removing existing ones
    async fn set_labels(&mut self, uid: &Uid, labels: &[String]) -> ImapResult<()>;

    async fn append(
        &mut self,
        folder: &str,
        flags: &[String],
        internal_date: Option<&DateTime<FixedOffset>>,
        body: &[u8],
    ) -> ImapResult<Option<Uid>>;

    async fn logout(&mut self) -> ImapResult<TransportStats>;
}

#[async_trait]
impl<S> RemoteMailbox for GmailClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn discover_special_folder(
        &mut self,
        kind: SpecialFolder,
    ) -> ImapResult<Option<Folder>> {
        GmailClient::discover_special_folder(self, kind).await
    }

    async fn select(&mut self, folder: &str, readonly: bool) -> ImapResult<SelectedFolder> {
        GmailClient::select(self, folder, readonly).await
    }

    async fn search(&mut self, query: Option<&str>) -> ImapResult<Vec<Uid>> {
        GmailClient::search(self, query).await
    }

    async fn fetch(
        &mut self,
        uids: &[Uid],
        items: FetchItems,
    ) -> ImapResult<Vec<FetchedMessage>> {
        GmailClient::fetch(self, uids, items).await
    }

    async fn get_labels(&mut self, uid: &Uid) -> ImapResult<Vec<String>> {
        GmailClient::get_labels(self, uid).await
    }

    async fn set_labels(&mut self, uid: &Uid, labels: &[String]) -> ImapResult<()> {
        GmailClient::set_labels(self, uid, labels).await
    }

    async fn append(
        &mut self,
        folder: &str,
        flags: &[String],
        internal_date: Option<&DateTime<FixedOffset>>,
        body: &[u8],
    ) -> ImapResult<Option<Uid>> {
        GmailClient::append(self, folder, flags, internal_date, body).await
    }

    async fn logout(&mut self) -> ImapResult<TransportStats> {
        GmailClient::logout(self).await
    }
}
