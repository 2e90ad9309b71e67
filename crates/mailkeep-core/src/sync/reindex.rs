//! Keeping the UID index valid for the current mailbox

use super::{Session, SyncEvent};
use crate::catalog::{IndexEntry, RebuildReport};
use crate::headers::header_message_id;
use crate::CoreResult;
use mailkeep_imap::{normalize_internal_date, FetchItems};
use tracing::warn;

impl Session {
    /// Rebuild the UID index from scratch against the server
    pub async fn reindex(&mut self) -> CoreResult<RebuildReport> {
        self.connect(true).await?;
        let uidvalidity = self.uidvalidity()?;
        if self.catalog.needs_migration() {
            self.catalog.migrate(Some(uidvalidity)).await?;
        }
        self.rebuild_index().await
    }

    /// Make sure stored UIDs refer to the selected mailbox
    ///
    /// Called after connecting. Migrates an old catalog, adopts the mailbox
    /// UIDVALIDITY for an empty one, and rebuilds the index when the stored
    /// value differs.
    pub(super) async fn ensure_index(&mut self) -> CoreResult<Option<RebuildReport>> {
        let current = self.uidvalidity()?;
        if self.catalog.needs_migration() {
            self.catalog.migrate(Some(current)).await?;
        }

        match self.catalog.uidvalidity() {
            Some(stored) if stored == current => Ok(None),
            None if self.catalog.message_count().await? == 0 => {
                self.catalog.set_uidvalidity(current).await?;
                Ok(None)
            }
            stored => {
                warn!(
                    "UIDVALIDITY is {} but the backup was indexed against {:?}; rebuilding the UID index",
                    current, stored
                );
                Ok(Some(self.rebuild_index().await?))
            }
        }
    }

    async fn rebuild_index(&mut self) -> CoreResult<RebuildReport> {
        let uids = self.search(None).await?;
        let total = uids.len();
        let mut entries = Vec::with_capacity(total);
        let mut done = 0;

        for batch in uids.chunks(self.options.refresh_batch_size()) {
            for message in self.fetch(batch, FetchItems::MessageIdHeader).await? {
                let Some(date) = message.internal_date else {
                    warn!("UID {} has no internal date; leaving it unmapped", message.uid);
                    continue;
                };
                entries.push(IndexEntry {
                    message_id: message.header.as_deref().and_then(header_message_id),
                    internal_date: normalize_internal_date(&date),
                    uid: message.uid,
                });
            }
            done += batch.len();
            self.emit(SyncEvent::ReindexProgress { done, total }).await;
        }

        let uidvalidity = self.uidvalidity()?;
        self.catalog.rebuild_uid_index(&entries, uidvalidity).await
    }
}
