//! Restore: upload captured messages and reapply their labels

use super::{Session, SyncEvent};
use crate::catalog::RestoreEntry;
use crate::CoreResult;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use mailkeep_imap::parse_internal_date;
use std::io::ErrorKind;
use tracing::{info, warn};

/// Outcome of a restore run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Worklist size at the start of the run
    pub pending: usize,
    pub restored: usize,
    /// Catalog entries whose message file is gone
    pub missing: usize,
    /// Uploaded, but the server did not say which UID it got, so no labels
    pub unlabeled: usize,
}

impl Session {
    /// Upload the messages on the restore worklist into All Mail
    ///
    /// An entry leaves the worklist only once its message and labels are on
    /// the server, so an interrupted run resumes where it stopped.
    pub async fn restore(&mut self) -> CoreResult<RestoreReport> {
        if self.catalog.needs_migration() {
            self.catalog.migrate(None).await?;
        }

        let labels: Vec<String> = self
            .options
            .labels
            .iter()
            .map(|l| restore_label_alias(l))
            .collect();
        self.catalog
            .prepare_restore(self.options.resume, &labels)
            .await?;
        let entries = self.catalog.pending_restore().await?;

        let mut report = RestoreReport {
            pending: entries.len(),
            ..Default::default()
        };
        if entries.is_empty() {
            info!("Nothing to restore");
            return Ok(report);
        }

        self.connect(false).await?;
        let folder = self.folder()?;
        let total = entries.len();

        for (i, entry) in entries.into_iter().enumerate() {
            self.check_interrupt()?;
            if self.restore_entry(&folder, &entry, &mut report).await? {
                self.catalog.finish_restore_entry(entry.message_num).await?;
            }
            self.emit(SyncEvent::RestoreProgress { done: i + 1, total })
                .await;
        }

        info!(
            "Restore done: {} restored, {} missing files, {} without UID",
            report.restored, report.missing, report.unlabeled
        );
        Ok(report)
    }

    /// `false` when the entry was skipped and should stay queued
    async fn restore_entry(
        &mut self,
        folder: &str,
        entry: &RestoreEntry,
        report: &mut RestoreReport,
    ) -> CoreResult<bool> {
        let path = self.catalog.root().join(&entry.message_filename);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.warn_skip(format!(
                    "{} is missing; skipping message {}",
                    path.display(),
                    entry.message_num
                ))
                .await;
                report.missing += 1;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let (mut labels, flags) = self.catalog.labels_and_flags(entry.message_num).await?;
        let flags: Vec<String> = flags
            .into_iter()
            .filter(|f| !f.eq_ignore_ascii_case("\\Recent"))
            .collect();
        if let Some(extra) = &self.options.restore_label {
            if !labels.contains(extra) {
                labels.push(extra.clone());
            }
        }

        let date = parse_catalog_date(&entry.message_internaldate);
        if date.is_none() {
            self.warn_skip(format!(
                "Message {} has an unreadable internal date {:?}; the server will date it now",
                entry.message_num, entry.message_internaldate
            ))
            .await;
        }
        match self.append(folder, &flags, date.as_ref(), &body).await? {
            Some(uid) => self.store_labels(&uid, &labels).await?,
            None => {
                warn!(
                    "Server did not report a UID for message {}; labels not applied",
                    entry.message_num
                );
                report.unlabeled += 1;
            }
        }

        report.restored += 1;
        Ok(true)
    }
}

/// Map the short names accepted for system labels onto Gmail's
pub fn restore_label_alias(label: &str) -> String {
    match label.to_ascii_lowercase().as_str() {
        "inbox" => "\\Inbox".to_string(),
        "sent" => "\\Sent".to_string(),
        "starred" => "\\Starred".to_string(),
        "draft" | "drafts" => "\\Draft".to_string(),
        "important" => "\\Important".to_string(),
        _ => label.to_string(),
    }
}

/// Read a stored internal date
///
/// Current catalogs hold UTC `YYYY-MM-DD HH:MM:SS`. Older ones may hold
/// RFC 3339, or the server's reply verbatim, as in
/// `INTERNALDATE "01-Mar-2020 00:00:00 -0500"`.
fn parse_catalog_date(value: &str) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc().fixed_offset());
    }
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Some(date);
    }
    let raw = value.strip_prefix("INTERNALDATE").unwrap_or(value).trim();
    parse_internal_date(raw.trim_matches('"'))
}
