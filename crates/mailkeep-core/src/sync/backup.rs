//! Backup: capture new messages, then refresh labels and flags of old ones

use super::{Session, SyncEvent};
use crate::catalog::{CatalogBatch, RebuildReport};
use crate::headers::MessageMeta;
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Datelike, Duration, FixedOffset, Local, NaiveDate};
use mailkeep_imap::{FetchItems, FetchedMessage, Uid};
use std::collections::HashSet;
use tracing::{debug, info};

/// Outcome of a backup run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    /// Messages matching the search
    pub matched: usize,
    /// Of those, not captured before this run
    pub new: usize,
    /// Newly captured in this run
    pub captured: usize,
    /// Requested but returned without a body or date
    pub skipped: usize,
    /// Previously captured messages whose labels and flags were refreshed
    pub refreshed: usize,
    /// Set when the UID index had to be rebuilt first
    pub rebuilt: Option<RebuildReport>,
}

impl Session {
    /// Capture every matching message not yet in the backup
    ///
    /// Each batch of captures commits as a unit. Interrupting stops after the
    /// message in progress; everything captured so far stays committed.
    pub async fn backup(&mut self) -> CoreResult<BackupReport> {
        self.connect(true).await?;
        let rebuilt = self.ensure_index().await?;

        let query = self
            .options
            .search
            .as_deref()
            .map(|q| expand_date_tokens(q, Local::now().date_naive()));
        if let Some(query) = &query {
            info!("Searching for messages matching {:?}", query);
        }
        let uids = self.search(query.as_deref()).await?;
        let matched = uids.len();
        let (new, captured) = self.partition(uids).await?;

        info!(
            "{} messages match, {} already backed up, {} to fetch",
            matched,
            captured.len(),
            new.len()
        );
        self.emit(SyncEvent::Searched {
            matched,
            new: new.len(),
            captured: captured.len(),
        })
        .await;

        let mut report = BackupReport {
            matched,
            new: new.len(),
            rebuilt,
            ..Default::default()
        };

        self.capture(&new, &mut report).await?;

        if self.options.refresh {
            report.refreshed = self.refresh(&captured).await?;
        }

        info!(
            "Backup done: {} captured, {} skipped, {} refreshed",
            report.captured, report.skipped, report.refreshed
        );
        Ok(report)
    }

    async fn capture(&mut self, uids: &[Uid], report: &mut BackupReport) -> CoreResult<()> {
        let uidvalidity = self.uidvalidity()?;
        let total = uids.len();
        let mut done = 0;

        for batch in uids.chunks(self.options.batch_size.max(1)) {
            let fetched = self.fetch(batch, FetchItems::Full).await?;
            let mut wanted: HashSet<&Uid> = batch.iter().collect();

            let mut tx = self.catalog.begin_batch().await?;
            let mut stored = 0;
            let mut interrupted = false;
            for message in fetched {
                if self.interrupt.is_triggered() {
                    interrupted = true;
                    break;
                }
                // each requested UID is stored once, repeats are ignored
                if !wanted.remove(&message.uid) {
                    debug!("Ignoring unrequested or repeated UID {}", message.uid);
                    continue;
                }
                if self.persist(&mut tx, message, uidvalidity).await? {
                    stored += 1;
                }
            }
            tx.commit().await?;

            report.captured += stored;
            if interrupted {
                return Err(CoreError::Interrupted);
            }
            report.skipped += batch.len().saturating_sub(stored);
            done += batch.len();
            self.emit(SyncEvent::BackupProgress { done, total }).await;
        }
        Ok(())
    }

    /// Write the message file and record it; `false` if it was skipped
    async fn persist(
        &self,
        tx: &mut CatalogBatch,
        message: FetchedMessage,
        uidvalidity: u32,
    ) -> CoreResult<bool> {
        let (Some(body), Some(date)) = (message.body.as_deref(), message.internal_date) else {
            self.warn_skip(format!(
                "UID {} came back without a body or internal date; skipping",
                message.uid
            ))
            .await;
            return Ok(false);
        };

        let relative = message_path(&date, uidvalidity, &message.uid);
        let path = self.catalog.root().join(&relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;

        let meta = MessageMeta::from_raw(body, &date);
        tx.record_message(&meta, &relative, &message.uid, &message.labels, &message.flags)
            .await?;
        Ok(true)
    }

    /// Bring stored labels and flags of captured messages up to date
    async fn refresh(&mut self, uids: &[Uid]) -> CoreResult<usize> {
        let total = uids.len();
        let mut done = 0;
        let mut refreshed = 0;

        for batch in uids.chunks(self.options.refresh_batch_size()) {
            let fetched = self.fetch(batch, FetchItems::LabelsAndFlags).await?;
            let mut wanted: HashSet<&Uid> = batch.iter().collect();

            let mut tx = self.catalog.begin_batch().await?;
            for message in fetched.iter().filter(|m| wanted.remove(&m.uid)) {
                if tx
                    .refresh_labels_flags(&message.uid, &message.labels, &message.flags)
                    .await?
                {
                    refreshed += 1;
                }
            }
            tx.commit().await?;

            done += batch.len();
            self.emit(SyncEvent::RefreshProgress { done, total }).await;
            self.check_interrupt()?;
        }
        Ok(refreshed)
    }
}

/// Relative path of a captured message: `<year>/<month>/<day>/<uidvalidity>-<uid>.eml`
///
/// The date is the internal date in the server's offset.
pub fn message_path(internal_date: &DateTime<FixedOffset>, uidvalidity: u32, uid: &Uid) -> String {
    format!(
        "{}/{}/{}/{}-{}.eml",
        internal_date.year(),
        internal_date.month(),
        internal_date.day(),
        uidvalidity,
        uid
    )
}

/// Replace relative date tokens in a search query
///
/// `*3d*`, `*2w*`, `*6m*` and `*1y*` become the date that many days, weeks,
/// months (30 days) or years (365 days) before `today`, as `YYYY/MM/DD`.
/// Anything else is left alone.
pub fn expand_date_tokens(query: &str, today: NaiveDate) -> String {
    let mut out = String::with_capacity(query.len());
    let mut rest = query;

    while let Some(start) = rest.find('*') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('*').and_then(|end| {
            token_date(&after[..end], today).map(|date| (end, date))
        }) {
            Some((end, date)) => {
                out.push_str(&date.format("%Y/%m/%d").to_string());
                rest = &after[end + 1..];
            }
            None => {
                out.push('*');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn token_date(token: &str, today: NaiveDate) -> Option<NaiveDate> {
    let unit = token.chars().last()?;
    let count: i64 = token[..token.len() - unit.len_utf8()].parse().ok()?;
    let days = match unit.to_ascii_lowercase() {
        'd' => count,
        'w' => count * 7,
        'm' => count * 30,
        'y' => count * 365,
        _ => return None,
    };
    today.checked_sub_signed(Duration::try_days(days)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    #[test]
    fn test_expand_date_tokens() {
        assert_eq!(
            expand_date_tokens("after:*3d* label:work", today()),
            "after:2024/03/12 label:work"
        );
        assert_eq!(expand_date_tokens("after:*2w*", today()), "after:2024/03/01");
        assert_eq!(expand_date_tokens("before:*1m*", today()), "before:2024/02/14");
        assert_eq!(expand_date_tokens("after:*1y*", today()), "after:2023/03/16");
    }

    #[test]
    fn test_unknown_tokens_are_kept() {
        assert_eq!(expand_date_tokens("subject:*wow*", today()), "subject:*wow*");
        assert_eq!(expand_date_tokens("a*b", today()), "a*b");
        assert_eq!(
            expand_date_tokens("*x* after:*1d*", today()),
            "*x* after:2024/03/14"
        );
        assert_eq!(expand_date_tokens("**", today()), "**");
    }

    #[test]
    fn test_message_path_uses_server_offset() {
        let date = DateTime::parse_from_rfc3339("2021-01-05T23:30:00-08:00").unwrap();
        let uid = Uid::new("4021").unwrap();
        assert_eq!(message_path(&date, 600123, &uid), "2021/1/5/600123-4021.eml");
    }
}
