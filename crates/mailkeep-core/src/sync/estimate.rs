//! Estimate how much a backup would download

use super::{expand_date_tokens, Session, SyncEvent};
use crate::CoreResult;
use chrono::Local;
use mailkeep_imap::FetchItems;
use tracing::info;

/// Outcome of an estimate run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EstimateReport {
    pub messages: usize,
    pub bytes: u64,
}

impl Session {
    /// Sum the sizes of matching messages without downloading them
    ///
    /// With `skip_captured`, messages already in the backup are left out.
    pub async fn estimate(&mut self) -> CoreResult<EstimateReport> {
        self.connect(true).await?;
        if self.options.skip_captured {
            self.ensure_index().await?;
        }

        let query = self
            .options
            .search
            .as_deref()
            .map(|q| expand_date_tokens(q, Local::now().date_naive()));
        let mut uids = self.search(query.as_deref()).await?;
        if self.options.skip_captured {
            uids = self.partition(uids).await?.0;
        }

        let total = uids.len();
        let mut report = EstimateReport::default();
        for batch in uids.chunks(self.options.refresh_batch_size()) {
            for message in self.fetch(batch, FetchItems::Size).await? {
                report.bytes += message.size.unwrap_or(0);
            }
            report.messages += batch.len();
            self.emit(SyncEvent::EstimateProgress {
                done: report.messages,
                total,
                bytes: report.bytes,
            })
            .await;
        }

        info!(
            "{} messages, {} to back up",
            report.messages,
            format_bytes(report.bytes)
        );
        Ok(report)
    }
}

/// Human-readable size with binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} bytes", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 bytes");
        assert_eq!(format_bytes(1023), "1023 bytes");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }
}
