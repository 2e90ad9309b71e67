//! IMAP message types

use chrono::{DateTime, FixedOffset, Utc};
use std::fmt;

/// IMAP INTERNALDATE layout, e.g. `17-Jul-1996 02:44:25 -0700`
const INTERNALDATE_FORMAT: &str = "%d-%b-%Y %H:%M:%S %z";

/// Server-assigned message UID
///
/// Kept as the server's decimal token. UIDs are identifiers, never numbers to
/// do arithmetic with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(String);

impl Uid {
    /// Accepts a non-empty run of ASCII digits
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(token))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which attributes a `UID FETCH` asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchItems {
    /// Labels, internal date, flags and the raw message, for capture
    Full,
    /// Labels and flags only, for metadata refresh
    LabelsAndFlags,
    /// Size only, for estimates
    Size,
    /// Message-ID header and internal date, for rebuilding the UID index
    MessageIdHeader,
}

impl FetchItems {
    pub(crate) fn as_imap(&self) -> &'static str {
        match self {
            FetchItems::Full => "(X-GM-LABELS INTERNALDATE FLAGS BODY.PEEK[])",
            FetchItems::LabelsAndFlags => "(X-GM-LABELS FLAGS)",
            FetchItems::Size => "(RFC822.SIZE)",
            FetchItems::MessageIdHeader => {
                "(INTERNALDATE BODY.PEEK[HEADER.FIELDS (MESSAGE-ID)])"
            }
        }
    }
}

/// One message's worth of a `UID FETCH` response
///
/// Only the attributes that were requested are populated.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMessage {
    pub uid: Uid,
    /// Gmail labels (X-GM-LABELS)
    pub labels: Vec<String>,
    /// IMAP flags, e.g. `\Seen`
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    /// RFC822.SIZE
    pub size: Option<u64>,
    /// Raw message bytes (BODY[])
    pub body: Option<Vec<u8>>,
    /// Raw header section bytes (BODY[HEADER.FIELDS ...])
    pub header: Option<Vec<u8>>,
}

impl FetchedMessage {
    pub fn new(uid: Uid) -> Self {
        Self {
            uid,
            labels: Vec::new(),
            flags: Vec::new(),
            internal_date: None,
            size: None,
            body: None,
            header: None,
        }
    }
}

/// Parse an IMAP INTERNALDATE value (without the surrounding quotes)
pub fn parse_internal_date(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(value.trim(), INTERNALDATE_FORMAT).ok()
}

/// Format a timestamp as an IMAP INTERNALDATE value (without quotes)
pub fn format_internal_date(date: &DateTime<FixedOffset>) -> String {
    date.format(INTERNALDATE_FORMAT).to_string()
}

/// Normalized form used for storage and comparison: UTC, second precision
pub fn normalize_internal_date(date: &DateTime<FixedOffset>) -> String {
    date.with_timezone(&Utc)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_uid_tokens() {
        assert_eq!(Uid::new("0042").unwrap().as_str(), "0042");
        assert!(Uid::new("").is_none());
        assert!(Uid::new("12a").is_none());
        assert!(Uid::new("-1").is_none());
    }

    #[test]
    fn test_internal_date_round_trip() {
        let date = parse_internal_date("17-Jul-1996 02:44:25 -0700").unwrap();
        assert_eq!(date.year(), 1996);
        assert_eq!(format_internal_date(&date), "17-Jul-1996 02:44:25 -0700");
        assert_eq!(normalize_internal_date(&date), "1996-07-17 09:44:25");
    }

    #[test]
    fn test_internal_date_space_padded_day() {
        let date = parse_internal_date(" 5-Mar-2011 23:01:00 +0000").unwrap();
        assert_eq!(date.day(), 5);
        assert_eq!(date.month(), 3);
    }
}
