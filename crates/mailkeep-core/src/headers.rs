//! Header fields kept in the catalog

use chrono::{DateTime, FixedOffset};
use mail_parser::{HeaderName, MessageParser};
use mailkeep_imap::normalize_internal_date;

/// Catalog columns derived from a captured message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMeta {
    pub to: String,
    pub from: String,
    pub subject: String,
    /// UTC, `YYYY-MM-DD HH:MM:SS`
    pub internal_date: String,
    pub message_id: Option<String>,
}

impl MessageMeta {
    /// Parse the header section of `raw`; unparseable headers leave fields empty
    pub fn from_raw(raw: &[u8], internal_date: &DateTime<FixedOffset>) -> Self {
        let mut meta = MessageMeta {
            internal_date: normalize_internal_date(internal_date),
            ..Default::default()
        };

        if let Some(message) = MessageParser::default().parse_headers(raw) {
            meta.to = trimmed(message.header_raw(HeaderName::To));
            meta.from = trimmed(message.header_raw(HeaderName::From));
            meta.subject = message.subject().unwrap_or_default().to_string();
            meta.message_id = message.message_id().map(str::to_string);
        }

        meta
    }
}

fn trimmed(value: Option<&str>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

/// Message-ID of a header block or full message, without angle brackets
pub fn header_message_id(raw: &[u8]) -> Option<String> {
    MessageParser::default()
        .parse_headers(raw)
        .and_then(|message| message.message_id().map(str::to_string))
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"From: Alice <alice@example.com>\r\n\
To: bob@example.com, carol@example.com\r\n\
Subject: =?UTF-8?Q?caf=C3=A9?=\r\n\
Message-ID: <abc.123@mail.example.com>\r\n\
\r\n\
hello\r\n";

    #[test]
    fn test_meta_from_raw() {
        let date = DateTime::parse_from_rfc3339("2021-06-01T23:30:00-02:00").unwrap();
        let meta = MessageMeta::from_raw(RAW, &date);
        assert_eq!(meta.from, "Alice <alice@example.com>");
        assert_eq!(meta.to, "bob@example.com, carol@example.com");
        assert_eq!(meta.subject, "café");
        assert_eq!(meta.internal_date, "2021-06-02 01:30:00");
        assert_eq!(meta.message_id.as_deref(), Some("abc.123@mail.example.com"));
    }

    #[test]
    fn test_message_id_from_header_fetch() {
        assert_eq!(
            header_message_id(b"Message-ID: <x@y>\r\n\r\n").as_deref(),
            Some("x@y")
        );
        assert_eq!(header_message_id(b"Subject: none\r\n\r\n"), None);
    }
}
