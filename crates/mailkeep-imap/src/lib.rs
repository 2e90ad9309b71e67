//! Gmail IMAP for mailkeep
//!
//! A raw-protocol client for the Gmail IMAP extensions, over a byte
//! transport with optional COMPRESS=DEFLATE.

mod client;
mod error;
mod folder;
mod mailbox;
mod message;
mod response;
mod transport;

#[cfg(test)]
mod testing;

pub use client::{ClientIdentity, ConnectOptions, GmailClient, TlsStream, VENDOR_CAPABILITY};
pub use error::{ImapError, ImapResult};
pub use folder::{Folder, SelectedFolder, SpecialFolder};
pub use mailbox::RemoteMailbox;
pub use message::{
    format_internal_date, normalize_internal_date, parse_internal_date, FetchItems,
    FetchedMessage, Uid,
};
pub use response::Status;
pub use transport::{CompressedTransport, TransportStats};
