//! In-memory Gmail for engine tests

use super::{Connector, Interrupt};
use crate::headers::header_message_id;
use crate::CoreResult;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use mailkeep_imap::{
    FetchItems, FetchedMessage, Folder, ImapError, ImapResult, RemoteMailbox, SelectedFolder,
    SpecialFolder, Status, TransportStats, Uid,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub const ALL_MAIL: &str = "[Gmail]/All Mail";

#[derive(Debug, Clone)]
pub struct FakeMessage {
    pub body: Vec<u8>,
    pub internal_date: DateTime<FixedOffset>,
    pub labels: Vec<String>,
    pub flags: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub uidvalidity: u32,
    pub messages: BTreeMap<u32, FakeMessage>,
    pub next_uid: u32,
    /// Answer this many fetches with NO
    pub fail_fetches: u32,
    /// Drop the connection on this many fetches
    pub drop_fetches: u32,
    /// Answer every fetch with each item twice
    pub duplicate_fetches: bool,
    /// Trigger the interrupt once this many fetches have been served
    pub interrupt_on_fetch: Option<(usize, Interrupt)>,
    /// Trigger the interrupt once this many messages have been appended
    pub interrupt_after_appends: Option<(usize, Interrupt)>,
    pub connections: u32,
    /// Items and size of every fetch that was served
    pub fetches: Vec<(FetchItems, usize)>,
    pub appended: usize,
    pub searches: Vec<Option<String>>,
}

/// Shared server state; every connection sees the same mailbox
#[derive(Debug, Clone)]
pub struct FakeGmail {
    state: Arc<Mutex<FakeState>>,
}

impl FakeGmail {
    pub fn new(uidvalidity: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                uidvalidity,
                next_uid: 1,
                ..Default::default()
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Add message `n` with a distinct Message-ID and date
    pub fn add_message(&self, n: u32, labels: &[&str], flags: &[&str]) -> Uid {
        let date = DateTime::parse_from_rfc3339(&format!(
            "2020-03-{:02}T{:02}:{:02}:00-05:00",
            n % 28 + 1,
            n % 24,
            n % 60
        ))
        .unwrap();
        let mut state = self.state();
        state.insert(FakeMessage {
            body: raw_message(n),
            internal_date: date,
            labels: labels.iter().map(|s| s.to_string()).collect(),
            flags: flags.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Give every message a new UID under a new UIDVALIDITY
    pub fn renumber(&self, uidvalidity: u32) {
        let mut state = self.state();
        let messages = std::mem::take(&mut state.messages);
        state.uidvalidity = uidvalidity;
        state.next_uid += 1000;
        for message in messages.into_values() {
            state.insert(message);
        }
    }

    pub fn uids(&self) -> Vec<Uid> {
        self.state().messages.keys().map(|n| uid(*n)).collect()
    }

    pub fn message(&self, uid: &Uid) -> Option<FakeMessage> {
        let n: u32 = uid.as_str().parse().ok()?;
        self.state().messages.get(&n).cloned()
    }
}

impl FakeState {
    fn insert(&mut self, message: FakeMessage) -> Uid {
        let n = self.next_uid;
        self.next_uid += 1;
        self.messages.insert(n, message);
        uid(n)
    }
}

pub fn uid(n: u32) -> Uid {
    Uid::new(n.to_string()).unwrap()
}

pub fn raw_message(n: u32) -> Vec<u8> {
    format!(
        "From: sender{n}@example.com\r\nTo: me@gmail.com\r\nSubject: Message {n}\r\n\
         Message-ID: <msg-{n}@example.com>\r\n\r\nBody of message {n}\r\n"
    )
    .into_bytes()
}

#[async_trait]
impl Connector for FakeGmail {
    async fn connect(&self) -> CoreResult<Box<dyn RemoteMailbox>> {
        self.state().connections += 1;
        Ok(Box::new(FakeSession {
            server: self.clone(),
        }))
    }
}

struct FakeSession {
    server: FakeGmail,
}

#[async_trait]
impl RemoteMailbox for FakeSession {
    async fn discover_special_folder(
        &mut self,
        kind: SpecialFolder,
    ) -> ImapResult<Option<Folder>> {
        let folder = Folder::new(
            ALL_MAIL.to_string(),
            Some('/'),
            vec!["\\HasNoChildren".to_string(), "\\All".to_string()],
        );
        Ok(folder.is(kind).then_some(folder))
    }

    async fn select(&mut self, folder: &str, readonly: bool) -> ImapResult<SelectedFolder> {
        if folder != ALL_MAIL {
            return Err(ImapError::FolderNotFound(folder.to_string()));
        }
        let state = self.server.state();
        Ok(SelectedFolder {
            full_path: folder.to_string(),
            uidvalidity: state.uidvalidity,
            message_count: state.messages.len() as u32,
            readonly,
        })
    }

    async fn search(&mut self, query: Option<&str>) -> ImapResult<Vec<Uid>> {
        self.server.state().searches.push(query.map(str::to_string));
        Ok(self.server.uids())
    }

    async fn fetch(
        &mut self,
        uids: &[Uid],
        items: FetchItems,
    ) -> ImapResult<Vec<FetchedMessage>> {
        let mut state = self.server.state();
        if state.drop_fetches > 0 {
            state.drop_fetches -= 1;
            return Err(ImapError::IoError(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(ImapError::CommandFailed {
                command: "UID FETCH".to_string(),
                status: Status::No,
                text: "Some messages could not be FETCHed (Failure)".to_string(),
            });
        }

        state.fetches.push((items, uids.len()));
        if let Some((after, interrupt)) = &state.interrupt_on_fetch {
            if state.fetches.len() >= *after {
                interrupt.trigger();
            }
        }

        let mut out = Vec::new();
        for uid in uids.iter().rev() {
            let Some(message) = uid
                .as_str()
                .parse::<u32>()
                .ok()
                .and_then(|n| state.messages.get(&n))
            else {
                continue;
            };
            let mut fetched = FetchedMessage::new(uid.clone());
            match items {
                FetchItems::Full => {
                    fetched.labels = message.labels.clone();
                    fetched.flags = message.flags.clone();
                    fetched.internal_date = Some(message.internal_date);
                    fetched.body = Some(message.body.clone());
                }
                FetchItems::LabelsAndFlags => {
                    fetched.labels = message.labels.clone();
                    fetched.flags = message.flags.clone();
                }
                FetchItems::Size => fetched.size = Some(message.body.len() as u64),
                FetchItems::MessageIdHeader => {
                    fetched.internal_date = Some(message.internal_date);
                    fetched.header = Some(match header_message_id(&message.body) {
                        Some(id) => format!("Message-ID: <{}>\r\n\r\n", id).into_bytes(),
                        None => b"\r\n".to_vec(),
                    });
                }
            }
            if state.duplicate_fetches {
                out.push(fetched.clone());
            }
            out.push(fetched);
        }
        Ok(out)
    }

    async fn get_labels(&mut self, uid: &Uid) -> ImapResult<Vec<String>> {
        Ok(self
            .server
            .message(uid)
            .map(|m| m.labels)
            .unwrap_or_default())
    }

    async fn set_labels(&mut self, uid: &Uid, labels: &[String]) -> ImapResult<()> {
        let n: u32 = uid
            .as_str()
            .parse()
            .map_err(|_| ImapError::ParseError(uid.to_string()))?;
        let mut state = self.server.state();
        let message = state.messages.get_mut(&n).ok_or_else(|| ImapError::CommandFailed {
            command: "UID STORE".to_string(),
            status: Status::No,
            text: "No such message".to_string(),
        })?;
        for label in labels {
            if !message.labels.contains(label) {
                message.labels.push(label.clone());
            }
        }
        Ok(())
    }

    async fn append(
        &mut self,
        folder: &str,
        flags: &[String],
        internal_date: Option<&DateTime<FixedOffset>>,
        body: &[u8],
    ) -> ImapResult<Option<Uid>> {
        if folder != ALL_MAIL {
            return Err(ImapError::FolderNotFound(folder.to_string()));
        }
        let mut state = self.server.state();
        let uid = state.insert(FakeMessage {
            body: body.to_vec(),
            internal_date: internal_date
                .copied()
                .unwrap_or_else(|| chrono::Utc::now().fixed_offset()),
            labels: Vec::new(),
            flags: flags.to_vec(),
        });
        state.appended += 1;
        if let Some((after, interrupt)) = &state.interrupt_after_appends {
            if state.appended >= *after {
                interrupt.trigger();
            }
        }
        Ok(Some(uid))
    }

    async fn logout(&mut self) -> ImapResult<TransportStats> {
        Ok(TransportStats::default())
    }
}
