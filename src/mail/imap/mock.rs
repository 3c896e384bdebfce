//! In-memory IMAP server for engine tests.
//!
//! Tracks open connections, held mailbox locks and every UID FETCH so
//! tests can assert on what the engine did to the server.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{ImapConnection, ImapConnector, MessagePosition, UidRange, build_mailbox_tree};
use crate::error::ImapError;
use crate::mail::types::{
    FetchedMessage, ImapMailbox, ImapMailboxStatus, MailFlags, SpecialUse,
};
use crate::sync::state::ImapAccount;

const DEFAULT_MESSAGE_SIZE: usize = 200;

#[derive(Debug, Clone)]
struct MockMessage {
    uid: u32,
    mod_seq: u64,
    source: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(crate) struct MockMailbox {
    path: String,
    special_use: Option<SpecialUse>,
    selectable: bool,
    uid_validity: u32,
    message_size: usize,
    messages: Vec<MockMessage>,
}

impl MockMailbox {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            special_use: None,
            selectable: true,
            uid_validity: 1,
            message_size: DEFAULT_MESSAGE_SIZE,
            messages: Vec::new(),
        }
    }

    pub fn with_special_use(mut self, special_use: SpecialUse) -> Self {
        self.special_use = Some(special_use);
        self
    }

    pub fn no_select(mut self) -> Self {
        self.selectable = false;
        self
    }

    pub fn with_uid_validity(mut self, uid_validity: u32) -> Self {
        self.uid_validity = uid_validity;
        self
    }

    /// Size in bytes of messages added afterwards.
    pub fn with_message_size(mut self, size: usize) -> Self {
        self.message_size = size;
        self
    }

    /// Add messages; each one's mod-sequence equals its UID.
    pub fn with_uids(mut self, uids: impl IntoIterator<Item = u32>) -> Self {
        for uid in uids {
            let source = message_source(&self.path, uid, self.message_size);
            self.messages.push(MockMessage {
                uid,
                mod_seq: u64::from(uid),
                source,
            });
        }
        self.messages.sort_by_key(|m| m.uid);
        self.messages.dedup_by_key(|m| m.uid);
        self
    }

    fn highest_mod_seq(&self) -> u64 {
        self.messages.iter().map(|m| m.mod_seq).max().unwrap_or(0)
    }

    fn uid_next(&self) -> u32 {
        self.messages.last().map(|m| m.uid + 1).unwrap_or(1)
    }

    fn node(&self) -> ImapMailbox {
        ImapMailbox {
            name: self.path.rsplit('/').next().unwrap_or(&self.path).to_string(),
            delimiter: Some("/".to_string()),
            special_use: self
                .special_use
                .or_else(|| self.path.eq_ignore_ascii_case("INBOX").then_some(SpecialUse::Inbox)),
            selectable: self.selectable,
            ..ImapMailbox::new(self.path.clone())
        }
    }
}

fn message_source(path: &str, uid: u32, size: usize) -> Vec<u8> {
    let mut source = format!(
        "From: Sender <sender@example.com>\r\n\
         To: me@example.com\r\n\
         Subject: {} #{}\r\n\
         Message-ID: <{}.{}@example.com>\r\n\
         \r\n",
        path,
        uid,
        uid,
        path.replace(['/', ' '], ".")
    )
    .into_bytes();
    if source.len() < size {
        source.resize(size, b'x');
    }
    source
}

/// One recorded UID FETCH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FetchRecord {
    pub path: String,
    pub range: UidRange,
    pub changed_since: Option<u64>,
}

#[derive(Debug)]
struct ServerState {
    mailboxes: BTreeMap<String, MockMailbox>,
    condstore: bool,
    message_delay: Duration,
    next_connection: u64,
    connects: usize,
    open: HashSet<u64>,
    peak_open: usize,
    locks: BTreeMap<u64, String>,
    double_locks: usize,
    fetches: Vec<FetchRecord>,
    failing_connects: usize,
    connection_limit: Option<usize>,
    auth_rejected: bool,
    failing_fetch_paths: HashSet<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                mailboxes: BTreeMap::new(),
                condstore: true,
                message_delay: Duration::ZERO,
                next_connection: 1,
                connects: 0,
                open: HashSet::new(),
                peak_open: 0,
                locks: BTreeMap::new(),
                double_locks: 0,
                fetches: Vec::new(),
                failing_connects: 0,
                connection_limit: None,
                auth_rejected: false,
                failing_fetch_paths: HashSet::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn with_mailbox(self, mailbox: MockMailbox) -> Self {
        self.lock().mailboxes.insert(mailbox.path.clone(), mailbox);
        self
    }

    pub fn without_condstore(self) -> Self {
        self.lock().condstore = false;
        self
    }

    /// Delay before each fetched message is yielded.
    pub fn with_message_delay(self, delay: Duration) -> Self {
        self.lock().message_delay = delay;
        self
    }

    /// The next `count` connection attempts fail with a transient error.
    pub fn with_failing_connects(self, count: usize) -> Self {
        self.lock().failing_connects = count;
        self
    }

    /// Connection attempts beyond the first `limit` fail.
    pub fn with_connection_limit(self, limit: usize) -> Self {
        self.lock().connection_limit = Some(limit);
        self
    }

    pub fn rejecting_auth(self) -> Self {
        self.lock().auth_rejected = true;
        self
    }

    /// Every UID FETCH in `path` fails.
    pub fn with_failing_fetch(self, path: &str) -> Self {
        self.lock().failing_fetch_paths.insert(path.to_string());
        self
    }

    pub fn add_mailbox(&self, mailbox: MockMailbox) {
        self.lock().mailboxes.insert(mailbox.path.clone(), mailbox);
    }

    pub fn remove_mailbox(&self, path: &str) {
        self.lock().mailboxes.remove(path);
    }

    pub fn add_messages(&self, path: &str, uids: impl IntoIterator<Item = u32>) {
        let mut state = self.lock();
        if let Some(mailbox) = state.mailboxes.remove(path) {
            let mailbox = mailbox.with_uids(uids);
            state.mailboxes.insert(path.to_string(), mailbox);
        }
    }

    /// Simulate a flag change: the message gets the next mod-sequence.
    pub fn touch_message(&self, path: &str, uid: u32) {
        let mut state = self.lock();
        if let Some(mailbox) = state.mailboxes.get_mut(path) {
            let next = mailbox.highest_mod_seq() + 1;
            if let Some(message) = mailbox.messages.iter_mut().find(|m| m.uid == uid) {
                message.mod_seq = next;
            }
        }
    }

    pub fn set_uid_validity(&self, path: &str, uid_validity: u32) {
        if let Some(mailbox) = self.lock().mailboxes.get_mut(path) {
            mailbox.uid_validity = uid_validity;
        }
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open.len()
    }

    pub fn peak_open_connections(&self) -> usize {
        self.lock().peak_open
    }

    pub fn held_locks(&self) -> Vec<String> {
        self.lock().locks.values().cloned().collect()
    }

    /// Times a mailbox was locked while another connection held it.
    pub fn double_locks(&self) -> usize {
        self.lock().double_locks
    }

    pub fn fetches(&self) -> Vec<FetchRecord> {
        self.lock().fetches.clone()
    }

    pub fn fetches_for(&self, path: &str) -> Vec<FetchRecord> {
        self.fetches().into_iter().filter(|f| f.path == path).collect()
    }

    pub fn message_size(&self, path: &str, uid: u32) -> Option<usize> {
        self.lock()
            .mailboxes
            .get(path)
            .and_then(|m| m.messages.iter().find(|msg| msg.uid == uid))
            .map(|msg| msg.source.len())
    }
}

#[async_trait]
impl ImapConnector for MockServer {
    async fn connect(&self, account: &ImapAccount) -> Result<Box<dyn ImapConnection>, ImapError> {
        let mut state = self.lock();
        if state.auth_rejected {
            return Err(ImapError::Auth {
                user: account.username.clone(),
                reason: "invalid credentials".to_string(),
            });
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(ImapError::Connect {
                host: account.host.clone(),
                reason: "connection refused".to_string(),
            });
        }
        if let Some(limit) = state.connection_limit
            && state.connects >= limit
        {
            return Err(ImapError::Connect {
                host: account.host.clone(),
                reason: "too many connections".to_string(),
            });
        }

        let id = state.next_connection;
        state.next_connection += 1;
        state.connects += 1;
        state.open.insert(id);
        state.peak_open = state.peak_open.max(state.open.len());

        Ok(Box::new(MockConnection {
            server: self.clone(),
            id,
            selected: None,
        }))
    }
}

pub(crate) struct MockConnection {
    server: MockServer,
    id: u64,
    selected: Option<String>,
}

impl MockConnection {
    fn selected(&self) -> Result<&str, ImapError> {
        self.selected
            .as_deref()
            .ok_or_else(|| ImapError::Protocol("no mailbox selected".to_string()))
    }

    fn positions(&self) -> Result<Vec<MessagePosition>, ImapError> {
        let path = self.selected()?;
        let state = self.server.lock();
        let mailbox = state
            .mailboxes
            .get(path)
            .ok_or_else(|| ImapError::MailboxNotFound(path.to_string()))?;
        Ok(mailbox
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| MessagePosition {
                seq: i as u32 + 1,
                uid: m.uid,
            })
            .collect())
    }
}

#[async_trait]
impl ImapConnection for MockConnection {
    async fn list_tree(&mut self) -> Result<Vec<ImapMailbox>, ImapError> {
        let flat = self
            .server
            .lock()
            .mailboxes
            .values()
            .map(MockMailbox::node)
            .collect();
        Ok(build_mailbox_tree(flat))
    }

    async fn status(&mut self, path: &str) -> Result<ImapMailboxStatus, ImapError> {
        let state = self.server.lock();
        let mailbox = state
            .mailboxes
            .get(path)
            .ok_or_else(|| ImapError::MailboxNotFound(path.to_string()))?;
        Ok(ImapMailboxStatus {
            path: path.to_string(),
            message_count: Some(mailbox.messages.len() as u32),
            uid_validity: Some(mailbox.uid_validity),
            uid_next: Some(mailbox.uid_next()),
            highest_mod_seq: state.condstore.then(|| mailbox.highest_mod_seq()),
        })
    }

    async fn lock_mailbox(&mut self, path: &str) -> Result<(), ImapError> {
        let mut state = self.server.lock();
        if !state.mailboxes.contains_key(path) {
            return Err(ImapError::MailboxNotFound(path.to_string()));
        }
        if state
            .locks
            .iter()
            .any(|(id, held)| *id != self.id && held == path)
        {
            state.double_locks += 1;
        }
        state.locks.insert(self.id, path.to_string());
        self.selected = Some(path.to_string());
        Ok(())
    }

    async fn release_lock(&mut self) -> Result<(), ImapError> {
        self.server.lock().locks.remove(&self.id);
        self.selected = None;
        Ok(())
    }

    async fn message_at(&mut self, seq: u32) -> Result<Option<MessagePosition>, ImapError> {
        let positions = self.positions()?;
        Ok(seq
            .checked_sub(1)
            .and_then(|i| positions.get(i as usize).copied()))
    }

    async fn first_message_from_uid(
        &mut self,
        uid: u32,
    ) -> Result<Option<MessagePosition>, ImapError> {
        Ok(self.positions()?.into_iter().find(|p| p.uid >= uid))
    }

    async fn fetch(
        &mut self,
        range: UidRange,
        changed_since: Option<u64>,
    ) -> Result<BoxStream<'_, Result<FetchedMessage, ImapError>>, ImapError> {
        let path = self.selected()?.to_string();
        let mut state = self.server.lock();
        state.fetches.push(FetchRecord {
            path: path.clone(),
            range,
            changed_since,
        });
        if state.failing_fetch_paths.contains(&path) {
            return Err(ImapError::Protocol(format!("FETCH failed in {}", path)));
        }

        let mailbox = state
            .mailboxes
            .get(&path)
            .ok_or_else(|| ImapError::MailboxNotFound(path.clone()))?;
        let messages: Vec<FetchedMessage> = mailbox
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| range.contains(m.uid))
            .filter(|(_, m)| changed_since.is_none_or(|since| m.mod_seq > since))
            .map(|(i, m)| FetchedMessage {
                seq: i as u32 + 1,
                uid: m.uid,
                size: Some(m.source.len() as u32),
                mod_seq: Some(m.mod_seq),
                flags: MailFlags::SEEN,
                source: Some(m.source.clone()),
                ..FetchedMessage::default()
            })
            .collect();
        let delay = state.message_delay;
        drop(state);

        Ok(stream::iter(messages)
            .then(move |message| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(message)
            })
            .boxed())
    }

    async fn logout(&mut self) -> Result<(), ImapError> {
        self.server.lock().open.remove(&self.id);
        Ok(())
    }
}
