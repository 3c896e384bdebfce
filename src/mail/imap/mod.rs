//! IMAP connection layer used by the sync engine.
//!
//! This module is split into:
//! - `mod.rs` - Connector/connection traits, range and position types
//! - `client.rs` - async-imap implementation over tokio-rustls
//! - `mock.rs` - In-memory server for tests

mod client;
#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ImapError;
use crate::mail::types::{FetchedMessage, ImapMailbox, ImapMailboxStatus};
use crate::sync::state::ImapAccount;

pub use client::AsyncImapConnector;

/// Inclusive UID window for a UID FETCH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidRange {
    pub from: u32,
    pub to: u32,
}

impl UidRange {
    pub fn new(from: u32, to: u32) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, uid: u32) -> bool {
        (self.from..=self.to).contains(&uid)
    }
}

impl fmt::Display for UidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.to == u32::MAX {
            write!(f, "{}:*", self.from)
        } else {
            write!(f, "{}:{}", self.from, self.to)
        }
    }
}

/// Sequence number and UID of one message in the locked mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePosition {
    pub seq: u32,
    pub uid: u32,
}

/// Opens authenticated connections for an account.
#[async_trait]
pub trait ImapConnector: Send + Sync {
    async fn connect(&self, account: &ImapAccount) -> Result<Box<dyn ImapConnection>, ImapError>;
}

/// One authenticated IMAP connection.
///
/// Message lookups and fetches operate on the mailbox locked with
/// [`lock_mailbox`](ImapConnection::lock_mailbox).
#[async_trait]
pub trait ImapConnection: Send {
    /// Full mailbox tree of the account.
    async fn list_tree(&mut self) -> Result<Vec<ImapMailbox>, ImapError>;

    async fn status(&mut self, path: &str) -> Result<ImapMailboxStatus, ImapError>;

    /// Open the mailbox read-only (EXAMINE).
    async fn lock_mailbox(&mut self, path: &str) -> Result<(), ImapError>;

    async fn release_lock(&mut self) -> Result<(), ImapError>;

    /// Message at sequence number `seq`, if it exists.
    async fn message_at(&mut self, seq: u32) -> Result<Option<MessagePosition>, ImapError>;

    /// Lowest-UID message whose UID is at least `uid`.
    async fn first_message_from_uid(
        &mut self,
        uid: u32,
    ) -> Result<Option<MessagePosition>, ImapError>;

    /// UID FETCH of a window, optionally restricted to messages whose
    /// mod-sequence is above `changed_since`.
    async fn fetch(
        &mut self,
        range: UidRange,
        changed_since: Option<u64>,
    ) -> Result<BoxStream<'_, Result<FetchedMessage, ImapError>>, ImapError>;

    async fn logout(&mut self) -> Result<(), ImapError>;
}

/// XOAUTH2 authenticator for IMAP
pub(crate) struct XOAuth2Authenticator {
    pub user: String,
    pub access_token: String,
}

impl async_imap::Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// Nest a flat LIST result into a tree using each mailbox's delimiter.
///
/// Mailboxes whose parent was not listed become roots.
pub fn build_mailbox_tree(flat: Vec<ImapMailbox>) -> Vec<ImapMailbox> {
    let parent_of = |mailbox: &ImapMailbox| -> Option<String> {
        let delimiter = mailbox.delimiter.as_deref().filter(|d| !d.is_empty())?;
        mailbox
            .path
            .rsplit_once(delimiter)
            .map(|(parent, _)| parent.to_string())
    };

    let mut depth_order: Vec<(usize, String)> = flat
        .iter()
        .map(|m| {
            let depth = m
                .delimiter
                .as_deref()
                .filter(|d| !d.is_empty())
                .map(|d| m.path.matches(d).count())
                .unwrap_or(0);
            (depth, m.path.clone())
        })
        .collect();
    depth_order.sort_by(|a, b| b.0.cmp(&a.0));

    let mut nodes: BTreeMap<String, ImapMailbox> =
        flat.into_iter().map(|m| (m.path.clone(), m)).collect();

    for (_, path) in depth_order {
        let Some(parent) = nodes.get(&path).and_then(|m| parent_of(m)) else {
            continue;
        };
        if parent == path || !nodes.contains_key(&parent) {
            continue;
        }
        if let Some(node) = nodes.remove(&path)
            && let Some(parent_node) = nodes.get_mut(&parent)
        {
            parent_node.children.push(node);
        }
    }

    let mut roots: Vec<ImapMailbox> = nodes.into_values().collect();
    sort_tree(&mut roots);
    roots
}

fn sort_tree(nodes: &mut [ImapMailbox]) {
    nodes.sort_by(|a, b| a.path.cmp(&b.path));
    for node in nodes {
        sort_tree(&mut node.children);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox(path: &str) -> ImapMailbox {
        ImapMailbox {
            delimiter: Some("/".to_string()),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            ..ImapMailbox::new(path)
        }
    }

    #[test]
    fn test_build_mailbox_tree_nests_children() {
        let flat = vec![
            mailbox("Work/2024/Q1"),
            mailbox("INBOX"),
            mailbox("Work"),
            mailbox("Work/2024"),
            mailbox("Work/2023"),
        ];

        let tree = build_mailbox_tree(flat);

        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].path, "INBOX");
        assert_eq!(tree[1].path, "Work");
        let years: Vec<_> = tree[1].children.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(years, vec!["Work/2023", "Work/2024"]);
        assert_eq!(tree[1].children[1].children[0].path, "Work/2024/Q1");
    }

    #[test]
    fn test_orphans_become_roots() {
        let tree = build_mailbox_tree(vec![mailbox("Lists/rust"), mailbox("INBOX")]);
        let roots: Vec<_> = tree.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(roots, vec!["INBOX", "Lists/rust"]);
    }

    #[test]
    fn test_uid_range_display() {
        assert_eq!(UidRange::new(1, 50).to_string(), "1:50");
        assert_eq!(UidRange::new(7, u32::MAX).to_string(), "7:*");
        assert!(UidRange::new(1, 50).contains(50));
        assert!(!UidRange::new(1, 50).contains(51));
    }
}
