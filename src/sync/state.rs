//! Durable sync state: account, per-mailbox cursors and imported UIDs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::mail::types::ImapMailboxStatus;

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password(String),
    /// OAuth2 access token, sent with XOAUTH2.
    AccessToken(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(***)"),
            Credentials::AccessToken(_) => f.write_str("AccessToken(***)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapAccount {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
}

impl ImapAccount {
    /// Key under which the account's state is stored.
    pub fn id(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Identifier the importer assigned to a mail in the target store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImportedMailId(pub String);

impl fmt::Display for ImportedMailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a worker walks a mailbox after comparing stored and server status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPlan {
    /// Every message from sequence 1.
    Full,
    /// Every message from sequence 1 whose mod-sequence is above `since`.
    Changes { since: u64 },
    /// Only messages with a UID above `after_uid`.
    Resume { after_uid: u32 },
}

impl SyncPlan {
    pub fn changed_since(&self) -> Option<u64> {
        match self {
            SyncPlan::Changes { since } => Some(*since),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxState {
    pub path: String,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
    pub highest_mod_seq: Option<u64>,
    imported_uid_to_mail_map: BTreeMap<u32, ImportedMailId>,
    /// UIDs that were fetched but could not be imported.
    failed_uids: BTreeSet<u32>,
}

impl MailboxState {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            uid_validity: None,
            uid_next: None,
            highest_mod_seq: None,
            imported_uid_to_mail_map: BTreeMap::new(),
            failed_uids: BTreeSet::new(),
        }
    }

    pub fn with_imported(
        mut self,
        imported: impl IntoIterator<Item = (u32, ImportedMailId)>,
    ) -> Self {
        self.imported_uid_to_mail_map.extend(imported);
        self
    }

    pub fn with_failed(mut self, failed: impl IntoIterator<Item = u32>) -> Self {
        self.failed_uids.extend(failed);
        self
    }

    pub fn is_imported(&self, uid: u32) -> bool {
        self.imported_uid_to_mail_map.contains_key(&uid)
    }

    pub fn imported_mail(&self, uid: u32) -> Option<&ImportedMailId> {
        self.imported_uid_to_mail_map.get(&uid)
    }

    pub fn imported(&self) -> &BTreeMap<u32, ImportedMailId> {
        &self.imported_uid_to_mail_map
    }

    pub fn imported_count(&self) -> usize {
        self.imported_uid_to_mail_map.len()
    }

    pub fn last_imported_uid(&self) -> Option<u32> {
        self.imported_uid_to_mail_map.keys().next_back().copied()
    }

    /// Record an imported mail. Existing entries are never rewritten;
    /// returns false if the UID was already recorded.
    pub fn record_import(&mut self, uid: u32, id: ImportedMailId) -> bool {
        self.failed_uids.remove(&uid);
        match self.imported_uid_to_mail_map.entry(uid) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(id);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    /// Remember a UID whose import failed so the next walk retries it.
    pub fn record_failure(&mut self, uid: u32) {
        if !self.is_imported(uid) {
            self.failed_uids.insert(uid);
        }
    }

    pub fn failed_uids(&self) -> &BTreeSet<u32> {
        &self.failed_uids
    }

    /// After a completed walk, keep only the failures that walk saw again.
    /// The others were imported or are gone from the server.
    pub fn retain_failures(&mut self, failed_in_walk: &BTreeSet<u32>) {
        self.failed_uids.retain(|uid| failed_in_walk.contains(uid));
    }

    /// Take over a fresh STATUS and decide how to walk the mailbox.
    ///
    /// A changed UIDVALIDITY invalidates every recorded UID. The server's
    /// HIGHESTMODSEQ is not stored here; it is committed with
    /// [`commit_mod_seq`](Self::commit_mod_seq) once the walk completed.
    /// Failed UIDs pull the walk back to the first of them.
    pub fn apply_status(&mut self, status: &ImapMailboxStatus) -> SyncPlan {
        if let (Some(known), Some(server)) = (self.uid_validity, status.uid_validity)
            && known != server
        {
            tracing::info!(
                "UIDVALIDITY of {} changed ({} -> {}), resyncing {} messages",
                self.path,
                known,
                server,
                self.imported_uid_to_mail_map.len()
            );
            self.imported_uid_to_mail_map.clear();
            self.failed_uids.clear();
            self.highest_mod_seq = None;
        }

        self.uid_validity = status.uid_validity.or(self.uid_validity);
        self.uid_next = status.uid_next.or(self.uid_next);

        let Some(after_uid) = self.last_imported_uid() else {
            return SyncPlan::Full;
        };

        let changed = match (self.highest_mod_seq, status.highest_mod_seq) {
            (Some(stored), Some(server)) if server > stored => Some(stored),
            _ => None,
        };

        match (self.failed_uids.first(), changed) {
            // A CHANGEDSINCE pass would not return the failed messages
            (Some(_), Some(_)) => SyncPlan::Full,
            (Some(&first_failed), None) => SyncPlan::Resume {
                after_uid: first_failed.saturating_sub(1).min(after_uid),
            },
            (None, Some(since)) => SyncPlan::Changes { since },
            (None, None) => SyncPlan::Resume { after_uid },
        }
    }

    pub fn commit_mod_seq(&mut self, highest_mod_seq: Option<u64>) {
        if highest_mod_seq.is_some() {
            self.highest_mod_seq = highest_mod_seq;
        }
    }
}

/// Everything needed to continue an import of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapSyncState {
    pub account: ImapAccount,
    /// Bytes a single session may download before it is postponed.
    pub max_quota: u64,
    pub mailbox_states: BTreeMap<String, MailboxState>,
}

impl ImapSyncState {
    pub fn new(account: ImapAccount, max_quota: u64) -> Self {
        Self {
            account,
            max_quota,
            mailbox_states: BTreeMap::new(),
        }
    }

    pub fn with_mailbox_states(mut self, states: impl IntoIterator<Item = MailboxState>) -> Self {
        for state in states {
            self.mailbox_states.insert(state.path.clone(), state);
        }
        self
    }

    pub fn mailbox_state(&self, path: &str) -> Option<&MailboxState> {
        self.mailbox_states.get(path)
    }

    /// Replace the stored state of a mailbox with a newer checkpoint.
    pub fn checkpoint(&mut self, state: MailboxState) {
        self.mailbox_states.insert(state.path.clone(), state);
    }

    pub fn imported_count(&self) -> usize {
        self.mailbox_states
            .values()
            .map(MailboxState::imported_count)
            .sum()
    }
}
