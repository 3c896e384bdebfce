//! Shared fixtures for sync engine tests.

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::state::{Credentials, ImapAccount, ImportedMailId, MailboxState};
use super::{MailImporter, SyncEventListener, SyncEventType};
use crate::error::SyncError;
use crate::mail::types::{ImapMail, ImapMailbox, ImapMailboxStatus};

pub(crate) fn test_account() -> ImapAccount {
    ImapAccount {
        host: "imap.example.com".to_string(),
        port: 993,
        username: "me@example.com".to_string(),
        credentials: Credentials::Password("secret".to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Recorded {
    Mailbox(String, SyncEventType),
    Status(String),
    Mail(String, u32, SyncEventType),
    Postpone(DateTime<Utc>),
    Finish(u64),
    Error(SyncError),
}

#[derive(Debug, Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn mailbox_events(&self) -> Vec<(String, SyncEventType)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Mailbox(path, event) => Some((path, event)),
                _ => None,
            })
            .collect()
    }

    pub fn mails(&self) -> Vec<(String, u32, SyncEventType)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Mail(path, uid, event) => Some((path, uid, event)),
                _ => None,
            })
            .collect()
    }

    pub fn mails_with(&self, event: SyncEventType) -> usize {
        self.mails().iter().filter(|(_, _, e)| *e == event).count()
    }

    pub fn errors(&self) -> Vec<SyncError> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Error(error) => Some(error),
                _ => None,
            })
            .collect()
    }

    pub fn finished(&self) -> Option<u64> {
        self.events().into_iter().find_map(|e| match e {
            Recorded::Finish(bytes) => Some(bytes),
            _ => None,
        })
    }

    pub fn postponed(&self) -> Option<DateTime<Utc>> {
        self.events().into_iter().find_map(|e| match e {
            Recorded::Postpone(at) => Some(at),
            _ => None,
        })
    }

    fn push(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }
}

impl SyncEventListener for RecordingListener {
    fn on_mailbox(&self, mailbox: &ImapMailbox, event: SyncEventType) {
        self.push(Recorded::Mailbox(mailbox.path.clone(), event));
    }

    fn on_mailbox_status(&self, status: &ImapMailboxStatus) {
        self.push(Recorded::Status(status.path.clone()));
    }

    fn on_mail(&self, mail: &ImapMail, event: SyncEventType) {
        self.push(Recorded::Mail(mail.mailbox.clone(), mail.uid, event));
    }

    fn on_postpone(&self, resume_at: DateTime<Utc>) {
        self.push(Recorded::Postpone(resume_at));
    }

    fn on_finish(&self, downloaded_bytes: u64) {
        self.push(Recorded::Finish(downloaded_bytes));
    }

    fn on_error(&self, error: &SyncError) {
        self.push(Recorded::Error(error.clone()));
    }
}

/// Importer that hands out `path/uid` ids and can be told to reject UIDs.
#[derive(Debug, Default)]
pub(crate) struct RecordingImporter {
    imported: AtomicUsize,
    rejected_uids: Mutex<HashSet<u32>>,
}

impl RecordingImporter {
    pub fn rejecting(uids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            imported: AtomicUsize::new(0),
            rejected_uids: Mutex::new(uids.into_iter().collect()),
        }
    }

    pub fn imported(&self) -> usize {
        self.imported.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailImporter for RecordingImporter {
    async fn import_mail(
        &self,
        mail: &ImapMail,
        mailbox: &MailboxState,
    ) -> anyhow::Result<ImportedMailId> {
        if self.rejected_uids.lock().unwrap().contains(&mail.uid) {
            bail!("target store rejected message {}", mail.uid);
        }
        self.imported.fetch_add(1, Ordering::SeqCst);
        Ok(ImportedMailId(format!("{}/{}", mailbox.path, mail.uid)))
    }
}
