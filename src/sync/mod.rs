//! Adaptive sync engine.
//!
//! This module is split into:
//! - `state.rs` - Durable account and mailbox cursors
//! - `mailbox.rs` - Runtime mailbox wrapper with efficiency scores
//! - `fetch_range.rs` - UID windows walked by a worker
//! - `process.rs` - Worker owning one connection and one mailbox
//! - `optimizer/` - Block size and parallelism control loops
//! - `session.rs` - Discovery, reconciliation and worker supervision

pub mod fetch_range;
pub mod mailbox;
pub mod optimizer;
pub mod process;
pub mod session;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SyncError;
use crate::mail::types::{ImapMail, ImapMailbox, ImapMailboxStatus};
use state::{ImportedMailId, MailboxState};

pub use mailbox::{Importance, SyncSessionMailbox};
pub use session::{SyncSession, SyncSessionState};
pub use state::{Credentials, ImapAccount, ImapSyncState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEventType {
    Create,
    Update,
    Delete,
}

/// Receives everything a session discovers and downloads.
///
/// Called from worker tasks, so implementations must be cheap and must
/// not block.
pub trait SyncEventListener: Send + Sync {
    fn on_mailbox(&self, mailbox: &ImapMailbox, event: SyncEventType);

    fn on_mailbox_status(&self, status: &ImapMailboxStatus);

    fn on_mail(&self, mail: &ImapMail, event: SyncEventType);

    /// Quota reached; the import may continue at `resume_at`.
    fn on_postpone(&self, resume_at: DateTime<Utc>);

    fn on_finish(&self, downloaded_bytes: u64);

    fn on_error(&self, error: &SyncError);
}

/// Persists a new mail into the target store.
#[async_trait]
pub trait MailImporter: Send + Sync {
    async fn import_mail(
        &self,
        mail: &ImapMail,
        mailbox: &MailboxState,
    ) -> anyhow::Result<ImportedMailId>;
}
