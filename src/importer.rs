//! Import surface of the engine.
//!
//! [`ImapImporter`] wraps a [`SyncSession`] of one account and keeps its
//! checkpoint in the [`StateStore`], so an import can be paused, resumed
//! after a restart, postponed by the download quota and deleted.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::cache::StateStore;
use crate::config::SyncConfig;
use crate::constants::CHECKPOINT_INTERVAL_SECS;
use crate::error::SyncError;
use crate::mail::imap::ImapConnector;
use crate::mail::types::{ImapMail, ImapMailbox, ImapMailboxStatus};
use crate::sync::state::ImapAccount;
use crate::sync::{
    MailImporter, SyncEventListener, SyncEventType, SyncSession, SyncSessionState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    Running,
    Paused,
    /// Quota reached; see [`ImapImporter::postponed_until`].
    Postponed,
}

impl From<SyncSessionState> for ImportState {
    fn from(state: SyncSessionState) -> Self {
        match state {
            SyncSessionState::Running => ImportState::Running,
            SyncSessionState::Postponed => ImportState::Postponed,
            SyncSessionState::Paused | SyncSessionState::Finished => ImportState::Paused,
        }
    }
}

/// Outcome of the current run, filled in by the session's events.
#[derive(Debug, Default)]
struct RunOutcome {
    postponed_until: Option<DateTime<Utc>>,
    downloaded_bytes: u64,
}

/// Forwards session events and remembers how the run ended.
struct ImportEventListener {
    inner: Arc<dyn SyncEventListener>,
    outcome: Mutex<RunOutcome>,
}

impl ImportEventListener {
    fn outcome(&self) -> std::sync::MutexGuard<'_, RunOutcome> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SyncEventListener for ImportEventListener {
    fn on_mailbox(&self, mailbox: &ImapMailbox, event: SyncEventType) {
        self.inner.on_mailbox(mailbox, event);
    }

    fn on_mailbox_status(&self, status: &ImapMailboxStatus) {
        self.inner.on_mailbox_status(status);
    }

    fn on_mail(&self, mail: &ImapMail, event: SyncEventType) {
        self.inner.on_mail(mail, event);
    }

    fn on_postpone(&self, resume_at: DateTime<Utc>) {
        self.outcome().postponed_until = Some(resume_at);
        self.inner.on_postpone(resume_at);
    }

    fn on_finish(&self, downloaded_bytes: u64) {
        {
            let mut outcome = self.outcome();
            outcome.postponed_until = None;
            outcome.downloaded_bytes = downloaded_bytes;
        }
        self.inner.on_finish(downloaded_bytes);
    }

    fn on_error(&self, error: &SyncError) {
        self.inner.on_error(error);
    }
}

pub struct ImapImporter {
    store: Arc<StateStore>,
    account_id: String,
    session: SyncSession,
    listener: Arc<ImportEventListener>,
    checkpoint_interval: Duration,
}

impl ImapImporter {
    /// Load the stored checkpoint of `account` and prepare a paused import.
    pub async fn new(
        store: Arc<StateStore>,
        account: ImapAccount,
        max_quota: u64,
        connector: Arc<dyn ImapConnector>,
        importer: Arc<dyn MailImporter>,
        config: SyncConfig,
        listener: Arc<dyn SyncEventListener>,
    ) -> Result<Self> {
        let account_id = account.id();
        let sync_state = store
            .load(&account, max_quota)
            .await
            .with_context(|| format!("Failed to load import state of {}", account_id))?;
        let stored = store.stored_import(&account_id).await?;

        tracing::info!(
            "Loaded import of {}: {} mailboxes, {} mails imported",
            account_id,
            sync_state.mailbox_states.len(),
            sync_state.imported_count()
        );

        let outcome = RunOutcome {
            postponed_until: stored.as_ref().and_then(|s| s.postponed_until),
            downloaded_bytes: stored.map(|s| s.downloaded_bytes).unwrap_or_default(),
        };

        Ok(Self {
            store,
            account_id,
            session: SyncSession::new(sync_state, connector, importer, config),
            listener: Arc::new(ImportEventListener {
                inner: listener,
                outcome: Mutex::new(outcome),
            }),
            checkpoint_interval: Duration::from_secs(CHECKPOINT_INTERVAL_SECS),
        })
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn state(&self) -> ImportState {
        self.session.state().into()
    }

    /// When a postponed import may continue.
    pub fn postponed_until(&self) -> Option<DateTime<Utc>> {
        self.listener.outcome().postponed_until
    }

    pub fn imported_count(&self) -> usize {
        self.session.sync_state().imported_count()
    }

    /// Start or resume the import.
    ///
    /// A postponed import stays postponed until its resume time passed.
    pub async fn continue_import(&mut self) -> Result<ImportState> {
        if self.session.state() == SyncSessionState::Running {
            return Ok(ImportState::Running);
        }
        if let Some(until) = self.postponed_until()
            && until > Utc::now()
        {
            tracing::info!("Import of {} postponed until {}", self.account_id, until);
            return Ok(ImportState::Postponed);
        }

        self.listener.outcome().postponed_until = None;
        self.store
            .set_run_outcome(&self.account_id, None, 0)
            .await?;
        Ok(self.session.start(self.listener.clone()).into())
    }

    /// Stop all workers and checkpoint what they imported.
    pub async fn pause_import(&mut self) -> Result<ImportState> {
        let state = self.session.stop().await;
        self.finish_run().await?;
        Ok(state.into())
    }

    /// Wait until the running import finishes or is postponed, checkpointing
    /// the sync state along the way.
    pub async fn wait_for_completion(&mut self) -> Result<ImportState> {
        let mut state_rx = self.session.subscribe();
        let mut interval = tokio::time::interval(self.checkpoint_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                result = async {
                    state_rx
                        .wait_for(|s| *s != SyncSessionState::Running)
                        .await
                        .map(|_| ())
                } => {
                    if result.is_err() {
                        tracing::warn!("Sync session state channel closed");
                    }
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.checkpoint().await {
                        tracing::warn!("Checkpoint of {} failed: {:#}", self.account_id, e);
                    }
                }
            }
        }

        let state = self.session.wait().await;
        self.finish_run().await?;
        Ok(state.into())
    }

    /// Stop the import and forget its stored state.
    pub async fn delete_import(mut self) -> Result<()> {
        self.session.stop().await;
        self.store
            .delete_account(&self.account_id)
            .await
            .with_context(|| format!("Failed to delete import of {}", self.account_id))?;
        tracing::info!("Deleted import of {}", self.account_id);
        Ok(())
    }

    async fn checkpoint(&self) -> Result<()> {
        self.store.save(&self.session.sync_state()).await
    }

    async fn finish_run(&self) -> Result<()> {
        self.checkpoint()
            .await
            .with_context(|| format!("Failed to save import state of {}", self.account_id))?;
        let (postponed_until, downloaded_bytes) = {
            let outcome = self.listener.outcome();
            (outcome.postponed_until, outcome.downloaded_bytes)
        };
        self.store
            .set_run_outcome(&self.account_id, postponed_until, downloaded_bytes)
            .await
    }
}
