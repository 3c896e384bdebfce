//! A worker: one connection, one mailbox, walked block by block.
//!
//! The worker owns its mailbox for its whole lifetime and hands it back to
//! the session with exactly one [`ProcessEvent::Exited`], whatever the
//! outcome. The lock on the mailbox is released and the connection logged
//! out before that event is sent.

use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::fetch_range::FetchUidRange;
use super::optimizer::{
    DownloadBlockSizeOptimizer, ProcessEventSender, ProcessExit, ProcessId, ThroughputSample,
};
use super::state::{ImapAccount, SyncPlan};
use super::{MailImporter, SyncEventListener, SyncEventType, SyncSessionMailbox};
use crate::actor::Ticker;
use crate::error::{ImapError, SyncError};
use crate::mail::imap::{ImapConnection, ImapConnector, UidRange};
use crate::mail::parser::parse_mail;
use crate::mail::types::FetchedMessage;

/// Everything a worker shares with its session and siblings.
pub struct WorkerContext {
    pub account: ImapAccount,
    pub connector: Arc<dyn ImapConnector>,
    pub importer: Arc<dyn MailImporter>,
    pub listener: Arc<dyn SyncEventListener>,
    pub events: ProcessEventSender,
    pub block_size_difference: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Stopped,
    ConnectionFailed,
}

/// How a walk ended when no error interrupted it.
enum WalkEnd {
    Completed,
    Cancelled,
}

pub struct SyncSessionProcess {
    process_id: ProcessId,
    ctx: Arc<WorkerContext>,
    cancel: CancellationToken,
    state: ProcessState,
}

impl SyncSessionProcess {
    pub fn new(process_id: ProcessId, ctx: Arc<WorkerContext>, cancel: CancellationToken) -> Self {
        Self {
            process_id,
            ctx,
            cancel,
            state: ProcessState::NotStarted,
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Sync `mailbox` until it is walked completely, the worker is
    /// cancelled or the connection fails. Returns the final state.
    pub async fn start(&mut self, mailbox: SyncSessionMailbox) -> ProcessState {
        let path = mailbox.path().to_string();

        let mut conn = match self.ctx.connector.connect(&self.ctx.account).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Worker {} could not connect for {}: {}", self.process_id, path, e);
                self.state = ProcessState::ConnectionFailed;
                self.ctx.listener.on_error(&SyncError::Connection {
                    mailbox: path,
                    source: e,
                });
                self.ctx
                    .events
                    .exited(self.process_id, ProcessExit::ConnectionFailed, mailbox);
                return self.state;
            }
        };

        self.state = ProcessState::Running;
        tracing::debug!("Worker {} syncing {}", self.process_id, path);

        let mut optimizer =
            DownloadBlockSizeOptimizer::new(mailbox, self.ctx.block_size_difference);
        let result = self.walk(conn.as_mut(), &mut optimizer).await;

        if let Err(e) = conn.release_lock().await {
            tracing::debug!("Releasing {} failed: {}", path, e);
        }
        if let Err(e) = conn.logout().await {
            tracing::debug!("Logout of worker {} failed: {}", self.process_id, e);
        }

        let exit = match result {
            Ok(WalkEnd::Completed) => ProcessExit::Finished,
            Ok(WalkEnd::Cancelled) => ProcessExit::Stopped,
            Err(e) => {
                tracing::warn!("Worker {} failed in {}: {}", self.process_id, path, e);
                self.ctx.listener.on_error(&SyncError::Fetch {
                    mailbox: path,
                    source: e,
                });
                ProcessExit::Failed
            }
        };

        self.state = ProcessState::Stopped;
        self.ctx
            .events
            .exited(self.process_id, exit, optimizer.into_mailbox());
        self.state
    }

    async fn walk(
        &self,
        conn: &mut dyn ImapConnection,
        optimizer: &mut DownloadBlockSizeOptimizer,
    ) -> Result<WalkEnd, ImapError> {
        let path = optimizer.mailbox().path().to_string();

        let status = conn.status(&path).await?;
        let plan = optimizer.mailbox_mut().state_mut().apply_status(&status);
        optimizer.mailbox_mut().init(status.message_count);
        self.ctx.listener.on_mailbox_status(&status);

        if self.cancel.is_cancelled() {
            return Ok(WalkEnd::Cancelled);
        }
        conn.lock_mailbox(&path).await?;
        tracing::debug!(
            "Walking {} ({:?} messages, plan {:?})",
            path,
            status.message_count,
            plan
        );

        let mut ticker = Ticker::new(optimizer.period(), CancellationToken::new());
        let mut failed = BTreeSet::new();
        let mut ranges = FetchUidRange::new(status.message_count, status.uid_next);
        let mut next = ranges
            .init(conn, plan, optimizer.mailbox().download_block_size())
            .await?;

        while let Some(range) = next {
            if self.cancel.is_cancelled() {
                return Ok(WalkEnd::Cancelled);
            }
            if let WalkEnd::Cancelled = self
                .fetch_range(conn, optimizer, &mut ticker, range, plan, &mut failed)
                .await?
            {
                return Ok(WalkEnd::Cancelled);
            }
            next = ranges
                .advance(conn, optimizer.mailbox().download_block_size())
                .await?;
        }

        let state = optimizer.mailbox_mut().state_mut();
        state.retain_failures(&failed);
        state.commit_mod_seq(status.highest_mod_seq);
        Ok(WalkEnd::Completed)
    }

    /// Fetch one window. A cancellation observed mid-batch drains the rest
    /// of the batch without processing it; the drained bytes still count
    /// against the quota.
    async fn fetch_range(
        &self,
        conn: &mut dyn ImapConnection,
        optimizer: &mut DownloadBlockSizeOptimizer,
        ticker: &mut Ticker,
        range: UidRange,
        plan: SyncPlan,
        failed: &mut BTreeSet<u32>,
    ) -> Result<WalkEnd, ImapError> {
        let mut stream = conn.fetch(range, plan.changed_since()).await?;
        let mut last_arrival = Instant::now();
        let mut cancelled = false;
        let mut drained_bytes = 0u64;

        loop {
            tokio::select! {
                true = ticker.tick() => {
                    optimizer.optimize();
                }
                item = stream.next() => {
                    let Some(item) = item else { break };
                    let fetched = item?;
                    if cancelled || self.cancel.is_cancelled() {
                        cancelled = true;
                        drained_bytes += fetched.source.as_ref().map_or(0, |s| s.len() as u64);
                        continue;
                    }
                    let now = Instant::now();
                    let elapsed_ms = now.duration_since(last_arrival).as_millis().max(1) as f64;
                    last_arrival = now;
                    let outcome = self.handle_message(optimizer, fetched, now, elapsed_ms).await;
                    if let Some(uid) = outcome {
                        failed.insert(uid);
                    }
                }
            }
        }

        if drained_bytes > 0 {
            let now = Instant::now();
            let elapsed_ms = now.duration_since(last_arrival).as_millis().max(1) as f64;
            tracing::debug!(
                "Worker {} drained {} bytes after cancellation",
                self.process_id,
                drained_bytes
            );
            self.ctx.events.download_update(
                self.process_id,
                optimizer.mailbox().report(),
                ThroughputSample {
                    at: now,
                    throughput: drained_bytes as f64 / elapsed_ms,
                },
                drained_bytes,
            );
        }

        Ok(if cancelled {
            WalkEnd::Cancelled
        } else {
            WalkEnd::Completed
        })
    }

    /// Import or classify one message. Returns the UID if it could not be
    /// imported.
    async fn handle_message(
        &self,
        optimizer: &mut DownloadBlockSizeOptimizer,
        fetched: FetchedMessage,
        now: Instant,
        elapsed_ms: f64,
    ) -> Option<u32> {
        let mailbox = optimizer.mailbox_mut();
        let uid = fetched.uid;
        let Some(bytes) = fetched.source.as_ref().map(|s| s.len() as u64) else {
            self.ctx.listener.on_error(&SyncError::MissingSource {
                mailbox: mailbox.path().to_string(),
                uid,
            });
            mailbox.state_mut().record_failure(uid);
            return Some(uid);
        };

        let throughput = bytes as f64 / elapsed_ms;
        mailbox.report_throughput(now, throughput);

        let mut failed = None;
        match parse_mail(mailbox.path(), fetched) {
            Ok(mail) => {
                let event = if mailbox.state().is_imported(mail.uid) {
                    Some(SyncEventType::Update)
                } else {
                    match self.ctx.importer.import_mail(&mail, mailbox.state()).await {
                        Ok(id) => {
                            mailbox.state_mut().record_import(mail.uid, id);
                            Some(SyncEventType::Create)
                        }
                        Err(e) => {
                            self.ctx.listener.on_error(&SyncError::Import {
                                mailbox: mail.mailbox.clone(),
                                uid: mail.uid,
                                reason: format!("{:#}", e),
                            });
                            failed = Some(mail.uid);
                            None
                        }
                    }
                };
                if let Some(event) = event {
                    self.ctx.listener.on_mail(&mail, event);
                }
            }
            Err(e) => {
                self.ctx.listener.on_error(&e);
                failed = Some(uid);
            }
        }
        if let Some(uid) = failed {
            mailbox.state_mut().record_failure(uid);
        }

        self.ctx.events.download_update(
            self.process_id,
            mailbox.report(),
            ThroughputSample { at: now, throughput },
            bytes,
        );
        failed
    }
}
