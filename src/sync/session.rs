//! Sync session: discovers the mailbox tree, reconciles it with the stored
//! state and supervises workers until every mailbox is done, the download
//! quota is reached or the session is stopped.
//!
//! The session runs as an actor task. [`SyncSession`] is its handle; the
//! worker pool and the parallel optimizer live inside the task and are
//! driven by a [`tokio::select!`] loop over commands, optimizer ticks and
//! worker events.

use chrono::{TimeDelta, Utc};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::optimizer::{
    ParallelProcessOptimizer, ProcessEvent, ProcessEventSender, ProcessId,
    SyncSessionEventListener,
};
use super::process::{SyncSessionProcess, WorkerContext};
use super::state::{ImapSyncState, MailboxState};
use super::{MailImporter, SyncEventListener, SyncEventType, SyncSessionMailbox};
use crate::actor::{RetryConfig, Ticker, with_retry};
use crate::config::SyncConfig;
use crate::constants::SESSION_COMMAND_CAPACITY;
use crate::error::{ImapError, SyncError};
use crate::mail::imap::ImapConnector;
use crate::mail::types::ImapMailbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSessionState {
    Paused,
    Running,
    /// Quota reached; continue after the announced resume time.
    Postponed,
    Finished,
}

#[derive(Debug)]
enum SessionCommand {
    Stop,
}

struct RunningSession {
    cmd_tx: mpsc::Sender<SessionCommand>,
    task: JoinHandle<()>,
}

/// Handle to a sync session of one account.
pub struct SyncSession {
    connector: Arc<dyn ImapConnector>,
    importer: Arc<dyn MailImporter>,
    config: SyncConfig,
    sync_state: Arc<Mutex<ImapSyncState>>,
    state_tx: watch::Sender<SyncSessionState>,
    running: Option<RunningSession>,
}

impl SyncSession {
    pub fn new(
        sync_state: ImapSyncState,
        connector: Arc<dyn ImapConnector>,
        importer: Arc<dyn MailImporter>,
        config: SyncConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SyncSessionState::Paused);
        Self {
            connector,
            importer,
            config,
            sync_state: Arc::new(Mutex::new(sync_state)),
            state_tx,
            running: None,
        }
    }

    pub fn state(&self) -> SyncSessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSessionState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of the state as of the last worker checkpoint.
    pub fn sync_state(&self) -> ImapSyncState {
        lock_state(&self.sync_state).clone()
    }

    /// Start syncing. Does nothing if the session is already running.
    pub fn start(&mut self, listener: Arc<dyn SyncEventListener>) -> SyncSessionState {
        if self.state() == SyncSessionState::Running {
            tracing::debug!("Sync session already running");
            return SyncSessionState::Running;
        }

        let (account, max_quota) = {
            let state = lock_state(&self.sync_state);
            (state.account.clone(), state.max_quota)
        };
        tracing::info!("Starting sync session for {}", account.id());

        let (events, events_rx) = ProcessEventSender::channel();
        let ctx = Arc::new(WorkerContext {
            account,
            connector: self.connector.clone(),
            importer: self.importer.clone(),
            listener,
            events,
            block_size_difference: self.config.block_size_optimization_difference,
        });
        let (cmd_tx, cmd_rx) = mpsc::channel(SESSION_COMMAND_CAPACITY);

        let actor = SessionActor {
            ctx,
            config: self.config.clone(),
            quota_limit: max_quota.saturating_sub(self.config.quota_safety_threshold),
            sync_state: self.sync_state.clone(),
            state_tx: self.state_tx.clone(),
            cmd_rx,
            events: events_rx,
        };

        self.state_tx.send_replace(SyncSessionState::Running);
        let task = tokio::spawn(actor.run());
        self.running = Some(RunningSession { cmd_tx, task });
        SyncSessionState::Running
    }

    /// Stop all workers and wait until they handed their mailboxes back.
    ///
    /// The session ends up `Paused` unless it already ended on its own.
    pub async fn stop(&mut self) -> SyncSessionState {
        if let Some(running) = &self.running {
            running.cmd_tx.send(SessionCommand::Stop).await.ok();
        }
        self.wait().await
    }

    /// Wait for the session task to end on its own.
    pub async fn wait(&mut self) -> SyncSessionState {
        if let Some(running) = self.running.take()
            && let Err(e) = running.task.await
        {
            tracing::error!("Sync session task failed: {}", e);
            self.state_tx.send_replace(SyncSessionState::Paused);
        }
        self.state()
    }
}

fn lock_state(state: &Mutex<ImapSyncState>) -> MutexGuard<'_, ImapSyncState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bytes downloaded in this session against the postpone limit.
#[derive(Debug, Clone, Copy)]
struct DownloadQuota {
    limit: u64,
    downloaded: u64,
}

impl DownloadQuota {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            downloaded: 0,
        }
    }

    /// Count `bytes`; true once the limit is exceeded.
    fn add(&mut self, bytes: u64) -> bool {
        self.downloaded = self.downloaded.saturating_add(bytes);
        self.downloaded > self.limit
    }
}

/// How the supervision loop ended.
enum SessionEnd {
    Finished,
    Postponed,
    Stopped,
}

struct SessionActor {
    ctx: Arc<WorkerContext>,
    config: SyncConfig,
    quota_limit: u64,
    sync_state: Arc<Mutex<ImapSyncState>>,
    state_tx: watch::Sender<SyncSessionState>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl SessionActor {
    async fn run(mut self) {
        let mut core = SessionCore {
            ctx: self.ctx.clone(),
            session_cancel: CancellationToken::new(),
            workers: JoinSet::new(),
            cancels: HashMap::new(),
            quota: DownloadQuota::new(self.quota_limit),
            postpone: false,
            all_finished: false,
        };

        let end = self.sync(&mut core).await;
        let listener = &self.ctx.listener;
        let state = match end {
            SessionEnd::Finished => {
                tracing::info!(
                    "Sync session finished, {} bytes downloaded",
                    core.quota.downloaded
                );
                listener.on_finish(core.quota.downloaded);
                SyncSessionState::Finished
            }
            SessionEnd::Postponed => {
                let delay = i64::try_from(self.config.postpone_delay_secs)
                    .ok()
                    .and_then(TimeDelta::try_seconds)
                    .unwrap_or(TimeDelta::days(1));
                let resume_at = Utc::now() + delay;
                tracing::info!(
                    "Download quota reached after {} bytes, postponing until {}",
                    core.quota.downloaded,
                    resume_at
                );
                listener.on_postpone(resume_at);
                SyncSessionState::Postponed
            }
            SessionEnd::Stopped => {
                tracing::info!("Sync session stopped");
                SyncSessionState::Paused
            }
        };
        self.state_tx.send_replace(state);
    }

    async fn sync(&mut self, core: &mut SessionCore) -> SessionEnd {
        let tree = tokio::select! {
            _ = self.cmd_rx.recv() => return SessionEnd::Stopped,
            result = discover(&self.ctx, &self.config.discovery_retry) => match result {
                Ok(tree) => tree,
                Err(e) => {
                    tracing::error!("Mailbox discovery failed: {}", e);
                    self.ctx.listener.on_error(&SyncError::Discovery(e));
                    return SessionEnd::Stopped;
                }
            },
        };

        let mailboxes = self.reconcile(&tree);
        let mut optimizer = ParallelProcessOptimizer::new(mailboxes, &self.config);
        if optimizer.idle_count() == 0 {
            return SessionEnd::Finished;
        }

        let mut ticker = Ticker::immediate(
            self.config.optimization_interval(),
            core.session_cancel.child_token(),
        );

        let end = loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Stop) | None => break SessionEnd::Stopped,
                },
                Some(event) = self.events.recv() => {
                    self.handle_event(event, &mut optimizer, core);
                }
                true = ticker.tick() => {
                    optimizer.optimize(Instant::now(), core);
                }
                Some(joined) = core.workers.join_next(), if !core.workers.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Worker task ended abnormally: {}", e);
                    }
                }
            }

            if core.postpone {
                break SessionEnd::Postponed;
            }
            if core.all_finished {
                break SessionEnd::Finished;
            }
        };

        ticker.stop();
        optimizer.stop(core);
        // Every worker hands its mailbox back exactly once
        while !optimizer.is_quiescent() {
            match self.events.recv().await {
                Some(event) => self.handle_event(event, &mut optimizer, core),
                None => break,
            }
        }
        while core.workers.join_next().await.is_some() {}

        end
    }

    /// Bring the stored mailbox states in line with the server tree and
    /// build the session mailboxes.
    fn reconcile(&self, tree: &[ImapMailbox]) -> Vec<SyncSessionMailbox> {
        let nodes: Vec<&ImapMailbox> = tree.iter().flat_map(|root| root.walk()).collect();
        let discovered: HashSet<&str> = nodes.iter().map(|n| n.path.as_str()).collect();
        let listener = &self.ctx.listener;
        let mut state = lock_state(&self.sync_state);

        let removed: Vec<String> = state
            .mailbox_states
            .keys()
            .filter(|path| !discovered.contains(path.as_str()))
            .cloned()
            .collect();
        for path in removed {
            tracing::info!("Mailbox {} no longer exists on the server", path);
            state.mailbox_states.remove(&path);
            listener.on_mailbox(&ImapMailbox::new(path), SyncEventType::Delete);
        }

        let mut mailboxes = Vec::with_capacity(nodes.len());
        for node in nodes {
            let mailbox_state = match state.mailbox_states.get(&node.path) {
                Some(known) => known.clone(),
                None => {
                    let fresh = MailboxState::new(node.path.clone());
                    state.checkpoint(fresh.clone());
                    listener.on_mailbox(node, SyncEventType::Create);
                    fresh
                }
            };
            mailboxes.push(SyncSessionMailbox::new(
                mailbox_state,
                node.special_use,
                node.selectable,
                &self.config,
            ));
        }

        tracing::info!(
            "Discovered {} mailboxes, {} to sync",
            mailboxes.len(),
            mailboxes.iter().filter(|m| m.is_syncable()).count()
        );
        mailboxes
    }

    fn handle_event(
        &self,
        event: ProcessEvent,
        optimizer: &mut ParallelProcessOptimizer,
        core: &mut SessionCore,
    ) {
        match event {
            ProcessEvent::DownloadUpdate {
                process_id,
                report,
                sample,
                downloaded_bytes,
            } => optimizer.on_download_update(process_id, report, sample, downloaded_bytes, core),
            ProcessEvent::Exited {
                process_id,
                exit,
                mailbox,
            } => {
                tracing::debug!("Worker {} for {} exited: {:?}", process_id, mailbox.path(), exit);
                lock_state(&self.sync_state).checkpoint(mailbox.state().clone());
                core.cancels.remove(&process_id);
                optimizer.on_process_exit(process_id, exit, *mailbox, core);
            }
            ProcessEvent::Lost { process_id } => {
                core.cancels.remove(&process_id);
                optimizer.on_process_lost(process_id, core);
            }
        }
    }
}

/// Worker pool the parallel optimizer drives.
struct SessionCore {
    ctx: Arc<WorkerContext>,
    session_cancel: CancellationToken,
    workers: JoinSet<()>,
    cancels: HashMap<ProcessId, CancellationToken>,
    quota: DownloadQuota,
    postpone: bool,
    all_finished: bool,
}

impl SyncSessionEventListener for SessionCore {
    fn on_start_sync_session_process(&mut self, process_id: ProcessId, mailbox: SyncSessionMailbox) {
        let cancel = self.session_cancel.child_token();
        self.cancels.insert(process_id, cancel.clone());
        let ctx = self.ctx.clone();

        self.workers.spawn(async move {
            let mut process = SyncSessionProcess::new(process_id, ctx.clone(), cancel);
            let outcome = AssertUnwindSafe(process.start(mailbox)).catch_unwind().await;
            if outcome.is_err() {
                tracing::error!("Worker {} panicked", process_id);
                ctx.events.lost(process_id);
            }
        });
    }

    fn on_stop_sync_session_process(&mut self, process_id: ProcessId) {
        if let Some(cancel) = self.cancels.remove(&process_id) {
            cancel.cancel();
        }
    }

    fn on_download_quota_update(&mut self, downloaded_bytes: u64) {
        if self.quota.add(downloaded_bytes) && !self.postpone {
            tracing::info!(
                "Downloaded {} of {} bytes allowed per session",
                self.quota.downloaded,
                self.quota.limit
            );
            self.postpone = true;
        }
    }

    fn on_all_mailboxes_finish(&mut self) {
        self.all_finished = true;
    }
}

/// List the server tree on a dedicated connection, retrying transient
/// failures.
async fn discover(
    ctx: &WorkerContext,
    retry: &RetryConfig,
) -> Result<Vec<ImapMailbox>, ImapError> {
    with_retry(retry, ImapError::is_transient, || async {
        let mut conn = ctx.connector.connect(&ctx.account).await?;
        let tree = conn.list_tree().await;
        if let Err(e) = conn.logout().await {
            tracing::debug!("Logout after discovery failed: {}", e);
        }
        tree
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::imap::mock::{MockMailbox, MockServer};
    use crate::mail::types::SpecialUse;
    use crate::sync::Importance;
    use crate::sync::state::ImportedMailId;
    use crate::sync::testing::{RecordingImporter, RecordingListener, test_account};
    use async_trait::async_trait;
    use std::time::Duration;

    fn sync_config() -> SyncConfig {
        SyncConfig {
            initial_download_block_size: 10,
            ..SyncConfig::default()
        }
    }

    fn session_with(
        server: &MockServer,
        sync_state: ImapSyncState,
        importer: Arc<dyn MailImporter>,
        config: SyncConfig,
    ) -> SyncSession {
        SyncSession::new(sync_state, Arc::new(server.clone()), importer, config)
    }

    fn session(server: &MockServer, config: SyncConfig) -> SyncSession {
        session_with(
            server,
            ImapSyncState::new(test_account(), u64::MAX),
            Arc::new(RecordingImporter::default()),
            config,
        )
    }

    fn account_server() -> MockServer {
        MockServer::new()
            .with_mailbox(MockMailbox::new("INBOX").with_uids(1..=30))
            .with_mailbox(
                MockMailbox::new("Sent")
                    .with_special_use(SpecialUse::Sent)
                    .with_uids(1..=10),
            )
            .with_mailbox(
                MockMailbox::new("Trash")
                    .with_special_use(SpecialUse::Trash)
                    .with_uids(1..=5),
            )
            .with_mailbox(
                MockMailbox::new("Junk")
                    .with_special_use(SpecialUse::Junk)
                    .with_uids(1..=5),
            )
            .with_mailbox(MockMailbox::new("Archive").no_select())
            .with_mailbox(MockMailbox::new("Archive/2023").with_uids(1..=4))
    }

    #[test]
    fn test_quota_is_exceeded_past_safety_threshold() {
        let max_quota: u64 = 2500;
        let mut quota = DownloadQuota::new(max_quota.saturating_sub(50));
        assert!(!quota.add(2450));
        assert!(quota.add(1));
        assert_eq!(quota.downloaded, 2451);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_imports_every_syncable_mailbox() {
        let server = account_server();
        let listener = Arc::new(RecordingListener::default());
        let mut session = session(&server, sync_config());

        assert_eq!(session.start(listener.clone()), SyncSessionState::Running);
        assert_eq!(session.wait().await, SyncSessionState::Finished);

        let created: Vec<String> = listener
            .mailbox_events()
            .into_iter()
            .filter(|(_, e)| *e == SyncEventType::Create)
            .map(|(path, _)| path)
            .collect();
        assert_eq!(
            created,
            vec!["Archive", "Archive/2023", "INBOX", "Junk", "Sent", "Trash"]
        );

        assert_eq!(listener.mails_with(SyncEventType::Create), 30 + 10 + 5 + 4);
        assert!(listener.mails().iter().all(|(path, _, _)| path != "Junk"));
        assert!(listener.errors().is_empty());
        assert_eq!(
            listener.finished(),
            Some((30 + 10 + 5 + 4) * server.message_size("INBOX", 1).unwrap() as u64)
        );

        let state = session.sync_state();
        assert_eq!(state.mailbox_states.len(), 6);
        assert_eq!(state.mailbox_state("INBOX").unwrap().imported_count(), 30);
        assert_eq!(state.mailbox_state("Junk").unwrap().imported_count(), 0);
        assert_eq!(state.mailbox_state("Archive").unwrap().imported_count(), 0);

        assert_eq!(server.open_connections(), 0);
        assert!(server.held_locks().is_empty());
        assert_eq!(server.double_locks(), 0);
        // Discovery plus at most one connection per syncable mailbox
        assert!(server.peak_open_connections() <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_important_mailboxes_are_synced_first() {
        let server = account_server();
        let config = SyncConfig {
            parallel_optimization_difference: 1,
            ..sync_config()
        };
        let mut session = session(&server, config);

        session.start(Arc::new(RecordingListener::default()));
        session.wait().await;

        let mut order: Vec<String> = Vec::new();
        for fetch in server.fetches() {
            if !order.contains(&fetch.path) {
                order.push(fetch.path);
            }
        }
        assert_eq!(order, vec!["INBOX", "Archive/2023", "Sent", "Trash"]);
        assert_eq!(
            Importance::for_mailbox(Some(SpecialUse::Trash), true),
            Importance::Low
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_only_reports_changes() {
        let server = account_server();
        let mut session = session(&server, sync_config());
        session.start(Arc::new(RecordingListener::default()));
        session.wait().await;

        server.add_messages("INBOX", 31..=33);
        server.touch_message("Sent", 4);

        let listener = Arc::new(RecordingListener::default());
        session.start(listener.clone());
        assert_eq!(session.wait().await, SyncSessionState::Finished);

        assert!(listener.mailbox_events().is_empty());
        let mut mails = listener.mails();
        mails.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        assert_eq!(
            mails,
            vec![
                ("INBOX".to_string(), 31, SyncEventType::Create),
                ("INBOX".to_string(), 32, SyncEventType::Create),
                ("INBOX".to_string(), 33, SyncEventType::Create),
                ("Sent".to_string(), 4, SyncEventType::Update),
            ]
        );
        assert_eq!(
            session.sync_state().mailbox_state("INBOX").unwrap().imported_count(),
            33
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_mailbox_is_dropped_from_state() {
        let server = MockServer::new().with_mailbox(MockMailbox::new("INBOX").with_uids(1..=2));
        let sync_state = ImapSyncState::new(test_account(), u64::MAX).with_mailbox_states([
            MailboxState::new("Old").with_imported([(1, ImportedMailId("x".to_string()))]),
        ]);
        let listener = Arc::new(RecordingListener::default());
        let mut session = session_with(
            &server,
            sync_state,
            Arc::new(RecordingImporter::default()),
            sync_config(),
        );

        session.start(listener.clone());
        session.wait().await;

        assert_eq!(
            listener.mailbox_events(),
            vec![
                ("Old".to_string(), SyncEventType::Delete),
                ("INBOX".to_string(), SyncEventType::Create),
            ]
        );
        assert!(session.sync_state().mailbox_state("Old").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_postpones_session() {
        let server = MockServer::new()
            .with_message_delay(Duration::from_millis(10))
            .with_mailbox(
            MockMailbox::new("INBOX")
                .with_message_size(500)
                .with_uids(1..=20),
        );
        let config = SyncConfig {
            quota_safety_threshold: 50,
            ..sync_config()
        };
        let listener = Arc::new(RecordingListener::default());
        let mut session = session_with(
            &server,
            ImapSyncState::new(test_account(), 2500),
            Arc::new(RecordingImporter::default()),
            config,
        );

        session.start(listener.clone());
        assert_eq!(session.wait().await, SyncSessionState::Postponed);

        let resume_at = listener.postponed().expect("postponed");
        assert!(resume_at > Utc::now() + TimeDelta::hours(23));
        assert!(listener.finished().is_none());

        let imported = session
            .sync_state()
            .mailbox_state("INBOX")
            .unwrap()
            .imported_count();
        assert!((5..20).contains(&imported), "imported {}", imported);
        assert_eq!(server.open_connections(), 0);
        assert!(server.held_locks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_with_running_workers_releases_everything() {
        let server = MockServer::new()
            .with_message_delay(Duration::from_millis(100))
            .with_mailbox(MockMailbox::new("INBOX").with_uids(1..=50))
            .with_mailbox(MockMailbox::new("Notes").with_uids(1..=50));
        let listener = Arc::new(RecordingListener::default());
        let mut session = session(&server, sync_config());

        session.start(listener.clone());
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(server.open_connections(), 2);

        assert_eq!(session.stop().await, SyncSessionState::Paused);
        assert_eq!(server.open_connections(), 0);
        assert!(server.held_locks().is_empty());
        assert!(listener.finished().is_none());

        let state = session.sync_state();
        for path in ["INBOX", "Notes"] {
            let imported = state.mailbox_state(path).unwrap().imported_count();
            assert!(imported > 0 && imported < 50, "{}: {}", path, imported);
        }

        // Stopping again changes nothing
        assert_eq!(session.stop().await, SyncSessionState::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_session_continues_where_it_stopped() {
        let server = MockServer::new()
            .with_message_delay(Duration::from_millis(100))
            .with_mailbox(MockMailbox::new("INBOX").with_uids(1..=30));
        let mut session = session(&server, sync_config());

        session.start(Arc::new(RecordingListener::default()));
        tokio::time::sleep(Duration::from_millis(550)).await;
        session.stop().await;

        let listener = Arc::new(RecordingListener::default());
        session.start(listener.clone());
        assert_eq!(session.wait().await, SyncSessionState::Finished);

        assert_eq!(
            session.sync_state().mailbox_state("INBOX").unwrap().imported_count(),
            30
        );
        assert_eq!(listener.mails_with(SyncEventType::Update), 0);
        assert_eq!(
            listener.mails_with(SyncEventType::Create) + 5,
            30,
            "first run imported five"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_keeps_single_actor() {
        let server = MockServer::new()
            .with_message_delay(Duration::from_millis(10))
            .with_mailbox(MockMailbox::new("INBOX").with_uids(1..=10));
        let mut session = session(&server, sync_config());

        session.start(Arc::new(RecordingListener::default()));
        assert_eq!(
            session.start(Arc::new(RecordingListener::default())),
            SyncSessionState::Running
        );
        assert_eq!(session.wait().await, SyncSessionState::Finished);
        // One discovery connection and one worker
        assert_eq!(server.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_retries_transient_failures() {
        let server = account_server().with_failing_connects(2);
        let listener = Arc::new(RecordingListener::default());
        let mut session = session(&server, sync_config());

        session.start(listener.clone());
        assert_eq!(session.wait().await, SyncSessionState::Finished);
        assert!(listener.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_discovery_backoff() {
        let server = account_server().with_failing_connects(5);
        let listener = Arc::new(RecordingListener::default());
        let mut session = session(&server, sync_config());

        session.start(listener.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.stop().await, SyncSessionState::Paused);

        // Every attempt so far was refused and no worker was started
        assert_eq!(server.connect_count(), 0);
        assert_eq!(server.open_connections(), 0);
        assert!(listener.errors().is_empty());
        assert!(listener.finished().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_login_pauses_session() {
        let server = account_server().rejecting_auth();
        let listener = Arc::new(RecordingListener::default());
        let mut session = session(&server, sync_config());

        session.start(listener.clone());
        assert_eq!(session.wait().await, SyncSessionState::Paused);

        let errors = listener.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], SyncError::Discovery(ImapError::Auth { .. })));
        assert!(listener.mailbox_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_mailbox_is_dropped_after_cap() {
        let server = MockServer::new()
            .with_failing_fetch("Sent")
            .with_mailbox(MockMailbox::new("INBOX").with_uids(1..=10))
            .with_mailbox(MockMailbox::new("Sent").with_uids(1..=10));
        let config = SyncConfig {
            max_mailbox_failures: 2,
            ..sync_config()
        };
        let listener = Arc::new(RecordingListener::default());
        let mut session = session(&server, config);

        session.start(listener.clone());
        assert_eq!(session.wait().await, SyncSessionState::Finished);

        assert_eq!(server.fetches_for("Sent").len(), 2);
        let fetch_errors = listener
            .errors()
            .into_iter()
            .filter(|e| matches!(e, SyncError::Fetch { .. }))
            .count();
        assert_eq!(fetch_errors, 2);
        assert_eq!(
            session.sync_state().mailbox_state("INBOX").unwrap().imported_count(),
            10
        );
    }

    struct PanickingImporter;

    #[async_trait]
    impl MailImporter for PanickingImporter {
        async fn import_mail(
            &self,
            mail: &crate::mail::types::ImapMail,
            mailbox: &MailboxState,
        ) -> anyhow::Result<ImportedMailId> {
            if mail.mailbox == "Broken" {
                panic!("importer bug");
            }
            Ok(ImportedMailId(format!("{}/{}", mailbox.path, mail.uid)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_worker_does_not_take_session_down() {
        let server = MockServer::new()
            .with_mailbox(MockMailbox::new("Broken").with_uids(1..=3))
            .with_mailbox(MockMailbox::new("INBOX").with_uids(1..=3));
        let mut session = session_with(
            &server,
            ImapSyncState::new(test_account(), u64::MAX),
            Arc::new(PanickingImporter),
            sync_config(),
        );

        session.start(Arc::new(RecordingListener::default()));
        assert_eq!(session.wait().await, SyncSessionState::Finished);

        let state = session.sync_state();
        assert_eq!(state.mailbox_state("INBOX").unwrap().imported_count(), 3);
        assert_eq!(state.mailbox_state("Broken").unwrap().imported_count(), 0);
    }
}
