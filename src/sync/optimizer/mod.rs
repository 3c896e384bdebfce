//! Feedback loops that tune a running session.
//!
//! - `block_size.rs` - Per-mailbox fetch block size, owned by a worker
//! - `parallel.rs` - Number of concurrent workers, owned by the session

pub mod block_size;
pub mod parallel;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::mailbox::{MailboxReport, SyncSessionMailbox};

pub use block_size::DownloadBlockSizeOptimizer;
pub use parallel::ParallelProcessOptimizer;

/// Decision of one optimizer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizerUpdateAction {
    #[default]
    NoUpdate,
    Increase,
    Decrease,
}

pub type ProcessId = u64;

/// One throughput measurement in bytes/ms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub at: Instant,
    pub throughput: f64,
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Walked the whole mailbox.
    Finished,
    /// Cancelled by the session.
    Stopped,
    /// Lost the connection or hit a protocol error mid-walk.
    Failed,
    /// Could not open a connection at all.
    ConnectionFailed,
}

/// Message from a worker to its session.
#[derive(Debug)]
pub enum ProcessEvent {
    DownloadUpdate {
        process_id: ProcessId,
        report: MailboxReport,
        sample: ThroughputSample,
        downloaded_bytes: u64,
    },
    /// Hands the mailbox back; sent exactly once per worker.
    Exited {
        process_id: ProcessId,
        exit: ProcessExit,
        mailbox: Box<SyncSessionMailbox>,
    },
    /// The worker task died without handing its mailbox back.
    Lost { process_id: ProcessId },
}

/// Worker side of the session's event channel.
#[derive(Debug, Clone)]
pub struct ProcessEventSender {
    tx: mpsc::UnboundedSender<ProcessEvent>,
}

impl ProcessEventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn download_update(
        &self,
        process_id: ProcessId,
        report: MailboxReport,
        sample: ThroughputSample,
        downloaded_bytes: u64,
    ) {
        // The session outlives its workers; a closed channel only happens
        // while the runtime shuts down.
        let _ = self.tx.send(ProcessEvent::DownloadUpdate {
            process_id,
            report,
            sample,
            downloaded_bytes,
        });
    }

    pub fn exited(&self, process_id: ProcessId, exit: ProcessExit, mailbox: SyncSessionMailbox) {
        let _ = self.tx.send(ProcessEvent::Exited {
            process_id,
            exit,
            mailbox: Box::new(mailbox),
        });
    }

    pub fn lost(&self, process_id: ProcessId) {
        let _ = self.tx.send(ProcessEvent::Lost { process_id });
    }
}

/// Callbacks the parallel optimizer makes into its session.
pub trait SyncSessionEventListener {
    /// Spawn a worker for `mailbox` under `process_id`.
    fn on_start_sync_session_process(&mut self, process_id: ProcessId, mailbox: SyncSessionMailbox);

    /// Ask the worker to stop after its current batch.
    fn on_stop_sync_session_process(&mut self, process_id: ProcessId);

    fn on_download_quota_update(&mut self, downloaded_bytes: u64);

    fn on_all_mailboxes_finish(&mut self);
}
