//! Decides how many workers a session runs.
//!
//! Every optimization interval the average throughput of the running
//! workers in the interval that just ended is compared with the one
//! before it. While throughput holds, more workers are started with the
//! most important idle mailboxes first. When throughput drops after an
//! increase, the least efficient worker that had a fair measurement
//! window is stopped.

use std::collections::{BTreeMap, VecDeque};
use tokio::time::Instant;

use super::{
    OptimizerUpdateAction, ProcessExit, ProcessId, SyncSessionEventListener, ThroughputSample,
};
use crate::config::SyncConfig;
use crate::sync::mailbox::{MailboxReport, SyncSessionMailbox};

/// A running worker as seen by the optimizer.
#[derive(Debug, Clone)]
pub struct OptimizerProcess {
    pub process_id: ProcessId,
    pub path: String,
    pub started_at: Instant,
    pub last_report: Option<MailboxReport>,
    samples: VecDeque<ThroughputSample>,
}

impl OptimizerProcess {
    fn new(process_id: ProcessId, path: String, started_at: Instant) -> Self {
        Self {
            process_id,
            path,
            started_at,
            last_report: None,
            samples: VecDeque::new(),
        }
    }

    /// Mean throughput of samples taken in `[from, to)`; `None` until the
    /// worker reported at least once or if it started after the interval.
    fn average_throughput(&self, from: Instant, to: Instant) -> Option<f64> {
        self.last_report.as_ref()?;
        if self.started_at >= to {
            return None;
        }
        let (sum, count) = self
            .samples
            .iter()
            .filter(|s| s.at >= from && s.at < to)
            .fold((0.0, 0u32), |(sum, count), s| (sum + s.throughput, count + 1));
        if count == 0 {
            Some(0.0)
        } else {
            Some(sum / count as f64)
        }
    }

    /// Ran at least one full measurement window of its mailbox.
    fn is_evictable(&self, now: Instant) -> bool {
        self.last_report
            .as_ref()
            .is_some_and(|r| self.started_at + r.time_to_live <= now)
    }

    fn normalized_efficiency_score(&self) -> f64 {
        self.last_report
            .as_ref()
            .map(|r| r.normalized_efficiency_score)
            .unwrap_or(0.0)
    }
}

#[derive(Debug)]
pub struct ParallelProcessOptimizer {
    idle: Vec<SyncSessionMailbox>,
    running: BTreeMap<ProcessId, OptimizerProcess>,
    /// Workers asked to stop that have not handed their mailbox back yet.
    stopping: BTreeMap<ProcessId, String>,
    next_process_id: ProcessId,
    last_action: OptimizerUpdateAction,
    previous_tick: Instant,
    last_tick: Instant,
    optimization_difference: usize,
    throughput_threshold: f64,
    max_mailbox_failures: u32,
    stopped: bool,
    finished: bool,
}

impl ParallelProcessOptimizer {
    pub fn new(mailboxes: Vec<SyncSessionMailbox>, config: &SyncConfig) -> Self {
        let now = Instant::now();
        Self {
            idle: mailboxes.into_iter().filter(|m| m.is_syncable()).collect(),
            running: BTreeMap::new(),
            stopping: BTreeMap::new(),
            next_process_id: 1,
            last_action: OptimizerUpdateAction::NoUpdate,
            previous_tick: now,
            last_tick: now,
            optimization_difference: config.parallel_optimization_difference.max(1),
            throughput_threshold: config.throughput_threshold,
            max_mailbox_failures: config.max_mailbox_failures.max(1),
            stopped: false,
            finished: false,
        }
    }

    pub fn last_action(&self) -> OptimizerUpdateAction {
        self.last_action
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn stopping_count(&self) -> usize {
        self.stopping.len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn running_paths(&self) -> Vec<&str> {
        self.running.values().map(|p| p.path.as_str()).collect()
    }

    /// Whether a worker currently holds `path`, including one that is
    /// stopping.
    pub fn is_busy(&self, path: &str) -> bool {
        self.running.values().any(|p| p.path == path)
            || self.stopping.values().any(|p| p == path)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// One control step. Call once per optimization interval.
    pub fn optimize(
        &mut self,
        now: Instant,
        listener: &mut dyn SyncSessionEventListener,
    ) -> OptimizerUpdateAction {
        if self.stopped || self.finished {
            return OptimizerUpdateAction::NoUpdate;
        }

        let current = self.average_throughput(self.last_tick, now);
        let last = self.average_throughput(self.previous_tick, self.last_tick);
        tracing::debug!(
            "Throughput: last {:.3} | current {:.3} bytes/ms ({} running, {} idle)",
            last,
            current,
            self.running.len(),
            self.idle.len()
        );

        let action = if current + self.throughput_threshold >= last {
            if self.last_action != OptimizerUpdateAction::Decrease {
                self.increase(now, listener)
            } else if self.running.len() > 1 {
                self.decrease(now, listener)
            } else {
                OptimizerUpdateAction::NoUpdate
            }
        } else if self.last_action == OptimizerUpdateAction::Increase && self.running.len() > 1 {
            self.decrease(now, listener)
        } else {
            OptimizerUpdateAction::NoUpdate
        };

        self.previous_tick = self.last_tick;
        self.last_tick = now;
        let oldest = self.previous_tick;
        for process in self.running.values_mut() {
            process.samples.retain(|s| s.at >= oldest);
        }

        self.last_action = action;
        action
    }

    fn increase(
        &mut self,
        now: Instant,
        listener: &mut dyn SyncSessionEventListener,
    ) -> OptimizerUpdateAction {
        if self.start_processes(self.optimization_difference, now, listener) > 0 {
            OptimizerUpdateAction::Increase
        } else {
            OptimizerUpdateAction::NoUpdate
        }
    }

    fn decrease(
        &mut self,
        now: Instant,
        listener: &mut dyn SyncSessionEventListener,
    ) -> OptimizerUpdateAction {
        if self.evict_least_efficient(now, listener) {
            OptimizerUpdateAction::Decrease
        } else {
            OptimizerUpdateAction::NoUpdate
        }
    }

    fn average_throughput(&self, from: Instant, to: Instant) -> f64 {
        let averages: Vec<f64> = self
            .running
            .values()
            .filter_map(|p| p.average_throughput(from, to))
            .collect();
        if averages.is_empty() {
            0.0
        } else {
            averages.iter().sum::<f64>() / averages.len() as f64
        }
    }

    /// Start up to `amount` workers, most important mailboxes first.
    fn start_processes(
        &mut self,
        amount: usize,
        now: Instant,
        listener: &mut dyn SyncSessionEventListener,
    ) -> usize {
        // Stable, so equally important mailboxes keep discovery order
        self.idle
            .sort_by_key(|m| std::cmp::Reverse(m.importance()));

        let mut started = 0;
        let mut index = 0;
        while started < amount && index < self.idle.len() {
            if self.is_busy(self.idle[index].path()) {
                index += 1;
                continue;
            }
            let mailbox = self.idle.remove(index);
            let process_id = self.next_process_id;
            self.next_process_id += 1;

            tracing::debug!("Starting worker {} for {}", process_id, mailbox.path());
            self.running.insert(
                process_id,
                OptimizerProcess::new(process_id, mailbox.path().to_string(), now),
            );
            listener.on_start_sync_session_process(process_id, mailbox);
            started += 1;
        }
        started
    }

    fn evict_least_efficient(
        &mut self,
        now: Instant,
        listener: &mut dyn SyncSessionEventListener,
    ) -> bool {
        let candidate = self
            .running
            .values()
            .filter(|p| p.is_evictable(now))
            .min_by(|a, b| {
                a.normalized_efficiency_score()
                    .total_cmp(&b.normalized_efficiency_score())
            })
            .map(|p| p.process_id);

        let Some(process_id) = candidate else {
            return false;
        };
        if let Some(process) = self.running.remove(&process_id) {
            tracing::debug!("Stopping worker {} for {}", process_id, process.path);
            self.stopping.insert(process_id, process.path);
            listener.on_stop_sync_session_process(process_id);
        }
        true
    }

    pub fn on_download_update(
        &mut self,
        process_id: ProcessId,
        report: MailboxReport,
        sample: ThroughputSample,
        downloaded_bytes: u64,
        listener: &mut dyn SyncSessionEventListener,
    ) {
        if let Some(process) = self.running.get_mut(&process_id) {
            process.last_report = Some(report);
            process.samples.push_back(sample);
        } else if !self.stopping.contains_key(&process_id) {
            tracing::debug!("Ignoring update from unknown worker {}", process_id);
            return;
        }
        listener.on_download_quota_update(downloaded_bytes);
    }

    /// A worker handed its mailbox back.
    pub fn on_process_exit(
        &mut self,
        process_id: ProcessId,
        exit: ProcessExit,
        mut mailbox: SyncSessionMailbox,
        listener: &mut dyn SyncSessionEventListener,
    ) {
        let was_running = self.running.remove(&process_id).is_some();
        if !was_running && self.stopping.remove(&process_id).is_none() {
            tracing::warn!("Exit of unknown worker {} ignored", process_id);
            return;
        }

        match exit {
            ProcessExit::Finished => {
                tracing::info!("Mailbox {} is up to date", mailbox.path());
                if was_running {
                    listener.on_stop_sync_session_process(process_id);
                }
                self.mailbox_done(listener);
            }
            ProcessExit::Stopped => self.idle.push(mailbox),
            ProcessExit::Failed | ProcessExit::ConnectionFailed => {
                let failures = mailbox.record_failure();
                if failures >= self.max_mailbox_failures {
                    tracing::warn!(
                        "Giving up on {} for this session after {} failed attempts",
                        mailbox.path(),
                        failures
                    );
                    self.mailbox_done(listener);
                } else {
                    self.idle.push(mailbox);
                }
            }
        }
    }

    /// A worker died without handing its mailbox back.
    pub fn on_process_lost(
        &mut self,
        process_id: ProcessId,
        listener: &mut dyn SyncSessionEventListener,
    ) {
        let path = self
            .running
            .remove(&process_id)
            .map(|p| p.path)
            .or_else(|| self.stopping.remove(&process_id));
        if let Some(path) = path {
            tracing::error!("Worker {} for {} was lost", process_id, path);
            self.mailbox_done(listener);
        }
    }

    fn mailbox_done(&mut self, listener: &mut dyn SyncSessionEventListener) {
        if self.stopped {
            return;
        }
        if self.idle.is_empty() && self.running.is_empty() && self.stopping.is_empty() {
            self.finished = true;
            listener.on_all_mailboxes_finish();
        } else {
            self.start_processes(1, Instant::now(), listener);
        }
    }

    /// Stop every running worker and start no more.
    pub fn stop(&mut self, listener: &mut dyn SyncSessionEventListener) {
        self.stopped = true;
        let running = std::mem::take(&mut self.running);
        for (process_id, process) in running {
            self.stopping.insert(process_id, process.path);
            listener.on_stop_sync_session_process(process_id);
        }
    }

    /// Nothing is running and nothing is waiting to hand a mailbox back.
    pub fn is_quiescent(&self) -> bool {
        self.running.is_empty() && self.stopping.is_empty()
    }
}
