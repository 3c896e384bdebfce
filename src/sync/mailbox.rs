//! Runtime wrapper around a [`MailboxState`] that tracks how well the
//! mailbox downloads.
//!
//! Throughput samples are collected in windows of `time_to_live` length.
//! Each finished window turns into one efficiency score in the history,
//! and the normalized score is the mean of the most recent history
//! entries. Both optimizers read these scores.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::state::MailboxState;
use crate::config::SyncConfig;
use crate::constants::{INITIAL_THROUGHPUT, TIME_TO_LIVE_SECS};
use crate::mail::types::SpecialUse;

/// Average size of a mail in KB, scales the measurement window.
const AVERAGE_MAIL_SIZE: f64 = 12.5;

/// Number of average mails a measurement window should cover.
const TIME_TO_LIVE_FACTOR: f64 = 5.0;

/// Scheduling priority derived from the special-use role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Importance {
    NoSync = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Importance {
    pub fn for_mailbox(special_use: Option<SpecialUse>, selectable: bool) -> Self {
        if !selectable {
            return Importance::NoSync;
        }
        match special_use {
            Some(SpecialUse::Inbox) => Importance::High,
            Some(SpecialUse::Trash | SpecialUse::Archive | SpecialUse::All) => Importance::Low,
            Some(SpecialUse::Junk) => Importance::NoSync,
            _ => Importance::Medium,
        }
    }

    pub fn weight(self) -> f64 {
        self as u8 as f64
    }
}

/// Snapshot a worker sends to the parallel optimizer with every update.
#[derive(Debug, Clone, PartialEq)]
pub struct MailboxReport {
    pub path: String,
    pub importance: Importance,
    pub time_to_live: Duration,
    pub efficiency_score: f64,
    pub normalized_efficiency_score: f64,
    pub download_block_size: u32,
}

#[derive(Debug, Clone)]
pub struct SyncSessionMailbox {
    state: MailboxState,
    special_use: Option<SpecialUse>,
    importance: Importance,
    mail_count: Option<u32>,
    time_to_live: Duration,
    current_throughput: f64,
    download_block_size: u32,
    window_started: Instant,
    window_sum: f64,
    window_samples: u32,
    efficiency_history: VecDeque<f64>,
    normalization_window: usize,
    failed_attempts: u32,
}

impl SyncSessionMailbox {
    pub fn new(
        state: MailboxState,
        special_use: Option<SpecialUse>,
        selectable: bool,
        config: &SyncConfig,
    ) -> Self {
        Self {
            state,
            special_use,
            importance: Importance::for_mailbox(special_use, selectable),
            mail_count: None,
            time_to_live: Duration::from_secs(TIME_TO_LIVE_SECS),
            current_throughput: INITIAL_THROUGHPUT,
            download_block_size: config.initial_download_block_size.max(1),
            window_started: Instant::now(),
            window_sum: 0.0,
            window_samples: 0,
            efficiency_history: VecDeque::new(),
            normalization_window: config.normalization_window.max(1),
            failed_attempts: 0,
        }
    }

    /// Prepare for a walk once the server reported the message count.
    ///
    /// The measurement window scales with the expected efficiency so that
    /// it spans a handful of average mails.
    pub fn init(&mut self, mail_count: Option<u32>) {
        self.mail_count = mail_count;
        let secs = AVERAGE_MAIL_SIZE * self.efficiency_score() * TIME_TO_LIVE_FACTOR;
        self.time_to_live = Duration::from_secs_f64(secs.max(1.0));
        self.window_started = Instant::now();
        self.window_sum = 0.0;
        self.window_samples = 0;
    }

    pub fn path(&self) -> &str {
        &self.state.path
    }

    pub fn state(&self) -> &MailboxState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut MailboxState {
        &mut self.state
    }

    pub fn into_state(self) -> MailboxState {
        self.state
    }

    pub fn special_use(&self) -> Option<SpecialUse> {
        self.special_use
    }

    pub fn importance(&self) -> Importance {
        self.importance
    }

    pub fn is_syncable(&self) -> bool {
        self.importance != Importance::NoSync
    }

    pub fn mail_count(&self) -> Option<u32> {
        self.mail_count
    }

    pub fn time_to_live(&self) -> Duration {
        self.time_to_live
    }

    pub fn current_throughput(&self) -> f64 {
        self.current_throughput
    }

    /// Record a throughput sample in bytes/ms.
    pub fn report_throughput(&mut self, at: Instant, throughput: f64) {
        self.current_throughput = throughput;

        if self.window_samples > 0 && self.window_started + self.time_to_live <= at {
            let mean = self.window_sum / self.window_samples as f64;
            self.efficiency_history
                .push_back(self.importance.weight() * mean);
            while self.efficiency_history.len() > self.normalization_window {
                self.efficiency_history.pop_front();
            }
            self.window_started = at;
            self.window_sum = 0.0;
            self.window_samples = 0;
        }

        self.window_sum += throughput;
        self.window_samples += 1;
    }

    pub fn efficiency_score(&self) -> f64 {
        self.importance.weight() * self.current_throughput
    }

    /// Mean of the most recent finished windows, or the instantaneous score
    /// while no window has finished yet.
    pub fn normalized_efficiency_score(&self) -> f64 {
        if self.efficiency_history.is_empty() {
            return self.efficiency_score();
        }
        self.efficiency_history.iter().sum::<f64>() / self.efficiency_history.len() as f64
    }

    pub fn efficiency_history(&self) -> impl Iterator<Item = f64> + '_ {
        self.efficiency_history.iter().copied()
    }

    pub fn download_block_size(&self) -> u32 {
        self.download_block_size
    }

    pub fn set_download_block_size(&mut self, size: u32) {
        self.download_block_size = size.max(1);
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn record_failure(&mut self) -> u32 {
        self.failed_attempts += 1;
        self.failed_attempts
    }

    pub fn report(&self) -> MailboxReport {
        MailboxReport {
            path: self.state.path.clone(),
            importance: self.importance,
            time_to_live: self.time_to_live,
            efficiency_score: self.efficiency_score(),
            normalized_efficiency_score: self.normalized_efficiency_score(),
            download_block_size: self.download_block_size,
        }
    }
}
