//! Grows the fetch block of a mailbox while its normalized efficiency
//! keeps up, and shrinks it when efficiency drops.

use std::time::Duration;

use super::OptimizerUpdateAction;
use crate::sync::mailbox::SyncSessionMailbox;

#[derive(Debug)]
pub struct DownloadBlockSizeOptimizer {
    mailbox: SyncSessionMailbox,
    optimization_difference: u32,
    last_normalized_efficiency_score: f64,
    last_action: OptimizerUpdateAction,
}

impl DownloadBlockSizeOptimizer {
    pub fn new(mailbox: SyncSessionMailbox, optimization_difference: u32) -> Self {
        Self {
            mailbox,
            optimization_difference,
            last_normalized_efficiency_score: 0.0,
            last_action: OptimizerUpdateAction::NoUpdate,
        }
    }

    /// How often [`optimize`](Self::optimize) should run.
    pub fn period(&self) -> Duration {
        self.mailbox.time_to_live()
    }

    pub fn mailbox(&self) -> &SyncSessionMailbox {
        &self.mailbox
    }

    pub fn mailbox_mut(&mut self) -> &mut SyncSessionMailbox {
        &mut self.mailbox
    }

    pub fn into_mailbox(self) -> SyncSessionMailbox {
        self.mailbox
    }

    pub fn last_action(&self) -> OptimizerUpdateAction {
        self.last_action
    }

    pub fn optimize(&mut self) -> OptimizerUpdateAction {
        let score = self.mailbox.normalized_efficiency_score();
        let current = self.mailbox.download_block_size();

        let action = if score >= self.last_normalized_efficiency_score {
            self.mailbox
                .set_download_block_size(current.saturating_add(self.optimization_difference));
            OptimizerUpdateAction::Increase
        } else {
            self.mailbox
                .set_download_block_size(current.saturating_sub(self.optimization_difference));
            OptimizerUpdateAction::Decrease
        };

        tracing::debug!(
            "Block size of {}: {} -> {} (score {:.3}, last {:.3})",
            self.mailbox.path(),
            current,
            self.mailbox.download_block_size(),
            score,
            self.last_normalized_efficiency_score
        );

        self.last_normalized_efficiency_score = score;
        self.last_action = action;
        action
    }
}
