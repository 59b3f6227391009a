//! Status - キューの状態集計

use serde::{Deserialize, Serialize};

use crate::domain::TaskStatus;

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub dead: usize,
}

impl QueueCounts {
    pub fn add(&mut self, status: TaskStatus, n: usize) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Done => self.done += n,
            TaskStatus::Dead => self.dead += n,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.done + self.dead
    }

    /// Nothing left to run or in flight.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}
