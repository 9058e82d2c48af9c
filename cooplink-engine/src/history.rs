//! In-memory record of finished transfers.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::SystemTime;

use cooplink_core::device::DeviceId;
use cooplink_core::state::{Direction, SessionId, TaskId, TransferState};

/// Entries kept before the oldest are dropped.
pub const HISTORY_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub peer: DeviceId,
    pub direction: Direction,
    pub files: Vec<String>,
    pub total_bytes: u64,
    /// Terminal state the task ended in.
    pub state: TransferState,
    pub finished_at: SystemTime,
}

#[derive(Debug)]
pub struct TransferHistory {
    records: Mutex<VecDeque<TransferRecord>>,
    capacity: usize,
}

impl Default for TransferHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl TransferHistory {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(HISTORY_CAPACITY))),
            capacity,
        }
    }

    pub fn record(&self, record: TransferRecord) {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TransferRecord> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64) -> TransferRecord {
        TransferRecord {
            task_id: TaskId(id),
            session_id: SessionId(1),
            peer: DeviceId::from("peer"),
            direction: Direction::Outbound,
            files: vec!["a.txt".into()],
            total_bytes: 10,
            state: TransferState::Completed,
            finished_at: SystemTime::now(),
        }
    }

    #[test]
    fn given_full_history_when_recording_then_oldest_dropped() {
        let history = TransferHistory::with_capacity(2);
        for id in 1..=3 {
            history.record(record(id));
        }
        let ids: Vec<u64> = history.snapshot().iter().map(|r| r.task_id.0).collect();
        assert_eq!(ids, [2, 3]);
    }

    #[test]
    fn given_empty_history_when_snapshotted_then_empty() {
        assert!(TransferHistory::default().snapshot().is_empty());
    }
}
