//! Per-message processing state and batch checkpoints
//!
//! Terminal states are sticky: once a message is marked success,
//! failed or dead-lettered, later marks are ignored so replays and
//! concurrent retries cannot flip a settled outcome. Only an explicit
//! operator reset reopens a message.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use tracing::debug;

use crate::models::{Checkpoint, CheckpointStatus, ProcessingState, ProcessingStatus, RawMessage};

#[derive(Default)]
pub struct CheckpointTracker {
    states: Mutex<HashMap<String, ProcessingState>>,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status transition. Returns false when the message is
    /// already in a terminal state and the mark was ignored.
    pub fn mark(&self, unique_id: &str, status: ProcessingStatus) -> bool {
        let mut states = self.states.lock().expect("checkpoint lock poisoned");
        let now = Utc::now();
        match states.get_mut(unique_id) {
            Some(state) if state.status.is_terminal() => {
                debug!(unique_id, current = ?state.status, "ignoring mark on terminal state");
                false
            }
            Some(state) => {
                state.status = status;
                state.last_attempt_at = now;
                if status == ProcessingStatus::Failed {
                    state.retry_count += 1;
                }
                true
            }
            None => {
                states.insert(
                    unique_id.to_string(),
                    ProcessingState {
                        status,
                        retry_count: u32::from(status == ProcessingStatus::Failed),
                        first_attempt_at: now,
                        last_attempt_at: now,
                    },
                );
                true
            }
        }
    }

    pub fn state(&self, unique_id: &str) -> Option<ProcessingState> {
        let states = self.states.lock().expect("checkpoint lock poisoned");
        states.get(unique_id).cloned()
    }

    pub fn is_terminal(&self, unique_id: &str) -> bool {
        self.state(unique_id)
            .map(|s| s.status.is_terminal())
            .unwrap_or(false)
    }

    /// Explicit operator reset back to unprocessed.
    pub fn reset(&self, unique_id: &str) {
        let mut states = self.states.lock().expect("checkpoint lock poisoned");
        if let Some(state) = states.get_mut(unique_id) {
            state.status = ProcessingStatus::Unprocessed;
            state.retry_count = 0;
            state.last_attempt_at = Utc::now();
        }
    }

    /// Filter out messages already settled in a previous run or batch.
    pub fn pending<'a>(&self, messages: &'a [RawMessage]) -> Vec<&'a RawMessage> {
        let states = self.states.lock().expect("checkpoint lock poisoned");
        messages
            .iter()
            .filter(|m| {
                states
                    .get(&m.unique_id)
                    .map(|s| !s.status.is_terminal())
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Seed the tracker from previously persisted message statuses so
    /// a resumed run skips settled work.
    pub fn seed(&self, settled: impl IntoIterator<Item = (String, ProcessingState)>) {
        let mut states = self.states.lock().expect("checkpoint lock poisoned");
        for (unique_id, state) in settled {
            states.entry(unique_id).or_insert(state);
        }
    }

    pub fn counts(&self) -> HashMap<ProcessingStatus, usize> {
        let states = self.states.lock().expect("checkpoint lock poisoned");
        let mut counts = HashMap::new();
        for state in states.values() {
            *counts.entry(state.status).or_insert(0) += 1;
        }
        counts
    }
}

/// Build the checkpoint record for a batch.
pub fn batch_checkpoint(
    scope_id: &str,
    batch_id: u32,
    total: usize,
    processed: usize,
    last_processed_id: Option<String>,
) -> Checkpoint {
    let status = if processed >= total {
        CheckpointStatus::Completed
    } else {
        CheckpointStatus::InProgress
    };
    Checkpoint {
        scope_id: scope_id.to_string(),
        batch_id,
        total,
        processed,
        last_processed_id,
        status,
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(id: &str) -> RawMessage {
        RawMessage {
            sender: "AX-SBIUPI".to_string(),
            body: "UPI debited by Rs.44.00".to_string(),
            timestamp: Utc::now(),
            channel: "sms".to_string(),
            unique_id: id.to_string(),
        }
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let tracker = CheckpointTracker::new();
        assert!(tracker.mark("m1", ProcessingStatus::Success));
        assert!(!tracker.mark("m1", ProcessingStatus::Failed));
        assert_eq!(
            tracker.state("m1").map(|s| s.status),
            Some(ProcessingStatus::Success)
        );
    }

    #[test]
    fn test_reset_reopens_message() {
        let tracker = CheckpointTracker::new();
        tracker.mark("m1", ProcessingStatus::DeadLettered);
        tracker.reset("m1");
        assert!(!tracker.is_terminal("m1"));
        assert!(tracker.mark("m1", ProcessingStatus::Success));
    }

    #[test]
    fn test_pending_filters_settled_messages() {
        let tracker = CheckpointTracker::new();
        let messages = vec![message("m1"), message("m2"), message("m3")];
        tracker.mark("m1", ProcessingStatus::Success);
        tracker.mark("m3", ProcessingStatus::Failed);

        let pending = tracker.pending(&messages);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].unique_id, "m2");
    }

    #[test]
    fn test_failed_marks_accumulate_retry_count() {
        let tracker = CheckpointTracker::new();
        tracker.mark("m1", ProcessingStatus::Unprocessed);
        tracker.mark("m1", ProcessingStatus::Failed);
        assert_eq!(tracker.state("m1").map(|s| s.retry_count), Some(1));
    }

    #[test]
    fn test_batch_checkpoint_status() {
        let cp = batch_checkpoint("run-1", 0, 10, 10, Some("m10".to_string()));
        assert_eq!(cp.status, CheckpointStatus::Completed);
        let cp = batch_checkpoint("run-1", 1, 10, 4, Some("m4".to_string()));
        assert_eq!(cp.status, CheckpointStatus::InProgress);
    }
}
