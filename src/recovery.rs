//! Retry scheduling and dead-letter collection
//!
//! Failures are split into permanent ones, which can never succeed on
//! retry and go straight to the dead-letter set, and transient ones,
//! which are retried with exponential backoff up to a cap.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{DeadLetterEntry, RawMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ValidationError,
    ParsingError,
    MissingEssentialFields,
    Timeout,
    NetworkError,
    LlmUnavailable,
    UnexpectedError,
}

impl FailureKind {
    /// Permanent failures are deterministic for a given message, so
    /// retrying them can only burn quota.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            FailureKind::ValidationError
                | FailureKind::ParsingError
                | FailureKind::MissingEssentialFields
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ValidationError => "validation_error",
            FailureKind::ParsingError => "parsing_error",
            FailureKind::MissingEssentialFields => "missing_essential_fields",
            FailureKind::Timeout => "timeout",
            FailureKind::NetworkError => "network_error",
            FailureKind::LlmUnavailable => "llm_unavailable",
            FailureKind::UnexpectedError => "unexpected_error",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 2.0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct RetryRecord {
    message: RawMessage,
    retry_count: u32,
    kind: FailureKind,
    error_message: String,
    delay: Duration,
}

/// Outcome of reporting a failure to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Retry after the given delay.
    Retry(Duration),
    /// The message has been dead-lettered.
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryStats {
    pub pending_retries: usize,
    pub dead_letters: usize,
}

#[derive(Default)]
struct RecoveryState {
    retry_queue: HashMap<String, RetryRecord>,
    dead_letters: Vec<DeadLetterEntry>,
}

pub struct ErrorRecoveryManager {
    config: RecoveryConfig,
    state: Mutex<RecoveryState>,
}

impl ErrorRecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RecoveryState::default()),
        }
    }

    /// Report a failed message. Permanent failures dead-letter
    /// immediately; transient ones are queued with exponential backoff
    /// until max_retries is exceeded.
    pub fn report_failure(
        &self,
        message: &RawMessage,
        kind: FailureKind,
        error_message: &str,
    ) -> FailureDisposition {
        let mut state = self.state.lock().expect("recovery lock poisoned");

        if kind.is_permanent() {
            let retry_count = state
                .retry_queue
                .remove(&message.unique_id)
                .map(|r| r.retry_count)
                .unwrap_or(0);
            Self::dead_letter(&mut state, message, kind, error_message, retry_count);
            return FailureDisposition::DeadLettered;
        }

        match state.retry_queue.get_mut(&message.unique_id) {
            None => {
                let delay = self.config.initial_delay;
                state.retry_queue.insert(
                    message.unique_id.clone(),
                    RetryRecord {
                        message: message.clone(),
                        retry_count: 1,
                        kind,
                        error_message: error_message.to_string(),
                        delay,
                    },
                );
                info!(
                    unique_id = %message.unique_id,
                    kind = kind.as_str(),
                    delay_secs = delay.as_secs_f64(),
                    "scheduled retry"
                );
                FailureDisposition::Retry(delay)
            }
            Some(record) => {
                if record.retry_count >= self.config.max_retries {
                    let retry_count = record.retry_count;
                    state.retry_queue.remove(&message.unique_id);
                    Self::dead_letter(&mut state, message, kind, error_message, retry_count);
                    return FailureDisposition::DeadLettered;
                }
                record.retry_count += 1;
                record.kind = kind;
                record.error_message = error_message.to_string();
                record.delay = Duration::from_secs_f64(
                    (record.delay.as_secs_f64() * self.config.backoff_factor)
                        .min(self.config.max_delay.as_secs_f64()),
                );
                let delay = record.delay;
                info!(
                    unique_id = %message.unique_id,
                    retry_count = record.retry_count,
                    delay_secs = delay.as_secs_f64(),
                    "scheduled retry"
                );
                FailureDisposition::Retry(delay)
            }
        }
    }

    fn dead_letter(
        state: &mut RecoveryState,
        message: &RawMessage,
        kind: FailureKind,
        error_message: &str,
        retry_count: u32,
    ) {
        warn!(
            unique_id = %message.unique_id,
            kind = kind.as_str(),
            retry_count,
            "message dead-lettered"
        );
        state.dead_letters.push(DeadLetterEntry {
            message: message.clone(),
            error_kind: kind.as_str().to_string(),
            error_message: error_message.to_string(),
            failed_at: Utc::now(),
            retry_count,
        });
    }

    /// Messages currently awaiting a retry, with their scheduled delay.
    pub fn pending(&self) -> Vec<(RawMessage, Duration)> {
        let state = self.state.lock().expect("recovery lock poisoned");
        state
            .retry_queue
            .values()
            .map(|r| (r.message.clone(), r.delay))
            .collect()
    }

    /// Drop the retry record after a successful reprocessing.
    pub fn resolve(&self, unique_id: &str) {
        let mut state = self.state.lock().expect("recovery lock poisoned");
        state.retry_queue.remove(unique_id);
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        let state = self.state.lock().expect("recovery lock poisoned");
        state.dead_letters.clone()
    }

    pub fn stats(&self) -> RecoveryStats {
        let state = self.state.lock().expect("recovery lock poisoned");
        RecoveryStats {
            pending_retries: state.retry_queue.len(),
            dead_letters: state.dead_letters.len(),
        }
    }

    /// Serialize the dead-letter set as newline-delimited JSON for
    /// offline triage.
    pub fn export_dead_letters(&self) -> crate::error::Result<String> {
        let entries = self.dead_letters();
        let mut out = String::new();
        for entry in &entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }
}

impl Default for ErrorRecoveryManager {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}
