//! Persistence boundary
//!
//! The pipeline talks to storage through [`TransactionStore`] so runs
//! can target an in-memory store in tests and a real backend in
//! deployment without touching the orchestration code.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::models::{Checkpoint, ExtractedTransaction, ProcessingState, ProcessingStatus};

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert extracted transactions, skipping ids already present.
    /// Returns the number actually inserted.
    async fn insert_transactions(&self, transactions: &[ExtractedTransaction]) -> Result<usize>;

    async fn mark_status(&self, unique_id: &str, status: ProcessingStatus) -> Result<()>;

    /// Statuses persisted by earlier runs, used to seed resume.
    async fn settled_states(&self) -> Result<Vec<(String, ProcessingState)>>;

    /// Distinct senders across stored transactions.
    async fn distinct_senders(&self) -> Result<Vec<String>>;

    async fn upsert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn load_checkpoint(&self, scope_id: &str, batch_id: u32) -> Result<Option<Checkpoint>>;

    async fn transaction_count(&self) -> Result<usize>;
}

#[derive(Default)]
struct StoreInner {
    transactions: HashMap<String, ExtractedTransaction>,
    states: HashMap<String, ProcessingState>,
    checkpoints: HashMap<(String, u32), Checkpoint>,
}

/// Reference store backed by process memory.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transactions(&self) -> Vec<ExtractedTransaction> {
        let inner = self.inner.read().await;
        inner.transactions.values().cloned().collect()
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn insert_transactions(&self, transactions: &[ExtractedTransaction]) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let mut inserted = 0;
        for txn in transactions {
            if inner.transactions.contains_key(&txn.unique_id) {
                debug!(unique_id = %txn.unique_id, "skipping duplicate transaction");
                continue;
            }
            inner
                .transactions
                .insert(txn.unique_id.clone(), txn.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn mark_status(&self, unique_id: &str, status: ProcessingStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let now = chrono::Utc::now();
        inner
            .states
            .entry(unique_id.to_string())
            .and_modify(|s| {
                s.status = status;
                s.last_attempt_at = now;
            })
            .or_insert(ProcessingState {
                status,
                retry_count: 0,
                first_attempt_at: now,
                last_attempt_at: now,
            });
        Ok(())
    }

    async fn settled_states(&self) -> Result<Vec<(String, ProcessingState)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .states
            .iter()
            .filter(|(_, s)| s.status.is_terminal())
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect())
    }

    async fn distinct_senders(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let mut senders: Vec<String> = inner
            .transactions
            .values()
            .map(|t| t.metadata.sender.clone())
            .collect();
        senders.sort();
        senders.dedup();
        Ok(senders)
    }

    async fn upsert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.checkpoints.insert(
            (checkpoint.scope_id.clone(), checkpoint.batch_id),
            checkpoint.clone(),
        );
        Ok(())
    }

    async fn load_checkpoint(&self, scope_id: &str, batch_id: u32) -> Result<Option<Checkpoint>> {
        let inner = self.inner.read().await;
        Ok(inner
            .checkpoints
            .get(&(scope_id.to_string(), batch_id))
            .cloned())
    }

    async fn transaction_count(&self) -> Result<usize> {
        let inner = self.inner.read().await;
        Ok(inner.transactions.len())
    }
}
