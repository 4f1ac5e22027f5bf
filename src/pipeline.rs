//! End-to-end extraction orchestration
//!
//! A run classifies the input, drops messages already settled by a
//! previous run, then processes the financial subset in adaptively
//! sized batches. Batches in a group run concurrently; groups run
//! sequentially with a pause between them to stay polite to the
//! upstream endpoint. Per message the order is cache, then LLM, then
//! the rule-based fallback; messages failing all three go through the
//! retry manager and eventually the dead-letter set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheStats, IntelligentCache};
use crate::checkpoint::{batch_checkpoint, CheckpointTracker};
use crate::classifier::{FilterStats, PatternClassifier};
use crate::config::{LlmConfig, PipelineConfig};
use crate::error::Result;
use crate::fallback::RuleBasedExtractor;
use crate::limiter::{AdaptiveRateLimiter, LimiterStats};
use crate::llm::LlmClient;
use crate::models::{ExtractedTransaction, MessageIntent, ProcessingStatus, RawMessage};
use crate::recovery::{
    ErrorRecoveryManager, FailureDisposition, FailureKind, RecoveryStats,
};
use crate::store::TransactionStore;

// Retry rounds are bounded by max_retries anyway; this is a hard stop
// against scheduling bugs.
const MAX_RETRY_ROUNDS: u32 = 8;

#[derive(Debug)]
pub struct RunSummary {
    pub total_messages: usize,
    pub financial_messages: usize,
    pub skipped_settled: usize,
    pub succeeded: usize,
    pub dead_lettered: usize,
    pub intent_breakdown: HashMap<MessageIntent, usize>,
    pub filter_stats: FilterStats,
    pub cache_stats: CacheStats,
    pub limiter_stats: LimiterStats,
    pub recovery_stats: RecoveryStats,
    pub elapsed: Duration,
}

type MessageOutcome = std::result::Result<ExtractedTransaction, (FailureKind, String)>;

/// Shared per-message extraction services, cheap to clone into tasks.
#[derive(Clone)]
struct Extractors {
    cache: Arc<IntelligentCache>,
    llm: Option<Arc<LlmClient>>,
    fallback: Arc<RuleBasedExtractor>,
    min_confidence: f64,
    message_timeout: Duration,
}

impl Extractors {
    async fn process(&self, message: &RawMessage) -> MessageOutcome {
        match tokio::time::timeout(self.message_timeout, self.process_inner(message)).await {
            Ok(outcome) => outcome,
            Err(_) => Err((
                FailureKind::Timeout,
                format!("exceeded {:?} budget", self.message_timeout),
            )),
        }
    }

    async fn process_inner(&self, message: &RawMessage) -> MessageOutcome {
        if let Some(hit) = self.cache.lookup(message) {
            return Ok(hit);
        }

        if let Some(llm) = &self.llm {
            if let Some(txn) = llm.extract(message).await {
                self.cache.store(message, txn.clone());
                return Ok(txn);
            }
        }

        let txn = self.fallback.extract(message);
        if txn.confidence_score >= self.min_confidence {
            Ok(txn)
        } else {
            Err((
                FailureKind::MissingEssentialFields,
                format!(
                    "no extractor produced a usable record (confidence {:.2})",
                    txn.confidence_score
                ),
            ))
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    scope_id: String,
    classifier: PatternClassifier,
    extractors: Extractors,
    limiter: Arc<AdaptiveRateLimiter>,
    recovery: Arc<ErrorRecoveryManager>,
    tracker: Arc<CheckpointTracker>,
    store: Arc<dyn TransactionStore>,
}

impl Pipeline {
    /// Build a pipeline. The LLM client, when configured, shares the
    /// pipeline's rate limiter so observed call latencies feed back
    /// into batch pacing.
    pub fn new(
        config: PipelineConfig,
        llm: Option<LlmConfig>,
        store: Arc<dyn TransactionStore>,
    ) -> Result<Self> {
        let limiter = Arc::new(AdaptiveRateLimiter::new(config.limiter));
        let llm = llm
            .map(|c| LlmClient::new(c, limiter.clone(), config.enrich))
            .transpose()?;
        let extractors = Extractors {
            cache: Arc::new(IntelligentCache::new(config.cache)),
            llm: llm.map(Arc::new),
            fallback: Arc::new(RuleBasedExtractor::new()),
            min_confidence: config.min_confidence,
            message_timeout: config.message_timeout,
        };
        let recovery = Arc::new(ErrorRecoveryManager::new(config.recovery));
        Ok(Self {
            scope_id: Uuid::new_v4().to_string(),
            classifier: PatternClassifier::default(),
            extractors,
            limiter,
            recovery,
            tracker: Arc::new(CheckpointTracker::new()),
            store,
            config,
        })
    }

    /// The rate limiter handle, for wiring into an [`LlmClient`].
    pub fn limiter(&self) -> Arc<AdaptiveRateLimiter> {
        self.limiter.clone()
    }

    pub fn recovery(&self) -> &ErrorRecoveryManager {
        &self.recovery
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    /// Run the full pipeline over a message set.
    pub async fn run(&self, messages: &[RawMessage]) -> Result<RunSummary> {
        let started = std::time::Instant::now();

        // Resume awareness: statuses settled by earlier runs are
        // seeded into the tracker so their messages are skipped.
        self.tracker.seed(self.store.settled_states().await?);

        let (financial, filter_stats) = self.classifier.filter_batch(messages);
        let financial_count = financial.len();
        info!(
            total = messages.len(),
            financial = financial_count,
            pct = format!("{:.1}", filter_stats.financial_percentage()),
            "classification complete"
        );

        let pending: Vec<RawMessage> = financial
            .into_iter()
            .filter(|m| !self.tracker.is_terminal(&m.unique_id))
            .cloned()
            .collect();
        let skipped_settled = financial_count - pending.len();
        if skipped_settled > 0 {
            info!(skipped_settled, "resuming past settled messages");
        }

        let mut succeeded = 0usize;
        let mut dead_lettered = 0usize;
        let mut intent_breakdown = HashMap::new();
        let mut batch_id = 0u32;
        let mut remaining = pending.as_slice();

        while !remaining.is_empty() {
            let batch_size = self.limiter.batch_size(self.config.batch_size).max(1);
            let group_span = batch_size * self.config.parallel_batches.max(1);
            let (group, rest) = remaining.split_at(group_span.min(remaining.len()));
            remaining = rest;

            let mut batches = JoinSet::new();
            for batch in group.chunks(batch_size) {
                let batch: Vec<RawMessage> = batch.to_vec();
                let extractors = self.extractors.clone();
                let limiter = self.limiter.clone();
                let id = batch_id;
                batch_id += 1;
                batches.spawn(async move {
                    limiter.wait().await;
                    let mut outcomes = Vec::with_capacity(batch.len());
                    let mut tasks = JoinSet::new();
                    for message in batch {
                        let extractors = extractors.clone();
                        tasks.spawn(async move {
                            let outcome = extractors.process(&message).await;
                            (message, outcome)
                        });
                    }
                    while let Some(joined) = tasks.join_next().await {
                        match joined {
                            Ok(pair) => outcomes.push(pair),
                            Err(err) => error!(error = %err, "message task panicked"),
                        }
                    }
                    (id, outcomes)
                });
            }

            while let Some(joined) = batches.join_next().await {
                let (id, outcomes) = match joined {
                    Ok(result) => result,
                    Err(err) => {
                        error!(error = %err, "batch task panicked");
                        continue;
                    }
                };
                let (batch_succeeded, batch_dead) = self
                    .settle_batch(id, outcomes, &mut intent_breakdown)
                    .await?;
                succeeded += batch_succeeded;
                dead_lettered += batch_dead;
            }

            if !remaining.is_empty() {
                tokio::time::sleep(self.config.inter_group_pause).await;
            }
        }

        let (retry_succeeded, retry_dead) = self.drain_retries(&mut intent_breakdown).await?;
        succeeded += retry_succeeded;
        dead_lettered += retry_dead;

        Ok(RunSummary {
            total_messages: messages.len(),
            financial_messages: financial_count,
            skipped_settled,
            succeeded,
            dead_lettered,
            intent_breakdown,
            filter_stats,
            cache_stats: self.extractors.cache.stats(),
            limiter_stats: self.limiter.stats(),
            recovery_stats: self.recovery.stats(),
            elapsed: started.elapsed(),
        })
    }

    /// Persist a batch's outcomes and record its checkpoint.
    async fn settle_batch(
        &self,
        batch_id: u32,
        outcomes: Vec<(RawMessage, MessageOutcome)>,
        intent_breakdown: &mut HashMap<MessageIntent, usize>,
    ) -> Result<(usize, usize)> {
        let total = outcomes.len();
        let mut transactions = Vec::new();
        let mut dead = 0usize;
        let mut last_processed_id = None;

        for (message, outcome) in outcomes {
            match outcome {
                Ok(txn) => {
                    if self.tracker.mark(&message.unique_id, ProcessingStatus::Success) {
                        self.store
                            .mark_status(&message.unique_id, ProcessingStatus::Success)
                            .await?;
                        last_processed_id = Some(message.unique_id.clone());
                        *intent_breakdown.entry(txn.message_intent).or_insert(0) += 1;
                        transactions.push(txn);
                    }
                }
                Err((kind, detail)) => {
                    match self.recovery.report_failure(&message, kind, &detail) {
                        FailureDisposition::DeadLettered => {
                            dead += 1;
                            self.tracker
                                .mark(&message.unique_id, ProcessingStatus::DeadLettered);
                            self.store
                                .mark_status(&message.unique_id, ProcessingStatus::DeadLettered)
                                .await?;
                        }
                        FailureDisposition::Retry(delay) => {
                            warn!(
                                unique_id = %message.unique_id,
                                delay_secs = delay.as_secs_f64(),
                                "message queued for retry"
                            );
                        }
                    }
                }
            }
        }

        let inserted = self.store.insert_transactions(&transactions).await?;
        let settled = transactions.len() + dead;
        self.store
            .upsert_checkpoint(&batch_checkpoint(
                &self.scope_id,
                batch_id,
                total,
                settled,
                last_processed_id,
            ))
            .await?;
        info!(batch_id, total, inserted, dead, "batch settled");
        Ok((transactions.len(), dead))
    }

    /// Reprocess queued transient failures until the queue drains.
    async fn drain_retries(
        &self,
        intent_breakdown: &mut HashMap<MessageIntent, usize>,
    ) -> Result<(usize, usize)> {
        let mut succeeded = 0usize;
        let mut dead = 0usize;

        for _round in 0..MAX_RETRY_ROUNDS {
            let pending = self.recovery.pending();
            if pending.is_empty() {
                break;
            }
            let wait = pending
                .iter()
                .map(|(_, delay)| *delay)
                .max()
                .unwrap_or_default();
            info!(pending = pending.len(), "retry round starting");
            tokio::time::sleep(wait).await;

            let mut tasks = JoinSet::new();
            for (message, _) in pending {
                let extractors = self.extractors.clone();
                tasks.spawn(async move {
                    let outcome = extractors.process(&message).await;
                    (message, outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let Ok((message, outcome)) = joined else {
                    continue;
                };
                match outcome {
                    Ok(txn) => {
                        self.recovery.resolve(&message.unique_id);
                        if self.tracker.mark(&message.unique_id, ProcessingStatus::Success) {
                            self.store
                                .mark_status(&message.unique_id, ProcessingStatus::Success)
                                .await?;
                            *intent_breakdown.entry(txn.message_intent).or_insert(0) += 1;
                            self.store.insert_transactions(&[txn]).await?;
                            succeeded += 1;
                        }
                    }
                    Err((kind, detail)) => {
                        if self.recovery.report_failure(&message, kind, &detail)
                            == FailureDisposition::DeadLettered
                        {
                            dead += 1;
                            self.tracker
                                .mark(&message.unique_id, ProcessingStatus::DeadLettered);
                            self.store
                                .mark_status(&message.unique_id, ProcessingStatus::DeadLettered)
                                .await?;
                        }
                    }
                }
            }
        }

        Ok((succeeded, dead))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::config::EnrichMode;
    use crate::limiter::LimiterConfig;
    use crate::recovery::RecoveryConfig;
    use crate::store::InMemoryStore;
    use chrono::Utc;

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            batch_size: 2,
            parallel_batches: 2,
            message_timeout: Duration::from_secs(5),
            inter_group_pause: Duration::ZERO,
            min_confidence: 0.3,
            enrich: EnrichMode::Safe,
            use_llm: false,
            limiter: LimiterConfig {
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                initial_delay: Duration::from_millis(1),
                target_latency: Duration::from_secs(5),
            },
            recovery: RecoveryConfig {
                max_retries: 2,
                backoff_factor: 2.0,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
            cache: CacheConfig::default(),
        }
    }

    fn message(id: &str, sender: &str, body: &str) -> RawMessage {
        RawMessage {
            sender: sender.to_string(),
            body: body.to_string(),
            timestamp: Utc::now(),
            channel: "sms".to_string(),
            unique_id: id.to_string(),
        }
    }

    fn sample_messages() -> Vec<RawMessage> {
        vec![
            message(
                "m1",
                "AX-SBIUPI",
                "Dear UPI user A/C X9855 debited by 44.0 on date 03Jul25 trf to STATION91 Refno 565625035570",
            ),
            message(
                "m2",
                "CP-SBIBNK",
                "Dear Customer, Rs.60000.00 credited to your A/c No XX4318 on 02-07-25 by STATION91",
            ),
            message("m3", "VK-PROMO", "Mega sale! 50% off on all items, shop now"),
            message("m4", "VK-SBIOTP", "Your OTP for login is 482913. Do not share."),
        ]
    }

    #[tokio::test]
    async fn test_run_extracts_financial_subset() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = Pipeline::new(fast_config(), None, store.clone()).expect("pipeline should build");

        let summary = pipeline
            .run(&sample_messages())
            .await
            .expect("run should succeed");

        assert_eq!(summary.total_messages, 4);
        assert_eq!(summary.financial_messages, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.dead_lettered, 0);
        assert_eq!(
            summary.intent_breakdown.get(&MessageIntent::Transaction),
            Some(&2)
        );
        assert_eq!(
            store
                .transaction_count()
                .await
                .expect("count should succeed"),
            2
        );
    }

    #[tokio::test]
    async fn test_second_run_skips_settled_messages() {
        let store = Arc::new(InMemoryStore::new());
        let messages = sample_messages();

        let first = Pipeline::new(fast_config(), None, store.clone()).expect("pipeline should build");
        first.run(&messages).await.expect("run should succeed");

        let second = Pipeline::new(fast_config(), None, store.clone()).expect("pipeline should build");
        let summary = second.run(&messages).await.expect("run should succeed");

        assert_eq!(summary.skipped_settled, 2);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(
            store
                .transaction_count()
                .await
                .expect("count should succeed"),
            2
        );
    }

    #[tokio::test]
    async fn test_unusable_extraction_dead_letters() {
        let store = Arc::new(InMemoryStore::new());
        let mut config = fast_config();
        // force even complete fallback records below the bar
        config.min_confidence = 0.95;
        let pipeline = Pipeline::new(config, None, store.clone()).expect("pipeline should build");

        let messages = vec![message(
            "m1",
            "UNKNOWN",
            "A/c debited by Rs.500.00 on 01-01-25",
        )];
        let summary = pipeline.run(&messages).await.expect("run should succeed");

        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(pipeline.recovery().dead_letters().len(), 1);
        assert_eq!(
            store
                .transaction_count()
                .await
                .expect("count should succeed"),
            0
        );
    }

    #[tokio::test]
    async fn test_checkpoints_written_per_batch() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = Pipeline::new(fast_config(), None, store.clone()).expect("pipeline should build");
        pipeline
            .run(&sample_messages())
            .await
            .expect("run should succeed");

        let cp = store
            .load_checkpoint(pipeline.scope_id(), 0)
            .await
            .expect("load should succeed")
            .expect("checkpoint should exist");
        assert_eq!(cp.total, 2);
        assert_eq!(cp.processed, 2);
    }
}
