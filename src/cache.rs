//! Pattern-keyed result cache
//!
//! Bank SMS traffic is heavily templated, so extractions for one
//! message usually apply verbatim to the next message from the same
//! template. Keys are derived from message structure rather than raw
//! text, which lets structurally identical messages share a cached
//! extraction even when amounts or reference numbers differ slightly.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::models::{ExtractedTransaction, RawMessage};

const EVICTION_FRACTION: f64 = 0.2;

const DEBIT_WORDS: &[&str] = &["debit", "deducted", "spent", "paid"];
const CREDIT_WORDS: &[&str] = &["credit", "credited", "received", "added"];
const TRANSFER_WORDS: &[&str] = &["transfer", "sent", "moved"];

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

struct CacheEntry {
    result: ExtractedTransaction,
    created_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct IntelligentCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl IntelligentCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Derive the pattern key a message caches under.
    ///
    /// Transactional messages key on direction, amount magnitude and
    /// sender; OTP and balance messages key on sender alone; anything
    /// else keys on a short hash of the normalized body.
    pub fn pattern_key(message: &RawMessage) -> String {
        let body = message.body.to_lowercase();
        let sender = message.sender.to_uppercase();

        if body.contains("upi") || body.contains("transaction") {
            let direction = classify_direction(&body);
            let magnitude = amount_magnitude(&body);
            format!("financial_{direction}_{magnitude}_{sender}")
        } else if body.contains("otp") {
            format!("otp_{sender}")
        } else if body.contains("balance") {
            format!("balance_{sender}")
        } else {
            let normalized: String = body
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == ' ')
                .collect();
            let digest = Sha256::digest(normalized.as_bytes());
            format!("generic_{}_{sender}", &hex::encode(digest)[..8])
        }
    }

    /// Look up a cached extraction for a structurally similar message.
    /// On a hit the cached record is rebound to this message's identity
    /// so the caller never sees another message's id in the result.
    pub fn lookup(&self, message: &RawMessage) -> Option<ExtractedTransaction> {
        let key = Self::pattern_key(message);
        let mut state = self.state.lock().expect("cache lock poisoned");

        let expired = matches!(
            state.entries.get(&key),
            Some(entry) if entry.created_at.elapsed() >= self.config.ttl
        );
        if expired {
            state.entries.remove(&key);
        }

        match state.entries.get(&key).map(|entry| entry.result.clone()) {
            Some(cached) => {
                state.hits += 1;
                let mut result = cached;
                result.unique_id = message.unique_id.clone();
                result.metadata.sender = message.sender.clone();
                result.metadata.original_text = message.body.clone();
                debug!(%key, "cache hit");
                Some(result)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    pub fn store(&self, message: &RawMessage, result: ExtractedTransaction) {
        let key = Self::pattern_key(message);
        let mut state = self.state.lock().expect("cache lock poisoned");

        if state.entries.len() >= self.config.max_entries && !state.entries.contains_key(&key) {
            evict_oldest(&mut state.entries, self.config.max_entries);
        }

        state.entries.insert(
            key,
            CacheEntry {
                result,
                created_at: Instant::now(),
            },
        );
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().expect("cache lock poisoned");
        CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
        }
    }
}

impl Default for IntelligentCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

fn classify_direction(body: &str) -> &'static str {
    if DEBIT_WORDS.iter().any(|w| body.contains(w)) {
        "debit"
    } else if CREDIT_WORDS.iter().any(|w| body.contains(w)) {
        "credit"
    } else if TRANSFER_WORDS.iter().any(|w| body.contains(w)) {
        "transfer"
    } else {
        "unknown"
    }
}

/// Bucket the first amount found in the body by order of magnitude.
fn amount_magnitude(body: &str) -> &'static str {
    static AMOUNT: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"(?i)(?:rs\.?|inr|₹)\s*([\d,]+(?:\.\d{1,2})?)")
            .expect("amount pattern must compile")
    });

    let Some(caps) = AMOUNT.captures(body) else {
        return "no_amount";
    };
    let raw = caps[1].replace(',', "");
    match raw.parse::<f64>() {
        Ok(v) if v < 100.0 => "small",
        Ok(v) if v < 1_000.0 => "medium",
        Ok(v) if v < 10_000.0 => "large",
        Ok(_) => "xlarge",
        Err(_) => "unknown",
    }
}

/// Drop the oldest 20% of entries to make room for new patterns.
fn evict_oldest(entries: &mut HashMap<String, CacheEntry>, max_entries: usize) {
    let evict_count = ((max_entries as f64 * EVICTION_FRACTION) as usize).max(1);
    let mut by_age: Vec<(String, Instant)> = entries
        .iter()
        .map(|(k, e)| (k.clone(), e.created_at))
        .collect();
    by_age.sort_by_key(|(_, created)| *created);
    for (key, _) in by_age.into_iter().take(evict_count) {
        entries.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::RuleBasedExtractor;
    use chrono::Utc;

    fn message(sender: &str, body: &str, unique_id: &str) -> RawMessage {
        RawMessage {
            sender: sender.to_string(),
            body: body.to_string(),
            timestamp: Utc::now(),
            channel: "sms".to_string(),
            unique_id: unique_id.to_string(),
        }
    }

    #[test]
    fn test_financial_pattern_key_shape() {
        let msg = message(
            "AX-SBIUPI",
            "Dear UPI user A/C X9855 debited by 44.0 on date 03Jul25",
            "m1",
        );
        // amount has no currency marker, so magnitude is no_amount
        assert_eq!(
            IntelligentCache::pattern_key(&msg),
            "financial_debit_no_amount_AX-SBIUPI"
        );

        let msg = message("HDFCBK", "UPI transaction of Rs.2,500.00 credited", "m2");
        assert_eq!(
            IntelligentCache::pattern_key(&msg),
            "financial_credit_large_HDFCBK"
        );
    }

    #[test]
    fn test_otp_and_balance_keys() {
        let otp = message("VK-SBIOTP", "Your OTP is 482913", "m1");
        assert_eq!(IntelligentCache::pattern_key(&otp), "otp_VK-SBIOTP");

        let bal = message("SBIINB", "Available balance in A/c X1234 is Rs.500", "m2");
        assert_eq!(IntelligentCache::pattern_key(&bal), "balance_SBIINB");
    }

    #[test]
    fn test_generic_key_is_stable_across_whitespace() {
        let a = message("FRIEND", "see you   at 5", "m1");
        let b = message("FRIEND", "see you at 5", "m2");
        assert_eq!(
            IntelligentCache::pattern_key(&a),
            IntelligentCache::pattern_key(&b)
        );
    }

    #[test]
    fn test_hit_rebinds_unique_id() {
        let cache = IntelligentCache::default();
        let first = message("AX-SBIUPI", "UPI debited by Rs.44.00", "m1");
        let second = message("AX-SBIUPI", "UPI debited by Rs.44.00", "m2");

        cache.store(&first, RuleBasedExtractor::new().extract(&first));
        let hit = cache.lookup(&second).expect("expected a cache hit");
        assert_eq!(hit.unique_id, "m2");
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_miss_on_different_pattern() {
        let cache = IntelligentCache::default();
        let debit = message("AX-SBIUPI", "UPI debited by Rs.44.00", "m1");
        let credit = message("AX-SBIUPI", "UPI credited by Rs.44.00", "m2");

        cache.store(&debit, RuleBasedExtractor::new().extract(&debit));
        assert!(cache.lookup(&credit).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = IntelligentCache::new(CacheConfig {
            max_entries: 100,
            ttl: Duration::ZERO,
        });
        let msg = message("AX-SBIUPI", "UPI debited by Rs.44.00", "m1");
        cache.store(&msg, RuleBasedExtractor::new().extract(&msg));
        assert!(cache.lookup(&msg).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_eviction_keeps_capacity_bounded() {
        let cache = IntelligentCache::new(CacheConfig {
            max_entries: 10,
            ttl: Duration::from_secs(3600),
        });
        for i in 0..15 {
            let msg = message(&format!("SENDER{i}"), "Your OTP is 1234", &format!("m{i}"));
            cache.store(&msg, RuleBasedExtractor::new().extract(&msg));
        }
        assert!(cache.stats().entries <= 10);
    }
}
