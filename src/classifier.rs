//! Pattern classifier
//!
//! Labels a raw message as financial or not. Exclusion patterns are
//! tested first because exclusion language ("OTP", "free gift") can
//! also trip weak financial signals; any exclusion match
//! short-circuits to non-financial with the category recorded.

use crate::models::{ClassificationResult, ExclusionCategory, RawMessage};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Empirically tuned weights and threshold. Kept in one place so a
/// retune never has to chase constants through the scoring code.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierWeights {
    pub topic_group_point: i32,
    pub bank_in_body_bonus: i32,
    pub amount_bonus: i32,
    pub bank_in_sender_bonus: i32,
    pub financial_threshold: i32,
}

impl Default for ClassifierWeights {
    fn default() -> Self {
        Self {
            topic_group_point: 1,
            bank_in_body_bonus: 2,
            amount_bonus: 2,
            bank_in_sender_bonus: 1,
            financial_threshold: 2,
        }
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){}", p)).expect("static pattern must compile"))
        .collect()
}

/// Exclusion pattern groups, in test order. Payment-request texts are
/// informational ("X has requested money") rather than transactions.
static EXCLUSION_PATTERNS: LazyLock<Vec<(ExclusionCategory, Vec<Regex>)>> = LazyLock::new(|| {
    vec![
        (
            ExclusionCategory::Otp,
            compile(&[
                r"otp|one\s*time\s*password|verification\s*code",
                r"\d{4,6}\s*is\s*your\s*otp|\d{4,6}\s*otp",
                r"verify.*account|authenticate.*account",
                r"login\s*code|access\s*code",
            ]),
        ),
        (
            ExclusionCategory::Promotional,
            compile(&[
                r"offer|discount|sale|deal|limited\s*time",
                r"free\s*(?:gift|voucher|coupon|delivery|shipping)",
                r"complimentary|voucher|coupon",
                r"win|winner|prize|contest|lucky\s*draw",
                r"avail\s*(?:now|today|this|offer|discount|free)",
                r"buy\s*1\s*get\s*1|payday\s*sale|flat\s*\d+%\s*off",
            ]),
        ),
        (
            ExclusionCategory::DataUsage,
            compile(&[
                r"data\s*usage|internet\s*usage|bandwidth",
                r"\d+%\s*data\s*used|\d+%\s*remaining",
                r"data\s*exhausted|data\s*renewal|data\s*plan",
            ]),
        ),
        (
            ExclusionCategory::ShoppingLogistics,
            compile(&[
                r"order.*(?:placed|confirmed|shipped|being\s*processed)",
                r"delivery|tracking|shipping|courier",
                r"shopping|cart|wishlist",
            ]),
        ),
        (
            ExclusionCategory::PaymentRequest,
            compile(&[
                r"has\s*requested\s*money|money\s*request",
                r"will\s*be\s*debited.*on\s*approving",
                r"pending.*complete.*checkout",
            ]),
        ),
        (
            ExclusionCategory::Social,
            compile(&[
                r"whatsapp|telegram|facebook|instagram|twitter",
                r"friend|contact\s*request|follow|like",
            ]),
        ),
        (
            ExclusionCategory::System,
            compile(&[
                r"system\s*maintenance|server\s*update|app\s*update",
                r"backup|sync|restore|password\s*reset",
                r"login|logout|session|timeout",
            ]),
        ),
    ]
});

/// Financial topic groups: one point per matching group.
static FINANCIAL_TOPIC_GROUPS: LazyLock<Vec<Vec<Regex>>> = LazyLock::new(|| {
    vec![
        // bank transactions
        compile(&[
            r"credited|debited|deposited|withdrawn|transfer|trf|trnsfr",
            r"account|a/c|ac\s*no|acc\s*no",
            r"balance|bal|avl\s*bal|available\s*balance",
            r"upi|imps|neft|rtgs|cheque|dd|demand\s*draft",
            r"ref\s*no|reference|transaction\s*id|txn\s*id",
        ]),
        // investment
        compile(&[
            r"mutual\s*fund|mf|sip|systematic\s*investment",
            r"stock|equity|shares|trading|brokerage",
            r"fd|fixed\s*deposit|recurring\s*deposit",
            r"dividend|interest|maturity|redemption",
            r"nav|units.*allotted|folio",
        ]),
        // credit cards
        compile(&[
            r"credit\s*card|card\s*ending|card\s*number",
            r"payment\s*due|minimum\s*amount|statement",
            r"transaction\s*alert|fraud\s*alert|suspicious",
        ]),
        // loans
        compile(&[
            r"loan|emi|equated\s*monthly\s*installment",
            r"repayment|overdue|late\s*fee|penalty",
            r"principal|outstanding|due\s*amount",
            r"sanctioned|disbursed",
        ]),
        // payments
        compile(&[
            r"payment.*(?:successful|completed|confirmed|received)",
            r"bill|utility|electricity|water|gas",
            r"rent|subscription|renewal",
        ]),
    ]
});

/// Bank and payment-platform names
static BANK_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"sbi|state\s*bank|statebank",
        r"hdfc",
        r"icici",
        r"axis\s*bank|axisbk",
        r"kotak",
        r"yes\s*bank|yesbank",
        r"idfc",
        r"indusind",
        r"federal\s*bank",
        r"canara",
        r"pnb|punjab\s*national\s*bank",
        r"boi|bank\s*of\s*india",
        r"union\s*bank",
        r"paytm|phonepe|gpay|amazon\s*pay",
        r"razorpay|payu|mobikwik|freecharge",
    ])
});

/// Currency / amount tokens
static AMOUNT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"rs\.?\s*\d+[,\d]*\.?\d*|₹\s*\d+[,\d]*\.?\d*",
        r"inr\s*\d+[,\d]*\.?\d*|\$\s*\d+[,\d]*\.?\d*",
        r"amount\s*rs\.?\s*\d+[,\d]*\.?\d*",
        r"debited\s*by\s*\d+[,\d]*\.?\d*",
        r"credited\s*inr\s*\d+[,\d]*\.?\d*",
    ])
});

/// Aggregate statistics from filtering a message set.
#[derive(Debug, Clone, Default)]
pub struct FilterStats {
    pub total: usize,
    pub financial: usize,
    pub exclusion_breakdown: HashMap<ExclusionCategory, usize>,
}

impl FilterStats {
    pub fn financial_percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.financial as f64 / self.total as f64 * 100.0
    }
}

/// Rule-based financial/non-financial scorer. Pure function over text.
pub struct PatternClassifier {
    weights: ClassifierWeights,
}

impl PatternClassifier {
    pub fn new(weights: ClassifierWeights) -> Self {
        Self { weights }
    }

    pub fn classify(&self, message: &RawMessage) -> ClassificationResult {
        let body = message.body.to_lowercase();
        let sender = message.sender.to_lowercase();

        // Exclusions first
        for (category, patterns) in EXCLUSION_PATTERNS.iter() {
            if patterns.iter().any(|p| p.is_match(&body)) {
                return ClassificationResult {
                    is_financial: false,
                    score: 0,
                    exclusion_category: Some(*category),
                };
            }
        }

        let mut score = 0;

        for group in FINANCIAL_TOPIC_GROUPS.iter() {
            if group.iter().any(|p| p.is_match(&body)) {
                score += self.weights.topic_group_point;
            }
        }

        if BANK_PATTERNS.iter().any(|p| p.is_match(&body)) {
            score += self.weights.bank_in_body_bonus;
        }

        if AMOUNT_PATTERNS.iter().any(|p| p.is_match(&body)) {
            score += self.weights.amount_bonus;
        }

        if BANK_PATTERNS.iter().any(|p| p.is_match(&sender)) {
            score += self.weights.bank_in_sender_bonus;
        }

        ClassificationResult {
            is_financial: score >= self.weights.financial_threshold,
            score,
            exclusion_category: None,
        }
    }

    /// Split a message set into its financial subset, recording why
    /// the rest were rejected.
    pub fn filter_batch<'a>(
        &self,
        messages: &'a [RawMessage],
    ) -> (Vec<&'a RawMessage>, FilterStats) {
        let mut financial = Vec::new();
        let mut stats = FilterStats {
            total: messages.len(),
            ..Default::default()
        };

        for message in messages {
            let result = self.classify(message);
            if result.is_financial {
                financial.push(message);
            } else if let Some(category) = result.exclusion_category {
                *stats.exclusion_breakdown.entry(category).or_insert(0) += 1;
            }
        }

        stats.financial = financial.len();
        (financial, stats)
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new(ClassifierWeights::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(sender: &str, body: &str) -> RawMessage {
        RawMessage {
            sender: sender.to_string(),
            body: body.to_string(),
            timestamp: Utc::now(),
            channel: "sms".to_string(),
            unique_id: "sms_000001".to_string(),
        }
    }

    #[test]
    fn test_otp_excluded_despite_financial_terms() {
        let m = msg(
            "AX-HDFCBK",
            "123456 is your OTP for transaction of Rs.5000 from A/c XX1234",
        );
        let result = PatternClassifier::default().classify(&m);
        assert!(!result.is_financial);
        assert_eq!(result.exclusion_category, Some(ExclusionCategory::Otp));
    }

    #[test]
    fn test_credit_sms_is_financial() {
        let m = msg(
            "AX-SBIINB-S",
            "Dear Customer, Your a/c no. XXXXXXXX9855 is credited by Rs.60000.00 \
             on 02-07-25 by a/c linked to mobile-STATION91 (IMPS Ref no 518359214156). -SBI",
        );
        let result = PatternClassifier::default().classify(&m);
        assert!(result.is_financial);
        assert!(result.score >= 2);
    }

    #[test]
    fn test_promotional_excluded() {
        let m = msg("VM-SHOPX", "Flat 50% off! Limited time offer, avail now");
        let result = PatternClassifier::default().classify(&m);
        assert!(!result.is_financial);
        assert_eq!(
            result.exclusion_category,
            Some(ExclusionCategory::Promotional)
        );
    }

    #[test]
    fn test_plain_chat_not_financial() {
        let m = msg("FRIEND", "see you at dinner tonight");
        let result = PatternClassifier::default().classify(&m);
        assert!(!result.is_financial);
        assert_eq!(result.exclusion_category, None);
    }

    #[test]
    fn test_filter_batch_breakdown() {
        let messages = vec![
            msg("SBI", "A/c X9855 debited by Rs.44.0 trf to MIDAS Refno 5656"),
            msg("VERIFY", "999999 is your OTP"),
            msg("SHOP", "Your order has been shipped, tracking inside"),
        ];
        let (financial, stats) = PatternClassifier::default().filter_batch(&messages);
        assert_eq!(financial.len(), 1);
        assert_eq!(stats.total, 3);
        assert_eq!(
            stats.exclusion_breakdown.get(&ExclusionCategory::Otp),
            Some(&1)
        );
        assert_eq!(
            stats
                .exclusion_breakdown
                .get(&ExclusionCategory::ShoppingLogistics),
            Some(&1)
        );
    }
}
