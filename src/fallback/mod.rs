//! Deterministic rule-based transaction extractor
//!
//! Fallback for when the LLM path is unavailable or returns unusable
//! output. Produces the full `ExtractedTransaction` schema with no
//! external call; unresolvable fields are left absent, never guessed.

use crate::models::{
    Account, Category, ExtractedTransaction, MessageIntent, PaymentMethod, RawMessage,
    TransactionMetadata, TransactionType,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

/// Confidence contract shared with downstream gating: base 0.2,
/// +0.3 amount, +0.3 type, +0.2 bank, capped at 1.0.
const CONFIDENCE_BASE: f64 = 0.2;
const CONFIDENCE_AMOUNT: f64 = 0.3;
const CONFIDENCE_TYPE: f64 = 0.3;
const CONFIDENCE_BANK: f64 = 0.2;

const MIN_COUNTERPARTY_LEN: usize = 4;
const MAX_TAGS: usize = 5;

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){}", p)).expect("static pattern must compile"))
        .collect()
}

/// Amount patterns in priority order; group 1 captures the numeric token.
static AMOUNT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"rs[\.:\s]*(\d+(?:,\d+)*(?:\.\d+)?)",
        r"₹\s*(\d+(?:,\d+)*(?:\.\d+)?)",
        r"inr[\.:\s]*(\d+(?:,\d+)*(?:\.\d+)?)",
        r"(?:debited|credited|withdrawn|deposited|paid|received)\s+(?:by\s+)?(?:rs[\.:\s]*|₹\s*)?(\d+(?:,\d+)*(?:\.\d+)?)",
        r"(?:amount|amt)\s+(?:of\s+)?(?:rs[\.:\s]*|₹\s*)?(\d+(?:,\d+)*(?:\.\d+)?)",
        r"(\d+(?:,\d+)*(?:\.\d+)?)\s*(?:rs|rupees|₹)",
        r"(?:transfer|trf|sent|received)\s+(?:of\s+)?(?:rs[\.:\s]*|₹\s*)?(\d+(?:,\d+)*(?:\.\d+)?)",
    ])
});

static DEBIT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"debited|debit|withdrawn|paid|sent|transfer(?:red)?.*to|trf.*to",
        r"purchase|spent|charged|deducted|emi|bill\s+payment",
        r"atm.*withdrawn|card.*transaction|payment.*made",
    ])
});

static CREDIT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"credited|credit|deposited|received|refund|cashback",
        r"salary|dividend|interest|bonus|reward|settlement",
        r"transfer(?:red)?.*from|received.*from|credited.*by",
    ])
});

static ACCOUNT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"a/c\s+(?:no\.?\s*)?([x\d]{4,})",
        r"account\s+(?:no\.?\s*)?([x\d]{4,})",
        r"a/c\s*([x\d]{4,})",
        r"(?:from|to)\s+a/c\s*([x\d]{4,})",
    ])
});

static DATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"on\s+(\d{1,2}[-/]\d{1,2}[-/]\d{2,4})",
        r"date\s+(\d{1,2}[-/]\d{1,2}[-/]\d{2,4})",
        r"(\d{1,2}[-/]\d{1,2}[-/]\d{2,4})",
        r"on\s+(\d{1,2}[a-z]{3}\d{2,4})",
        r"date\s+(\d{1,2}[a-z]{3}\d{2,4})",
    ])
});

const DATE_FORMATS: &[&str] = &["%d-%m-%y", "%d/%m/%y", "%d-%m-%Y", "%d/%m/%Y", "%d%b%y", "%d%b%Y"];

static BALANCE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?:available\s+)?balance\s+(?:rs\.?\s*|₹\s*)?(\d+(?:,\d+)*(?:\.\d+)?)",
        r"bal\s+(?:rs\.?\s*|₹\s*)?(\d+(?:,\d+)*(?:\.\d+)?)",
        r"(?:current\s+)?balance.*?(?:rs\.?\s*|₹\s*)?(\d+(?:,\d+)*(?:\.\d+)?)",
    ])
});

static REFERENCE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"ref(?:no|erence)?\s*:?\s*(\w+)",
        r"transaction\s+(?:no|number|id)\s*:?\s*(\w+)",
        r"utr\s*:?\s*(\w+)",
        r"txn\s+(?:id|no)\s*:?\s*(\w+)",
        r"(?:imps|neft|rtgs)\s+ref\s+no\s+(\w+)",
    ])
});

static COUNTERPARTY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?:trf\s+to|transfer(?:red)?\s+to|sent\s+to|paid\s+to)\s+([^.]+?)(?:\s+ref|$|\.|,)",
        r"(?:from|by)\s+([^.]+?)(?:\s+\(|$|\.|,|-)",
        r"(?:received\s+from|credited\s+by)\s+([^.]+?)(?:\s+\(|$|\.|,)",
        r"(?:merchant|vendor|payee):\s*([^.]+?)(?:$|\.|,)",
    ])
});

/// Payment-method buckets in detection order.
static METHOD_PATTERNS: LazyLock<Vec<(PaymentMethod, Vec<Regex>)>> = LazyLock::new(|| {
    vec![
        (PaymentMethod::Upi, compile(&[r"upi", r"@\w+", r"vpa"])),
        (PaymentMethod::Imps, compile(&[r"imps"])),
        (PaymentMethod::Neft, compile(&[r"neft"])),
        (PaymentMethod::Rtgs, compile(&[r"rtgs"])),
        (PaymentMethod::Atm, compile(&[r"atm", r"cash\s+withdrawal"])),
        (PaymentMethod::Card, compile(&[r"card", r"pos", r"swipe"])),
        (
            PaymentMethod::Online,
            compile(&[r"internet\s+banking", r"online", r"net\s+banking"]),
        ),
        (
            PaymentMethod::Cheque,
            compile(&[r"cheque", r"check", r"demand\s+draft"]),
        ),
    ]
});

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("static pattern must compile"));
static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s-]").expect("static pattern must compile"));
static BANK_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-([a-z]+)$").expect("static pattern must compile"));
static BANK_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([a-z]+)\s+bank").expect("static pattern must compile"));

/// Sender/body alias → canonical bank name. Ordered so longer,
/// more specific aliases win before their prefixes.
const BANK_ALIASES: &[(&str, &str)] = &[
    ("sbiupi", "State Bank of India"),
    ("sbiinb", "State Bank of India"),
    ("cbssbi", "State Bank of India"),
    ("sbipsg", "State Bank of India"),
    ("atmsbi", "State Bank of India"),
    ("sbi", "State Bank of India"),
    ("hdfcbank", "HDFC Bank"),
    ("hdfcbk", "HDFC Bank"),
    ("hdfc", "HDFC Bank"),
    ("icicibank", "ICICI Bank"),
    ("icicibk", "ICICI Bank"),
    ("icici", "ICICI Bank"),
    ("axisbank", "Axis Bank"),
    ("axisbk", "Axis Bank"),
    ("axis", "Axis Bank"),
    ("kotakbank", "Kotak Mahindra Bank"),
    ("kotak", "Kotak Mahindra Bank"),
    ("yesbank", "Yes Bank"),
    ("yesbk", "Yes Bank"),
    ("yes", "Yes Bank"),
    ("pnb", "Punjab National Bank"),
    ("boi", "Bank of India"),
    ("canara", "Canara Bank"),
    ("union", "Union Bank"),
    ("idbi", "IDBI Bank"),
    ("indusind", "IndusInd Bank"),
    ("federal", "Federal Bank"),
    ("karur", "Karur Vysya Bank"),
    ("rbl", "RBL Bank"),
    ("phonpe", "PhonePe"),
    ("paytm", "Paytm"),
    ("gpay", "Google Pay"),
    ("amazonpay", "Amazon Pay"),
    ("mobikwik", "MobiKwik"),
    ("freecharge", "FreeCharge"),
];

/// Rule-based extractor; `extract` is total over well-formed input.
#[derive(Debug, Default)]
pub struct RuleBasedExtractor;

impl RuleBasedExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract a full transaction record from a raw message.
    pub fn extract(&self, message: &RawMessage) -> ExtractedTransaction {
        let body = &message.body;

        let amount = extract_amount(body);
        let transaction_type = extract_transaction_type(body);
        let bank = extract_bank_name(&message.sender, body);
        let account_number = extract_account_number(body);
        let transaction_date = extract_transaction_date(body, message.timestamp);
        let balance = extract_balance(body);
        let reference_id = extract_reference_id(body);
        let counterparty = extract_counterparty(body);
        let method = extract_payment_method(body);
        let category = categorize(body, counterparty.as_deref());
        let message_intent = determine_intent(body, transaction_type);

        let tags = generate_tags(body, category);
        let summary = generate_summary(transaction_type, amount, counterparty.as_deref());
        let confidence_score = confidence(amount, transaction_type, bank.as_deref());

        ExtractedTransaction {
            unique_id: message.unique_id.clone(),
            transaction_type,
            amount,
            currency: "INR".to_string(),
            transaction_date,
            account: Account {
                bank,
                account_number,
            },
            counterparty,
            balance,
            category,
            tags,
            summary,
            confidence_score,
            message_intent,
            metadata: TransactionMetadata {
                channel: message.channel.clone(),
                sender: message.sender.clone(),
                method,
                reference_id,
                original_text: message.body.clone(),
            },
        }
    }
}

fn parse_numeric(token: &str) -> Option<f64> {
    token.replace(',', "").parse::<f64>().ok()
}

fn extract_amount(body: &str) -> Option<f64> {
    for pattern in AMOUNT_PATTERNS.iter() {
        for capture in pattern.captures_iter(body) {
            if let Some(amount) = capture.get(1).and_then(|m| parse_numeric(m.as_str())) {
                if amount > 0.0 {
                    return Some(amount);
                }
            }
        }
    }
    None
}

fn extract_transaction_type(body: &str) -> Option<TransactionType> {
    let lowered = body.to_lowercase();

    let mut debit_score = DEBIT_PATTERNS.iter().filter(|p| p.is_match(body)).count() as i32;
    let mut credit_score = CREDIT_PATTERNS.iter().filter(|p| p.is_match(body)).count() as i32;

    // Strong direct indicators outweigh the generic verb groups
    if lowered.contains("debited") || lowered.contains("withdrawn") {
        debit_score += 2;
    }
    if lowered.contains("credited") || lowered.contains("deposited") {
        credit_score += 2;
    }

    // Strictly higher wins; a tie is ambiguous
    if debit_score > credit_score {
        Some(TransactionType::Debit)
    } else if credit_score > debit_score {
        Some(TransactionType::Credit)
    } else {
        None
    }
}

fn lookup_bank(token: &str) -> Option<String> {
    BANK_ALIASES
        .iter()
        .find(|(alias, _)| token.contains(alias))
        .map(|(_, name)| name.to_string())
}

fn extract_bank_name(sender: &str, body: &str) -> Option<String> {
    let sender_lower = sender.to_lowercase();
    let body_lower = body.to_lowercase();

    // Sender field carries the higher-trust signal
    if let Some(bank) = lookup_bank(&sender_lower) {
        return Some(bank);
    }
    if let Some(bank) = lookup_bank(&body_lower) {
        return Some(bank);
    }

    // Suffix heuristic: trailing "-SBI" style sign-off, or "<name> bank"
    for pattern in [&*BANK_SUFFIX, &*BANK_WORD] {
        if let Some(capture) = pattern.captures(&body_lower) {
            if let Some(bank) = capture.get(1).and_then(|m| lookup_bank(m.as_str())) {
                return Some(bank);
            }
        }
    }

    None
}

fn extract_account_number(body: &str) -> Option<String> {
    for pattern in ACCOUNT_PATTERNS.iter() {
        if let Some(capture) = pattern.captures(body) {
            if let Some(m) = capture.get(1) {
                return Some(m.as_str().to_uppercase());
            }
        }
    }
    None
}

fn parse_date_token(token: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(token, fmt).ok())
}

/// Three-tier fallback: explicit date token in the body, else the
/// message's own timestamp, else current processing time. The result
/// is never absent.
fn extract_transaction_date(body: &str, message_timestamp: DateTime<Utc>) -> DateTime<Utc> {
    for pattern in DATE_PATTERNS.iter() {
        if let Some(capture) = pattern.captures(body) {
            if let Some(date) = capture.get(1).and_then(|m| parse_date_token(m.as_str())) {
                return date.and_time(NaiveTime::MIN).and_utc();
            }
        }
    }

    if message_timestamp.timestamp() != 0 {
        return message_timestamp;
    }

    Utc::now()
}

fn extract_balance(body: &str) -> Option<f64> {
    for pattern in BALANCE_PATTERNS.iter() {
        if let Some(capture) = pattern.captures(body) {
            if let Some(balance) = capture.get(1).and_then(|m| parse_numeric(m.as_str())) {
                return Some(balance);
            }
        }
    }
    None
}

fn extract_reference_id(body: &str) -> Option<String> {
    for pattern in REFERENCE_PATTERNS.iter() {
        if let Some(capture) = pattern.captures(body) {
            if let Some(m) = capture.get(1) {
                return Some(m.as_str().to_string());
            }
        }
    }
    None
}

fn clean_counterparty(raw: &str) -> Option<String> {
    let collapsed = WHITESPACE_RUN.replace_all(raw.trim(), " ");
    let cleaned = NON_WORD.replace_all(&collapsed, "").trim().to_string();
    if cleaned.len() >= MIN_COUNTERPARTY_LEN {
        Some(cleaned)
    } else {
        None
    }
}

fn extract_counterparty(body: &str) -> Option<String> {
    for pattern in COUNTERPARTY_PATTERNS.iter() {
        for capture in pattern.captures_iter(body) {
            if let Some(counterparty) = capture.get(1).and_then(|m| clean_counterparty(m.as_str()))
            {
                return Some(counterparty);
            }
        }
    }
    None
}

fn extract_payment_method(body: &str) -> PaymentMethod {
    for (method, patterns) in METHOD_PATTERNS.iter() {
        if patterns.iter().any(|p| p.is_match(body)) {
            return *method;
        }
    }
    PaymentMethod::Other
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn categorize(body: &str, counterparty: Option<&str>) -> Category {
    let body_lower = body.to_lowercase();
    let counterparty_lower = counterparty.unwrap_or("").to_lowercase();

    if contains_any(
        &body_lower,
        &["mutual fund", "sip", "investment", "dividend", "nav"],
    ) {
        return Category::Investment;
    }
    if contains_any(&body_lower, &["salary", "station91", "company"]) {
        return Category::Transfer;
    }
    if contains_any(&body_lower, &["atm", "cash withdrawal"]) {
        return Category::AtmWithdrawal;
    }
    if contains_any(&body_lower, &["bill", "utility", "electricity", "recharge"]) {
        return Category::BillPayment;
    }
    if contains_any(
        &counterparty_lower,
        &["zomato", "swiggy", "restaurant", "food"],
    ) {
        return Category::FoodDining;
    }

    Category::Other
}

fn determine_intent(body: &str, transaction_type: Option<TransactionType>) -> MessageIntent {
    let body_lower = body.to_lowercase();

    if contains_any(&body_lower, &["otp", "verification", "code", "authenticate"]) {
        return MessageIntent::Otp;
    }
    if body_lower.contains("requested money") || body_lower.contains("will be debited") {
        return MessageIntent::PaymentRequest;
    }
    if contains_any(&body_lower, &["offer", "discount", "free", "win", "prize"]) {
        return MessageIntent::Promo;
    }
    if contains_any(&body_lower, &["alert", "fraud", "suspicious", "block"]) {
        return MessageIntent::Alert;
    }
    if transaction_type.is_some() {
        return MessageIntent::Transaction;
    }

    MessageIntent::Other
}

fn generate_tags(body: &str, category: Category) -> Vec<String> {
    let body_lower = body.to_lowercase();
    let mut tags = Vec::new();

    if let Ok(serde_json::Value::String(name)) = serde_json::to_value(category) {
        tags.push(name);
    }

    for tag in ["atm", "online", "mobile", "salary", "refund"] {
        if body_lower.contains(tag) {
            tags.push(tag.to_string());
        }
    }

    tags.truncate(MAX_TAGS);
    tags
}

fn generate_summary(
    transaction_type: Option<TransactionType>,
    amount: Option<f64>,
    counterparty: Option<&str>,
) -> String {
    let (transaction_type, amount) = match (transaction_type, amount) {
        (Some(t), Some(a)) => (t, a),
        _ => return "Transaction processed".to_string(),
    };

    let (action, direction) = match transaction_type {
        TransactionType::Debit => ("Paid", "to"),
        TransactionType::Credit => ("Received", "from"),
    };

    match counterparty {
        Some(cp) => {
            let short: String = cp.chars().take(20).collect();
            format!("{} ₹{:.0} {} {}", action, amount, direction, short)
        }
        None => format!("{} ₹{:.0}", action, amount),
    }
}

fn confidence(
    amount: Option<f64>,
    transaction_type: Option<TransactionType>,
    bank: Option<&str>,
) -> f64 {
    let mut score = CONFIDENCE_BASE;
    if amount.is_some() {
        score += CONFIDENCE_AMOUNT;
    }
    if transaction_type.is_some() {
        score += CONFIDENCE_TYPE;
    }
    if bank.is_some() {
        score += CONFIDENCE_BANK;
    }
    score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(sender: &str, body: &str) -> RawMessage {
        RawMessage {
            sender: sender.to_string(),
            body: body.to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 7, 3, 21, 55, 26).unwrap(),
            channel: "sms".to_string(),
            unique_id: "test_001".to_string(),
        }
    }

    #[test]
    fn test_credit_sms_full_extraction() {
        let m = msg(
            "AX-SBIINB-S",
            "Dear Customer, Your a/c no. XXXXXXXX9855 is credited by Rs.60000.00 \
             on 02-07-25 by STATION91",
        );
        let txn = RuleBasedExtractor::new().extract(&m);

        assert_eq!(txn.transaction_type, Some(TransactionType::Credit));
        assert_eq!(txn.amount, Some(60000.0));
        assert_eq!(txn.currency, "INR");
        assert!(txn.counterparty.as_deref().unwrap().contains("STATION91"));
        assert!(txn
            .account
            .account_number
            .as_deref()
            .unwrap()
            .contains("9855"));
        assert_eq!(txn.account.bank.as_deref(), Some("State Bank of India"));
        assert_eq!(txn.unique_id, "test_001");
    }

    #[test]
    fn test_atm_withdrawal() {
        let m = msg("SBI", "Rs.2000 withdrawn at ATM from A/cX9855");
        let txn = RuleBasedExtractor::new().extract(&m);

        assert_eq!(txn.transaction_type, Some(TransactionType::Debit));
        assert_eq!(txn.amount, Some(2000.0));
        assert_eq!(txn.category, Category::AtmWithdrawal);
        assert_eq!(txn.metadata.method, PaymentMethod::Atm);
    }

    #[test]
    fn test_explicit_date_token_wins() {
        let m = msg("SBI", "A/c X9855 credited by Rs.500 on 02-07-25");
        let txn = RuleBasedExtractor::new().extract(&m);
        assert_eq!(
            txn.transaction_date.date_naive(),
            NaiveDate::from_ymd_opt(2025, 7, 2).unwrap()
        );
    }

    #[test]
    fn test_compact_date_format() {
        let m = msg(
            "JD-SBIUPI-S",
            "Dear UPI user A/C X9855 debited by 44.0 on date 03Jul25 trf to \
             MIDAS DAILY SUPE Refno 565625035570. -SBI",
        );
        let txn = RuleBasedExtractor::new().extract(&m);
        assert_eq!(
            txn.transaction_date.date_naive(),
            NaiveDate::from_ymd_opt(2025, 7, 3).unwrap()
        );
        assert_eq!(txn.metadata.reference_id.as_deref(), Some("565625035570"));
        assert!(txn.counterparty.as_deref().unwrap().contains("MIDAS"));
        assert_eq!(txn.metadata.method, PaymentMethod::Upi);
    }

    #[test]
    fn test_date_falls_back_to_message_timestamp() {
        let m = msg("SBI", "A/c X9855 credited by Rs.500");
        let txn = RuleBasedExtractor::new().extract(&m);
        assert_eq!(txn.transaction_date, m.timestamp);
    }

    #[test]
    fn test_confidence_all_resolved() {
        let m = msg("AX-HDFCBK", "Rs.500 debited from A/c XX1234");
        let txn = RuleBasedExtractor::new().extract(&m);
        assert!((txn.confidence_score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_confidence_nothing_resolved() {
        let m = msg("UNKNOWN", "hello there");
        let txn = RuleBasedExtractor::new().extract(&m);
        assert!((txn.confidence_score - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ambiguous_type_left_absent() {
        // both verbs present with equal weight
        let m = msg("SBI", "debited and credited equally confusing");
        let txn = RuleBasedExtractor::new().extract(&m);
        assert_eq!(txn.transaction_type, None);
    }

    #[test]
    fn test_non_positive_amount_rejected() {
        assert_eq!(extract_amount("Rs.0 debited"), None);
        assert_eq!(extract_amount("Rs.0.00 charged"), None);
    }

    #[test]
    fn test_thousands_separator_stripped() {
        assert_eq!(extract_amount("credited by Rs.1,23,456.78"), Some(123456.78));
    }

    #[test]
    fn test_short_counterparty_rejected() {
        // "Rs" survives pattern capture but dies in cleaning
        assert_eq!(extract_counterparty("credited by Rs."), None);
    }

    #[test]
    fn test_balance_extraction() {
        let m = msg("SBI", "Rs.500 debited. Available balance Rs.12,345.67");
        let txn = RuleBasedExtractor::new().extract(&m);
        assert_eq!(txn.balance, Some(12345.67));
    }

    #[test]
    fn test_tags_capped_at_five() {
        let m = msg(
            "SBI",
            "atm online mobile salary refund atm withdrawal Rs.100 debited",
        );
        let txn = RuleBasedExtractor::new().extract(&m);
        assert!(txn.tags.len() <= 5);
        assert!(txn.tags.contains(&"atm-withdrawal".to_string()));
    }

    #[test]
    fn test_intent_transaction_requires_resolved_type() {
        let m = msg("SBI", "Rs.500 debited from A/c XX1234");
        let txn = RuleBasedExtractor::new().extract(&m);
        assert_eq!(txn.message_intent, MessageIntent::Transaction);

        let m = msg("X", "your statement is ready");
        let txn = RuleBasedExtractor::new().extract(&m);
        assert_ne!(txn.message_intent, MessageIntent::Transaction);
    }
}
