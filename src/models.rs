//! Core data models for the SMS extraction pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Investment,
    Transfer,
    AtmWithdrawal,
    BillPayment,
    FoodDining,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageIntent {
    Transaction,
    PaymentRequest,
    PendingConfirmation,
    Otp,
    Promo,
    Alert,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaymentMethod {
    #[serde(rename = "UPI")]
    Upi,
    #[serde(rename = "IMPS")]
    Imps,
    #[serde(rename = "NEFT")]
    Neft,
    #[serde(rename = "RTGS")]
    Rtgs,
    #[serde(rename = "ATM")]
    Atm,
    #[serde(rename = "Card")]
    Card,
    #[serde(rename = "MF")]
    MutualFund,
    #[serde(rename = "Online")]
    Online,
    #[serde(rename = "Cheque")]
    Cheque,
    #[serde(rename = "Other")]
    Other,
}

/// Reason a message was rejected by the classifier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionCategory {
    Otp,
    Promotional,
    DataUsage,
    ShoppingLogistics,
    PaymentRequest,
    Social,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Unprocessed,
    Success,
    Failed,
    DeadLettered,
}

impl ProcessingStatus {
    /// Terminal states are never left implicitly; only an explicit
    /// operator reset can reopen a message.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessingStatus::Unprocessed)
    }
}

//
// ================= Raw Message =================
//

/// A raw ingested message. Immutable once created; `unique_id` is the
/// only stable identity used for correlation downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub sender: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_channel")]
    pub channel: String,
    pub unique_id: String,
}

fn default_channel() -> String {
    "sms".to_string()
}

//
// ================= Classification =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub is_financial: bool,
    pub score: i32,
    pub exclusion_category: Option<ExclusionCategory>,
}

//
// ================= Extracted Transaction =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub bank: Option<String>,
    pub account_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub channel: String,
    pub sender: String,
    pub method: PaymentMethod,
    pub reference_id: Option<String>,
    pub original_text: String,
}

/// The structured record both extraction paths produce. The LLM path
/// and the rule-based fallback MUST populate the same schema so
/// downstream consumers stay extractor-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedTransaction {
    pub unique_id: String,
    pub transaction_type: Option<TransactionType>,
    pub amount: Option<f64>,
    pub currency: String,
    /// Never absent: explicit token → message timestamp → processing time.
    pub transaction_date: DateTime<Utc>,
    pub account: Account,
    pub counterparty: Option<String>,
    pub balance: Option<f64>,
    pub category: Category,
    pub tags: Vec<String>,
    pub summary: String,
    pub confidence_score: f64,
    pub message_intent: MessageIntent,
    pub metadata: TransactionMetadata,
}

//
// ================= Processing State =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingState {
    pub status: ProcessingStatus,
    pub retry_count: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

//
// ================= Dead Letter =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message: RawMessage,
    pub error_kind: String,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
}

//
// ================= Checkpoint =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    InProgress,
    Completed,
}

/// Persisted progress marker enabling a batch run to resume after
/// interruption without reprocessing completed messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub scope_id: String,
    pub batch_id: u32,
    pub total: usize,
    pub processed: usize,
    pub last_processed_id: Option<String>,
    pub status: CheckpointStatus,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionType::Credit => "credit",
            TransactionType::Debit => "debit",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for MessageIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageIntent::Transaction => "transaction",
            MessageIntent::PaymentRequest => "payment_request",
            MessageIntent::PendingConfirmation => "pending_confirmation",
            MessageIntent::Otp => "otp",
            MessageIntent::Promo => "promo",
            MessageIntent::Alert => "alert",
            MessageIntent::Other => "other",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_spellings() {
        assert_eq!(
            serde_json::to_string(&Category::AtmWithdrawal).unwrap(),
            "\"atm-withdrawal\""
        );
        assert_eq!(
            serde_json::to_string(&MessageIntent::PaymentRequest).unwrap(),
            "\"payment_request\""
        );
        assert_eq!(
            serde_json::to_string(&PaymentMethod::Upi).unwrap(),
            "\"UPI\""
        );
        assert_eq!(
            serde_json::to_string(&TransactionType::Credit).unwrap(),
            "\"credit\""
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ProcessingStatus::Unprocessed.is_terminal());
        assert!(ProcessingStatus::Success.is_terminal());
        assert!(ProcessingStatus::Failed.is_terminal());
        assert!(ProcessingStatus::DeadLettered.is_terminal());
    }
}
