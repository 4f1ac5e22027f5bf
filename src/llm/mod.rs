//! LLM extraction client
//!
//! Talks to an OpenAI-compatible chat completions endpoint over a
//! pooled HTTP client. Transient upstream trouble (429, 5xx, network
//! timeouts) is retried with exponential backoff; anything else fails
//! the call immediately and the pipeline falls back to the rule-based
//! extractor.

pub mod recovery;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{EnrichMode, LlmConfig};
use crate::error::{ExtractionError, Result};
use crate::fallback::RuleBasedExtractor;
use crate::limiter::AdaptiveRateLimiter;
use crate::models::{
    Account, Category, ExtractedTransaction, MessageIntent, PaymentMethod, RawMessage,
    TransactionMetadata, TransactionType,
};

const RETRY_CAP_SECS: f64 = 30.0;

const EXTRACTION_RULES: &str = "\
You extract structured transaction data from Indian bank and UPI SMS messages.
Respond with a single JSON object and nothing else. Fields:
  transaction_type: \"debit\" or \"credit\", null if unclear
  amount: number, null if absent
  currency: ISO code, default \"INR\"
  transaction_date: ISO 8601 date from the message body, null if absent
  bank: bank name, null if unknown
  account_number: masked account digits, null if absent
  counterparty: merchant or person on the other side, null if unknown
  balance: available balance after the transaction, null if absent
  category: one of investment, transfer, atm-withdrawal, bill-payment, food-dining, other
  method: one of UPI, IMPS, NEFT, RTGS, ATM, Card, MF, Online, Cheque, Other
  reference_id: transaction reference, null if absent
  tags: up to 5 short lowercase labels
  summary: one short human sentence
  confidence_score: 0.0 to 1.0
  message_intent: one of transaction, payment_request, pending_confirmation, otp, promo, alert, other
Never invent values that are not in the message.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
    limiter: Arc<AdaptiveRateLimiter>,
    fallback: RuleBasedExtractor,
    enrich: EnrichMode,
}

impl LlmClient {
    pub fn new(
        config: LlmConfig,
        limiter: Arc<AdaptiveRateLimiter>,
        enrich: EnrichMode,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            config,
            limiter,
            fallback: RuleBasedExtractor::new(),
            enrich,
        })
    }

    /// Extract a transaction via the model. Returns None when the
    /// endpoint is unreachable after retries or the response cannot be
    /// turned into a valid record; the caller decides what happens
    /// next.
    pub async fn extract(&self, message: &RawMessage) -> Option<ExtractedTransaction> {
        let content = match self.complete(message).await {
            Ok(content) => content,
            Err(err) => {
                warn!(unique_id = %message.unique_id, error = %err, "llm call failed");
                return None;
            }
        };

        let Some(value) = recovery::recover_json(&content) else {
            warn!(unique_id = %message.unique_id, "no json recoverable from llm output");
            return None;
        };

        let enrichment = match self.enrich {
            EnrichMode::Safe => Some(self.fallback.extract(message)),
            EnrichMode::Off => None,
        };

        match coerce_transaction(&value, message, enrichment.as_ref()) {
            Ok(txn) => Some(txn),
            Err(err) => {
                warn!(unique_id = %message.unique_id, error = %err, "llm output failed coercion");
                None
            }
        }
    }

    /// One chat completion with retry on transient upstream failures.
    async fn complete(&self, message: &RawMessage) -> Result<String> {
        let user_prompt = format!(
            "Sender: {}\nReceived at: {}\nMessage: {}",
            message.sender,
            message.timestamp.to_rfc3339(),
            message.body
        );
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: EXTRACTION_RULES,
                },
                ChatMessage {
                    role: "user",
                    content: &user_prompt,
                },
            ],
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            max_tokens: self.config.max_tokens,
        };

        let mut last_error = ExtractionError::LlmUnavailable("no attempts made".to_string());
        for attempt in 1..=self.config.max_attempts {
            let started = Instant::now();
            let outcome = self.send(&request).await;
            let latency = started.elapsed();

            match outcome {
                Ok(content) => {
                    self.limiter.record(latency, true);
                    debug!(
                        unique_id = %message.unique_id,
                        latency_ms = latency.as_millis() as u64,
                        attempt,
                        "llm call succeeded"
                    );
                    return Ok(content);
                }
                Err(err) if err.is_permanent() => {
                    self.limiter.record(latency, false);
                    return Err(err);
                }
                Err(err) => {
                    self.limiter.record(latency, false);
                    warn!(
                        unique_id = %message.unique_id,
                        attempt,
                        error = %err,
                        "transient llm failure"
                    );
                    last_error = err;
                    if attempt < self.config.max_attempts {
                        let backoff = self
                            .config
                            .retry_backoff_base
                            .powi(attempt as i32)
                            .min(RETRY_CAP_SECS);
                        tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn send(&self, request: &ChatRequest<'_>) -> Result<String> {
        let mut builder = self.http.post(&self.config.api_url).json(request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ExtractionError::TransientNetwork(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: Value = response.json().await?;
            extract_content(&body).ok_or_else(|| {
                ExtractionError::LlmMalformedResponse("no content field in response".to_string())
            })
        } else if matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504) {
            Err(ExtractionError::LlmUnavailable(format!(
                "upstream returned {status}"
            )))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ExtractionError::PermanentRejection {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Dig the generated text out of an OpenAI-compatible response, or
/// one of the generic single-field shapes some local servers emit.
fn extract_content(body: &Value) -> Option<String> {
    if let Some(content) = body
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
    {
        return Some(content.to_string());
    }
    for field in ["text", "output", "generated_text", "content"] {
        if let Some(content) = body.get(field).and_then(|v| v.as_str()) {
            return Some(content.to_string());
        }
    }
    None
}

/// Turn a recovered JSON object into a transaction record. `currency`
/// and `message_intent` are the essential fields; everything else is
/// parsed leniently and, in safe mode, backfilled from the rule-based
/// extraction where the model left gaps.
pub fn coerce_transaction(
    value: &Value,
    message: &RawMessage,
    enrichment: Option<&ExtractedTransaction>,
) -> Result<ExtractedTransaction> {
    let object = value
        .as_object()
        .ok_or_else(|| ExtractionError::ParsingError("llm output is not an object".to_string()))?;
    if object.len() < 2 {
        return Err(ExtractionError::ParsingError(
            "llm output has too few fields".to_string(),
        ));
    }

    let currency = string_field(object.get("currency"))
        .ok_or_else(|| ExtractionError::MissingEssentialFields("currency".to_string()))?;
    let message_intent = string_field(object.get("message_intent"))
        .and_then(|s| parse_intent(&s))
        .ok_or_else(|| ExtractionError::MissingEssentialFields("message_intent".to_string()))?;

    let mut transaction_type =
        string_field(object.get("transaction_type")).and_then(|s| parse_type(&s));
    let mut amount = number_field(object.get("amount")).filter(|a| *a > 0.0);
    let mut counterparty = string_field(object.get("counterparty"));
    let mut balance = number_field(object.get("balance"));
    let mut bank = string_field(object.get("bank"));
    let mut account_number = string_field(object.get("account_number"));
    let mut reference_id = string_field(object.get("reference_id"));
    let mut category = string_field(object.get("category")).and_then(|s| parse_category(&s));
    let mut method = string_field(object.get("method")).and_then(|s| parse_method(&s));

    let transaction_date = string_field(object.get("transaction_date"))
        .and_then(|s| parse_date(&s))
        .unwrap_or(message.timestamp);

    let summary = string_field(object.get("summary")).unwrap_or_default();
    let confidence_score = number_field(object.get("confidence_score"))
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);

    if let Some(base) = enrichment {
        if transaction_type.is_none() {
            transaction_type = base.transaction_type;
        }
        if amount.is_none() {
            amount = base.amount;
        }
        if counterparty.is_none() {
            counterparty = base.counterparty.clone();
        }
        if balance.is_none() {
            balance = base.balance;
        }
        if bank.is_none() {
            bank = base.account.bank.clone();
        }
        if account_number.is_none() {
            account_number = base.account.account_number.clone();
        }
        if reference_id.is_none() {
            reference_id = base.metadata.reference_id.clone();
        }
        if category.is_none() {
            category = Some(base.category);
        }
        if method.is_none() {
            method = Some(base.metadata.method);
        }
    }

    let tags = object
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .take(5)
                .collect()
        })
        .unwrap_or_default();

    Ok(ExtractedTransaction {
        unique_id: message.unique_id.clone(),
        transaction_type,
        amount,
        currency,
        transaction_date,
        account: Account {
            bank,
            account_number,
        },
        counterparty,
        balance,
        category: category.unwrap_or(Category::Other),
        tags,
        summary,
        confidence_score,
        message_intent,
        metadata: TransactionMetadata {
            channel: message.channel.clone(),
            sender: message.sender.clone(),
            method: method.unwrap_or(PaymentMethod::Other),
            reference_id,
            original_text: message.body.clone(),
        },
    })
}

fn string_field(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("null") || s.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(s.to_string())
    }
}

/// Accept numbers or numeric strings, with thousands separators.
fn number_field(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.replace(',', "").trim().parse().ok(),
        _ => None,
    }
}

fn parse_type(s: &str) -> Option<TransactionType> {
    match s.to_lowercase().as_str() {
        "debit" | "dr" => Some(TransactionType::Debit),
        "credit" | "cr" => Some(TransactionType::Credit),
        _ => None,
    }
}

fn parse_intent(s: &str) -> Option<MessageIntent> {
    serde_json::from_value(Value::String(s.to_lowercase())).ok()
}

fn parse_category(s: &str) -> Option<Category> {
    serde_json::from_value(Value::String(s.to_lowercase())).ok()
}

fn parse_method(s: &str) -> Option<PaymentMethod> {
    serde_json::from_value(Value::String(s.to_string()))
        .ok()
        .or_else(|| match s.to_lowercase().as_str() {
            "upi" => Some(PaymentMethod::Upi),
            "imps" => Some(PaymentMethod::Imps),
            "neft" => Some(PaymentMethod::Neft),
            "rtgs" => Some(PaymentMethod::Rtgs),
            "atm" => Some(PaymentMethod::Atm),
            "card" => Some(PaymentMethod::Card),
            "mf" | "mutual fund" => Some(PaymentMethod::MutualFund),
            "online" => Some(PaymentMethod::Online),
            "cheque" | "check" => Some(PaymentMethod::Cheque),
            _ => None,
        })
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_time(NaiveTime::MIN).and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn message() -> RawMessage {
        RawMessage {
            sender: "AX-SBIUPI".to_string(),
            body: "Dear UPI user A/C X9855 debited by 44.0 on date 03Jul25 trf to STATION91 Refno 565625035570"
                .to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 7, 3, 10, 0, 0).single().unwrap(),
            channel: "sms".to_string(),
            unique_id: "m1".to_string(),
        }
    }

    #[test]
    fn test_coerce_full_object() {
        let value = json!({
            "transaction_type": "debit",
            "amount": 44.0,
            "currency": "INR",
            "transaction_date": "2025-07-03",
            "bank": "SBI",
            "counterparty": "STATION91",
            "category": "transfer",
            "method": "UPI",
            "summary": "Paid ₹44 to STATION91",
            "confidence_score": 0.9,
            "message_intent": "transaction"
        });
        let txn = coerce_transaction(&value, &message(), None).expect("should coerce");
        assert_eq!(txn.transaction_type, Some(TransactionType::Debit));
        assert_eq!(txn.amount, Some(44.0));
        assert_eq!(txn.account.bank.as_deref(), Some("SBI"));
        assert_eq!(txn.metadata.method, PaymentMethod::Upi);
        assert_eq!(txn.unique_id, "m1");
    }

    #[test]
    fn test_missing_currency_is_essential() {
        let value = json!({"amount": 44.0, "message_intent": "transaction"});
        assert!(matches!(
            coerce_transaction(&value, &message(), None),
            Err(ExtractionError::MissingEssentialFields(_))
        ));
    }

    #[test]
    fn test_missing_intent_is_essential() {
        let value = json!({"amount": 44.0, "currency": "INR"});
        assert!(matches!(
            coerce_transaction(&value, &message(), None),
            Err(ExtractionError::MissingEssentialFields(_))
        ));
    }

    #[test]
    fn test_numeric_string_amount_accepted() {
        let value = json!({
            "currency": "INR",
            "message_intent": "transaction",
            "amount": "1,234.56"
        });
        let txn = coerce_transaction(&value, &message(), None).expect("should coerce");
        assert_eq!(txn.amount, Some(1234.56));
    }

    #[test]
    fn test_enrichment_fills_only_missing_fields() {
        let base = RuleBasedExtractor::new().extract(&message());
        assert!(base.metadata.reference_id.is_some());

        let value = json!({
            "currency": "INR",
            "message_intent": "transaction",
            "transaction_type": "credit",
            "amount": 99.0
        });
        let txn =
            coerce_transaction(&value, &message(), Some(&base)).expect("should coerce");
        // model-provided fields win even when the fallback disagrees
        assert_eq!(txn.transaction_type, Some(TransactionType::Credit));
        assert_eq!(txn.amount, Some(99.0));
        // gaps come from the rule-based extraction
        assert_eq!(txn.counterparty.as_deref(), Some("STATION91"));
        assert_eq!(
            txn.metadata.reference_id.as_deref(),
            Some("565625035570")
        );
    }

    #[test]
    fn test_extract_content_shapes() {
        let openai = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(extract_content(&openai).as_deref(), Some("hello"));

        let generic = json!({"generated_text": "hi"});
        assert_eq!(extract_content(&generic).as_deref(), Some("hi"));

        assert!(extract_content(&json!({"usage": {}})).is_none());
    }

    #[test]
    fn test_method_enriched_when_model_omits_it() {
        let base = RuleBasedExtractor::new().extract(&message());
        assert_eq!(base.metadata.method, PaymentMethod::Upi);

        let value = json!({"currency": "INR", "message_intent": "transaction"});
        let txn = coerce_transaction(&value, &message(), Some(&base)).expect("should coerce");
        assert_eq!(txn.metadata.method, PaymentMethod::Upi);
    }

    #[test]
    fn test_unknown_date_falls_back_to_message_timestamp() {
        let value = json!({
            "currency": "INR",
            "message_intent": "transaction",
            "transaction_date": "yesterday"
        });
        let txn = coerce_transaction(&value, &message(), None).expect("should coerce");
        assert_eq!(txn.transaction_date, message().timestamp);
    }

    #[test]
    fn test_confidence_clamped() {
        let value = json!({
            "currency": "INR",
            "message_intent": "transaction",
            "confidence_score": 7.5
        });
        let txn = coerce_transaction(&value, &message(), None).expect("should coerce");
        assert_eq!(txn.confidence_score, 1.0);
    }

    #[test]
    fn test_null_strings_treated_as_absent() {
        let value = json!({
            "currency": "INR",
            "message_intent": "transaction",
            "counterparty": "null",
            "bank": ""
        });
        let txn = coerce_transaction(&value, &message(), None).expect("should coerce");
        assert!(txn.counterparty.is_none());
        assert!(txn.account.bank.is_none());
    }
}
