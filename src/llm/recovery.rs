//! JSON recovery for unreliable model output
//!
//! Small instruction-tuned models wrap JSON in prose, fences and
//! reasoning blocks, or emit structurally broken objects. Recovery
//! runs a sequence of increasingly aggressive strategies and returns
//! the first parseable object with more than one field.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("fence pattern must compile")
});

static THINK_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(think|thinking|reasoning)>.*?</(think|thinking|reasoning)>")
        .expect("think pattern must compile")
});

static OBJECT_CANDIDATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{[^{}]*\}").expect("object pattern must compile")
});

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("comma pattern must compile"));

static UNQUOTED_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).expect("key pattern must compile")
});

static KEY_VALUE_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([A-Za-z_][A-Za-z0-9_]*)"\s*:\s*("(?:[^"\\]|\\.)*"|-?\d+(?:\.\d+)?|true|false|null)"#)
        .expect("pair pattern must compile")
});

/// Recover a JSON object from raw model output. Returns the first
/// object with more than one field, or None if nothing salvageable.
pub fn recover_json(raw: &str) -> Option<Value> {
    if let Some(value) = parse_cleaned(raw) {
        return Some(value);
    }
    if let Some(value) = parse_balanced_object(raw) {
        debug!("recovered json via brace scan");
        return Some(value);
    }
    if let Some(value) = parse_repaired_candidates(raw) {
        debug!("recovered json via candidate repair");
        return Some(value);
    }
    if let Some(value) = reconstruct_from_pairs(raw) {
        debug!("recovered json via key-value reconstruction");
        return Some(value);
    }
    None
}

fn usable(value: &Value) -> bool {
    value.as_object().map(|o| o.len() > 1).unwrap_or(false)
}

/// Strategy 1: strip fences, reasoning blocks and surrounding prose,
/// then parse directly.
fn parse_cleaned(raw: &str) -> Option<Value> {
    let without_think = THINK_BLOCK.replace_all(raw, "");

    let candidate = match FENCE.captures(&without_think) {
        Some(caps) => caps[1].to_string(),
        None => without_think.to_string(),
    };

    let start = candidate.find('{')?;
    let end = candidate.rfind('}')?;
    if end <= start {
        return None;
    }
    let trimmed = &candidate[start..=end];
    serde_json::from_str::<Value>(trimmed).ok().filter(usable)
}

/// Strategy 2: scan for the first balanced top-level object, tracking
/// brace depth outside of string literals.
fn parse_balanced_object(raw: &str) -> Option<Value> {
    let bytes = raw.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = raw[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in bytes.iter().enumerate().skip(start) {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(value) = serde_json::from_str::<Value>(&raw[start..=i])
                            .ok()
                            .filter(usable)
                        {
                            return Some(value);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        search_from = start + 1;
    }
    None
}

/// Strategy 3: flat `{...}` candidates with common syntax damage
/// repaired.
fn parse_repaired_candidates(raw: &str) -> Option<Value> {
    for m in OBJECT_CANDIDATE.find_iter(raw) {
        let repaired = repair(m.as_str());
        if let Some(value) = serde_json::from_str::<Value>(&repaired).ok().filter(usable) {
            return Some(value);
        }
    }
    None
}

fn repair(candidate: &str) -> String {
    let fixed = TRAILING_COMMA.replace_all(candidate, "$1");
    UNQUOTED_KEY.replace_all(&fixed, "$1\"$2\":").into_owned()
}

/// Strategy 4: rebuild an object from whatever quoted key-value pairs
/// survive in the text.
fn reconstruct_from_pairs(raw: &str) -> Option<Value> {
    let mut object = Map::new();
    for caps in KEY_VALUE_PAIR.captures_iter(raw) {
        let key = caps[1].to_string();
        if let Ok(value) = serde_json::from_str::<Value>(&caps[2]) {
            object.entry(key).or_insert(value);
        }
    }
    if object.len() > 1 {
        Some(Value::Object(object))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_json_passes_through() {
        let value = recover_json(r#"{"currency": "INR", "amount": 44.0}"#)
            .expect("clean json should parse");
        assert_eq!(value["amount"], 44.0);
    }

    #[test]
    fn test_fenced_json_with_prose() {
        let raw = "Here is the extraction:\n```json\n{\"currency\": \"INR\", \"amount\": 44.0}\n```\nDone.";
        let value = recover_json(raw).expect("fenced json should parse");
        assert_eq!(value["currency"], "INR");
    }

    #[test]
    fn test_think_block_is_stripped() {
        let raw = "<think>the amount is {probably} 44</think>{\"currency\": \"INR\", \"amount\": 44.0}";
        let value = recover_json(raw).expect("json after think block should parse");
        assert_eq!(value["amount"], 44.0);
    }

    #[test]
    fn test_nested_object_recovered_by_brace_scan() {
        let raw = "prefix {\"currency\": \"INR\", \"account\": {\"bank\": \"SBI\"}} suffix }";
        let value = recover_json(raw).expect("balanced object should parse");
        assert_eq!(value["account"]["bank"], "SBI");
    }

    #[test]
    fn test_trailing_comma_repaired() {
        let raw = r#"{"currency": "INR", "amount": 44.0,}"#;
        let value = recover_json(raw).expect("repaired json should parse");
        assert_eq!(value["currency"], "INR");
    }

    #[test]
    fn test_unquoted_keys_repaired() {
        let raw = r#"{currency: "INR", amount: 44.0}"#;
        let value = recover_json(raw).expect("repaired json should parse");
        assert_eq!(value["amount"], 44.0);
    }

    #[test]
    fn test_key_value_reconstruction() {
        let raw = r#"The "currency": "INR" and also "amount": 44.0 but the braces { are } broken"#;
        let value = recover_json(raw).expect("pairs should reconstruct");
        assert_eq!(value["currency"], "INR");
        assert_eq!(value["amount"], 44.0);
    }

    #[test]
    fn test_single_field_object_rejected() {
        assert!(recover_json(r#"{"currency": "INR"}"#).is_none());
    }

    #[test]
    fn test_plain_prose_yields_nothing() {
        assert!(recover_json("I could not find a transaction here.").is_none());
    }

    #[test]
    fn test_string_braces_do_not_break_scan() {
        let raw = r#"{"summary": "paid {rent}", "currency": "INR"}"#;
        let value = recover_json(raw).expect("braces inside strings should be ignored");
        assert_eq!(value["currency"], "INR");
    }
}
