use serde_json::Value;

use crate::types::{UsageSnapshot, UsageTotals};

/// Known keys and their common snake_case aliases; a usage snapshot is treated as
/// an opaque numeric map with well-known keys rather than a fixed schema.
const INPUT_KEYS: &[&str] = &["inputTokens", "input_tokens", "input"];
const OUTPUT_KEYS: &[&str] = &["outputTokens", "output_tokens", "output"];
const CACHE_READ_KEYS: &[&str] = &["cacheReadTokens", "cache_read_tokens", "cacheRead", "cache_read"];
const TOTAL_KEYS: &[&str] = &["totalTokens", "total_tokens", "total"];

fn read_numeric(snapshot: &UsageSnapshot, keys: &[&str]) -> u64 {
    for key in keys {
        if let Some(value) = snapshot.get(*key) {
            if let Some(n) = value.as_u64() {
                return n;
            }
            if let Some(f) = value.as_f64() {
                return f.max(0.0) as u64;
            }
        }
    }
    0
}

/// Computes the canonical per-message usage as element-wise `max(0, out - in)`.
/// The relay never interprets model names beyond this composition -- `model` is
/// read straight from `usageOutgoing.aggregates.byModel[0]`.
pub fn diff_usage(incoming: &UsageSnapshot, outgoing: &UsageSnapshot) -> UsageTotals {
    let sub = |out_keys: &[&str]| {
        let out = read_numeric(outgoing, out_keys);
        let inp = read_numeric(incoming, out_keys);
        out.saturating_sub(inp)
    };

    UsageTotals {
        input_tokens: sub(INPUT_KEYS),
        output_tokens: sub(OUTPUT_KEYS),
        cache_read_tokens: sub(CACHE_READ_KEYS),
        total_tokens: sub(TOTAL_KEYS),
        model: canonical_model_name(outgoing),
    }
}

/// `provider/model` composed from the first row of `aggregates.byModel`, when both
/// fields are present; `None` otherwise. Never guessed from any other source.
pub fn canonical_model_name(outgoing: &UsageSnapshot) -> Option<String> {
    let by_model = outgoing
        .get("aggregates")
        .and_then(Value::as_object)
        .and_then(|aggregates| aggregates.get("byModel"))
        .and_then(Value::as_array)?;
    let first = by_model.first()?;
    let provider = first.get("provider").and_then(Value::as_str);
    let model = first.get("model").and_then(Value::as_str)?;
    match provider {
        Some(provider) => Some(format!("{provider}/{model}")),
        None => Some(model.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(v: Value) -> UsageSnapshot {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn diffs_clamp_at_zero_when_outgoing_regresses() {
        let incoming = snapshot(json!({ "inputTokens": 100, "outputTokens": 50 }));
        let outgoing = snapshot(json!({ "inputTokens": 90, "outputTokens": 120 }));
        let usage = diff_usage(&incoming, &outgoing);
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.output_tokens, 70);
    }

    #[test]
    fn accepts_snake_case_aliases() {
        let incoming = snapshot(json!({ "input_tokens": 10 }));
        let outgoing = snapshot(json!({ "input_tokens": 40 }));
        let usage = diff_usage(&incoming, &outgoing);
        assert_eq!(usage.input_tokens, 30);
    }

    #[test]
    fn canonical_model_composes_provider_and_model() {
        let outgoing = snapshot(json!({
            "aggregates": { "byModel": [{ "provider": "anthropic", "model": "claude" }] }
        }));
        assert_eq!(canonical_model_name(&outgoing), Some("anthropic/claude".to_string()));
    }

    #[test]
    fn canonical_model_is_none_when_absent() {
        let outgoing = snapshot(json!({}));
        assert_eq!(canonical_model_name(&outgoing), None);
    }
}
