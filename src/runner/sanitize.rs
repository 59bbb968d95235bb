//! Recursive bounding of tool inputs and outputs (§4.2 Sanitisation).
//!
//! `serde_json::Value` has no functions or bigints of its own (those are
//! source-language concepts from the spec's upstream SDK), so the
//! practical surface here is depth/width/string-length bounding and
//! cycle-proofing is moot for a tree-shaped `Value` — the cap still
//! guards against pathologically deep/wide agent-supplied JSON.

use serde_json::Value;

/// Maximum nesting depth before a subtree is replaced with a marker.
pub const MAX_DEPTH: usize = 5;
/// Maximum number of keys kept per object.
pub const MAX_KEYS: usize = 60;
/// Maximum number of items kept per array.
pub const MAX_ITEMS: usize = 30;
/// Maximum characters kept per string value.
pub const MAX_STRING_CHARS: usize = 4_000;

/// Recursively bound a JSON value per the limits above.
///
/// Applying this twice yields identical output — it is a fixed point
/// (§8 idempotence property).
#[must_use]
pub fn sanitize_value(value: &Value) -> Value {
    sanitize_at_depth(value, 0)
}

fn sanitize_at_depth(value: &Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return Value::String("[truncated: max depth reached]".to_owned());
    }

    match value {
        Value::String(s) => Value::String(truncate_chars(s, MAX_STRING_CHARS)),
        Value::Array(items) => {
            let mut out: Vec<Value> = items
                .iter()
                .take(MAX_ITEMS)
                .map(|v| sanitize_at_depth(v, depth + 1))
                .collect();
            if items.len() > MAX_ITEMS {
                out.push(Value::String(format!(
                    "[truncated: {} more items]",
                    items.len() - MAX_ITEMS
                )));
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, val) in map.iter().take(MAX_KEYS) {
                out.insert(key.clone(), sanitize_at_depth(val, depth + 1));
            }
            if map.len() > MAX_KEYS {
                out.insert(
                    "__truncated__".to_owned(),
                    Value::String(format!("{} more keys omitted", map.len() - MAX_KEYS)),
                );
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Truncate a string to at most `max_chars` Unicode scalar values,
/// appending a visible sentinel when truncation occurred.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...[truncated]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_is_a_fixed_point() {
        let value = json!({
            "a": "x".repeat(5_000),
            "b": (0..50).collect::<Vec<_>>(),
            "c": { "d": { "e": { "f": { "g": { "h": "too deep" } } } } },
        });

        let once = sanitize_value(&value);
        let twice = sanitize_value(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn oversized_array_is_truncated_with_marker() {
        let value = json!((0..100).collect::<Vec<_>>());
        let sanitized = sanitize_value(&value);
        let Value::Array(items) = sanitized else {
            panic!("expected array");
        };
        assert_eq!(items.len(), MAX_ITEMS + 1);
        assert!(items.last().unwrap().as_str().unwrap().contains("more items"));
    }

    #[test]
    fn string_truncation_appends_sentinel_once() {
        let long = "x".repeat(10_000);
        let truncated = truncate_chars(&long, 100);
        assert_eq!(truncated.matches("[truncated]").count(), 1);
    }
}
