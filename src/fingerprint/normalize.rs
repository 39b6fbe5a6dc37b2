/// Request and context normalization
///
/// Produces the stable byte representation that fingerprinting hashes over.
/// Both functions are pure: same logical input, same bytes, regardless of
/// call order or process.
use serde_json::Value;

use crate::error::{IncantError, Result};

/// Filler phrases stripped from prompts before hashing. Two prompts that
/// differ only in politeness should resolve to the same script.
const STOPWORDS: &[&str] = &[
    "please",
    "can you",
    "could you",
    "would you",
    "i need",
    "i want",
    "help me",
    "create",
    "make",
    "generate",
    "build",
    "write",
];

/// Normalize a prompt: lowercase, strip the fixed stopword set, collapse
/// whitespace.
pub fn normalize_prompt(prompt: &str) -> String {
    let mut normalized = prompt.to_lowercase();

    for stopword in STOPWORDS {
        normalized = normalized.replace(stopword, "");
    }

    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize a context document into canonical compact JSON: object keys
/// sorted, numeric strings converted to numbers, no insignificant whitespace.
///
/// The context must be a JSON object (or null, which collapses to `{}`);
/// anything else is a `Validation` error. Whitespace *inside* string values
/// is preserved: in strict mode it participates in the fingerprint.
pub fn normalize_context(context: &Value) -> Result<String> {
    let canonical = match context {
        Value::Null => Value::Object(serde_json::Map::new()),
        Value::Object(_) => canonicalize(context)?,
        other => {
            return Err(IncantError::Validation(format!(
                "context must be a JSON object, got {}",
                json_type_name(other)
            )))
        }
    };

    let mut out = String::new();
    write_canonical(&canonical, &mut out);
    Ok(out)
}

/// Recursively canonicalize value types. Strings that parse fully as JSON
/// numbers become numbers, so `{"fps": "24"}` and `{"fps": 24}` fingerprint
/// identically.
fn canonicalize(value: &Value) -> Result<Value> {
    match value {
        Value::String(s) => Ok(coerce_numeric(s)),
        Value::Array(items) => {
            let items = items.iter().map(canonicalize).collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(items))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, val) in map {
                out.insert(key.clone(), canonicalize(val)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn coerce_numeric(s: &str) -> Value {
    let trimmed = s.trim();
    if trimmed != s || trimmed.is_empty() {
        // Leading/trailing whitespace is significant in strict mode.
        return Value::String(s.to_string());
    }

    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::Number(n.into());
    }

    // Only plain decimal forms; exponents and non-finite values stay strings.
    if trimmed.contains('.') && !trimmed.contains(['e', 'E']) {
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                if let Some(n) = serde_json::Number::from_f64(f) {
                    return Value::Number(n);
                }
            }
        }
    }

    Value::String(s.to_string())
}

/// Emit compact JSON with object keys in sorted order. Deterministic
/// independently of serde_json feature flags.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_prompt_strips_stopwords() {
        assert_eq!(
            normalize_prompt("Please create a script to concatenate videos"),
            "a script to concatenate videos"
        );
        assert_eq!(normalize_prompt("  Concatenate   these  VIDEOS "), "concatenate these videos");
    }

    #[test]
    fn test_normalize_context_sorts_keys() {
        let a = json!({"output": "final.mp4", "inputs": ["a.mp4", "b.mp4"]});
        let b = json!({"inputs": ["a.mp4", "b.mp4"], "output": "final.mp4"});
        assert_eq!(
            normalize_context(&a).unwrap(),
            normalize_context(&b).unwrap()
        );
    }

    #[test]
    fn test_normalize_context_coerces_numeric_strings() {
        let a = json!({"fps": "24"});
        let b = json!({"fps": 24});
        assert_eq!(
            normalize_context(&a).unwrap(),
            normalize_context(&b).unwrap()
        );
    }

    #[test]
    fn test_whitespace_inside_values_is_significant() {
        let a = json!({"name": "a b"});
        let b = json!({"name": "a  b"});
        assert_ne!(
            normalize_context(&a).unwrap(),
            normalize_context(&b).unwrap()
        );
    }

    #[test]
    fn test_non_object_context_rejected() {
        let err = normalize_context(&json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, IncantError::Validation(_)));
    }

    #[test]
    fn test_null_context_collapses_to_empty_object() {
        assert_eq!(normalize_context(&Value::Null).unwrap(), "{}");
        assert_eq!(normalize_context(&json!({})).unwrap(), "{}");
    }

    #[test]
    fn test_nested_canonicalization() {
        let a = json!({"outer": {"b": "1", "a": 2}});
        let b = json!({"outer": {"a": 2, "b": 1}});
        assert_eq!(
            normalize_context(&a).unwrap(),
            normalize_context(&b).unwrap()
        );
    }
}
