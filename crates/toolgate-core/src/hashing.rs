//! Stable short digests of JSON tool inputs.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex characters kept from the SHA-256 digest.
pub const INPUT_HASH_LEN: usize = 16;

/// First 16 hex characters of the SHA-256 of `value` in canonical form.
///
/// Object keys are sorted before hashing, so two inputs that differ only in
/// key order hash identically.
pub fn hash_input(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(INPUT_HASH_LEN);
    hex
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_sixteen_hex_chars() {
        let h = hash_input(&json!({"owner": "acme", "repo": "widgets"}));
        assert_eq!(h.len(), INPUT_HASH_LEN);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"a": 1, "b": {"x": [1, 2], "y": null}});
        let b = json!({"b": {"y": null, "x": [1, 2]}, "a": 1});
        assert_eq!(hash_input(&a), hash_input(&b));
    }

    #[test]
    fn different_inputs_differ() {
        assert_ne!(hash_input(&json!({"n": 1})), hash_input(&json!({"n": 2})));
        assert_ne!(hash_input(&json!([1, 2])), hash_input(&json!([2, 1])));
    }

    #[test]
    fn matches_plain_sha256_for_scalars() {
        let expected = hex::encode(Sha256::digest(b"\"hello\""));
        assert_eq!(hash_input(&json!("hello")), expected[..INPUT_HASH_LEN]);
    }
}
