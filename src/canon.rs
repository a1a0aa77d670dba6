//! Canonical JSON codec and digest helpers.
//!
//! Every persisted identity in the index — tree hashes, commit hashes,
//! artifact ids, payload hashes, task ids, envelope input/output hashes —
//! derives from the canonical form produced here: object keys sorted
//! lexicographically, no insignificant whitespace, UTF-8 output, numbers
//! rendered losslessly, absent keys omitted. Two values that canonicalize
//! to the same string are the same value as far as the index is concerned.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value in canonical form: sorted keys, no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// `sha256_hex(canonical_json(value))` — the identity function for every
/// hashed shape in the schema.
pub fn hash_value(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_json_string(s, out),
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// JSON string escaping per RFC 8259: the two mandatory escapes plus
/// `\uXXXX` for control characters. Everything else passes through as UTF-8.
fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted() {
        let v = json!({"zulu": 1, "alpha": 2, "mike": 3});
        assert_eq!(canonical_json(&v), r#"{"alpha":2,"mike":3,"zulu":1}"#);
    }

    #[test]
    fn test_nested_objects_sorted() {
        let v = json!({"b": {"y": 1, "x": 2}, "a": [{"k": 1, "j": 2}]});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":[{"j":2,"k":1}],"b":{"x":2,"y":1}}"#
        );
    }

    #[test]
    fn test_no_whitespace() {
        let v = json!({"a": [1, 2, 3], "b": "text with spaces"});
        let s = canonical_json(&v);
        assert!(!s.contains(": "));
        assert!(!s.contains(", "));
    }

    #[test]
    fn test_scalars() {
        assert_eq!(canonical_json(&json!(null)), "null");
        assert_eq!(canonical_json(&json!(true)), "true");
        assert_eq!(canonical_json(&json!(42)), "42");
        assert_eq!(canonical_json(&json!(-7)), "-7");
        assert_eq!(canonical_json(&json!(0.5)), "0.5");
        assert_eq!(canonical_json(&json!("hi")), r#""hi""#);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(canonical_json(&json!("a\"b\\c")), r#""a\"b\\c""#);
        assert_eq!(canonical_json(&json!("line\nbreak")), r#""line\nbreak""#);
        assert_eq!(canonical_json(&json!("\u{01}")), "\"\\u0001\"");
        // Non-ASCII stays as UTF-8, not escaped.
        assert_eq!(canonical_json(&json!("héllo")), "\"héllo\"");
    }

    #[test]
    fn test_hash_is_stable_across_key_order() {
        let a = json!({"tree_hash": "t1", "parents": ["p1", "p2"]});
        let b = json!({"parents": ["p1", "p2"], "tree_hash": "t1"});
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn test_hash_format() {
        let h = hash_value(&json!({}));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_sha256_known_vector() {
        // sha256("") is the well-known empty digest.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
