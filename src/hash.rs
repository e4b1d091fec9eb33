//! Deterministic content hashing over canonical JSON.
//!
//! The content hash covers the non-identity fields of an element: the typed
//! payload, prefixed with the element kind. Identity and attribution fields
//! (id, timestamps, creator, deletion marker) never participate, so two
//! elements with the same content hash agree on everything merge and sync
//! care about.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::model::Element;

/// Render a JSON value with object keys sorted recursively.
///
/// Arrays keep their order; numbers use serde_json's default formatting.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json handles escaping; a bare string is valid JSON.
            out.push_str(&serde_json::to_string(s).unwrap_or_default());
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// Hex SHA-256 over `kind + ":" + canonical_json(payload)`.
///
/// # Errors
///
/// Returns an error if the payload fails to serialize.
pub fn compute_content_hash(element: &Element) -> Result<String> {
    let body = element.payload.to_value()?;
    Ok(hash_kind_and_body(element.kind.as_str(), &body))
}

/// Async variant for runtimes that hash off-thread. Byte-identical to
/// [`compute_content_hash`]; the synchronous form is canonical.
///
/// # Errors
///
/// Returns an error if the payload fails to serialize.
pub async fn compute_content_hash_async(element: &Element) -> Result<String> {
    compute_content_hash(element)
}

pub(crate) fn hash_kind_and_body(kind: &str, body: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b":");
    hasher.update(canonical_json(body).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Whether two elements agree on all non-identity fields.
///
/// # Errors
///
/// Returns an error if either payload fails to serialize.
pub fn has_same_content_hash(a: &Element, b: &Element) -> Result<bool> {
    Ok(compute_content_hash(a)? == compute_content_hash(b)?)
}

/// Whether an element's current content matches an expected hash.
///
/// # Errors
///
/// Returns an error if the payload fails to serialize.
pub fn matches_content_hash(element: &Element, expected: &str) -> Result<bool> {
    Ok(compute_content_hash(element)? == expected)
}
