//! Canonical JSON and tool-call signatures.
//!
//! Loop detection and dictionary hashing both require that semantically
//! equal argument objects hash identically, so objects are serialised with
//! sorted keys before hashing. Arguments are never compared as raw strings.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialise a JSON value with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<_> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*key).clone()).to_string());
                    out.push(':');
                    if let Some(child) = map.get(*key) {
                        write(child, out);
                    }
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Signature of a tool call: `sha256(name + canonical_json(args))[..16]`.
pub fn tool_call_signature(name: &str, arguments: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(canonical_json(arguments).as_bytes());

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
