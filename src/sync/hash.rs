//! Content hashing for idempotent sync.

use crate::models::IncomingRecord;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub const HASH_PREFIX: &str = "sha256:";

/// Hash of a record's source table and payload.
///
/// Object keys are sorted before hashing, so two payloads that differ only in
/// key order hash the same. The record id and timestamp are not part of the
/// content.
pub fn content_hash(record: &IncomingRecord) -> String {
    let mut canonical = String::new();
    write_canonical(&JsonValue::String(record.source_table.clone()), &mut canonical);
    canonical.push('\n');
    for (key, value) in sorted(&record.payload) {
        write_canonical(&JsonValue::String(key.clone()), &mut canonical);
        canonical.push(':');
        write_canonical(value, &mut canonical);
        canonical.push(',');
    }

    let digest = Sha256::digest(canonical.as_bytes());
    format!("{HASH_PREFIX}{}", hex::encode(digest))
}

fn sorted(map: &serde_json::Map<String, JsonValue>) -> Vec<(&String, &JsonValue)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            out.push('{');
            for (i, (key, value)) in sorted(map).into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
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
