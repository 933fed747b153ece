//! Deterministic `hashInfo` fingerprints of a corpus snapshot.
//!
//! The same inputs always yield the same digest; the archive type prefix keeps
//! the two families disjoint even before the `(type, hash_info)` constraint.

use chrono::{DateTime, Utc};
use serde_json::Value;

const NO_INSTANT: &str = "-";

/// Fingerprint of the full corpus as of a cutoff.
pub fn corpus_fingerprint(count: u64, max_updated: Option<DateTime<Utc>>) -> String {
    digest(&format!("all|{count}|{}", instant_component(max_updated)))
}

/// Fingerprint of a saved set: its query, size and newest member update.
pub fn set_fingerprint(sqon: &Value, size: u64, max_updated: Option<DateTime<Utc>>) -> String {
    let mut canonical = String::new();
    write_canonical(sqon, &mut canonical);
    digest(&format!(
        "set_query|{canonical}|{size}|{}",
        instant_component(max_updated)
    ))
}

fn instant_component(instant: Option<DateTime<Utc>>) -> String {
    instant
        .map(|at| at.timestamp_millis().to_string())
        .unwrap_or_else(|| NO_INSTANT.to_string())
}

fn digest(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

/// Compact JSON with object keys sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
