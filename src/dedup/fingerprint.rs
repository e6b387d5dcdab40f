//! Content fingerprints for replay detection.
//!
//! A fingerprint maps semantically identical deliveries (reordered keys,
//! different whitespace, fresh timestamps) to the same key. Payloads that
//! carry an explicit identifier are keyed by it instead of by content.
//!
//! This is a heuristic. Treating a real duplicate as new is tolerated;
//! suppressing a genuinely new event is not, so the volatile field list is
//! kept short and is only applied at the top level.

use serde_json::{Map, Value};

use crate::events::InboundFrame;

/// Identifier fields checked in priority order. The first non-empty match wins.
pub const ID_FIELDS: &[&str] = &["id", "eventId", "event_id", "uuid", "message_id"];

/// Top-level fields that legitimately differ between replays of one event.
pub const VOLATILE_FIELDS: &[&str] = &[
    "timestamp",
    "ts",
    "createdAt",
    "created_at",
    "updatedAt",
    "updated_at",
    "requestId",
    "request_id",
    "correlationId",
    "correlation_id",
];

/// Nesting depth past which sub-trees are replaced by [`DEPTH_SENTINEL`].
pub const MAX_DEPTH: usize = 64;

/// Marker written in place of sub-trees nested beyond [`MAX_DEPTH`].
pub const DEPTH_SENTINEL: &str = "[depth]";

/// Compute the dedup key for a decoded payload.
pub fn fingerprint(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            if let Some(id) = explicit_id(map) {
                return format!("id:{}", id);
            }
            let stripped: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| !VOLATILE_FIELDS.contains(&key.as_str()))
                .map(|(key, val)| (key.clone(), val.clone()))
                .collect();
            let canonical = canonical_json(&Value::Object(stripped));
            format!("obj:{}", blake3::hash(canonical.as_bytes()).to_hex())
        }
        Value::String(s) => format!("str:{}", s.trim()),
        Value::Null => "nil:null".to_string(),
        other => format!("other:{}", canonical_json(other)),
    }
}

/// Dedup key for a raw frame. Text that is not JSON keys as a string.
pub fn fingerprint_frame(frame: &InboundFrame) -> String {
    fingerprint(&frame.decode())
}

/// Serialize a value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, 0, &mut out);
    out
}

fn explicit_id(map: &Map<String, Value>) -> Option<String> {
    ID_FIELDS.iter().find_map(|field| match map.get(*field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn write_canonical(value: &Value, depth: usize, out: &mut String) {
    if depth > MAX_DEPTH {
        write_string(DEPTH_SENTINEL, out);
        return;
    }

    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                if let Some(child) = map.get(key) {
                    write_canonical(child, depth + 1, out);
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
                write_canonical(item, depth + 1, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        // Null, Bool and Number have a single compact JSON form.
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::from(s).to_string());
}
