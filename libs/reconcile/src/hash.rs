//! Content hashing of instance templates and canary plans.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Number of hex characters of a revision hash that end up in object names.
///
/// Truncation keeps names short at the price of possible collisions, which
/// the revision store resolves by bumping a collision counter.
const REVISION_HASH_LEN: usize = 10;

/// Bytes of the SHA-256 digest kept by [`content_digest`].
const CONTENT_DIGEST_BYTES: usize = 16;

/// Short hash used to derive a revision name.
///
/// The collision count is mixed in so that a name already taken by different
/// content can be re-derived into a fresh one.
pub fn revision_hash(data: &Value, collision_count: i32) -> String {
    let mut hasher = hasher_for(data);
    if collision_count > 0 {
        hasher.update(collision_count.to_be_bytes());
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(REVISION_HASH_LEN);
    digest
}

/// Key-order independent digest of a JSON document, `sha256:`-prefixed.
pub fn content_digest(data: &Value) -> String {
    let digest = hasher_for(data).finalize();
    format!("sha256:{}", hex::encode(&digest[..CONTENT_DIGEST_BYTES]))
}

/// Canonical JSON: object keys sorted, no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn hasher_for(data: &Value) -> Sha256 {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(data).as_bytes());
    hasher
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
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
        // Scalars already serialize canonically.
        scalar => out.push_str(&scalar.to_string()),
    }
}
