//! Canonical hashing of the committed state.
//!
//! Deterministic canonical serialization + SHA-256. The result is the app
//! hash every replica must agree on; the plan and the version map live in
//! the `upgrade` partition and are therefore covered by it.
//!
//! Rules:
//!   - kernel_version first, then partitions
//!   - partitions sorted by name (UTF-8 byte order)
//!   - entries sorted by key (byte order), keys and values lowercase hex
//!   - UTF-8 JSON, no whitespace

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::codec::CodecError;
use crate::store::{Partition, StateStore};
use crate::KERNEL_VERSION;

const RECORD: &str = "canonical state";

/// Canonical serialization of a store to UTF-8 JSON bytes.
pub fn canonical_serialize(store: &StateStore) -> Vec<u8> {
    build_canonical_value(store).to_string().into_bytes()
}

/// SHA-256 of the canonical serialization, lowercase hex.
pub fn canonical_hash(store: &StateStore) -> String {
    hash_bytes(&canonical_serialize(store))
}

/// Lowercase hex SHA-256 of arbitrary bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Build the canonical value in strict field order.
///
/// serde_json::Map preserves insertion order (`preserve_order`), and
/// BTreeMap iteration gives the sorted partition and key order.
fn build_canonical_value(store: &StateStore) -> Value {
    let mut partitions = Vec::new();
    for (name, entries) in store.partitions() {
        let entries: Vec<Value> = entries
            .iter()
            .map(|(k, v)| {
                Value::Array(vec![
                    Value::String(hex::encode(k)),
                    Value::String(hex::encode(v)),
                ])
            })
            .collect();

        let mut partition = Map::new();
        partition.insert("name".to_string(), Value::String(name.clone()));
        partition.insert("entries".to_string(), Value::Array(entries));
        partitions.push(Value::Object(partition));
    }

    // kernel_version MUST be first, it binds the hash to the kernel identity.
    let mut root = Map::new();
    root.insert(
        "kernel_version".to_string(),
        Value::Number(KERNEL_VERSION.into()),
    );
    root.insert("partitions".to_string(), Value::Array(partitions));
    Value::Object(root)
}

/// Inverse of `canonical_serialize`.
///
/// Strict: the result must re-serialize to exactly the input bytes,
/// otherwise the input was not canonical.
pub fn decode_canonical(bytes: &[u8]) -> Result<StateStore, CodecError> {
    let root: Value = serde_json::from_slice(bytes).map_err(|e| decode_err(e.to_string()))?;

    match root.get("kernel_version").and_then(Value::as_u64) {
        Some(v) if v == u64::from(KERNEL_VERSION) => {}
        other => {
            return Err(decode_err(format!(
                "kernel_version {:?} does not match {}",
                other, KERNEL_VERSION
            )))
        }
    }

    let list = root
        .get("partitions")
        .and_then(Value::as_array)
        .ok_or_else(|| decode_err("missing partitions".to_string()))?;

    let mut partitions: BTreeMap<String, Partition> = BTreeMap::new();
    for item in list {
        let name = item
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| decode_err("partition without name".to_string()))?;
        let entries = item
            .get("entries")
            .and_then(Value::as_array)
            .ok_or_else(|| decode_err(format!("partition {:?} without entries", name)))?;

        let mut partition = Partition::new();
        for entry in entries {
            let pair = entry
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| decode_err(format!("bad entry in partition {:?}", name)))?;
            let key = hex_field(&pair[0])?;
            let value = hex_field(&pair[1])?;
            partition.insert(key, value);
        }
        partitions.insert(name.to_string(), partition);
    }

    let store = StateStore::from_partitions(partitions);
    if canonical_serialize(&store) != bytes {
        return Err(CodecError::NonCanonical {
            record: RECORD,
            reason: "input does not re-serialize to identical bytes".to_string(),
        });
    }
    Ok(store)
}

fn hex_field(v: &Value) -> Result<Vec<u8>, CodecError> {
    let s = v
        .as_str()
        .ok_or_else(|| decode_err("expected hex string".to_string()))?;
    hex::decode(s).map_err(|e| decode_err(e.to_string()))
}

fn decode_err(reason: String) -> CodecError {
    CodecError::Decode {
        record: RECORD,
        reason,
    }
}
