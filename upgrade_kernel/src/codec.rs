//! Protobuf records for the upgrade partition.
//!
//! Hand-written prost messages, no prost-build. Field numbers are part of
//! the committed state and must never be reused.
//!
//! Version map entries are written in lexicographic module order and the
//! decoder refuses anything else, so a given map has exactly one encoding.

use prost::Message;
use thiserror::Error;

use crate::plan::Plan;
use crate::version_map::VersionMap;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("protobuf decode error in {record}: {reason}")]
    Decode { record: &'static str, reason: String },
    #[error("non-canonical {record}: {reason}")]
    NonCanonical { record: &'static str, reason: String },
}

// ── Wire types ─────────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct ProtoPlan {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub height: u64,
    #[prost(string, tag = "3")]
    pub info: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoModuleVersion {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub version: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoVersionMap {
    #[prost(message, repeated, tag = "1")]
    pub modules: Vec<ProtoModuleVersion>,
}

// ── Plan ───────────────────────────────────────────────────────

impl From<&Plan> for ProtoPlan {
    fn from(plan: &Plan) -> Self {
        Self {
            name: plan.name.clone(),
            height: plan.height,
            info: plan.info.clone(),
        }
    }
}

impl From<ProtoPlan> for Plan {
    fn from(proto: ProtoPlan) -> Self {
        Plan {
            name: proto.name,
            height: proto.height,
            info: proto.info,
        }
    }
}

pub fn encode_plan(plan: &Plan) -> Vec<u8> {
    ProtoPlan::from(plan).encode_to_vec()
}

pub fn decode_plan(bytes: &[u8]) -> Result<Plan, CodecError> {
    let proto = ProtoPlan::decode(bytes).map_err(|e| CodecError::Decode {
        record: "plan",
        reason: e.to_string(),
    })?;
    if proto.name.is_empty() {
        return Err(CodecError::NonCanonical {
            record: "plan",
            reason: "empty name".to_string(),
        });
    }
    Ok(proto.into())
}

// ── Version map ────────────────────────────────────────────────

pub fn encode_version_map(vm: &VersionMap) -> Vec<u8> {
    ProtoVersionMap {
        modules: vm
            .iter()
            .map(|(name, version)| ProtoModuleVersion {
                name: name.to_string(),
                version,
            })
            .collect(),
    }
    .encode_to_vec()
}

pub fn decode_version_map(bytes: &[u8]) -> Result<VersionMap, CodecError> {
    let proto = ProtoVersionMap::decode(bytes).map_err(|e| CodecError::Decode {
        record: "version map",
        reason: e.to_string(),
    })?;

    let mut vm = VersionMap::new();
    let mut previous: Option<&str> = None;
    for entry in &proto.modules {
        if entry.name.is_empty() {
            return Err(CodecError::NonCanonical {
                record: "version map",
                reason: "empty module name".to_string(),
            });
        }
        if let Some(prev) = previous {
            if prev >= entry.name.as_str() {
                return Err(CodecError::NonCanonical {
                    record: "version map",
                    reason: format!(
                        "module {:?} out of order or duplicated after {:?}",
                        entry.name, prev
                    ),
                });
            }
        }
        previous = Some(entry.name.as_str());
        vm.set(entry.name.clone(), entry.version);
    }
    Ok(vm)
}

// ── Heights ────────────────────────────────────────────────────

/// Heights are stored as 8 big-endian bytes.
pub fn encode_height(height: u64) -> Vec<u8> {
    height.to_be_bytes().to_vec()
}

pub fn decode_height(bytes: &[u8]) -> Result<u64, CodecError> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| CodecError::Decode {
        record: "height",
        reason: format!("expected 8 bytes, got {}", bytes.len()),
    })?;
    Ok(u64::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_map_encoding_is_order_independent() {
        let a: VersionMap = [("staking", 3u64), ("bank", 2), ("gov", 1)].into_iter().collect();
        let b: VersionMap = [("gov", 1u64), ("staking", 3), ("bank", 2)].into_iter().collect();
        assert_eq!(encode_version_map(&a), encode_version_map(&b));
        assert_eq!(decode_version_map(&encode_version_map(&a)).unwrap(), a);
    }

    #[test]
    fn test_decode_rejects_unsorted_version_map() {
        let bytes = ProtoVersionMap {
            modules: vec![
                ProtoModuleVersion { name: "gov".into(), version: 1 },
                ProtoModuleVersion { name: "bank".into(), version: 1 },
            ],
        }
        .encode_to_vec();
        assert!(matches!(
            decode_version_map(&bytes),
            Err(CodecError::NonCanonical { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_duplicate_module() {
        let bytes = ProtoVersionMap {
            modules: vec![
                ProtoModuleVersion { name: "bank".into(), version: 1 },
                ProtoModuleVersion { name: "bank".into(), version: 2 },
            ],
        }
        .encode_to_vec();
        assert!(decode_version_map(&bytes).is_err());
    }

    #[test]
    fn test_decode_garbage_plan() {
        assert!(matches!(
            decode_plan(&[0xff, 0xff, 0xff]),
            Err(CodecError::Decode { record: "plan", .. })
        ));
    }

    #[test]
    fn test_height_encoding() {
        assert_eq!(decode_height(&encode_height(100)).unwrap(), 100);
        assert!(decode_height(&[1, 2, 3]).is_err());
    }
}
