//! Deterministic state snapshots.
//!
//! A snapshot is the canonical JSON of the committed store plus its hash.
//! No timestamps in snapshot content. A snapshot whose hash or invariants do
//! not check out is never restored; the caller falls back to an older one or
//! to a full replay.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use upgrade_kernel::hashing::{canonical_hash, canonical_serialize, decode_canonical, hash_bytes};
use upgrade_kernel::invariants::try_validate_upgrade_state;
use upgrade_kernel::store::StateStore;
use upgrade_kernel::KERNEL_VERSION;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot serialization: {0}")]
    Serialization(String),
    #[error("snapshot deserialization: {0}")]
    Deserialization(String),
    #[error("snapshot at height {height} has hash {recorded}, content hashes to {computed}")]
    HashMismatch {
        height: u64,
        recorded: String,
        computed: String,
    },
    #[error("snapshot kernel version {found}, this binary runs {expected}")]
    KernelVersion { found: u32, expected: u32 },
    #[error("snapshot violates invariants: {0}")]
    InvariantViolation(String),
}

/// On-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    /// Height of the last block included.
    pub height: u64,
    /// Canonical JSON of the committed store.
    pub canonical_json: String,
    /// Lowercase hex SHA-256 of `canonical_json`, equal to the app hash.
    pub hash: String,
    pub kernel_version: u32,
}

impl Snapshot {
    pub fn capture(height: u64, store: &StateStore) -> Result<Self, SnapshotError> {
        let canonical_json = String::from_utf8(canonical_serialize(store))
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        Ok(Self {
            height,
            canonical_json,
            hash: canonical_hash(store),
            kernel_version: KERNEL_VERSION,
        })
    }
}

fn snapshot_path(dir: &Path, height: u64) -> PathBuf {
    dir.join(format!("snapshot_{:012}.json", height))
}

pub fn save_snapshot(dir: &Path, height: u64, store: &StateStore) -> Result<PathBuf, SnapshotError> {
    fs::create_dir_all(dir)?;
    let snap = Snapshot::capture(height, store)?;
    let content =
        serde_json::to_string(&snap).map_err(|e| SnapshotError::Serialization(e.to_string()))?;

    let path = snapshot_path(dir, height);
    let mut file = File::create(&path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    Ok(path)
}

/// `None` if no snapshot exists at that height.
pub fn load_snapshot(dir: &Path, height: u64) -> Result<Option<Snapshot>, SnapshotError> {
    let path = snapshot_path(dir, height);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)?;
    let snap = serde_json::from_str(&content)
        .map_err(|e| SnapshotError::Deserialization(format!("{}: {}", path.display(), e)))?;
    Ok(Some(snap))
}

/// Heights of all snapshot files in `dir`, ascending.
pub fn snapshot_heights(dir: &Path) -> Result<Vec<u64>, SnapshotError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut heights = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let parsed = name
            .to_str()
            .and_then(|n| n.strip_prefix("snapshot_"))
            .and_then(|n| n.strip_suffix(".json"))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(height) = parsed {
            heights.push(height);
        }
    }
    heights.sort_unstable();
    Ok(heights)
}

pub fn load_latest_snapshot(dir: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    match snapshot_heights(dir)?.last() {
        Some(height) => load_snapshot(dir, *height),
        None => Ok(None),
    }
}

pub fn verify_snapshot_hash(snap: &Snapshot) -> bool {
    hash_bytes(snap.canonical_json.as_bytes()) == snap.hash
}

/// Hash check, kernel version check, strict decode, invariant check.
pub fn restore_snapshot(snap: &Snapshot) -> Result<StateStore, SnapshotError> {
    if snap.kernel_version != KERNEL_VERSION {
        return Err(SnapshotError::KernelVersion {
            found: snap.kernel_version,
            expected: KERNEL_VERSION,
        });
    }
    let computed = hash_bytes(snap.canonical_json.as_bytes());
    if computed != snap.hash {
        return Err(SnapshotError::HashMismatch {
            height: snap.height,
            recorded: snap.hash.clone(),
            computed,
        });
    }
    let store = decode_canonical(snap.canonical_json.as_bytes())
        .map_err(|e| SnapshotError::Deserialization(e.to_string()))?;
    try_validate_upgrade_state(&store).map_err(SnapshotError::InvariantViolation)?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use upgrade_kernel::keeper::init_genesis;
    use upgrade_kernel::version_map::VersionMap;

    fn store() -> StateStore {
        let mut store = StateStore::new();
        let vm: VersionMap = [("bank", 1u64)].into_iter().collect();
        init_genesis(&mut store, &vm).unwrap();
        store.mount("bank").unwrap();
        store.set("bank", b"alice".to_vec(), b"10".to_vec()).unwrap();
        store
    }

    #[test]
    fn test_save_then_restore_matches_app_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        save_snapshot(dir.path(), 7, &store).unwrap();

        let snap = load_latest_snapshot(dir.path()).unwrap().unwrap();
        assert_eq!(snap.height, 7);
        assert_eq!(snap.hash, canonical_hash(&store));
        assert!(verify_snapshot_hash(&snap));
        assert_eq!(restore_snapshot(&snap).unwrap(), store);
    }

    #[test]
    fn test_latest_is_highest_height() {
        let dir = tempfile::tempdir().unwrap();
        for h in [5, 100, 20] {
            save_snapshot(dir.path(), h, &store()).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        assert_eq!(snapshot_heights(dir.path()).unwrap(), vec![5, 20, 100]);
        assert_eq!(load_latest_snapshot(dir.path()).unwrap().unwrap().height, 100);
        assert!(load_snapshot(dir.path(), 6).unwrap().is_none());
    }

    #[test]
    fn test_tampered_snapshot_is_refused() {
        let mut snap = Snapshot::capture(3, &store()).unwrap();
        snap.canonical_json = snap.canonical_json.replace("3130", "3939");
        assert!(!verify_snapshot_hash(&snap));
        assert!(matches!(
            restore_snapshot(&snap),
            Err(SnapshotError::HashMismatch { height: 3, .. })
        ));
    }

    #[test]
    fn test_state_without_upgrade_partition_is_refused() {
        let mut bare = StateStore::new();
        bare.mount("bank").unwrap();
        let snap = Snapshot::capture(1, &bare).unwrap();
        assert!(matches!(
            restore_snapshot(&snap),
            Err(SnapshotError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_unknown_field_in_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path(), 1);
        fs::write(
            &path,
            r#"{"height":1,"canonical_json":"{}","hash":"","kernel_version":1,"extra":0}"#,
        )
        .unwrap();
        assert!(matches!(
            load_snapshot(dir.path(), 1),
            Err(SnapshotError::Deserialization(_))
        ));
    }
}
