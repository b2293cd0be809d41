//! Invariant checks on the upgrade partition.
//!
//! Non-panicking: each check returns `Err(message)` on the first failure.
//! Run after every applied upgrade and whenever state is restored from a
//! snapshot.

use crate::codec::{decode_height, decode_plan, decode_version_map};
use crate::keeper::{DONE_PREFIX, PLAN_KEY, VERSION_MAP_KEY};
use crate::store::{StateStore, UPGRADE_PARTITION};

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all checks. Returns the first failure.
pub fn try_validate_upgrade_state(store: &StateStore) -> Result<(), String> {
    try_check_partition_mounted(store)?;
    try_check_version_map(store)?;
    try_check_done_records(store)?;
    try_check_pending_plan(store)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

fn try_check_partition_mounted(store: &StateStore) -> Result<(), String> {
    if !store.has_partition(UPGRADE_PARTITION) {
        return Err(format!(
            "[INVARIANT:upgrade_partition] partition {:?} is not mounted",
            UPGRADE_PARTITION
        ));
    }
    Ok(())
}

/// Exactly one canonical version map record.
fn try_check_version_map(store: &StateStore) -> Result<(), String> {
    let bytes = store
        .get(UPGRADE_PARTITION, VERSION_MAP_KEY)
        .map_err(|e| format!("[INVARIANT:version_map] {}", e))?
        .ok_or_else(|| "[INVARIANT:version_map] no version map recorded".to_string())?;
    decode_version_map(bytes).map_err(|e| format!("[INVARIANT:version_map] {}", e))?;
    Ok(())
}

fn try_check_done_records(store: &StateStore) -> Result<(), String> {
    let entries = store
        .iter_prefix(UPGRADE_PARTITION, DONE_PREFIX)
        .map_err(|e| format!("[INVARIANT:done_records] {}", e))?;
    for (key, value) in entries {
        if key.len() == DONE_PREFIX.len() {
            return Err("[INVARIANT:done_records] done record with empty name".to_string());
        }
        decode_height(value).map_err(|e| {
            format!(
                "[INVARIANT:done_records] {:?}: {}",
                String::from_utf8_lossy(key),
                e
            )
        })?;
    }
    Ok(())
}

/// A pending plan must decode and must not name an upgrade that already ran.
fn try_check_pending_plan(store: &StateStore) -> Result<(), String> {
    let Some(bytes) = store
        .get(UPGRADE_PARTITION, PLAN_KEY)
        .map_err(|e| format!("[INVARIANT:pending_plan] {}", e))?
    else {
        return Ok(());
    };
    let plan = decode_plan(bytes).map_err(|e| format!("[INVARIANT:pending_plan] {}", e))?;

    let mut done_key = DONE_PREFIX.to_vec();
    done_key.extend_from_slice(plan.name.as_bytes());
    let already_done = store
        .get(UPGRADE_PARTITION, &done_key)
        .map_err(|e| format!("[INVARIANT:pending_plan] {}", e))?
        .is_some();
    if already_done {
        return Err(format!(
            "[INVARIANT:pending_plan] plan {:?} is pending but already marked done",
            plan.name
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_height, encode_plan};
    use crate::keeper::init_genesis;
    use crate::plan::Plan;
    use crate::version_map::VersionMap;

    fn genesis() -> StateStore {
        let mut store = StateStore::new();
        let vm: VersionMap = [("bank", 1u64)].into_iter().collect();
        init_genesis(&mut store, &vm).unwrap();
        store
    }

    #[test]
    fn test_genesis_state_is_valid() {
        assert!(try_validate_upgrade_state(&genesis()).is_ok());
    }

    #[test]
    fn test_missing_partition() {
        let err = try_validate_upgrade_state(&StateStore::new()).unwrap_err();
        assert!(err.contains("[INVARIANT:upgrade_partition]"));
    }

    #[test]
    fn test_corrupt_version_map() {
        let mut store = genesis();
        store.set(UPGRADE_PARTITION, VERSION_MAP_KEY, vec![0xff, 0xff]).unwrap();
        let err = try_validate_upgrade_state(&store).unwrap_err();
        assert!(err.contains("[INVARIANT:version_map]"));
    }

    #[test]
    fn test_pending_plan_already_done() {
        let mut store = genesis();
        store
            .set(UPGRADE_PARTITION, PLAN_KEY, encode_plan(&Plan::new("v2", 10, "")))
            .unwrap();
        assert!(try_validate_upgrade_state(&store).is_ok());

        store.set(UPGRADE_PARTITION, b"done/v2".to_vec(), encode_height(5)).unwrap();
        let err = try_validate_upgrade_state(&store).unwrap_err();
        assert!(err.contains("[INVARIANT:pending_plan]"));
    }
}
