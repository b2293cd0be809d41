//! Partitioned state store.
//!
//! The committed application state is a set of named partitions, each an
//! ordered `bytes -> bytes` map. Everything is `BTreeMap`-backed so iteration
//! order is identical on every replica.
//!
//! Store upgrades (add / rename / delete partitions) are validated up front
//! and applied all-or-nothing.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Partition owned by the upgrade keeper. Never touched by store upgrades
/// or by ordinary module writes.
pub const UPGRADE_PARTITION: &str = "upgrade";

/// One partition: ordered key/value pairs.
pub type Partition = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("partition {0:?} is not mounted")]
    UnknownPartition(String),
    #[error("partition {0:?} already exists")]
    PartitionExists(String),
    #[error("invalid partition name {0:?}: must match [A-Za-z0-9_.-]+")]
    InvalidPartitionName(String),
    #[error("partition {0:?} is reserved")]
    ReservedPartition(String),
    #[error("invalid store upgrades: {0}")]
    InvalidStoreUpgrades(String),
}

/// Validate that a partition name matches `[A-Za-z0-9_.-]+`.
pub fn validate_partition_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.')
    {
        return Err(StoreError::InvalidPartitionName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Store upgrades
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreRename {
    pub old_name: String,
    pub new_name: String,
}

/// Declarative partition changes applied right before an upgrade handler runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreUpgrades {
    pub added: Vec<String>,
    pub renamed: Vec<StoreRename>,
    pub deleted: Vec<String>,
}

impl StoreUpgrades {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, name: impl Into<String>) -> Self {
        self.added.push(name.into());
        self
    }

    pub fn rename(mut self, old_name: impl Into<String>, new_name: impl Into<String>) -> Self {
        self.renamed.push(StoreRename {
            old_name: old_name.into(),
            new_name: new_name.into(),
        });
        self
    }

    pub fn delete(mut self, name: impl Into<String>) -> Self {
        self.deleted.push(name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.renamed.is_empty() && self.deleted.is_empty()
    }

    /// Static checks, independent of any store contents.
    ///
    /// Every partition name may appear at most once across all three lists,
    /// and the upgrade partition may not appear at all.
    pub fn validate(&self) -> Result<(), StoreError> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let names = self
            .added
            .iter()
            .map(String::as_str)
            .chain(
                self.renamed
                    .iter()
                    .flat_map(|r| [r.old_name.as_str(), r.new_name.as_str()]),
            )
            .chain(self.deleted.iter().map(String::as_str));

        for name in names {
            validate_partition_name(name)?;
            if name == UPGRADE_PARTITION {
                return Err(StoreError::ReservedPartition(name.to_string()));
            }
            if !seen.insert(name) {
                return Err(StoreError::InvalidStoreUpgrades(format!(
                    "partition {:?} listed more than once",
                    name
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateStore {
    partitions: BTreeMap<String, Partition>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store with the given partitions mounted and empty.
    pub fn with_partitions<I, S>(names: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut store = Self::new();
        for name in names {
            store.mount(name)?;
        }
        Ok(store)
    }

    /// Mount an empty partition.
    pub fn mount(&mut self, name: impl Into<String>) -> Result<(), StoreError> {
        let name = name.into();
        validate_partition_name(&name)?;
        if self.partitions.contains_key(&name) {
            return Err(StoreError::PartitionExists(name));
        }
        self.partitions.insert(name, Partition::new());
        Ok(())
    }

    pub fn has_partition(&self, name: &str) -> bool {
        self.partitions.contains_key(name)
    }

    /// Partition names in lexicographic order.
    pub fn partition_names(&self) -> impl Iterator<Item = &str> {
        self.partitions.keys().map(String::as_str)
    }

    pub fn partition(&self, name: &str) -> Result<&Partition, StoreError> {
        self.partitions
            .get(name)
            .ok_or_else(|| StoreError::UnknownPartition(name.to_string()))
    }

    fn partition_mut(&mut self, name: &str) -> Result<&mut Partition, StoreError> {
        self.partitions
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownPartition(name.to_string()))
    }

    pub fn get(&self, partition: &str, key: &[u8]) -> Result<Option<&[u8]>, StoreError> {
        Ok(self.partition(partition)?.get(key).map(Vec::as_slice))
    }

    pub fn set(
        &mut self,
        partition: &str,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), StoreError> {
        self.partition_mut(partition)?
            .insert(key.into(), value.into());
        Ok(())
    }

    /// Remove a key, returning the previous value if any.
    pub fn delete(&mut self, partition: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.partition_mut(partition)?.remove(key))
    }

    /// Ordered iteration over one partition.
    pub fn iter(
        &self,
        partition: &str,
    ) -> Result<impl Iterator<Item = (&[u8], &[u8])>, StoreError> {
        Ok(self
            .partition(partition)?
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice())))
    }

    /// Ordered iteration over the keys of one partition starting with `prefix`.
    pub fn iter_prefix<'a>(
        &'a self,
        partition: &str,
        prefix: &'a [u8],
    ) -> Result<impl Iterator<Item = (&'a [u8], &'a [u8])>, StoreError> {
        Ok(self
            .partition(partition)?
            .range(prefix.to_vec()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_slice(), v.as_slice())))
    }

    /// Apply partition additions, renames and deletions.
    ///
    /// Checked completely before anything is changed: on error the store is
    /// exactly as it was.
    pub fn apply_store_upgrades(&mut self, upgrades: &StoreUpgrades) -> Result<(), StoreError> {
        upgrades.validate()?;

        for rename in &upgrades.renamed {
            if !self.has_partition(&rename.old_name) {
                return Err(StoreError::UnknownPartition(rename.old_name.clone()));
            }
            if self.has_partition(&rename.new_name) {
                return Err(StoreError::PartitionExists(rename.new_name.clone()));
            }
        }
        for name in &upgrades.added {
            if self.has_partition(name) {
                return Err(StoreError::PartitionExists(name.clone()));
            }
        }
        for name in &upgrades.deleted {
            if !self.has_partition(name) {
                return Err(StoreError::UnknownPartition(name.clone()));
            }
        }

        for rename in &upgrades.renamed {
            if let Some(data) = self.partitions.remove(&rename.old_name) {
                self.partitions.insert(rename.new_name.clone(), data);
            }
        }
        for name in &upgrades.added {
            self.partitions.insert(name.clone(), Partition::new());
        }
        for name in &upgrades.deleted {
            self.partitions.remove(name);
        }
        Ok(())
    }

    pub(crate) fn partitions(&self) -> &BTreeMap<String, Partition> {
        &self.partitions
    }

    pub(crate) fn from_partitions(partitions: BTreeMap<String, Partition>) -> Self {
        Self { partitions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StateStore {
        let mut store = StateStore::with_partitions(["bank", "staking"]).unwrap();
        store.set("bank", b"alice".to_vec(), b"10".to_vec()).unwrap();
        store.set("staking", b"val1".to_vec(), b"bonded".to_vec()).unwrap();
        store
    }

    #[test]
    fn test_unknown_partition_is_an_error() {
        let mut store = sample();
        assert_eq!(
            store.set("gov", b"k".to_vec(), b"v".to_vec()),
            Err(StoreError::UnknownPartition("gov".to_string()))
        );
        assert!(store.get("gov", b"k").is_err());
    }

    #[test]
    fn test_partition_name_validation() {
        assert!(validate_partition_name("ibc-transfer_v2.1").is_ok());
        assert!(validate_partition_name("").is_err());
        assert!(validate_partition_name("with space").is_err());
    }

    #[test]
    fn test_iter_prefix_stops_at_prefix_boundary() {
        let mut store = StateStore::with_partitions(["p"]).unwrap();
        for key in ["a/1", "a/2", "b/1"] {
            store.set("p", key.as_bytes().to_vec(), b"x".to_vec()).unwrap();
        }
        let keys: Vec<&[u8]> = store.iter_prefix("p", b"a/").unwrap().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a/1".as_slice(), b"a/2".as_slice()]);
    }

    #[test]
    fn test_store_upgrades_rename_add_delete() {
        let mut store = sample();
        let upgrades = StoreUpgrades::new()
            .rename("bank", "bank2")
            .add("newPartition")
            .delete("staking");
        store.apply_store_upgrades(&upgrades).unwrap();

        let names: Vec<&str> = store.partition_names().collect();
        assert_eq!(names, vec!["bank2", "newPartition"]);
        assert_eq!(store.get("bank2", b"alice").unwrap(), Some(b"10".as_slice()));
    }

    #[test]
    fn test_failed_store_upgrade_leaves_store_untouched() {
        let mut store = sample();
        let before = store.clone();
        // The rename is fine, the deletion target does not exist.
        let upgrades = StoreUpgrades::new().rename("bank", "bank2").delete("missing");
        assert_eq!(
            store.apply_store_upgrades(&upgrades),
            Err(StoreError::UnknownPartition("missing".to_string()))
        );
        assert_eq!(store, before);
    }

    #[test]
    fn test_store_upgrades_reject_reserved_and_duplicates() {
        assert_eq!(
            StoreUpgrades::new().delete(UPGRADE_PARTITION).validate(),
            Err(StoreError::ReservedPartition(UPGRADE_PARTITION.to_string()))
        );
        assert!(matches!(
            StoreUpgrades::new().add("x").delete("x").validate(),
            Err(StoreError::InvalidStoreUpgrades(_))
        ));
    }
}
