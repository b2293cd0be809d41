//! Divergence detection between replicas.
//!
//! `compare_states` explains why two committed stores hash differently:
//! version map differences, plan differences and which partitions differ.
//! `verify_determinism` replays the same blocks twice and checks the app
//! hash after every block.

use std::collections::BTreeSet;

use serde::Serialize;

use upgrade_kernel::error::{ConfigurationError, SchedulingError};
use upgrade_kernel::hashing::canonical_hash;
use upgrade_kernel::keeper::{get_plan, get_version_map};
use upgrade_kernel::orchestrator::UpgradeOrchestrator;
use upgrade_kernel::plan::Plan;
use upgrade_kernel::store::StateStore;
use upgrade_kernel::version_map::{diff, VersionDiff};

use crate::block::Block;
use crate::chain::Chain;
use crate::error::ReplicaError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DivergenceReport {
    pub app_hash_a: String,
    pub app_hash_b: String,
    /// Version map of `b` relative to `a`.
    pub version_diff: VersionDiff,
    pub plan_a: Option<Plan>,
    pub plan_b: Option<Plan>,
    pub partitions_only_in_a: Vec<String>,
    pub partitions_only_in_b: Vec<String>,
    /// Partitions present in both with different contents.
    pub differing_partitions: Vec<String>,
}

impl DivergenceReport {
    pub fn is_identical(&self) -> bool {
        self.app_hash_a == self.app_hash_b
    }
}

pub fn compare_states(a: &StateStore, b: &StateStore) -> Result<DivergenceReport, SchedulingError> {
    let names_a: BTreeSet<&str> = a.partition_names().collect();
    let names_b: BTreeSet<&str> = b.partition_names().collect();

    let mut differing = Vec::new();
    for name in names_a.intersection(&names_b) {
        if a.partition(name)? != b.partition(name)? {
            differing.push(name.to_string());
        }
    }

    Ok(DivergenceReport {
        app_hash_a: canonical_hash(a),
        app_hash_b: canonical_hash(b),
        version_diff: diff(&get_version_map(a)?, &get_version_map(b)?),
        plan_a: get_plan(a)?,
        plan_b: get_plan(b)?,
        partitions_only_in_a: names_a.difference(&names_b).map(|s| s.to_string()).collect(),
        partitions_only_in_b: names_b.difference(&names_a).map(|s| s.to_string()).collect(),
        differing_partitions: differing,
    })
}

/// Replay `blocks` on two independently built orchestrators and compare the
/// app hash after every block. Returns the final app hash.
pub fn verify_determinism<F>(build: F, blocks: &[Block]) -> Result<String, ReplicaError>
where
    F: Fn() -> Result<UpgradeOrchestrator, ConfigurationError>,
{
    let mut left = Chain::genesis(build()?)?;
    let mut right = Chain::genesis(build()?)?;
    check_same(0, left.app_hash(), right.app_hash())?;

    for block in blocks {
        let a = left.execute_block(block)?.app_hash;
        let b = right.execute_block(block)?.app_hash;
        check_same(block.height, a, b)?;
    }
    Ok(left.app_hash())
}

fn check_same(height: u64, left: String, right: String) -> Result<(), ReplicaError> {
    if left != right {
        return Err(ReplicaError::Divergence {
            height,
            left,
            right,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use upgrade_kernel::keeper::init_genesis;
    use upgrade_kernel::version_map::VersionMap;

    fn base() -> StateStore {
        let mut store = StateStore::new();
        let vm: VersionMap = [("bank", 1u64)].into_iter().collect();
        init_genesis(&mut store, &vm).unwrap();
        store.mount("bank").unwrap();
        store
    }

    #[test]
    fn test_identical_states() {
        let report = compare_states(&base(), &base()).unwrap();
        assert!(report.is_identical());
        assert!(report.version_diff.is_empty());
        assert!(report.differing_partitions.is_empty());
    }

    #[test]
    fn test_partition_differences_are_located() {
        let a = base();
        let mut b = base();
        b.set("bank", b"alice".to_vec(), b"1".to_vec()).unwrap();
        b.mount("gov").unwrap();

        let report = compare_states(&a, &b).unwrap();
        assert!(!report.is_identical());
        assert_eq!(report.differing_partitions, vec!["bank".to_string()]);
        assert_eq!(report.partitions_only_in_b, vec!["gov".to_string()]);
        assert!(report.partitions_only_in_a.is_empty());
    }
}
