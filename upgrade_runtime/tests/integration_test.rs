//! Integration tests for upgrade_runtime.
//!
//! All tests use temporary directories for isolation.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use upgrade_kernel::error::{ConfigurationError, ConsensusHalt, UpgradeError};
use upgrade_kernel::keeper::{done_height, get_plan, get_version_map};
use upgrade_kernel::module_manager::{ModuleDescriptor, ModuleManager};
use upgrade_kernel::orchestrator::{BlockOutcome, UpgradeOrchestrator};
use upgrade_kernel::plan::Plan;
use upgrade_kernel::registry::UpgradeRegistry;
use upgrade_kernel::version_map::VersionMap;
use upgrade_kernel::Context;

use upgrade_runtime::block::{Block, Tx};
use upgrade_runtime::config::ReplicaConfig;
use upgrade_runtime::divergence::{compare_states, verify_determinism};
use upgrade_runtime::replay;
use upgrade_runtime::replica::{Replica, SharedReplica};
use upgrade_runtime::snapshot::snapshot_heights;
use upgrade_runtime::upgrade_info::read_upgrade_info;
use upgrade_runtime::upgrades::{register_upgrades, V1_0_0_ONEX_TESTNET};
use upgrade_runtime::ReplicaError;

// ─────────────────────────────────────────────────────────────
// Binaries
// ─────────────────────────────────────────────────────────────

/// The old binary: bank at version 1, only the shipped upgrades.
fn old_binary() -> (UpgradeRegistry, ModuleManager) {
    let mut registry = UpgradeRegistry::new();
    register_upgrades(&mut registry).unwrap();
    let mut modules = ModuleManager::new();
    modules.register_module(ModuleDescriptor::new("bank", 1)).unwrap();
    (registry, modules)
}

/// The new binary: knows upgrade "v2", which moves bank to version 2.
fn new_binary() -> (UpgradeRegistry, ModuleManager) {
    let mut registry = UpgradeRegistry::new();
    register_upgrades(&mut registry).unwrap();
    registry
        .register(
            "v2",
            |_: &mut Context, _: &Plan, mut vm: VersionMap| -> Result<VersionMap, UpgradeError> {
                vm.set("bank", 2);
                Ok(vm)
            },
            None,
        )
        .unwrap();
    let mut modules = ModuleManager::new();
    modules
        .register_module(
            ModuleDescriptor::new("bank", 2)
                .genesis_version(1)
                .migration(1, |ctx: &mut Context| -> Result<(), UpgradeError> {
                    ctx.store_mut().set("bank", b"denom".to_vec(), b"uonex".to_vec())?;
                    Ok(())
                }),
        )
        .unwrap();
    (registry, modules)
}

fn open(dir: &Path, binary: (UpgradeRegistry, ModuleManager), config: ReplicaConfig) -> Result<Replica, ReplicaError> {
    let (registry, modules) = binary;
    Replica::open(dir, config, registry, modules)
}

fn orchestrator(binary: (UpgradeRegistry, ModuleManager)) -> Result<UpgradeOrchestrator, ConfigurationError> {
    let (registry, modules) = binary;
    UpgradeOrchestrator::new(registry, modules, Default::default())
}

/// Block `h` writes one bank entry.
fn transfer_block(h: u64) -> Block {
    Block::new(
        h,
        vec![Tx::write("bank", format!("acct{:04}", h).into_bytes(), h.to_be_bytes().to_vec())],
    )
}

fn schedule_block(h: u64, name: &str, at: u64) -> Block {
    Block::new(h, vec![Tx::SchedulePlan(Plan::new(name, at, "swap to the new binary"))])
}

fn vm(entries: &[(&str, u64)]) -> VersionMap {
    entries.iter().map(|(m, v)| (*m, *v)).collect()
}

// ─────────────────────────────────────────────────────────────
// Upgrade lifecycle
// ─────────────────────────────────────────────────────────────

#[test]
fn shipped_binary_swap_upgrade_applies_through_governance() {
    let dir = tempfile::tempdir().unwrap();
    let mut replica = open(dir.path(), old_binary(), ReplicaConfig::default()).unwrap();

    replica
        .apply_block(&schedule_block(1, V1_0_0_ONEX_TESTNET, 5))
        .unwrap();
    for h in 2..5 {
        replica.apply_block(&transfer_block(h)).unwrap();
    }
    let result = replica.apply_block(&transfer_block(5)).unwrap();
    assert!(matches!(result.outcome, BlockOutcome::Applied(_)));

    assert_eq!(get_version_map(replica.store()).unwrap(), vm(&[("bank", 1)]));
    assert_eq!(get_plan(replica.store()).unwrap(), None);
    assert_eq!(done_height(replica.store(), V1_0_0_ONEX_TESTNET).unwrap(), Some(5));
    assert!(read_upgrade_info(dir.path()).unwrap().is_none());
}

#[test]
fn missing_handler_halts_and_new_binary_resumes() {
    let dir = tempfile::tempdir().unwrap();

    // Old binary runs until the upgrade height and halts there.
    {
        let mut replica = open(dir.path(), old_binary(), ReplicaConfig::default()).unwrap();
        replica.apply_block(&schedule_block(1, "v2", 4)).unwrap();
        replica.apply_block(&transfer_block(2)).unwrap();
        replica.apply_block(&transfer_block(3)).unwrap();
        let before = replica.app_hash();

        let err = replica.apply_block(&transfer_block(4)).unwrap_err();
        assert!(matches!(
            err.halt(),
            Some(ConsensusHalt::MissingUpgradeHandler { plan_height: 4, .. })
        ));
        assert_eq!(replica.height(), 3);
        assert_eq!(replica.app_hash(), before);

        // Latched.
        assert!(replica.apply_block(&transfer_block(4)).is_err());
        assert!(replica.halted().is_some());
    }

    let info = read_upgrade_info(dir.path()).unwrap().expect("upgrade info written");
    assert_eq!(info.name, "v2");
    assert_eq!(info.height, 4);
    assert_eq!(info.info, "swap to the new binary");

    // Restarting the old binary halts again at the same block.
    {
        let mut replica = open(dir.path(), old_binary(), ReplicaConfig::default()).unwrap();
        assert_eq!(replica.height(), 3);
        assert!(replica.apply_block(&transfer_block(4)).is_err());
    }

    // The new binary replays the log and applies the upgrade.
    let mut replica = open(dir.path(), new_binary(), ReplicaConfig::default()).unwrap();
    assert_eq!(replica.height(), 3);
    let result = replica.apply_block(&transfer_block(4)).unwrap();
    let BlockOutcome::Applied(applied) = result.outcome else {
        panic!("expected v2 to apply at height 4");
    };
    assert_eq!(applied.to, vm(&[("bank", 2)]));
    assert_eq!(
        replica.store().get("bank", b"denom").unwrap(),
        Some(&b"uonex"[..])
    );
    assert!(replica.store().get("bank", b"acct0004").unwrap().is_some());
}

#[test]
fn skip_height_lets_old_binary_continue() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReplicaConfig::from_json_str(r#"{"skip_upgrade_heights":[4]}"#).unwrap();
    let mut replica = open(dir.path(), old_binary(), config).unwrap();

    replica.apply_block(&schedule_block(1, "v2", 4)).unwrap();
    for h in 2..=6 {
        replica.apply_block(&transfer_block(h)).unwrap();
    }
    assert_eq!(replica.height(), 6);
    assert_eq!(get_plan(replica.store()).unwrap(), None);
    assert!(read_upgrade_info(dir.path()).unwrap().is_none());
}

// ─────────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────────

#[test]
fn restart_restores_snapshot_and_replays_tail() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReplicaConfig {
        snapshot_interval: 2,
        ..ReplicaConfig::default()
    };

    let hash = {
        let mut replica = open(dir.path(), old_binary(), config.clone()).unwrap();
        for h in 1..=5 {
            replica.apply_block(&transfer_block(h)).unwrap();
        }
        replica.app_hash()
    };
    assert_eq!(snapshot_heights(&dir.path().join("snapshots")).unwrap(), vec![0, 2, 4]);

    let replica = open(dir.path(), old_binary(), config.clone()).unwrap();
    assert_eq!(replica.height(), 5);
    assert_eq!(replica.app_hash(), hash);

    // A damaged latest snapshot is skipped, not trusted.
    let latest = dir.path().join("snapshots").join("snapshot_000000000004.json");
    let damaged = fs::read_to_string(&latest).unwrap().replace("kernel_version\":1", "kernel_version\":9");
    fs::write(&latest, damaged).unwrap();
    let replica = open(dir.path(), old_binary(), config).unwrap();
    assert_eq!(replica.app_hash(), hash);
}

#[test]
fn corrupted_block_log_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut replica = open(dir.path(), old_binary(), ReplicaConfig::default()).unwrap();
        for h in 1..=3 {
            replica.apply_block(&transfer_block(h)).unwrap();
        }
    }
    let log = dir.path().join("blocks.log");
    let bytes = fs::read(&log).unwrap();
    fs::write(&log, &bytes[..bytes.len() - 3]).unwrap();

    let err = open(dir.path(), old_binary(), ReplicaConfig::default())
        .err()
        .expect("corrupt log must not open");
    assert!(matches!(err, ReplicaError::Io(ref e) if e.kind() == std::io::ErrorKind::InvalidData));
}

#[test]
fn failed_append_stops_replica_until_reopened() {
    let dir = tempfile::tempdir().unwrap();
    let mut replica = open(dir.path(), old_binary(), ReplicaConfig::default()).unwrap();

    // The log file is created on first append; a directory in its place makes that fail.
    let log = dir.path().join("blocks.log");
    fs::create_dir(&log).unwrap();

    let err = replica.apply_block(&transfer_block(1)).unwrap_err();
    assert!(matches!(err, ReplicaError::PersistFailed { height: 1, .. }));
    assert!(replica.persist_failure().is_some());

    // Neither the next block nor a retry of the lost one is accepted.
    let err = replica.apply_block(&transfer_block(2)).unwrap_err();
    assert!(matches!(err, ReplicaError::PersistFailed { .. }));
    let err = replica.apply_block(&transfer_block(1)).unwrap_err();
    assert!(matches!(err, ReplicaError::PersistFailed { .. }));
    assert!(replica.halted().is_none());
    drop(replica);

    fs::remove_dir(&log).unwrap();
    let mut replica = open(dir.path(), old_binary(), ReplicaConfig::default()).unwrap();
    assert_eq!(replica.height(), 0);
    replica.apply_block(&transfer_block(1)).unwrap();
    assert_eq!(replica.height(), 1);
}

#[test]
fn replay_full_matches_live_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut replica = open(dir.path(), new_binary(), ReplicaConfig::default()).unwrap();
    replica.apply_block(&schedule_block(1, "v2", 3)).unwrap();
    for h in 2..=6 {
        replica.apply_block(&transfer_block(h)).unwrap();
    }
    let live = replica.app_hash();
    let replayed = replica.replay_full(orchestrator(new_binary()).unwrap()).unwrap();
    assert_eq!(live, replayed);
    assert_eq!(replica.height(), 6);
}

// ─────────────────────────────────────────────────────────────
// Determinism
// ─────────────────────────────────────────────────────────────

fn upgrade_chain_blocks() -> Vec<Block> {
    let mut blocks = vec![schedule_block(1, "v2", 5)];
    blocks.extend((2..=8).map(transfer_block));
    blocks
}

#[test]
fn two_replicas_fed_same_blocks_agree() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let mut a = open(dir_a.path(), new_binary(), ReplicaConfig::default()).unwrap();
    let mut b = open(dir_b.path(), new_binary(), ReplicaConfig::default()).unwrap();

    for block in upgrade_chain_blocks() {
        let ha = a.apply_block(&block).unwrap().app_hash;
        let hb = b.apply_block(&block).unwrap().app_hash;
        assert_eq!(ha, hb, "replicas diverged at height {}", block.height);
    }
    assert!(compare_states(a.store(), b.store()).unwrap().is_identical());
}

#[test]
fn verify_determinism_over_an_upgrade() {
    let blocks = upgrade_chain_blocks();
    let hash = verify_determinism(|| orchestrator(new_binary()), &blocks).unwrap();
    let (_, replayed) = replay::rebuild_state(orchestrator(new_binary()).unwrap(), &blocks).unwrap();
    assert_eq!(hash, replayed);
}

#[test]
fn divergent_binaries_are_explained() {
    // One replica skips the upgrade height, the other applies it.
    let blocks = upgrade_chain_blocks();
    let applied = replay::replay_from_genesis(orchestrator(new_binary()).unwrap(), &blocks).unwrap();

    let (registry, modules) = new_binary();
    let skipping = UpgradeOrchestrator::new(
        registry,
        modules,
        upgrade_kernel::OrchestratorConfig {
            skip_upgrade_heights: [5].into_iter().collect(),
            ..Default::default()
        },
    )
    .unwrap();
    let skipped = replay::replay_from_genesis(skipping, &blocks).unwrap();

    let report = compare_states(skipped.store(), applied.store()).unwrap();
    assert!(!report.is_identical());
    assert_eq!(report.version_diff.upgraded.len(), 1);
    assert!(report.differing_partitions.contains(&"bank".to_string()));
    assert!(report.differing_partitions.contains(&"upgrade".to_string()));
}

// ─────────────────────────────────────────────────────────────
// Shared access
// ─────────────────────────────────────────────────────────────

#[test]
fn shared_replica_serialises_writers() {
    let dir = tempfile::tempdir().unwrap();
    let shared = Arc::new(SharedReplica::new(
        open(dir.path(), old_binary(), ReplicaConfig::default()).unwrap(),
    ));

    let writer = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || {
            for h in 1..=20 {
                shared.apply_block(&transfer_block(h)).unwrap();
            }
        })
    };
    let reader = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || {
            let mut last = 0;
            for _ in 0..50 {
                let h = shared.height();
                assert!(h >= last);
                last = h;
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();

    assert_eq!(shared.height(), 20);
    assert!(shared.halted().is_none());
}
