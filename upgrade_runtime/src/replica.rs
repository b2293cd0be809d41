//! Persistent replica: a chain plus its block log and snapshots.
//!
//! Directory layout:
//!   <data_dir>/blocks.log
//!   <data_dir>/snapshots/snapshot_<height>.json
//!   <data_dir>/upgrade-info.json   (only after an upgrade halt)
//!
//! Apply-before-persist order:
//!   1. chain.execute_block(block)  (may halt, nothing is persisted then)
//!   2. block_log.append(block)     (only if step 1 succeeded)
//!   3. snapshot if the interval is reached
//!
//! The first halt is latched; the replica refuses every later block. A
//! failed append or snapshot latches too: memory is then ahead of disk and
//! the replica must be reopened from what was persisted.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{error, info, warn};

use upgrade_kernel::error::ConsensusHalt;
use upgrade_kernel::keeper::get_plan;
use upgrade_kernel::module_manager::ModuleManager;
use upgrade_kernel::orchestrator::UpgradeOrchestrator;
use upgrade_kernel::registry::UpgradeRegistry;
use upgrade_kernel::store::StateStore;

use crate::block::Block;
use crate::block_log::BlockLog;
use crate::chain::{BlockResult, Chain};
use crate::config::ReplicaConfig;
use crate::error::ReplicaError;
use crate::replay;
use crate::snapshot::{load_snapshot, restore_snapshot, save_snapshot, snapshot_heights};
use crate::upgrade_info::{write_upgrade_info, UpgradeInfo};

pub struct Replica {
    data_dir: PathBuf,
    config: ReplicaConfig,
    chain: Chain,
    block_log: BlockLog,
    halted: Option<ConsensusHalt>,
    persist_failure: Option<String>,
}

impl Replica {
    /// Open or create a replica.
    ///
    /// Restores the latest valid snapshot not ahead of the block log (or
    /// starts from genesis), replays the remaining blocks, then runs the
    /// orchestrator's startup check. A halt during any of this writes
    /// `upgrade-info.json` when applicable and is returned as an error.
    pub fn open(
        data_dir: &Path,
        config: ReplicaConfig,
        registry: UpgradeRegistry,
        modules: ModuleManager,
    ) -> Result<Self, ReplicaError> {
        config.validate()?;
        let block_log = BlockLog::open(&data_dir.join("blocks.log"))?;
        let orchestrator =
            UpgradeOrchestrator::new(registry, modules, config.orchestrator_config())?;
        let snap_dir = data_dir.join("snapshots");

        let chain = match latest_valid_snapshot(&snap_dir, block_log.last_height())? {
            Some((height, store)) => {
                info!(height, "restored snapshot");
                Chain::from_state(orchestrator, store, height)
            }
            None => {
                let chain = Chain::genesis(orchestrator)?;
                save_snapshot(&snap_dir, 0, chain.store())?;
                info!(chain_id = %config.chain_id, "initialized genesis state");
                chain
            }
        };

        let mut replica = Self {
            data_dir: data_dir.to_path_buf(),
            config,
            chain,
            block_log,
            halted: None,
            persist_failure: None,
        };

        let pending = replica.block_log.load_after(replica.chain.height())?;
        if !pending.is_empty() {
            info!(
                from = replica.chain.height() + 1,
                to = replica.block_log.last_height(),
                "replaying block log"
            );
        }
        for block in &pending {
            replica.execute(block)?;
        }

        if let Err(halt) = replica.chain.check_startup() {
            return Err(replica.on_halt(halt));
        }

        info!(
            height = replica.chain.height(),
            app_hash = %replica.chain.app_hash(),
            "replica ready"
        );
        Ok(replica)
    }

    pub fn apply_block(&mut self, block: &Block) -> Result<BlockResult, ReplicaError> {
        if let Some(reason) = &self.persist_failure {
            return Err(ReplicaError::PersistFailed {
                height: self.chain.height(),
                reason: reason.clone(),
            });
        }
        let result = self.execute(block)?;
        if let Err(e) = self.persist(block) {
            error!(height = block.height, error = %e, "block not persisted, replica stopped");
            let reason = e.to_string();
            self.persist_failure = Some(reason.clone());
            return Err(ReplicaError::PersistFailed {
                height: block.height,
                reason,
            });
        }
        Ok(result)
    }

    fn persist(&mut self, block: &Block) -> Result<(), ReplicaError> {
        self.block_log.append(block)?;
        let interval = self.config.snapshot_interval;
        if interval > 0 && block.height % interval == 0 {
            save_snapshot(&self.snapshot_dir(), block.height, self.chain.store())?;
        }
        Ok(())
    }

    /// Throw away in-memory state and rebuild it from genesis and the block
    /// log, on a fresh orchestrator. Returns the app hash.
    pub fn replay_full(&mut self, orchestrator: UpgradeOrchestrator) -> Result<String, ReplicaError> {
        let blocks = self.block_log.load_all()?;
        self.chain = replay::replay_from_genesis(orchestrator, &blocks)?;
        Ok(self.chain.app_hash())
    }

    fn execute(&mut self, block: &Block) -> Result<BlockResult, ReplicaError> {
        if let Some(halt) = &self.halted {
            return Err(ReplicaError::Halt(halt.clone()));
        }
        match self.chain.execute_block(block) {
            Err(ReplicaError::Halt(halt)) => Err(self.on_halt(halt)),
            other => other,
        }
    }

    fn on_halt(&mut self, halt: ConsensusHalt) -> ReplicaError {
        error!(height = self.chain.height(), %halt, "replica halted");
        if let ConsensusHalt::MissingUpgradeHandler { .. } = &halt {
            match get_plan(self.chain.store()) {
                Ok(Some(plan)) => match write_upgrade_info(&self.data_dir, &UpgradeInfo::from(&plan)) {
                    Ok(path) => info!(path = %path.display(), "wrote upgrade info"),
                    Err(e) => error!(error = %e, "failed to write upgrade info"),
                },
                Ok(None) => {}
                Err(e) => error!(error = %e, "cannot read plan for upgrade info"),
            }
        }
        self.halted = Some(halt.clone());
        ReplicaError::Halt(halt)
    }

    pub fn halted(&self) -> Option<&ConsensusHalt> {
        self.halted.as_ref()
    }

    pub fn persist_failure(&self) -> Option<&str> {
        self.persist_failure.as_deref()
    }

    pub fn height(&self) -> u64 {
        self.chain.height()
    }

    pub fn app_hash(&self) -> String {
        self.chain.app_hash()
    }

    pub fn store(&self) -> &StateStore {
        self.chain.store()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }
}

/// Highest snapshot at or below `max_height` that restores cleanly.
fn latest_valid_snapshot(
    dir: &Path,
    max_height: u64,
) -> Result<Option<(u64, StateStore)>, ReplicaError> {
    for height in snapshot_heights(dir)?.into_iter().rev() {
        if height > max_height {
            warn!(height, max_height, "snapshot ahead of block log, ignoring");
            continue;
        }
        let restored = load_snapshot(dir, height).and_then(|snap| match snap {
            Some(snap) => restore_snapshot(&snap).map(Some),
            None => Ok(None),
        });
        match restored {
            Ok(Some(store)) => return Ok(Some((height, store))),
            Ok(None) => {}
            Err(e) => warn!(height, error = %e, "skipping unusable snapshot"),
        }
    }
    Ok(None)
}

/// Thread-safe replica handle.
pub struct SharedReplica {
    inner: Mutex<Replica>,
}

impl SharedReplica {
    pub fn new(replica: Replica) -> Self {
        Self {
            inner: Mutex::new(replica),
        }
    }

    pub fn apply_block(&self, block: &Block) -> Result<BlockResult, ReplicaError> {
        let mut replica = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        replica.apply_block(block)
    }

    pub fn app_hash(&self) -> String {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).app_hash()
    }

    pub fn height(&self) -> u64 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).height()
    }

    pub fn halted(&self) -> Option<ConsensusHalt> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .halted()
            .cloned()
    }
}
