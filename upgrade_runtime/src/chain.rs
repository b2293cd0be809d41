//! In-memory block executor.
//!
//! Per block:
//!   1. strict height check (previous + 1)
//!   2. upgrade check (`begin_block`), a halt aborts the block
//!   3. each tx on its own branch of the block context; a failed tx is
//!      discarded and only its result is recorded
//!   4. commit: adopt the block's store, compute the app hash

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use upgrade_kernel::context::{Context, Event};
use upgrade_kernel::error::{ConsensusHalt, SchedulingError};
use upgrade_kernel::hashing::canonical_hash;
use upgrade_kernel::keeper::{cancel_plan, schedule_plan};
use upgrade_kernel::orchestrator::{BlockOutcome, UpgradeOrchestrator};
use upgrade_kernel::store::{StateStore, StoreError, UPGRADE_PARTITION};

use crate::block::{Block, Tx};
use crate::error::ReplicaError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    #[error("partition {0:?} is written only through governance")]
    ReservedPartition(String),
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxResult {
    pub index: usize,
    pub kind: &'static str,
    pub error: Option<String>,
}

impl TxResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct BlockResult {
    pub height: u64,
    pub outcome: BlockOutcome,
    pub tx_results: Vec<TxResult>,
    pub events: Vec<Event>,
    pub app_hash: String,
}

pub struct Chain {
    orchestrator: UpgradeOrchestrator,
    store: StateStore,
    height: u64,
}

impl Chain {
    /// Fresh chain at height 0 with the orchestrator's genesis state.
    pub fn genesis(orchestrator: UpgradeOrchestrator) -> Result<Self, ReplicaError> {
        let mut store = StateStore::new();
        orchestrator.init_genesis(&mut store)?;
        Ok(Self {
            orchestrator,
            store,
            height: 0,
        })
    }

    /// Resume from a committed store, typically a restored snapshot.
    pub fn from_state(orchestrator: UpgradeOrchestrator, store: StateStore, height: u64) -> Self {
        Self {
            orchestrator,
            store,
            height,
        }
    }

    pub fn check_startup(&mut self) -> Result<(), ConsensusHalt> {
        self.orchestrator.check_startup(&self.store, self.height)
    }

    pub fn execute_block(&mut self, block: &Block) -> Result<BlockResult, ReplicaError> {
        let expected = self.height + 1;
        if block.height != expected {
            return Err(ReplicaError::HeightOutOfOrder {
                expected,
                got: block.height,
            });
        }

        let mut ctx = Context::new(block.height, self.store.clone());
        let outcome = self.orchestrator.begin_block(&mut ctx)?;

        let mut tx_results = Vec::with_capacity(block.txs.len());
        for (index, tx) in block.txs.iter().enumerate() {
            let mut branch = ctx.branch();
            let error = match execute_tx(&mut branch, tx) {
                Ok(()) => {
                    ctx.merge(branch);
                    None
                }
                Err(e) => {
                    debug!(height = block.height, index, kind = tx.kind(), error = %e, "tx rejected");
                    Some(e.to_string())
                }
            };
            tx_results.push(TxResult {
                index,
                kind: tx.kind(),
                error,
            });
        }

        let (store, events) = ctx.into_parts();
        self.store = store;
        self.height = block.height;
        let app_hash = canonical_hash(&self.store);

        info!(
            height = block.height,
            txs = block.txs.len(),
            app_hash = %app_hash,
            "block committed"
        );
        Ok(BlockResult {
            height: block.height,
            outcome,
            tx_results,
            events,
            app_hash,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn app_hash(&self) -> String {
        canonical_hash(&self.store)
    }

    pub fn orchestrator(&self) -> &UpgradeOrchestrator {
        &self.orchestrator
    }
}

fn execute_tx(ctx: &mut Context, tx: &Tx) -> Result<(), TxError> {
    match tx {
        Tx::SchedulePlan(plan) => schedule_plan(ctx, plan.clone())?,
        Tx::CancelPlan => {
            cancel_plan(ctx)?;
        }
        Tx::Write {
            partition,
            key,
            value,
        } => {
            reject_reserved(partition)?;
            ctx.store_mut().set(partition, key.clone(), value.clone())?;
        }
        Tx::Delete { partition, key } => {
            reject_reserved(partition)?;
            ctx.store_mut().delete(partition, key)?;
        }
    }
    Ok(())
}

fn reject_reserved(partition: &str) -> Result<(), TxError> {
    if partition == UPGRADE_PARTITION {
        return Err(TxError::ReservedPartition(partition.to_string()));
    }
    Ok(())
}
