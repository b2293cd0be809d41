//! Rebuild chain state from blocks.
//!
//! All upgrade and module logic is delegated to the kernel. No shortcuts,
//! no cached state.

use upgrade_kernel::orchestrator::UpgradeOrchestrator;
use upgrade_kernel::store::StateStore;

use crate::block::Block;
use crate::chain::Chain;
use crate::error::ReplicaError;

/// Genesis, then every block in order. Returns the resulting chain.
pub fn replay_from_genesis(
    orchestrator: UpgradeOrchestrator,
    blocks: &[Block],
) -> Result<Chain, ReplicaError> {
    let chain = Chain::genesis(orchestrator)?;
    replay_onto(chain, blocks)
}

/// Continue `chain` with the blocks above its height.
pub fn replay_onto(mut chain: Chain, blocks: &[Block]) -> Result<Chain, ReplicaError> {
    let start = chain.height();
    for block in blocks.iter().filter(|b| b.height > start) {
        chain.execute_block(block)?;
    }
    Ok(chain)
}

/// Replay from genesis, returning the final store and app hash.
pub fn rebuild_state(
    orchestrator: UpgradeOrchestrator,
    blocks: &[Block],
) -> Result<(StateStore, String), ReplicaError> {
    let chain = replay_from_genesis(orchestrator, blocks)?;
    let hash = chain.app_hash();
    Ok((chain.store().clone(), hash))
}
