use std::io;

use thiserror::Error;

use upgrade_kernel::error::{ConfigurationError, ConsensusHalt};
use upgrade_kernel::store::StoreError;

use crate::config::ConfigError;
use crate::snapshot::SnapshotError;

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("consensus halt: {0}")]
    Halt(#[from] ConsensusHalt),
    #[error("block out of order: expected height {expected}, got {got}")]
    HeightOutOfOrder { expected: u64, got: u64 },
    #[error("replicas diverged at height {height}: {left} != {right}")]
    Divergence {
        height: u64,
        left: String,
        right: String,
    },
    #[error("block {height} executed but not persisted, reopen the replica: {reason}")]
    PersistFailed { height: u64, reason: String },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl ReplicaError {
    pub fn halt(&self) -> Option<&ConsensusHalt> {
        match self {
            ReplicaError::Halt(halt) => Some(halt),
            _ => None,
        }
    }
}
