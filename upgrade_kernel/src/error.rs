//! Error taxonomy.
//!
//! Three classes, with different propagation rules:
//!   - `ConfigurationError`: wiring mistakes, caught at startup, fatal.
//!   - `SchedulingError`: returned to the governance caller, never affects
//!     consensus.
//!   - `ConsensusHalt`: block processing must stop on this replica. Never
//!     retried automatically.
//!
//! `UpgradeError` is what upgrade handlers and module migrations return.

use std::fmt;

use thiserror::Error;

use crate::codec::CodecError;
use crate::store::StoreError;
use crate::version_map::VersionMapError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("upgrade name must not be empty")]
    EmptyUpgradeName,
    #[error("upgrade handler {0:?} is already registered")]
    DuplicateUpgradeName(String),
    #[error("upgrade registry is frozen, cannot register {0:?} after block processing started")]
    RegistryFrozen(String),
    #[error("invalid store upgrades for {name:?}: {source}")]
    InvalidStoreUpgrades { name: String, source: StoreError },
    #[error("module name must not be empty")]
    EmptyModuleName,
    #[error("module {0:?} is registered twice")]
    DuplicateModule(String),
    #[error("unknown module {0:?}")]
    UnknownModule(String),
    #[error("module {module:?}: {reason}")]
    InvalidModule { module: String, reason: String },
    #[error("invalid migration order: {0}")]
    InvalidMigrationOrder(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    #[error("plan name must not be empty")]
    EmptyPlanName,
    #[error("plan height {height} must be greater than current height {current}")]
    InvalidHeight { height: u64, current: u64 },
    #[error("upgrade plan {0:?} is already pending")]
    PlanAlreadyPending(String),
    #[error("no upgrade plan is pending")]
    NoPlanPending,
    #[error("upgrade {name:?} was already applied at height {height}")]
    PlanAlreadyApplied { name: String, height: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Step of an upgrade that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStage {
    StoreUpgrades,
    Handler,
    Migrations,
    Persist,
}

impl fmt::Display for UpgradeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpgradeStage::StoreUpgrades => "store upgrades",
            UpgradeStage::Handler => "handler",
            UpgradeStage::Migrations => "module migrations",
            UpgradeStage::Persist => "persist",
        };
        f.write_str(s)
    }
}

/// Fatal result of the per-block upgrade check. The block loop must stop
/// and must not commit the current block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusHalt {
    #[error(
        "UPGRADE {name:?} NEEDED at height {plan_height}: no handler registered in this binary \
         (current height {current_height})"
    )]
    MissingUpgradeHandler {
        name: String,
        plan_height: u64,
        current_height: u64,
    },
    #[error("upgrade {name:?} failed at height {height} during {stage}: {reason}")]
    UpgradeHandlerFailed {
        name: String,
        height: u64,
        stage: UpgradeStage,
        reason: String,
    },
    #[error("upgrade state is corrupt at height {height}: {reason}")]
    CorruptUpgradeState { height: u64, reason: String },
}

/// Error returned by upgrade handlers and module migrations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct UpgradeError(String);

impl UpgradeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<StoreError> for UpgradeError {
    fn from(err: StoreError) -> Self {
        Self(err.to_string())
    }
}

impl From<CodecError> for UpgradeError {
    fn from(err: CodecError) -> Self {
        Self(err.to_string())
    }
}

impl From<VersionMapError> for UpgradeError {
    fn from(err: VersionMapError) -> Self {
        Self(err.to_string())
    }
}
