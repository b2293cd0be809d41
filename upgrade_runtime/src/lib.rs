#![forbid(unsafe_code)]

//! Upgrade runtime.
//!
//! Wraps the upgrade kernel with block execution, persistence, snapshots,
//! replay and divergence checks. Upgrade scheduling and execution are
//! delegated to the kernel.

pub mod block;
pub mod block_log;
pub mod chain;
pub mod config;
pub mod divergence;
pub mod error;
pub mod replay;
pub mod replica;
pub mod snapshot;
pub mod upgrade_info;
pub mod upgrades;

pub use error::ReplicaError;
