#![forbid(unsafe_code)]

//! Upgrade kernel: deterministic upgrade scheduling and execution.
//!
//! Pure state-machine code. No I/O, no clocks. Persistence, block
//! execution and replay live in `upgrade_runtime`.

/// Version of the canonical state layout. Stamped into every canonical
/// serialization and snapshot.
pub const KERNEL_VERSION: u32 = 1;

pub mod codec;
pub mod context;
pub mod error;
pub mod graph;
pub mod hashing;
pub mod invariants;
pub mod keeper;
pub mod module_manager;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod store;
pub mod version_map;

pub use context::{Context, Event};
pub use error::{ConfigurationError, ConsensusHalt, SchedulingError, UpgradeError, UpgradeStage};
pub use module_manager::{ModuleDescriptor, ModuleManager};
pub use orchestrator::{BlockOutcome, OrchestratorConfig, UpgradeOrchestrator};
pub use plan::Plan;
pub use registry::{UpgradeHandler, UpgradeRegistry};
pub use store::{StateStore, StoreUpgrades};
pub use version_map::VersionMap;
