//! Named upgrades shipped with this binary.
//!
//! Both testnet upgrades only swap the binary: no store upgrades, and the
//! version map is carried through unchanged.

use tracing::info;

use upgrade_kernel::context::Context;
use upgrade_kernel::error::{ConfigurationError, UpgradeError};
use upgrade_kernel::plan::Plan;
use upgrade_kernel::registry::UpgradeRegistry;
use upgrade_kernel::version_map::VersionMap;

pub const V1_0_0_ONEX_TESTNET: &str = "v1.0.0-onex-testnet";
pub const V1_0_1_ONEX_TESTNET: &str = "v1.0.1-onex-testnet";

pub const UPGRADE_NAMES: [&str; 2] = [V1_0_0_ONEX_TESTNET, V1_0_1_ONEX_TESTNET];

fn binary_swap(_: &mut Context, plan: &Plan, vm: VersionMap) -> Result<VersionMap, UpgradeError> {
    info!(name = %plan.name, modules = vm.len(), "binary swap upgrade, version map unchanged");
    Ok(vm)
}

pub fn register_upgrades(registry: &mut UpgradeRegistry) -> Result<(), ConfigurationError> {
    for name in UPGRADE_NAMES {
        registry.register(name, binary_swap, None)?;
    }
    Ok(())
}
