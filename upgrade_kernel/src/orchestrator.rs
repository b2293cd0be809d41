//! Upgrade orchestrator.
//!
//! Runs at the start of every block, before any module logic:
//!   1. No plan pending            -> proceed
//!   2. Plan in the future         -> proceed (warn inside the warning window)
//!   3. Plan due at this height    -> skip height? lookup handler, apply store
//!                                    upgrades, run handler, run migrations,
//!                                    persist version map, clear plan
//!   4. Plan in the past           -> halt (the upgrade was skipped)
//!
//! Steps of case 3 run on a branch of the block context and are merged back
//! only if every step succeeded, so a halt never leaves partial writes.
//! The first halt is latched: every later call returns it again.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::context::{Context, Event};
use crate::error::{ConfigurationError, ConsensusHalt, SchedulingError, UpgradeStage};
use crate::invariants::try_validate_upgrade_state;
use crate::keeper;
use crate::module_manager::{MigrationReport, ModuleManager};
use crate::plan::{Plan, PlanPhase};
use crate::registry::{Registration, UpgradeHandler, UpgradeRegistry};
use crate::store::{StateStore, StoreError, StoreUpgrades, UPGRADE_PARTITION};
use crate::version_map::{diff, VersionDiff, VersionMap};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Start logging about a pending plan this many blocks before it is due.
    /// Zero disables the warning.
    pub warning_window: u64,
    /// Heights at which a due plan is dropped instead of applied.
    pub skip_upgrade_heights: BTreeSet<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedUpgrade {
    pub plan: Plan,
    pub from: VersionMap,
    pub to: VersionMap,
    pub diff: VersionDiff,
    pub migrations: MigrationReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    NoPlan,
    Pending { plan: Plan, blocks_remaining: u64 },
    Applied(AppliedUpgrade),
    Skipped(Plan),
}

pub struct UpgradeOrchestrator {
    registry: UpgradeRegistry,
    modules: ModuleManager,
    config: OrchestratorConfig,
    halted: Option<ConsensusHalt>,
    warned_for: Option<String>,
}

impl UpgradeOrchestrator {
    /// Wire the orchestrator. The module manager's migration order is
    /// resolved here so configuration mistakes surface before any block.
    pub fn new(
        registry: UpgradeRegistry,
        modules: ModuleManager,
        config: OrchestratorConfig,
    ) -> Result<Self, ConfigurationError> {
        modules.migration_order()?;
        Ok(Self {
            registry,
            modules,
            config,
            halted: None,
            warned_for: None,
        })
    }

    /// Register another handler. Only possible until the first block.
    pub fn register_upgrade_handler<H>(
        &mut self,
        name: impl Into<String>,
        handler: H,
        store_upgrades: Option<StoreUpgrades>,
    ) -> Result<(), ConfigurationError>
    where
        H: UpgradeHandler + 'static,
    {
        self.registry.register(name, handler, store_upgrades)
    }

    pub fn registry(&self) -> &UpgradeRegistry {
        &self.registry
    }

    pub fn modules(&self) -> &ModuleManager {
        &self.modules
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn halted(&self) -> Option<&ConsensusHalt> {
        self.halted.as_ref()
    }

    /// Mount the upgrade partition plus one partition per genesis module and
    /// record the genesis version map.
    pub fn init_genesis(&self, store: &mut StateStore) -> Result<VersionMap, StoreError> {
        let genesis = self.modules.genesis_version_map();
        keeper::init_genesis(store, &genesis)?;
        for module in genesis.modules() {
            if !store.has_partition(module) {
                store.mount(module)?;
            }
        }
        info!(modules = genesis.len(), "genesis version map recorded");
        Ok(genesis)
    }

    /// Startup gate, run once on the last committed state before the next
    /// block. A pending plan whose height has already been committed was
    /// never applied: this binary must not continue.
    pub fn check_startup(
        &mut self,
        store: &StateStore,
        last_committed_height: u64,
    ) -> Result<(), ConsensusHalt> {
        self.registry.freeze();
        if let Some(halt) = &self.halted {
            return Err(halt.clone());
        }

        let next_height = last_committed_height + 1;
        let plan = match keeper::get_plan(store) {
            Ok(plan) => plan,
            Err(e) => return Err(self.halt(corrupt(next_height, e))),
        };
        let Some(plan) = plan else {
            return Ok(());
        };

        if plan.height <= last_committed_height {
            return Err(self.halt(ConsensusHalt::MissingUpgradeHandler {
                name: plan.name,
                plan_height: plan.height,
                current_height: next_height,
            }));
        }
        if plan.height == next_height && !self.registry.has_handler(&plan.name) {
            warn!(
                name = %plan.name,
                height = plan.height,
                "upgrade is due at the next block and this binary has no handler for it"
            );
        }
        Ok(())
    }

    /// Per-block upgrade check. Must run before any module logic of the
    /// block. An `Err` means the block must not be committed.
    pub fn begin_block(&mut self, ctx: &mut Context) -> Result<BlockOutcome, ConsensusHalt> {
        self.registry.freeze();
        if let Some(halt) = &self.halted {
            return Err(halt.clone());
        }

        let height = ctx.height();
        let plan = match keeper::get_plan(ctx.store()) {
            Ok(plan) => plan,
            Err(e) => return Err(self.halt(corrupt(height, e))),
        };
        let Some(plan) = plan else {
            return Ok(BlockOutcome::NoPlan);
        };

        match plan.phase(height) {
            PlanPhase::Future { blocks_remaining } => {
                self.maybe_warn(&plan, blocks_remaining);
                Ok(BlockOutcome::Pending {
                    plan,
                    blocks_remaining,
                })
            }
            PlanPhase::Overdue { .. } => Err(self.halt(ConsensusHalt::MissingUpgradeHandler {
                name: plan.name,
                plan_height: plan.height,
                current_height: height,
            })),
            PlanPhase::Due => {
                if self.config.skip_upgrade_heights.contains(&height) {
                    return self.skip(ctx, plan);
                }
                let Some(registration) = self.registry.lookup(&plan.name).cloned() else {
                    return Err(self.halt(ConsensusHalt::MissingUpgradeHandler {
                        name: plan.name,
                        plan_height: plan.height,
                        current_height: height,
                    }));
                };
                match self.apply(ctx, &plan, &registration) {
                    Ok(applied) => Ok(BlockOutcome::Applied(applied)),
                    Err(halt) => Err(self.halt(halt)),
                }
            }
        }
    }

    fn apply(
        &self,
        ctx: &mut Context,
        plan: &Plan,
        registration: &Registration,
    ) -> Result<AppliedUpgrade, ConsensusHalt> {
        let height = ctx.height();
        let failed = |stage: UpgradeStage, reason: String| ConsensusHalt::UpgradeHandlerFailed {
            name: plan.name.clone(),
            height,
            stage,
            reason,
        };

        info!(name = %plan.name, height, "applying upgrade");
        let mut branch = ctx.branch();

        let from = keeper::get_version_map(branch.store()).map_err(|e| corrupt(height, e))?;

        if let Some(upgrades) = &registration.store_upgrades {
            branch
                .store_mut()
                .apply_store_upgrades(upgrades)
                .map_err(|e| failed(UpgradeStage::StoreUpgrades, e.to_string()))?;
            info!(
                added = upgrades.added.len(),
                renamed = upgrades.renamed.len(),
                deleted = upgrades.deleted.len(),
                "store upgrades applied"
            );
        }

        let to = registration
            .handler
            .upgrade(&mut branch, plan, from.clone())
            .map_err(|e| failed(UpgradeStage::Handler, e.to_string()))?;

        let migrations = self
            .modules
            .run_migrations(&mut branch, &from, &to)
            .map_err(|e| failed(UpgradeStage::Migrations, e.to_string()))?;

        let store = branch.store_mut();
        keeper::set_version_map(store, &to)
            .and_then(|_| keeper::clear_plan(store))
            .and_then(|_| keeper::mark_done(store, &plan.name, height))
            .map_err(|e| failed(UpgradeStage::Persist, e.to_string()))?;
        try_validate_upgrade_state(branch.store())
            .map_err(|reason| failed(UpgradeStage::Persist, reason))?;

        let version_diff = diff(&from, &to);
        branch.emit(
            Event::new("upgrade_applied")
                .attr("name", &plan.name)
                .attr("height", height)
                .attr("upgraded_modules", version_diff.upgraded.len())
                .attr("added_modules", version_diff.added.len()),
        );
        ctx.merge(branch);

        info!(
            name = %plan.name,
            height,
            upgraded = version_diff.upgraded.len(),
            added = version_diff.added.len(),
            "upgrade applied"
        );
        Ok(AppliedUpgrade {
            plan: plan.clone(),
            from,
            to,
            diff: version_diff,
            migrations,
        })
    }

    fn skip(&mut self, ctx: &mut Context, plan: Plan) -> Result<BlockOutcome, ConsensusHalt> {
        let height = ctx.height();
        if let Err(e) = keeper::clear_plan(ctx.store_mut()) {
            return Err(self.halt(corrupt(height, e.into())));
        }
        warn!(name = %plan.name, height, "skipping upgrade at operator-configured skip height");
        ctx.emit(
            Event::new("upgrade_skipped")
                .attr("name", &plan.name)
                .attr("height", height),
        );
        Ok(BlockOutcome::Skipped(plan))
    }

    fn maybe_warn(&mut self, plan: &Plan, blocks_remaining: u64) {
        if self.config.warning_window == 0 || blocks_remaining > self.config.warning_window {
            return;
        }
        if self.warned_for.as_deref() == Some(plan.name.as_str()) {
            return;
        }
        if self.registry.has_handler(&plan.name) {
            info!(
                name = %plan.name,
                height = plan.height,
                blocks_remaining,
                "upgrade approaching, handler registered"
            );
        } else {
            warn!(
                name = %plan.name,
                height = plan.height,
                blocks_remaining,
                "upgrade approaching and this binary has no handler for it, \
                 replace the binary before the upgrade height"
            );
        }
        self.warned_for = Some(plan.name.clone());
    }

    fn halt(&mut self, halt: ConsensusHalt) -> ConsensusHalt {
        error!(%halt, "consensus halt");
        self.halted = Some(halt.clone());
        halt
    }
}

fn corrupt(height: u64, err: SchedulingError) -> ConsensusHalt {
    ConsensusHalt::CorruptUpgradeState {
        height,
        reason: format!("{} (partition {:?})", err, UPGRADE_PARTITION),
    }
}
