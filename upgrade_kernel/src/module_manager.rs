//! Module manager.
//!
//! Knows every module of the application, its genesis and current consensus
//! versions, and the migrations that take its state from one version to the
//! next. Given the version map before and after an upgrade it runs every
//! missing migration step, module by module, in a fixed order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::context::{Context, Event};
use crate::error::{ConfigurationError, UpgradeError};
use crate::graph::{migration_order, DependencyGraph};
use crate::version_map::{diff, VersionMap, VersionMapError};

/// Migrates one module's state from version `n` to `n + 1`.
pub type MigrationFn = Arc<dyn Fn(&mut Context) -> Result<(), UpgradeError> + Send + Sync>;

/// Initializes a module that did not exist before the upgrade.
pub type InitFn = Arc<dyn Fn(&mut Context) -> Result<(), UpgradeError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
    #[error(transparent)]
    VersionMap(#[from] VersionMapError),
    #[error("module {module:?} version {version} is ahead of its consensus version {consensus}")]
    VersionAhead {
        module: String,
        version: u64,
        consensus: u64,
    },
    #[error("module {module:?} has no migration registered from version {from}")]
    MissingMigration { module: String, from: u64 },
    #[error("module {module:?} migration from version {from} failed: {source}")]
    Failed {
        module: String,
        from: u64,
        source: UpgradeError,
    },
    #[error("module {module:?} initialization failed: {source}")]
    InitFailed { module: String, source: UpgradeError },
    #[error(transparent)]
    Order(#[from] ConfigurationError),
}

// ---------------------------------------------------------------------------
// Module descriptors
// ---------------------------------------------------------------------------

pub struct ModuleDescriptor {
    name: String,
    consensus_version: u64,
    genesis_version: Option<u64>,
    depends_on: BTreeSet<String>,
    migrations: Vec<(u64, MigrationFn)>,
    init: Option<InitFn>,
}

impl ModuleDescriptor {
    /// A module present at genesis at its current consensus version.
    pub fn new(name: impl Into<String>, consensus_version: u64) -> Self {
        Self {
            name: name.into(),
            consensus_version,
            genesis_version: Some(consensus_version),
            depends_on: BTreeSet::new(),
            migrations: Vec::new(),
            init: None,
        }
    }

    pub fn genesis_version(mut self, version: u64) -> Self {
        self.genesis_version = Some(version);
        self
    }

    /// The module is absent from the genesis version map and only comes to
    /// exist through an upgrade.
    pub fn added_by_upgrade(mut self) -> Self {
        self.genesis_version = None;
        self
    }

    pub fn depends_on(mut self, module: impl Into<String>) -> Self {
        self.depends_on.insert(module.into());
        self
    }

    pub fn migration<F>(mut self, from: u64, f: F) -> Self
    where
        F: Fn(&mut Context) -> Result<(), UpgradeError> + Send + Sync + 'static,
    {
        self.migrations.push((from, Arc::new(f)));
        self
    }

    pub fn on_init<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Context) -> Result<(), UpgradeError> + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consensus_version(&self) -> u64 {
        self.consensus_version
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("consensus_version", &self.consensus_version)
            .field("genesis_version", &self.genesis_version)
            .field("depends_on", &self.depends_on)
            .field(
                "migrations",
                &self.migrations.iter().map(|(v, _)| *v).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

struct RegisteredModule {
    consensus_version: u64,
    genesis_version: Option<u64>,
    depends_on: BTreeSet<String>,
    migrations: BTreeMap<u64, MigrationFn>,
    init: Option<InitFn>,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStep {
    pub module: String,
    pub from: u64,
    pub to: u64,
}

/// What `run_migrations` did, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub steps: Vec<MigrationStep>,
    pub initialized: Vec<String>,
}

// ---------------------------------------------------------------------------
// ModuleManager
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ModuleManager {
    modules: BTreeMap<String, RegisteredModule>,
    explicit_order: Option<Vec<String>>,
}

impl fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleManager")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("explicit_order", &self.explicit_order)
            .finish()
    }
}

impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_module(&mut self, module: ModuleDescriptor) -> Result<(), ConfigurationError> {
        let ModuleDescriptor {
            name,
            consensus_version,
            genesis_version,
            depends_on,
            migrations,
            init,
        } = module;

        if name.is_empty() {
            return Err(ConfigurationError::EmptyModuleName);
        }
        if self.modules.contains_key(&name) {
            return Err(ConfigurationError::DuplicateModule(name));
        }
        if let Some(genesis) = genesis_version {
            if genesis > consensus_version {
                return Err(ConfigurationError::InvalidModule {
                    module: name,
                    reason: format!(
                        "genesis version {} exceeds consensus version {}",
                        genesis, consensus_version
                    ),
                });
            }
        }

        let mut by_version: BTreeMap<u64, MigrationFn> = BTreeMap::new();
        for (from, f) in migrations {
            if from >= consensus_version {
                return Err(ConfigurationError::InvalidModule {
                    module: name,
                    reason: format!(
                        "migration from version {} must start below consensus version {}",
                        from, consensus_version
                    ),
                });
            }
            if by_version.insert(from, f).is_some() {
                return Err(ConfigurationError::InvalidModule {
                    module: name,
                    reason: format!("migration from version {} registered twice", from),
                });
            }
        }

        self.modules.insert(
            name,
            RegisteredModule {
                consensus_version,
                genesis_version,
                depends_on,
                migrations: by_version,
                init,
            },
        );
        Ok(())
    }

    /// Pin the migration order. Must name every registered module exactly once.
    pub fn set_order_migrations<I, S>(&mut self, order: I) -> Result<(), ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let order: Vec<String> = order.into_iter().map(Into::into).collect();
        let mut seen = BTreeSet::new();
        for module in &order {
            if !self.modules.contains_key(module) {
                return Err(ConfigurationError::UnknownModule(module.clone()));
            }
            if !seen.insert(module.as_str()) {
                return Err(ConfigurationError::InvalidMigrationOrder(format!(
                    "module {:?} listed twice",
                    module
                )));
            }
        }
        if let Some(missing) = self.modules.keys().find(|m| !seen.contains(m.as_str())) {
            return Err(ConfigurationError::InvalidMigrationOrder(format!(
                "module {:?} missing from migration order",
                missing
            )));
        }
        self.explicit_order = Some(order);
        Ok(())
    }

    /// The explicit order if one was set, otherwise dependencies first with
    /// lexicographic tie-breaking.
    pub fn migration_order(&self) -> Result<Vec<String>, ConfigurationError> {
        if let Some(order) = &self.explicit_order {
            return Ok(order.clone());
        }
        let graph: DependencyGraph = self
            .modules
            .iter()
            .map(|(name, m)| (name.clone(), m.depends_on.clone()))
            .collect();
        migration_order(&graph)
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn consensus_version(&self, module: &str) -> Option<u64> {
        self.modules.get(module).map(|m| m.consensus_version)
    }

    /// Version map written at genesis.
    pub fn genesis_version_map(&self) -> VersionMap {
        self.modules
            .iter()
            .filter_map(|(name, m)| m.genesis_version.map(|v| (name.as_str(), v)))
            .collect()
    }

    /// Version map this binary's code paths implement.
    pub fn consensus_version_map(&self) -> VersionMap {
        self.modules
            .iter()
            .map(|(name, m)| (name.as_str(), m.consensus_version))
            .collect()
    }

    /// Bring every module from its version in `from` to its version in `to`.
    ///
    /// `to` must cover exactly the registered modules, may not regress any
    /// module and may not go past a module's consensus version. Modules
    /// missing from `from` are initialized instead of migrated.
    pub fn run_migrations(
        &self,
        ctx: &mut Context,
        from: &VersionMap,
        to: &VersionMap,
    ) -> Result<MigrationReport, MigrationError> {
        to.validate_against(self.module_names())?;
        diff(from, to).check_monotonic()?;

        for (module, version) in to.iter() {
            let consensus = self.consensus_version(module).unwrap_or_default();
            if version > consensus {
                return Err(MigrationError::VersionAhead {
                    module: module.to_string(),
                    version,
                    consensus,
                });
            }
        }

        let order = self.migration_order()?;

        let mut report = MigrationReport::default();
        for name in &order {
            let Some(module) = self.modules.get(name) else {
                continue;
            };
            let target = to.get(name).unwrap_or_default();

            match from.get(name) {
                None => {
                    if let Some(init) = &module.init {
                        init(ctx).map_err(|source| MigrationError::InitFailed {
                            module: name.clone(),
                            source,
                        })?;
                    }
                    debug!(module = %name, version = target, "module initialized");
                    ctx.emit(
                        Event::new("module_initialized")
                            .attr("module", name)
                            .attr("version", target),
                    );
                    report.initialized.push(name.clone());
                }
                Some(current) => {
                    for step in current..target {
                        let migrate = module.migrations.get(&step).ok_or_else(|| {
                            MigrationError::MissingMigration {
                                module: name.clone(),
                                from: step,
                            }
                        })?;
                        migrate(ctx).map_err(|source| MigrationError::Failed {
                            module: name.clone(),
                            from: step,
                            source,
                        })?;
                        debug!(module = %name, from = step, to = step + 1, "module migrated");
                        ctx.emit(
                            Event::new("module_migrated")
                                .attr("module", name)
                                .attr("from", step)
                                .attr("to", step + 1),
                        );
                        report.steps.push(MigrationStep {
                            module: name.clone(),
                            from: step,
                            to: step + 1,
                        });
                    }
                }
            }
        }

        info!(
            steps = report.steps.len(),
            initialized = report.initialized.len(),
            "module migrations complete"
        );
        Ok(report)
    }
}
