//! Upgrade registry: upgrade name -> handler (+ optional store upgrades).
//!
//! Populated once while the application is wired together, frozen as soon
//! as block processing starts. Never persisted.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{ConfigurationError, UpgradeError};
use crate::plan::Plan;
use crate::store::StoreUpgrades;
use crate::version_map::VersionMap;

/// A named upgrade. Receives the version map recorded before the upgrade
/// and returns the version map the application runs with afterwards.
///
/// Must be deterministic: no wall clock, no randomness, no I/O outside the
/// context's state.
pub trait UpgradeHandler: Send + Sync {
    fn upgrade(
        &self,
        ctx: &mut Context,
        plan: &Plan,
        from: VersionMap,
    ) -> Result<VersionMap, UpgradeError>;
}

impl<F> UpgradeHandler for F
where
    F: Fn(&mut Context, &Plan, VersionMap) -> Result<VersionMap, UpgradeError> + Send + Sync,
{
    fn upgrade(
        &self,
        ctx: &mut Context,
        plan: &Plan,
        from: VersionMap,
    ) -> Result<VersionMap, UpgradeError> {
        self(ctx, plan, from)
    }
}

#[derive(Clone)]
pub struct Registration {
    pub handler: Arc<dyn UpgradeHandler>,
    pub store_upgrades: Option<StoreUpgrades>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("store_upgrades", &self.store_upgrades)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct UpgradeRegistry {
    entries: BTreeMap<String, Registration>,
    frozen: bool,
}

impl UpgradeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(
        &mut self,
        name: impl Into<String>,
        handler: H,
        store_upgrades: Option<StoreUpgrades>,
    ) -> Result<(), ConfigurationError>
    where
        H: UpgradeHandler + 'static,
    {
        self.register_arc(name, Arc::new(handler), store_upgrades)
    }

    pub fn register_arc(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn UpgradeHandler>,
        store_upgrades: Option<StoreUpgrades>,
    ) -> Result<(), ConfigurationError> {
        let name = name.into();
        if self.frozen {
            return Err(ConfigurationError::RegistryFrozen(name));
        }
        if name.is_empty() {
            return Err(ConfigurationError::EmptyUpgradeName);
        }
        if self.entries.contains_key(&name) {
            return Err(ConfigurationError::DuplicateUpgradeName(name));
        }
        if let Some(upgrades) = &store_upgrades {
            upgrades
                .validate()
                .map_err(|source| ConfigurationError::InvalidStoreUpgrades {
                    name: name.clone(),
                    source,
                })?;
        }

        self.entries.insert(
            name,
            Registration {
                handler,
                store_upgrades,
            },
        );
        Ok(())
    }

    /// `None` is the not-found signal.
    pub fn lookup(&self, name: &str) -> Option<&Registration> {
        self.entries.get(name)
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}
