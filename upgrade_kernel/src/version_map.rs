//! Version maps: `module name -> consensus version`.
//!
//! Pure data. Iteration is always in lexicographic module order, which is
//! what makes diffs, encodings and hashes identical across replicas.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionMapError {
    #[error("module name must not be empty")]
    EmptyModuleName,
    #[error("module {0:?} has no entry in the version map")]
    MissingModule(String),
    #[error("module {0:?} is not registered with the application")]
    UnknownModule(String),
    #[error("module {module:?} would regress from version {from} to {to}")]
    Regression { module: String, from: u64, to: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionMap(BTreeMap<String, u64>);

impl VersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, module: &str) -> Option<u64> {
        self.0.get(module).copied()
    }

    /// Set a module's version, returning the previous one.
    pub fn set(&mut self, module: impl Into<String>, version: u64) -> Option<u64> {
        self.0.insert(module.into(), version)
    }

    pub fn remove(&mut self, module: &str) -> Option<u64> {
        self.0.remove(module)
    }

    pub fn contains(&self, module: &str) -> bool {
        self.0.contains_key(module)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// `self` overlaid with `overlay`; entries in `overlay` win.
    pub fn merge(&self, overlay: &VersionMap) -> VersionMap {
        let mut merged = self.clone();
        for (module, version) in overlay.iter() {
            merged.set(module, version);
        }
        merged
    }

    /// Every registered module must have exactly one entry and no entry may
    /// name an unregistered module.
    pub fn validate_against<'a, I>(&self, registered: I) -> Result<(), VersionMapError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        if self.0.keys().any(String::is_empty) {
            return Err(VersionMapError::EmptyModuleName);
        }
        let registered: BTreeSet<&str> = registered.into_iter().collect();
        if let Some(missing) = registered.iter().find(|m| !self.contains(m)) {
            return Err(VersionMapError::MissingModule(missing.to_string()));
        }
        if let Some(unknown) = self.modules().find(|m| !registered.contains(m)) {
            return Err(VersionMapError::UnknownModule(unknown.to_string()));
        }
        Ok(())
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for VersionMap {
    fn from_iter<T: IntoIterator<Item = (S, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl IntoIterator for VersionMap {
    type Item = (String, u64);
    type IntoIter = std::collections::btree_map::IntoIter<String, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleVersionChange {
    pub module: String,
    pub from: u64,
    pub to: u64,
}

/// Structured difference between two version maps. All lists are in
/// lexicographic module order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDiff {
    pub upgraded: Vec<ModuleVersionChange>,
    pub downgraded: Vec<ModuleVersionChange>,
    pub added: Vec<(String, u64)>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl VersionDiff {
    /// True when no module changed, appeared or disappeared.
    pub fn is_empty(&self) -> bool {
        self.upgraded.is_empty()
            && self.downgraded.is_empty()
            && self.added.is_empty()
            && self.removed.is_empty()
    }

    /// First regression, if any.
    pub fn check_monotonic(&self) -> Result<(), VersionMapError> {
        match self.downgraded.first() {
            Some(change) => Err(VersionMapError::Regression {
                module: change.module.clone(),
                from: change.from,
                to: change.to,
            }),
            None => Ok(()),
        }
    }
}

/// Compare `old` against `new`.
pub fn diff(old: &VersionMap, new: &VersionMap) -> VersionDiff {
    let modules_old: BTreeSet<&str> = old.modules().collect();
    let modules_new: BTreeSet<&str> = new.modules().collect();

    let mut report = VersionDiff {
        added: modules_new
            .difference(&modules_old)
            .map(|m| (m.to_string(), new.get(m).unwrap_or_default()))
            .collect(),
        removed: modules_old
            .difference(&modules_new)
            .map(|m| m.to_string())
            .collect(),
        ..Default::default()
    };

    for module in modules_old.intersection(&modules_new) {
        let (from, to) = (old.get(module).unwrap_or_default(), new.get(module).unwrap_or_default());
        let change = ModuleVersionChange {
            module: module.to_string(),
            from,
            to,
        };
        match to.cmp(&from) {
            std::cmp::Ordering::Greater => report.upgraded.push(change),
            std::cmp::Ordering::Less => report.downgraded.push(change),
            std::cmp::Ordering::Equal => report.unchanged.push(change.module),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(entries: &[(&str, u64)]) -> VersionMap {
        entries.iter().map(|(m, v)| (*m, *v)).collect()
    }

    #[test]
    fn test_diff_classifies_every_module() {
        let old = vm(&[("bank", 1), ("gov", 3), ("mint", 2), ("params", 1)]);
        let new = vm(&[("bank", 2), ("gov", 2), ("mint", 2), ("ibc", 1)]);
        let d = diff(&old, &new);

        assert_eq!(
            d.upgraded,
            vec![ModuleVersionChange { module: "bank".into(), from: 1, to: 2 }]
        );
        assert_eq!(
            d.downgraded,
            vec![ModuleVersionChange { module: "gov".into(), from: 3, to: 2 }]
        );
        assert_eq!(d.added, vec![("ibc".to_string(), 1)]);
        assert_eq!(d.removed, vec!["params".to_string()]);
        assert_eq!(d.unchanged, vec!["mint".to_string()]);
        assert!(!d.is_empty());
        assert!(matches!(
            d.check_monotonic(),
            Err(VersionMapError::Regression { ref module, from: 3, to: 2 }) if module == "gov"
        ));
    }

    #[test]
    fn test_identical_maps_diff_empty() {
        let a = vm(&[("bank", 1), ("gov", 1)]);
        let d = diff(&a, &a.clone());
        assert!(d.is_empty());
        assert_eq!(d.unchanged.len(), 2);
        assert!(d.check_monotonic().is_ok());
    }

    #[test]
    fn test_merge_overlay_wins() {
        let base = vm(&[("bank", 1), ("gov", 1)]);
        let merged = base.merge(&vm(&[("gov", 4), ("ibc", 1)]));
        assert_eq!(merged, vm(&[("bank", 1), ("gov", 4), ("ibc", 1)]));
    }

    #[test]
    fn test_validate_against_registered_modules() {
        let map = vm(&[("bank", 1), ("gov", 1)]);
        assert!(map.validate_against(["gov", "bank"]).is_ok());
        assert_eq!(
            map.validate_against(["bank", "gov", "mint"]),
            Err(VersionMapError::MissingModule("mint".into()))
        );
        assert_eq!(
            map.validate_against(["bank"]),
            Err(VersionMapError::UnknownModule("gov".into()))
        );
    }

    #[test]
    fn test_iteration_is_lexicographic() {
        let map = vm(&[("zeta", 1), ("alpha", 1), ("mid", 1)]);
        let order: Vec<&str> = map.modules().collect();
        assert_eq!(order, vec!["alpha", "mid", "zeta"]);
    }
}
