//! Replica configuration, read from a JSON file.
//!
//! Every field has a default, unknown fields are rejected.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use upgrade_kernel::orchestrator::OrchestratorConfig;

pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 100;
pub const DEFAULT_UPGRADE_WARNING_WINDOW: u64 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicaConfig {
    pub chain_id: String,
    /// Save a snapshot every N blocks. Zero disables periodic snapshots.
    pub snapshot_interval: u64,
    pub upgrade_warning_window: u64,
    /// Heights at which a due upgrade is dropped instead of applied.
    pub skip_upgrade_heights: BTreeSet<u64>,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            chain_id: "local".to_string(),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            upgrade_warning_window: DEFAULT_UPGRADE_WARNING_WINDOW,
            skip_upgrade_heights: BTreeSet::new(),
        }
    }
}

impl ReplicaConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chain_id.is_empty() {
            return Err(ConfigError::Invalid("chain_id must not be empty".into()));
        }
        if self.skip_upgrade_heights.contains(&0) {
            return Err(ConfigError::Invalid(
                "skip_upgrade_heights must not contain 0".into(),
            ));
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            warning_window: self.upgrade_warning_window,
            skip_upgrade_heights: self.skip_upgrade_heights.clone(),
        }
    }
}
