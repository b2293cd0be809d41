//! `upgrade-info.json`: written into the data directory when the node halts
//! for an upgrade this binary cannot run, so a process supervisor can swap
//! in the new binary and restart.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use upgrade_kernel::plan::Plan;

pub const UPGRADE_INFO_FILE: &str = "upgrade-info.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeInfo {
    pub name: String,
    pub height: u64,
    #[serde(default)]
    pub info: String,
}

impl From<&Plan> for UpgradeInfo {
    fn from(plan: &Plan) -> Self {
        Self {
            name: plan.name.clone(),
            height: plan.height,
            info: plan.info.clone(),
        }
    }
}

pub fn write_upgrade_info(data_dir: &Path, info: &UpgradeInfo) -> io::Result<PathBuf> {
    fs::create_dir_all(data_dir)?;
    let content = serde_json::to_string(info)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let path = data_dir.join(UPGRADE_INFO_FILE);
    let mut file = File::create(&path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    Ok(path)
}

pub fn read_upgrade_info(data_dir: &Path) -> io::Result<Option<UpgradeInfo>> {
    let path = data_dir.join(UPGRADE_INFO_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
