//! Upgrade plans.
//!
//! A plan is pure data: which named upgrade runs, and at which height.

use serde::{Deserialize, Serialize};

use crate::error::SchedulingError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub name: String,
    pub height: u64,
    /// Opaque to the kernel. Typically binary download hints.
    #[serde(default)]
    pub info: String,
}

/// Where a pending plan stands relative to the block being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanPhase {
    Future { blocks_remaining: u64 },
    Due,
    Overdue { blocks_late: u64 },
}

impl Plan {
    pub fn new(name: impl Into<String>, height: u64, info: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            height,
            info: info.into(),
        }
    }

    /// Checks that need no chain state.
    pub fn validate_basic(&self) -> Result<(), SchedulingError> {
        if self.name.is_empty() {
            return Err(SchedulingError::EmptyPlanName);
        }
        if self.height == 0 {
            return Err(SchedulingError::InvalidHeight {
                height: self.height,
                current: 0,
            });
        }
        Ok(())
    }

    pub fn phase(&self, current_height: u64) -> PlanPhase {
        match self.height.cmp(&current_height) {
            std::cmp::Ordering::Greater => PlanPhase::Future {
                blocks_remaining: self.height - current_height,
            },
            std::cmp::Ordering::Equal => PlanPhase::Due,
            std::cmp::Ordering::Less => PlanPhase::Overdue {
                blocks_late: current_height - self.height,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase() {
        let plan = Plan::new("v2", 100, "");
        assert_eq!(plan.phase(50), PlanPhase::Future { blocks_remaining: 50 });
        assert_eq!(plan.phase(100), PlanPhase::Due);
        assert_eq!(plan.phase(103), PlanPhase::Overdue { blocks_late: 3 });
    }

    #[test]
    fn test_validate_basic() {
        assert!(Plan::new("v2", 10, "").validate_basic().is_ok());
        assert_eq!(
            Plan::new("", 10, "").validate_basic(),
            Err(SchedulingError::EmptyPlanName)
        );
        assert!(matches!(
            Plan::new("v2", 0, "").validate_basic(),
            Err(SchedulingError::InvalidHeight { height: 0, .. })
        ));
    }
}
