//! Upgrade keeper: plan lifecycle and version-map persistence.
//!
//! All records live in the reserved `upgrade` partition:
//!
//! ```text
//!   plan            -> ProtoPlan          (at most one)
//!   version_map     -> ProtoVersionMap
//!   done/<name>     -> height, 8 bytes BE (one per applied upgrade)
//! ```
//!
//! Writes go to the block's working state, so they only become visible to
//! later blocks once the enclosing block commits.

use tracing::info;

use crate::codec::{
    decode_height, decode_plan, decode_version_map, encode_height, encode_plan,
    encode_version_map, CodecError,
};
use crate::context::{Context, Event};
use crate::error::SchedulingError;
use crate::plan::Plan;
use crate::store::{StateStore, StoreError, UPGRADE_PARTITION};
use crate::version_map::VersionMap;

pub const PLAN_KEY: &[u8] = b"plan";
pub const VERSION_MAP_KEY: &[u8] = b"version_map";
pub const DONE_PREFIX: &[u8] = b"done/";

fn done_key(name: &str) -> Vec<u8> {
    let mut key = DONE_PREFIX.to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

// ---------------------------------------------------------------------------
// Genesis
// ---------------------------------------------------------------------------

/// Mount the upgrade partition and record the genesis version map.
pub fn init_genesis(store: &mut StateStore, genesis: &VersionMap) -> Result<(), StoreError> {
    store.mount(UPGRADE_PARTITION)?;
    store.set(UPGRADE_PARTITION, VERSION_MAP_KEY, encode_version_map(genesis))
}

// ---------------------------------------------------------------------------
// Governance API
// ---------------------------------------------------------------------------

/// Schedule an upgrade plan.
///
/// Fails if the height is not in the future, a plan is already pending, or
/// the name was used by an upgrade that already ran.
pub fn schedule_plan(ctx: &mut Context, plan: Plan) -> Result<(), SchedulingError> {
    plan.validate_basic()?;
    if plan.height <= ctx.height() {
        return Err(SchedulingError::InvalidHeight {
            height: plan.height,
            current: ctx.height(),
        });
    }
    if let Some(pending) = get_plan(ctx.store())? {
        return Err(SchedulingError::PlanAlreadyPending(pending.name));
    }
    if let Some(height) = done_height(ctx.store(), &plan.name)? {
        return Err(SchedulingError::PlanAlreadyApplied {
            name: plan.name,
            height,
        });
    }

    ctx.store_mut()
        .set(UPGRADE_PARTITION, PLAN_KEY, encode_plan(&plan))?;
    info!(name = %plan.name, height = plan.height, "upgrade plan scheduled");
    ctx.emit(
        Event::new("upgrade_scheduled")
            .attr("name", &plan.name)
            .attr("height", plan.height),
    );
    Ok(())
}

/// Cancel the pending plan and return it.
pub fn cancel_plan(ctx: &mut Context) -> Result<Plan, SchedulingError> {
    let plan = get_plan(ctx.store())?.ok_or(SchedulingError::NoPlanPending)?;
    ctx.store_mut().delete(UPGRADE_PARTITION, PLAN_KEY)?;
    info!(name = %plan.name, height = plan.height, "upgrade plan cancelled");
    ctx.emit(
        Event::new("upgrade_cancelled")
            .attr("name", &plan.name)
            .attr("height", plan.height),
    );
    Ok(plan)
}

pub fn get_plan(store: &StateStore) -> Result<Option<Plan>, SchedulingError> {
    match store.get(UPGRADE_PARTITION, PLAN_KEY)? {
        Some(bytes) => Ok(Some(decode_plan(bytes)?)),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Orchestrator-side records
// ---------------------------------------------------------------------------

/// Delete the pending plan without any checks. Used once the plan has been
/// applied or skipped.
pub(crate) fn clear_plan(store: &mut StateStore) -> Result<(), StoreError> {
    store.delete(UPGRADE_PARTITION, PLAN_KEY).map(|_| ())
}

pub fn get_version_map(store: &StateStore) -> Result<VersionMap, SchedulingError> {
    let bytes = store
        .get(UPGRADE_PARTITION, VERSION_MAP_KEY)?
        .ok_or(CodecError::Decode {
            record: "version map",
            reason: "no version map recorded".to_string(),
        })?;
    Ok(decode_version_map(bytes)?)
}

pub(crate) fn set_version_map(store: &mut StateStore, vm: &VersionMap) -> Result<(), StoreError> {
    store.set(UPGRADE_PARTITION, VERSION_MAP_KEY, encode_version_map(vm))
}

pub(crate) fn mark_done(store: &mut StateStore, name: &str, height: u64) -> Result<(), StoreError> {
    store.set(UPGRADE_PARTITION, done_key(name), encode_height(height))
}

/// Height at which the named upgrade was applied, if it was.
pub fn done_height(store: &StateStore, name: &str) -> Result<Option<u64>, SchedulingError> {
    match store.get(UPGRADE_PARTITION, &done_key(name))? {
        Some(bytes) => Ok(Some(decode_height(bytes)?)),
        None => Ok(None),
    }
}

/// All applied upgrades as `(name, height)`, ordered by name.
pub fn applied_upgrades(store: &StateStore) -> Result<Vec<(String, u64)>, SchedulingError> {
    let mut out = Vec::new();
    for (key, value) in store.iter_prefix(UPGRADE_PARTITION, DONE_PREFIX)? {
        let name = String::from_utf8_lossy(&key[DONE_PREFIX.len()..]).into_owned();
        out.push((name, decode_height(value)?));
    }
    Ok(out)
}

/// The most recently applied upgrade. Ties on height break by name.
pub fn last_completed_upgrade(store: &StateStore) -> Result<Option<(String, u64)>, SchedulingError> {
    Ok(applied_upgrades(store)?
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0))))
}
