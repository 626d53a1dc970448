// Copyright 2023 Oxide Computer Company
//! Poolsets with local replicas: recovery through sync and transform.
use anyhow::{ensure, Context, Result};
use ras_pool::{
    sync_local_replica_scenarios, transform_scenario, DeviceInventory,
    PoolKind, SyncScenario, TransformScenario,
};

use super::{case, param_case};
use crate::runner::{Fixture, TestCase};

const SYNC: &str = "SyncLocalReplica";
const SYNC_CASE: &str = "TC_SYNC_LOCAL_REPLICA";
const TRANSFORM: &str = "UnsafeShutdownTransform";
const TRANSFORM_CASE: &str = "TC_TRANSFORM_POOLSET_TO_US_DIMM";

fn sync_create(f: &mut Fixture<'_>, sc: &SyncScenario) -> Result<()> {
    ensure!(sc.enough_dimms, "not enough dimms configured to run: {}", sc);
    let poolset = sc.poolset.as_ref().context("scenario has no poolset")?;
    f.create_poolset_pool(poolset)?;
    let mut h = f.open_pool(PoolKind::Obj, &poolset.full_path())?;
    f.write_pattern(h.as_mut())?;
    f.hold(h);
    Ok(())
}

/// A syncable pool comes back from `sync` alone; any other needs the
/// primary repaired first.
fn sync_recover(f: &mut Fixture<'_>, sc: &SyncScenario) -> Result<()> {
    ensure!(sc.enough_dimms, "not enough dimms configured to run: {}", sc);
    let poolset = sc.poolset.as_ref().context("scenario has no poolset")?;
    f.passed_on_previous_phase()?;

    let path = poolset.full_path();
    f.expect_open_fails(PoolKind::Obj, &path)?;
    f.sync(&path, if sc.is_syncable { 0 } else { 1 })?;
    if !sc.is_syncable {
        f.expect_open_fails(PoolKind::Obj, &path)?;
        f.repair(&path)?;
        f.sync(&path, 0)?;
    }
    let mut h = f
        .open_pool(PoolKind::Obj, &path)
        .context("pool could not be opened after sync")?;
    f.verify_data(h.as_mut())?;
    f.hold(h);
    Ok(())
}

fn transform_create(
    f: &mut Fixture<'_>,
    sc: Option<&TransformScenario>,
) -> Result<()> {
    f.require_unsafe(1)?;
    f.require_safe(1)?;
    let sc = sc.context("no transform scenario for this device inventory")?;
    f.create_poolset_pool(&sc.origin)?;
    let mut h = f.open_pool(PoolKind::Obj, &sc.origin.full_path())?;
    f.write_pattern(h.as_mut())?;
    f.hold(h);
    Ok(())
}

/// Moving a replica onto the DIMM that took the shutdown only works once
/// the poolset is healthy again.
fn transform_recover(
    f: &mut Fixture<'_>,
    sc: Option<&TransformScenario>,
) -> Result<()> {
    f.require_unsafe(1)?;
    f.require_safe(1)?;
    let sc = sc.context("no transform scenario for this device inventory")?;
    f.passed_on_previous_phase()?;

    f.write_poolset(&sc.added)?;
    f.write_poolset(&sc.final_poolset)?;
    let origin = sc.origin.full_path();
    let added = sc.added.full_path();
    f.transform(&origin, &added, 1)?;
    f.sync(&origin, 0)?;
    f.transform(&origin, &added, 0)?;
    f.transform(&added, &sc.final_poolset.full_path(), 0)?;

    let mut h = f.open_pool(PoolKind::Obj, &sc.final_poolset.full_path())?;
    f.verify_data(h.as_mut())?;
    f.hold(h);
    Ok(())
}

pub(super) fn register(cases: &mut Vec<TestCase>, inv: &DeviceInventory) {
    for (i, sc) in sync_local_replica_scenarios(inv).into_iter().enumerate() {
        let first = sc.clone();
        cases.push(param_case(SYNC, SYNC_CASE, 1, i, move |f| {
            sync_create(f, &first)
        }));
        cases.push(param_case(SYNC, SYNC_CASE, 2, i, move |f| {
            sync_recover(f, &sc)
        }));
    }

    let sc = transform_scenario(inv);
    let first = sc.clone();
    cases.push(case(TRANSFORM, TRANSFORM_CASE, 1, move |f| {
        transform_create(f, first.as_ref())
    }));
    cases.push(case(TRANSFORM, TRANSFORM_CASE, 2, move |f| {
        transform_recover(f, sc.as_ref())
    }));
}
