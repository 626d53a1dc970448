// Copyright 2023 Oxide Computer Company
//! Poolsets with replicas on the remote node.
use anyhow::{ensure, Context, Result};
use ras_pool::{
    sync_remote_replica_scenarios, DeviceInventory, PoolKind,
    SyncRemoteScenario,
};

use super::param_case;
use crate::runner::{Fixture, TestCase};

const SYNC: &str = "SyncRemoteReplica";
const SYNC_CASE: &str = "TC_SYNC_REMOTE_REPLICA";

fn sync_create(f: &mut Fixture<'_>, sc: &SyncRemoteScenario) -> Result<()> {
    ensure!(sc.enough_dimms, "not enough dimms configured to run: {}", sc);
    let poolset = sc.poolset.as_ref().context("scenario has no poolset")?;
    f.write_poolset(poolset)?;
    for rp in sc.remote_poolsets.iter() {
        f.create_remote_poolset(rp)?;
    }
    f.pmempool(
        &["create", "obj", &poolset.full_path().to_string_lossy()],
        0,
    )?;
    let mut h = f.open_pool(PoolKind::Obj, &poolset.full_path())?;
    f.write_pattern(h.as_mut())?;
    f.hold(h);
    Ok(())
}

fn sync_recover(f: &mut Fixture<'_>, sc: &SyncRemoteScenario) -> Result<()> {
    ensure!(sc.enough_dimms, "not enough dimms configured to run: {}", sc);
    let poolset = sc.poolset.as_ref().context("scenario has no poolset")?;
    f.passed_on_previous_phase()?;
    f.assert_usc(1, &sc.unsafe_mountpoints)?;
    for rp in sc.remote_poolsets.iter() {
        if !rp.unsafe_mountpoints.is_empty() {
            f.assert_remote_usc(&rp.unsafe_mountpoints)?;
        }
    }

    let path = poolset.full_path();
    ensure!(poolset.file_exists(), "poolset file {:?} does not exist", path);
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

pub(super) fn register(cases: &mut Vec<TestCase>, inv: &DeviceInventory) {
    for (i, sc) in sync_remote_replica_scenarios(inv).into_iter().enumerate() {
        let first = sc.clone();
        cases.push(param_case(SYNC, SYNC_CASE, 1, i, move |f| {
            sync_create(f, &first)
        }));
        cases.push(param_case(SYNC, SYNC_CASE, 2, i, move |f| {
            sync_recover(f, &sc)
        }));
    }
}
