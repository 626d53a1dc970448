// Copyright 2023 Oxide Computer Company
//! Single file pools moved to other storage after the power cycle.
use anyhow::{ensure, Result};
use ras_pool::{
    move_scenarios_with_us, move_scenarios_without_us, DeviceInventory,
    MoveScenario, PoolKind,
};

use super::param_case;
use crate::runner::{Fixture, TestCase};

fn create(f: &mut Fixture<'_>, sc: &MoveScenario, close: bool) -> Result<()> {
    ensure!(sc.enough_dimms, "not enough dimms configured to run: {}", sc);
    let h = f.create_filled_pool(PoolKind::Obj, &f.pool_path(&sc.src_dir))?;
    if close {
        h.close()?;
    } else {
        f.hold(h);
    }
    Ok(())
}

/// A clean pool opens wherever it lands; a dirty one sees different
/// storage under it and has to be repaired first.
fn move_and_open(
    f: &mut Fixture<'_>,
    sc: &MoveScenario,
    clean: bool,
) -> Result<()> {
    ensure!(sc.enough_dimms, "not enough dimms configured to run: {}", sc);
    f.passed_on_previous_phase()?;
    f.assert_usc(1, &sc.unsafe_mountpoints)?;
    f.assert_usc(0, &sc.safe_mountpoints)?;

    let src = f.pool_path(&sc.src_dir);
    let dest = f.pool_path(&sc.dest_dir);
    f.move_pool(&src, &dest)?;
    if !clean {
        f.expect_open_fails(PoolKind::Obj, &dest)?;
        f.repair(&dest)?;
    }
    let mut h = f.open_pool(PoolKind::Obj, &dest)?;
    f.verify_data(h.as_mut())?;
    f.hold(h);
    Ok(())
}

fn register_suite(
    cases: &mut Vec<TestCase>,
    suite: &'static str,
    name: &'static str,
    scenarios: Vec<MoveScenario>,
    clean: bool,
) {
    for (i, sc) in scenarios.into_iter().enumerate() {
        let first = sc.clone();
        cases.push(param_case(suite, name, 1, i, move |f| {
            create(f, &first, clean)
        }));
        cases.push(param_case(suite, name, 2, i, move |f| {
            move_and_open(f, &sc, clean)
        }));
    }
}

pub(super) fn register(cases: &mut Vec<TestCase>, inv: &DeviceInventory) {
    register_suite(
        cases,
        "MoveCleanPool",
        "TC_MOVE_POOL_CLEAN",
        move_scenarios_with_us(inv),
        true,
    );
    register_suite(
        cases,
        "MoveDirtyPool",
        "TC_MOVE_POOL_DIRTY",
        move_scenarios_with_us(inv),
        false,
    );
    register_suite(
        cases,
        "MoveCleanPoolWithoutUS",
        "TC_MOVE_POOL_CLEAN_WITHOUT_US",
        move_scenarios_without_us(inv),
        true,
    );
    register_suite(
        cases,
        "MoveDirtyPoolWithoutUS",
        "TC_MOVE_POOL_DIRTY_WITHOUT_US",
        move_scenarios_without_us(inv),
        false,
    );
}
