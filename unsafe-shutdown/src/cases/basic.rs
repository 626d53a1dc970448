// Copyright 2023 Oxide Computer Company
//! Single file pools on one DIMM.
use std::path::PathBuf;

use anyhow::Result;
use ras_pool::PoolKind;

use super::case;
use crate::runner::{Fixture, TestCase};

const BASIC: &str = "UnsafeShutdownBasic";
const WITHOUT_US: &str = "UnsafeShutdownBasicWithoutUS";

fn us_pool_path(f: &Fixture<'_>) -> Result<PathBuf> {
    Ok(f.pool_path(&f.unsafe_mountpoint(0)?))
}

/// Create the pool, fill it and leave it open.
fn create_dirty(f: &mut Fixture<'_>, kind: PoolKind) -> Result<()> {
    let path = us_pool_path(f)?;
    let h = f.create_filled_pool(kind, &path)?;
    f.hold(h);
    Ok(())
}

/// The pool went down open with its DIMM: opening has to be refused
/// until it is repaired, and then the data has to be intact.
fn open_after_us(f: &mut Fixture<'_>, kind: PoolKind) -> Result<()> {
    let us = f.unsafe_mountpoint(0)?;
    f.passed_on_previous_phase()?;
    f.assert_usc(1, &[us.clone()])?;

    let path = f.pool_path(&us);
    f.expect_open_fails(kind, &path)?;
    f.repair(&path)?;
    let mut h = f.open_pool(kind, &path)?;
    f.verify_data(h.as_mut())?;
    f.hold(h);
    Ok(())
}

pub(super) fn register(cases: &mut Vec<TestCase>) {
    for (name, kind) in [
        ("TRY_OPEN_OBJ", PoolKind::Obj),
        ("TRY_OPEN_BLK", PoolKind::Blk),
        ("TRY_OPEN_LOG", PoolKind::Log),
    ] {
        cases.push(case(BASIC, name, 1, move |f| create_dirty(f, kind)));
        cases.push(case(BASIC, name, 2, move |f| open_after_us(f, kind)));
    }

    const DOUBLE: &str = "TC_TRY_OPEN_AFTER_DOUBLE_US";
    cases.push(case(BASIC, DOUBLE, 1, |f| create_dirty(f, PoolKind::Obj)));
    cases.push(case(BASIC, DOUBLE, 2, |f| {
        let us = f.unsafe_mountpoint(0)?;
        f.passed_on_previous_phase()?;
        f.assert_usc(1, &[us])
    }));
    cases.push(case(BASIC, DOUBLE, 3, |f| open_after_us(f, PoolKind::Obj)));

    // Closed before the shutdown, so nothing to recover.
    const CLEAN: &str = "TC_OPEN_CLEAN";
    cases.push(case(BASIC, CLEAN, 1, |f| {
        let path = us_pool_path(f)?;
        let h = f.create_filled_pool(PoolKind::Obj, &path)?;
        h.close()?;
        Ok(())
    }));
    cases.push(case(BASIC, CLEAN, 2, |f| {
        let us = f.unsafe_mountpoint(0)?;
        f.passed_on_previous_phase()?;
        f.assert_usc(1, &[us.clone()])?;
        let mut h = f.open_pool(PoolKind::Obj, &f.pool_path(&us))?;
        f.verify_data(h.as_mut())?;
        f.hold(h);
        Ok(())
    }));

    // Left open, but the DIMM under it shut down safely.
    const DIRTY_NO_US: &str = "TC_OPEN_DIRTY_NO_US";
    cases.push(case(WITHOUT_US, DIRTY_NO_US, 1, |f| {
        let path = f.pool_path(&f.safe_mountpoint(0)?);
        let h = f.create_filled_pool(PoolKind::Obj, &path)?;
        f.hold(h);
        Ok(())
    }));
    cases.push(case(WITHOUT_US, DIRTY_NO_US, 2, |f| {
        let safe = f.safe_mountpoint(0)?;
        f.passed_on_previous_phase()?;
        f.assert_usc(0, &[safe.clone()])?;
        let mut h = f.open_pool(PoolKind::Obj, &f.pool_path(&safe))?;
        f.verify_data(h.as_mut())?;
        f.hold(h);
        Ok(())
    }));
}
