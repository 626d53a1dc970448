// Copyright 2023 Oxide Computer Company
//! Every test this binary knows about, one entry per phase of each.
use anyhow::Result;
use ras_pool::DeviceInventory;

use crate::runner::{Fixture, TestCase};

mod basic;
mod moves;
mod remote;
mod replicas;

/// Prefix gtest gives value-parametrized suites.
const PARAM_PREFIX: &str = "UnsafeShutdown";

pub fn all_cases(inv: &DeviceInventory) -> Vec<TestCase> {
    let mut cases = Vec::new();
    basic::register(&mut cases);
    replicas::register(&mut cases, inv);
    remote::register(&mut cases, inv);
    moves::register(&mut cases, inv);
    cases
}

fn case<F>(suite: &str, name: &str, phase: u32, body: F) -> TestCase
where
    F: Fn(&mut Fixture<'_>) -> Result<()> + Send + Sync + 'static,
{
    TestCase {
        name: format!("{}.{}_phase_{}", suite, name, phase),
        body: Box::new(body),
    }
}

fn param_case<F>(
    suite: &str,
    name: &str,
    phase: u32,
    index: usize,
    body: F,
) -> TestCase
where
    F: Fn(&mut Fixture<'_>) -> Result<()> + Send + Sync + 'static,
{
    TestCase {
        name: format!(
            "{}/{}.{}_phase_{}/{}",
            PARAM_PREFIX, suite, name, phase, index
        ),
        body: Box::new(body),
    }
}
