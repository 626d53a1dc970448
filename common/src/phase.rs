// Copyright 2023 Oxide Computer Company
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// One process invocation between two power cycles, counted from 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Phase(u32);

impl Phase {
    pub const FIRST: Phase = Phase(1);

    pub fn new(n: u32) -> Result<Self> {
        if n == 0 {
            bail!("phases are numbered from 1");
        }
        Ok(Phase(n))
    }

    pub fn number(&self) -> u32 {
        self.0
    }

    pub fn is_first(&self) -> bool {
        self.0 == 1
    }

    pub fn next(&self) -> Phase {
        Phase(self.0 + 1)
    }

    /// `phase_N`, the token test names carry.
    pub fn name(&self) -> String {
        format!("phase_{}", self.0)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase_{}", self.0)
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    /// Accepts `2` or `phase_2`.
    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("phase_").unwrap_or(s);
        match digits.parse::<u32>() {
            Ok(n) => Phase::new(n),
            Err(_) => bail!("invalid phase {:?}", s),
        }
    }
}

/// What happens once the tests of a phase have run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PostAction {
    /// Record counters and inject an unsafe shutdown; a power cycle follows.
    Inject,
    /// Last phase: remove every test directory.
    Cleanup,
}
