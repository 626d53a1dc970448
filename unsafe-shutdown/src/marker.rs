// Copyright 2023 Oxide Computer Company
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use slog::{debug, Logger};

const PHASE_SUFFIXES: [&str; 3] =
    ["_before_us", "_after_first_us", "_after_second_us"];
const PHASE_TOKEN: &str = "_phase_";

/// Remove one `_phase_<digits>` occurrence, if there is one.
fn strip_phase_number(name: &str) -> Option<String> {
    let mut from = 0;
    while let Some(at) = name[from..].find(PHASE_TOKEN) {
        let start = from + at;
        let digits_at = start + PHASE_TOKEN.len();
        let digits = name[digits_at..]
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        if digits > 0 {
            let mut out = name[..start].to_string();
            out.push_str(&name[digits_at + digits..]);
            return Some(out);
        }
        from = start + 1;
    }
    None
}

/// The name shared by every phase of one logical test: separators become
/// underscores and the phase part of the name goes away.
///
/// `Suite.Case_phase_2` and `Suite.Case_after_first_us` both give
/// `Suite_Case`; `UnsafeShutdown/Suite.Case_phase_1/3` gives
/// `UnsafeShutdown_Suite_Case_3`.
pub fn normalize_test_name(full_name: &str) -> String {
    let mut name = full_name.replace(|c: char| c == '/' || c == '.', "_");
    loop {
        let before = name.len();
        for suffix in PHASE_SUFFIXES {
            name = name.replace(suffix, "");
        }
        while let Some(stripped) = strip_phase_number(&name) {
            name = stripped;
        }
        if name.len() == before {
            return name;
        }
    }
}

/// The one-shot token that lets phase N+1 of a test know phase N passed.
#[derive(Debug, Clone)]
pub struct PhasePassedMarker {
    path: PathBuf,
    log: Logger,
}

impl PhasePassedMarker {
    pub fn new(test_dir: &Path, normalized_name: &str, log: Logger) -> Self {
        PhasePassedMarker {
            path: test_dir.join(format!("{}_passed", normalized_name)),
            log,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leave the token behind, but only for a test that passed.
    pub fn stamp(&self, passed: bool) -> Result<()> {
        if !passed {
            return Ok(());
        }
        std::fs::write(&self.path, b"")
            .with_context(|| format!("write marker {:?}", self.path))?;
        debug!(self.log, "stamped {:?}", self.path);
        Ok(())
    }

    /// Take the token. True only if it was there.
    pub fn consume_if_present(&self) -> bool {
        match std::fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(e) => {
                debug!(self.log, "no marker {:?}: {}", self.path, e);
                false
            }
        }
    }
}
