// Copyright 2023 Oxide Computer Company
//! A small gtest-compatible runner and the fixture every test body gets.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use ras_common::{shell, CommandOutput, RunStatus, TestFilter};
use ras_dimm::{DimmCollection, InjectManager};
use ras_pool::{
    test_pattern, write_test_pattern, PoolError, PoolHandle, PoolKind,
    PoolLibrary, Poolset, RemotePoolset,
};
use slog::{error, info, o, warn, Logger};

use crate::marker::{normalize_test_name, PhasePassedMarker};
use crate::phase::PhaseContext;
use crate::remote::RemoteNode;

pub type CaseBody = Box<dyn Fn(&mut Fixture<'_>) -> Result<()> + Send + Sync>;

/// One phase of one logical test.
pub struct TestCase {
    pub name: String,
    pub body: CaseBody,
}

impl std::fmt::Debug for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase").field("name", &self.name).finish()
    }
}

/// What every test in the process shares.
pub struct TestEnv {
    pub ctx: PhaseContext,
    pub library: Arc<dyn PoolLibrary>,
    pub inject: InjectManager,
    pub log: Logger,
}

impl TestEnv {
    pub fn new(
        ctx: PhaseContext,
        library: Arc<dyn PoolLibrary>,
        log: Logger,
    ) -> Self {
        TestEnv {
            inject: InjectManager::new(&ctx.test_dir, log.clone()),
            ctx,
            library,
            log,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
}

impl Report {
    pub fn status(&self) -> RunStatus {
        RunStatus::from_counts(self.passed.len(), self.failed.len())
    }
}

/// Run every case `filter` selects, in order, and print the familiar
/// progress lines.
pub fn run_tests(
    cases: &[TestCase],
    filter: &TestFilter,
    env: &TestEnv,
) -> Report {
    let selected: Vec<&TestCase> =
        cases.iter().filter(|c| filter.matches(&c.name)).collect();
    println!("[==========] Running {} tests.", selected.len());

    let mut report = Report::default();
    for case in selected {
        println!("[ RUN      ] {}", case.name);
        let mut fixture = Fixture::new(env, &case.name);
        let mut res = (case.body)(&mut fixture);
        if let Err(e) = fixture.tear_down(res.is_ok()) {
            res = res.and(Err(e));
        }
        match res {
            Ok(()) => {
                println!("[       OK ] {}", case.name);
                report.passed.push(case.name.clone());
            }
            Err(e) => {
                error!(env.log, "{}: {:#}", case.name, e);
                println!("{:#}", e);
                println!("[  FAILED  ] {}", case.name);
                report.failed.push(case.name.clone());
            }
        }
    }

    let ran = report.passed.len() + report.failed.len();
    println!("[==========] {} tests ran.", ran);
    println!("[  PASSED  ] {} tests.", report.passed.len());
    if !report.failed.is_empty() {
        println!("[  FAILED  ] {} tests, listed below:", report.failed.len());
        for name in report.failed.iter() {
            println!("[  FAILED  ] {}", name);
        }
    }
    report
}

fn with_errno(e: PoolError, what: &str) -> anyhow::Error {
    let errno = e.errno();
    anyhow::Error::new(e).context(format!("{} ({})", what, errno))
}

/// Per-test state and the helpers test bodies are written with.
pub struct Fixture<'a> {
    env: &'a TestEnv,
    normalized: String,
    marker: PhasePassedMarker,
    open_pools: Vec<Box<dyn PoolHandle>>,
    log: Logger,
}

impl<'a> Fixture<'a> {
    pub fn new(env: &'a TestEnv, full_name: &str) -> Self {
        let normalized = normalize_test_name(full_name);
        let log = env.log.new(o!("test" => full_name.to_string()));
        let marker =
            PhasePassedMarker::new(&env.ctx.test_dir, &normalized, log.clone());
        Fixture {
            marker,
            env,
            normalized,
            open_pools: Vec::new(),
            log,
        }
    }

    pub fn passed_on_previous_phase(&self) -> Result<()> {
        ensure!(
            self.marker.consume_if_present(),
            "part of test before shutdown failed"
        );
        Ok(())
    }

    /// Where this test keeps its single file pool under `dir`.
    pub fn pool_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}_pool", self.normalized))
    }

    pub fn require_unsafe(&self, n: usize) -> Result<()> {
        ensure!(
            self.env.ctx.unsafe_colls.len() >= n,
            "test needs {} unsafe dimm collections, {} configured",
            n,
            self.env.ctx.unsafe_colls.len()
        );
        Ok(())
    }

    pub fn require_safe(&self, n: usize) -> Result<()> {
        ensure!(
            self.env.ctx.safe_colls.len() >= n,
            "test needs {} safe dimm collections, {} configured",
            n,
            self.env.ctx.safe_colls.len()
        );
        Ok(())
    }

    pub fn unsafe_mountpoint(&self, i: usize) -> Result<PathBuf> {
        self.require_unsafe(i + 1)?;
        Ok(self.env.ctx.unsafe_colls[i].mountpoint().to_path_buf())
    }

    pub fn safe_mountpoint(&self, i: usize) -> Result<PathBuf> {
        self.require_safe(i + 1)?;
        Ok(self.env.ctx.safe_colls[i].mountpoint().to_path_buf())
    }

    /// The collections mounted at `mountpoints`, in that order.
    pub fn collections_at(
        &self,
        mountpoints: &[PathBuf],
    ) -> Result<Vec<DimmCollection>> {
        mountpoints
            .iter()
            .map(|m| {
                self.env
                    .ctx
                    .collections
                    .iter()
                    .find(|c| c.mountpoint() == m)
                    .cloned()
                    .with_context(|| format!("no dimm collection at {:?}", m))
            })
            .collect()
    }

    /// Every DIMM under `mountpoints` moved by exactly `delta` since the
    /// last recording.
    pub fn assert_usc(
        &self,
        delta: u64,
        mountpoints: &[PathBuf],
    ) -> Result<()> {
        let colls = self.collections_at(mountpoints)?;
        let bad = self.env.inject.usc_mismatches(delta, &colls);
        if !bad.is_empty() {
            let list: Vec<String> =
                bad.iter().map(ToString::to_string).collect();
            bail!("unexpected shutdown counts: {}", list.join("; "));
        }
        Ok(())
    }

    pub fn remote(&self) -> Result<&dyn RemoteNode> {
        self.env
            .ctx
            .remote
            .as_deref()
            .context("test needs a remote node, none configured")
    }

    /// Write a poolset file on the node that will hold the replica.
    pub fn create_remote_poolset(&self, rp: &RemotePoolset) -> Result<()> {
        let path = rp.poolset.full_path();
        self.remote()?
            .write_file(&path, &rp.poolset.content())
            .with_context(|| {
                format!("creating poolset file {:?} on {}", path, rp.host)
            })?;
        info!(self.log, "wrote {:?} on {}", path, rp.host);
        Ok(())
    }

    /// Every DIMM under the node's `mountpoints` went up by exactly one.
    pub fn assert_remote_usc(&self, mountpoints: &[PathBuf]) -> Result<()> {
        ensure!(
            self.remote()?.check_unsafe(mountpoints)?,
            "unsafe shutdown was not injected on remote {:?}",
            mountpoints
        );
        Ok(())
    }

    pub fn create_pool(
        &self,
        kind: PoolKind,
        path: &Path,
    ) -> Result<Box<dyn PoolHandle>> {
        let h = self
            .env
            .library
            .create(kind, path)
            .map_err(|e| with_errno(e, "pool creating failed"))?;
        info!(self.log, "created {} pool {:?}", kind, path);
        Ok(h)
    }

    /// Create a pool and fill it with the test pattern.
    pub fn create_filled_pool(
        &self,
        kind: PoolKind,
        path: &Path,
    ) -> Result<Box<dyn PoolHandle>> {
        let mut h = self.create_pool(kind, path)?;
        self.write_pattern(h.as_mut())?;
        Ok(h)
    }

    pub fn write_pattern(&self, handle: &mut dyn PoolHandle) -> Result<()> {
        write_test_pattern(handle).context("writing to pool failed")
    }

    pub fn open_pool(
        &self,
        kind: PoolKind,
        path: &Path,
    ) -> Result<Box<dyn PoolHandle>> {
        self.env
            .library
            .open(kind, path)
            .map_err(|e| with_errno(e, "pool opening failed"))
    }

    /// Opening must be refused with an invalid argument error.
    pub fn expect_open_fails(
        &mut self,
        kind: PoolKind,
        path: &Path,
    ) -> Result<()> {
        match self.env.library.open(kind, path) {
            Ok(h) => {
                self.hold(h);
                bail!("pool {:?} opened after unsafe shutdown", path)
            }
            Err(e) if e.is_invalid_argument() => {
                info!(self.log, "open refused as expected: {}", e);
                Ok(())
            }
            Err(e) => bail!("expected EINVAL opening {:?}, got {}", path, e),
        }
    }

    /// Leave `handle` to the fixture. It is closed at teardown unless the
    /// phase ends with an injection.
    pub fn hold(&mut self, handle: Box<dyn PoolHandle>) {
        self.open_pools.push(handle);
    }

    pub fn verify_data(&self, handle: &mut dyn PoolHandle) -> Result<()> {
        let got = handle.read().context("reading data from pool failed")?;
        let want = test_pattern(handle.kind());
        ensure!(
            got == want,
            "data read from pool differs from written: {:?} != {:?}",
            got,
            want
        );
        Ok(())
    }

    /// Run `pmempool` and require the given exit code.
    pub fn pmempool(
        &self,
        args: &[&str],
        expected: i32,
    ) -> Result<CommandOutput> {
        let out = self.env.library.pmempool(args)?;
        if out.exit_code != expected {
            error!(self.log, "pmempool {}: {}", args.join(" "), out);
            bail!(
                "pmempool {}: expected exit code {}, got {}",
                args.join(" "),
                expected,
                out
            );
        }
        Ok(out)
    }

    pub fn repair(&self, path: &Path) -> Result<()> {
        self.pmempool(&["check", "-ry", &path.to_string_lossy()], 0)?;
        Ok(())
    }

    pub fn sync(&self, path: &Path, expected: i32) -> Result<()> {
        self.pmempool(&["sync", &path.to_string_lossy()], expected)?;
        Ok(())
    }

    pub fn transform(
        &self,
        src: &Path,
        dst: &Path,
        expected: i32,
    ) -> Result<()> {
        self.pmempool(
            &["transform", &src.to_string_lossy(), &dst.to_string_lossy()],
            expected,
        )?;
        Ok(())
    }

    pub fn write_poolset(&self, poolset: &Poolset) -> Result<()> {
        poolset.write_file().with_context(|| {
            format!("creating poolset file {:?}", poolset.full_path())
        })?;
        ensure!(
            poolset.file_exists(),
            "poolset file {:?} does not exist",
            poolset.full_path()
        );
        Ok(())
    }

    /// Write the poolset file and create an object pool from it.
    pub fn create_poolset_pool(&self, poolset: &Poolset) -> Result<()> {
        self.write_poolset(poolset)?;
        self.pmempool(
            &["create", "obj", &poolset.full_path().to_string_lossy()],
            0,
        )?;
        Ok(())
    }

    pub fn move_pool(&self, src: &Path, dst: &Path) -> Result<()> {
        let out = shell::run("mv", [src, dst])?;
        ensure!(out.success(), "moving {:?} to {:?} failed: {}", src, dst, out);
        Ok(())
    }

    /// Stamp the passed marker, then close whatever is still open unless
    /// the process is about to go down with its pools dirty.
    fn tear_down(&mut self, passed: bool) -> Result<()> {
        let res = self.marker.stamp(passed);
        let pools = std::mem::take(&mut self.open_pools);
        if self.env.ctx.has_inject_at_end() {
            drop(pools);
        } else {
            for p in pools {
                let path = p.path().to_path_buf();
                if let Err(e) = p.close() {
                    warn!(self.log, "closing {:?}: {}", path, e);
                }
            }
        }
        res
    }
}
