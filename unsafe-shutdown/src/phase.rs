// Copyright 2023 Oxide Computer Company
//! What runs around the tests of one phase.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ras_common::status::{DIMM_OPERATION_FAILED, FAILURE, RETURN_CODE_LINE};
use ras_common::{phase_filter, LocalConfig, Phase, PostAction, TestFilter};
use ras_dimm::{Designation, DimmCollection, InjectManager};
use ras_pool::{library_from_config, DeviceInventory};
use slog::{error, info, o, warn, Logger};
use strum::Display;

use crate::cases;
use crate::remote::RemoteNode;
use crate::runner::{run_tests, TestEnv};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ExecutionAction {
    Setup,
    CheckUsc,
    Inject,
    CleanUp,
}

/// Everything the tests of one process invocation share.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub phase: Phase,
    pub pre_action: ExecutionAction,
    pub post_action: ExecutionAction,
    pub test_dir: PathBuf,
    /// All collections, configuration order.
    pub collections: Vec<DimmCollection>,
    pub unsafe_colls: Vec<DimmCollection>,
    pub safe_colls: Vec<DimmCollection>,
    /// The node holding remote replicas, if one is configured.
    pub remote: Option<Arc<dyn RemoteNode>>,
}

impl PhaseContext {
    pub fn new(
        phase: Phase,
        post: PostAction,
        test_dir: PathBuf,
        collections: Vec<DimmCollection>,
    ) -> Self {
        let Designation {
            unsafe_colls,
            safe_colls,
        } = Designation::from_collections(&collections);
        PhaseContext {
            phase,
            pre_action: if phase.is_first() {
                ExecutionAction::Setup
            } else {
                ExecutionAction::CheckUsc
            },
            post_action: match post {
                PostAction::Inject => ExecutionAction::Inject,
                PostAction::Cleanup => ExecutionAction::CleanUp,
            },
            test_dir,
            collections,
            unsafe_colls,
            safe_colls,
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: Option<Arc<dyn RemoteNode>>) -> Self {
        self.remote = remote;
        self
    }

    pub fn has_inject_at_end(&self) -> bool {
        self.post_action == ExecutionAction::Inject
    }

    pub fn inventory(&self) -> DeviceInventory {
        let mounts = |c: &[DimmCollection]| {
            c.iter().map(|c| c.mountpoint().to_path_buf()).collect()
        };
        DeviceInventory {
            unsafe_mountpoints: mounts(&self.unsafe_colls),
            safe_mountpoints: mounts(&self.safe_colls),
            non_dimm_dir: self.test_dir.clone(),
            remote: self.remote.as_ref().map(|n| n.inventory()),
        }
    }
}

pub struct TestPhaseController {
    ctx: PhaseContext,
    inject: InjectManager,
    log: Logger,
}

impl TestPhaseController {
    pub fn new(ctx: PhaseContext, log: Logger) -> Self {
        let log = log.new(o!("phase" => ctx.phase.name()));
        TestPhaseController {
            inject: InjectManager::new(&ctx.test_dir, log.clone()),
            ctx,
            log,
        }
    }

    /// Run the pre-action. If it fails, clean up before returning the
    /// error; no test should run after that.
    pub fn run_pre_test_action(&self) -> Result<()> {
        info!(self.log, "pre-test action {}", self.ctx.pre_action);
        let res = self.run_action(self.ctx.pre_action);
        if let Err(e) = &res {
            error!(self.log, "{} failed: {:#}", self.ctx.pre_action, e);
            if let Err(e) = self.cleanup() {
                warn!(self.log, "cleanup: {:#}", e);
            }
        }
        res
    }

    pub fn run_post_test_action(&self) -> Result<()> {
        info!(self.log, "post-test action {}", self.ctx.post_action);
        self.run_action(self.ctx.post_action)
    }

    fn run_action(&self, action: ExecutionAction) -> Result<()> {
        match action {
            ExecutionAction::Setup => self.setup(),
            ExecutionAction::CheckUsc => self.check_usc(),
            ExecutionAction::Inject => self.inject(),
            ExecutionAction::CleanUp => self.cleanup(),
        }
    }

    fn setup(&self) -> Result<()> {
        std::fs::create_dir_all(&self.ctx.test_dir)
            .with_context(|| format!("create {:?}", self.ctx.test_dir))?;
        for c in self.ctx.collections.iter() {
            std::fs::create_dir_all(c.mountpoint())
                .with_context(|| format!("create {:?}", c.mountpoint()))?;
        }
        if let Some(node) = &self.ctx.remote {
            node.setup().context("remote node setup")?;
        }
        Ok(())
    }

    fn check_usc(&self) -> Result<()> {
        let safe = self.inject.is_usc_increased_by(0, &self.ctx.safe_colls);
        let unsafe_ =
            self.inject.is_usc_increased_by(1, &self.ctx.unsafe_colls);
        if !safe {
            bail!("shutdown count changed on a DIMM that was not injected");
        }
        if !unsafe_ {
            bail!("shutdown count did not go up by one on an injected DIMM");
        }
        Ok(())
    }

    fn inject(&self) -> Result<()> {
        self.inject.record_usc_all(&self.ctx.collections)?;
        self.inject.inject_all(&self.ctx.unsafe_colls)?;
        if let Some(node) = &self.ctx.remote {
            let mounts = node.inventory().unsafe_mountpoints;
            if !mounts.is_empty() {
                node.inject(&mounts).context("remote node inject")?;
            }
        }
        Ok(())
    }

    /// Remove the test directory and whatever the tests left on the
    /// mountpoints. Keeps going past errors.
    pub fn cleanup(&self) -> Result<()> {
        let mut failed = Vec::new();
        if self.ctx.test_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.ctx.test_dir) {
                failed.push(format!("{:?}: {}", self.ctx.test_dir, e));
            }
        }
        for c in self.ctx.collections.iter() {
            if let Err(e) = empty_dir(c.mountpoint()) {
                failed.push(format!("{:?}: {:#}", c.mountpoint(), e));
            }
        }
        if let Some(node) = &self.ctx.remote {
            if let Err(e) = node.cleanup() {
                failed.push(format!("remote node: {:#}", e));
            }
        }
        if !failed.is_empty() {
            bail!("cleanup left {}", failed.join(", "));
        }
        Ok(())
    }
}

fn empty_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Run one phase start to end and return the process exit code.
pub fn execute_phase(
    cfg: &LocalConfig,
    collections: Vec<DimmCollection>,
    remote: Option<Arc<dyn RemoteNode>>,
    phase: Phase,
    post: PostAction,
    filter: &str,
    log: &Logger,
) -> i32 {
    let ctx = PhaseContext::new(phase, post, cfg.test_dir.clone(), collections)
        .with_remote(remote);
    let controller = TestPhaseController::new(ctx.clone(), log.clone());

    if controller.run_pre_test_action().is_err() {
        println!("{} {}", RETURN_CODE_LINE, FAILURE);
        return FAILURE;
    }

    let mut visible = ctx.collections.clone();
    if let Some(node) = &ctx.remote {
        match node.visible_collections(log) {
            Ok(c) => visible.extend(c),
            Err(e) => warn!(log, "remote node dimms: {:#}", e),
        }
    }
    let library = library_from_config(&cfg.tools, &visible, log);
    let cases = cases::all_cases(&ctx.inventory());
    let filter = TestFilter::parse(&phase_filter(filter, phase));
    let env = TestEnv::new(ctx, library, log.clone());
    let report = run_tests(&cases, &filter, &env);

    let mut code = report.status().exit_code();
    if let Err(e) = controller.run_post_test_action() {
        if post == PostAction::Inject {
            error!(log, "inject failed: {:#}", e);
            code = DIMM_OPERATION_FAILED;
        } else {
            warn!(log, "cleanup failed: {:#}", e);
        }
    }
    println!("{} {}", RETURN_CODE_LINE, code);
    code
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::remote::test_util::InProcessNode;
    use ras_common::discard_logger;
    use ras_dimm::{Dimm, EmulatedDimm};
    use ras_pool::RemoteInventory;
    use tempfile::tempdir;

    fn colls(root: &Path, n: usize) -> Vec<DimmCollection> {
        (0..n)
            .map(|i| {
                DimmCollection::new(
                    root.join(format!("pmem{}", i)),
                    vec![Arc::new(EmulatedDimm::new(
                        &root.join("emu"),
                        &format!("nmem{}", i),
                    )) as Arc<dyn Dimm>],
                )
            })
            .collect()
    }

    fn controller(
        phase: u32,
        post: PostAction,
        t: &Path,
        c: &[DimmCollection],
    ) -> TestPhaseController {
        let phase = Phase::new(phase).unwrap();
        let ctx = PhaseContext::new(phase, post, t.to_path_buf(), c.to_vec());
        TestPhaseController::new(ctx, discard_logger())
    }

    #[test]
    fn actions_follow_phase_and_post_action() {
        let dir = tempdir().unwrap();
        let c = colls(dir.path(), 3);
        let t = dir.path().join("t");
        let post = PostAction::Inject;
        let first = PhaseContext::new(Phase::FIRST, post, t.clone(), c.clone());
        assert_eq!(first.pre_action, ExecutionAction::Setup);
        assert_eq!(first.post_action, ExecutionAction::Inject);
        assert!(first.has_inject_at_end());
        assert_eq!(first.unsafe_colls.len(), 2);
        assert_eq!(first.safe_colls.len(), 1);

        let phase = Phase::new(3).unwrap();
        let last = PhaseContext::new(phase, PostAction::Cleanup, t, c);
        assert_eq!(last.pre_action, ExecutionAction::CheckUsc);
        assert_eq!(last.post_action, ExecutionAction::CleanUp);
        assert!(!last.has_inject_at_end());

        let inv = last.inventory();
        assert_eq!(
            inv.unsafe_mountpoints,
            vec![dir.path().join("pmem0"), dir.path().join("pmem2")]
        );
        assert_eq!(inv.safe_mountpoints, vec![dir.path().join("pmem1")]);
        assert_eq!(inv.non_dimm_dir, dir.path().join("t"));
    }

    #[test]
    fn inject_then_check() {
        let dir = tempdir().unwrap();
        let c = colls(dir.path(), 2);
        let t = dir.path().join("t");

        let p1 = controller(1, PostAction::Inject, &t, &c);
        p1.run_pre_test_action().unwrap();
        assert!(t.is_dir());
        assert!(dir.path().join("pmem1").is_dir());
        p1.run_post_test_action().unwrap();

        let p2 = controller(2, PostAction::Cleanup, &t, &c);
        p2.run_pre_test_action().unwrap();
        let leftover = dir.path().join("pmem0").join("leftover");
        std::fs::write(&leftover, b"x").unwrap();
        p2.run_post_test_action().unwrap();
        assert!(!t.exists());
        assert!(dir.path().join("pmem0").is_dir());
        assert!(!leftover.exists());
    }

    #[test]
    fn failed_check_cleans_up() {
        let dir = tempdir().unwrap();
        let c = colls(dir.path(), 2);
        let t = dir.path().join("t");
        std::fs::create_dir_all(&t).unwrap();

        // Nothing was recorded, so there is nothing to compare against.
        let p2 = controller(2, PostAction::Inject, &t, &c);
        assert!(p2.run_pre_test_action().is_err());
        assert!(!t.exists());
    }

    #[test]
    fn missed_injection_fails_check() {
        let dir = tempdir().unwrap();
        let c = colls(dir.path(), 2);
        let t = dir.path().join("t");
        let p1 = controller(1, PostAction::Inject, &t, &c);
        p1.run_pre_test_action().unwrap();
        p1.run_post_test_action().unwrap();

        // A second injection before the check: the count is now +2.
        for d in c[0].iter() {
            d.inject_unsafe_shutdown().unwrap();
        }
        let p2 = controller(2, PostAction::Inject, &t, &c);
        assert!(p2.run_pre_test_action().is_err());
    }

    fn remote_node(root: &Path, unsafe_mount: &str) -> Arc<InProcessNode> {
        let colls = (0..2)
            .map(|i| {
                DimmCollection::new(
                    root.join(format!("rpmem{}", i)),
                    vec![Arc::new(EmulatedDimm::new(
                        &root.join("remu"),
                        &format!("rnmem{}", i),
                    )) as Arc<dyn Dimm>],
                )
            })
            .collect();
        Arc::new(InProcessNode {
            inventory: RemoteInventory {
                host: "node-2".to_string(),
                unsafe_mountpoints: vec![root.join(unsafe_mount)],
                safe_mountpoints: vec![root.join("rpmem1")],
                non_dimm_dir: root.join("rtest"),
            },
            colls,
            inject: InjectManager::new(root.join("rtest"), discard_logger()),
        })
    }

    #[test]
    fn remote_node_follows_the_phase() {
        let dir = tempdir().unwrap();
        let c = colls(dir.path(), 2);
        let t = dir.path().join("t");
        let node = remote_node(dir.path(), "rpmem0");
        let remote = Some(node.clone() as Arc<dyn RemoteNode>);
        let ctx = |phase: u32, post: PostAction| {
            let phase = Phase::new(phase).unwrap();
            PhaseContext::new(phase, post, t.clone(), c.clone())
                .with_remote(remote.clone())
        };

        let inv = ctx(1, PostAction::Inject).inventory();
        let rinv = inv.remote.unwrap();
        assert_eq!(rinv.host, "node-2");
        assert_eq!(rinv.unsafe_mountpoints, vec![dir.path().join("rpmem0")]);

        let p1 = TestPhaseController::new(
            ctx(1, PostAction::Inject),
            discard_logger(),
        );
        p1.run_pre_test_action().unwrap();
        assert!(dir.path().join("rtest").is_dir());
        assert!(dir.path().join("rpmem1").is_dir());
        p1.run_post_test_action().unwrap();
        let (r0, r1) = (dir.path().join("rpmem0"), dir.path().join("rpmem1"));
        assert!(node.check_unsafe(&[r0.clone()]).unwrap());
        // Never recorded, never injected.
        assert!(!node.check_unsafe(&[r1]).unwrap());

        let p2 = TestPhaseController::new(
            ctx(2, PostAction::Cleanup),
            discard_logger(),
        );
        p2.run_pre_test_action().unwrap();
        std::fs::write(r0.join("remote_pool.set"), "x").unwrap();
        p2.run_post_test_action().unwrap();
        assert!(!dir.path().join("rtest").exists());
        assert_eq!(std::fs::read_dir(&r0).unwrap().count(), 0);
    }

    #[test]
    fn failed_remote_inject_fails_the_post_action() {
        let dir = tempdir().unwrap();
        let c = colls(dir.path(), 2);
        let t = dir.path().join("t");
        let node = remote_node(dir.path(), "not-a-mountpoint");
        let ctx = PhaseContext::new(
            Phase::FIRST,
            PostAction::Inject,
            t,
            c.clone(),
        )
        .with_remote(Some(node as Arc<dyn RemoteNode>));
        let p1 = TestPhaseController::new(ctx, discard_logger());
        p1.run_pre_test_action().unwrap();
        assert!(p1.run_post_test_action().is_err());
        // The local DIMMs were injected first.
        assert_eq!(c[0].iter().next().unwrap().shutdown_count().unwrap(), 1);
    }
}
