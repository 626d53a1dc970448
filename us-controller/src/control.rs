// Copyright 2023 Oxide Computer Company
//! Driving every phase of the tests across the DUTs.
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use futures::future::join_all;
use ras_common::shell::quote;
use ras_common::status::{parse_return_code, CONNECTION_ERROR, FAILURE};
use ras_common::{phase_filter, CommandOutput, Phase, PostAction, RunStatus};
use slog::{error, info, warn, Logger};
use tokio::time::Duration;

use crate::client::{test_binary_command, Dut};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_REBOOT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub struct RemoteExecutionController {
    /// The first one runs the tests, all of them get power cycled.
    duts: Vec<Arc<dyn Dut>>,
    test_binary: String,
    connect_timeout: Duration,
    reboot_timeout: Duration,
    log: Logger,
}

impl RemoteExecutionController {
    pub fn new(
        duts: Vec<Arc<dyn Dut>>,
        test_binary: &str,
        log: Logger,
    ) -> Result<Self> {
        ensure!(!duts.is_empty(), "no DUT to run on");
        Ok(RemoteExecutionController {
            duts,
            test_binary: test_binary.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reboot_timeout: DEFAULT_REBOOT_TIMEOUT,
            log,
        })
    }

    pub fn with_timeouts(
        mut self,
        connect: Duration,
        reboot: Duration,
    ) -> Self {
        self.connect_timeout = connect;
        self.reboot_timeout = reboot;
        self
    }

    fn primary(&self) -> &Arc<dyn Dut> {
        &self.duts[0]
    }

    /// The filter goes through the DUT's shell as one quoted word.
    pub fn phase_command(
        &self,
        dut: &dyn Dut,
        phase: Phase,
        post: PostAction,
        filter: &str,
    ) -> String {
        format!(
            "{} run {} {} --gtest_filter={}",
            test_binary_command(dut, &self.test_binary),
            phase.number(),
            post,
            quote(&phase_filter(filter, phase))
        )
    }

    /// Run one phase of the tests on the primary DUT.
    pub async fn phase_execute(
        &self,
        phase: Phase,
        post: PostAction,
        filter: &str,
    ) -> Result<CommandOutput> {
        let dut = self.primary();
        let cmd = self.phase_command(dut.as_ref(), phase, post, filter);
        info!(self.log, "{}: {}", dut.address(), cmd);
        dut.execute(&cmd).await
    }

    /// Power cycle every DUT at once. Every command is issued and finished
    /// before any result is looked at.
    pub async fn run_power_cycle(&self) -> bool {
        let tasks = self.duts.iter().map(|d| {
            let d = Arc::clone(d);
            tokio::spawn(async move { d.power_cycle().await })
        });
        let results = join_all(tasks).await;

        let mut ok = true;
        for (dut, res) in self.duts.iter().zip(results) {
            let addr = dut.address();
            match res {
                Ok(Ok(out)) if out.success() => {
                    info!(self.log, "{}: power cycled", addr);
                }
                Ok(Ok(out)) => {
                    error!(self.log, "{}: power cycle failed: {}", addr, out);
                    ok = false;
                }
                Ok(Err(e)) => {
                    error!(self.log, "{}: power cycle failed: {:#}", addr, e);
                    ok = false;
                }
                Err(e) => {
                    error!(self.log, "{}: power cycle task: {}", addr, e);
                    ok = false;
                }
            }
        }
        ok
    }

    /// True once every DUT answered within `timeout`.
    pub async fn wait_for_duts_connection(&self, timeout: Duration) -> bool {
        let tasks = self.duts.iter().map(|d| {
            let d = Arc::clone(d);
            tokio::spawn(async move { d.wait_for_connection(timeout).await })
        });
        let results = join_all(tasks).await;

        let mut ok = true;
        for (dut, res) in self.duts.iter().zip(results) {
            if !matches!(res, Ok(true)) {
                error!(
                    self.log,
                    "{}: not reachable within {}",
                    dut.address(),
                    humantime::format_duration(timeout)
                );
                ok = false;
            }
        }
        ok
    }

    /// The status a phase reported. A phase that injected may take the
    /// connection down with it, then the code is read from its output.
    fn phase_status(
        &self,
        phase: Phase,
        post: PostAction,
        out: &CommandOutput,
    ) -> RunStatus {
        let dropped = out.exit_code == CONNECTION_ERROR;
        let code = if post == PostAction::Inject && dropped {
            match parse_return_code(&out.content) {
                Some(c) => c,
                None => {
                    warn!(
                        self.log,
                        "{}: connection lost before the tests reported", phase
                    );
                    FAILURE
                }
            }
        } else {
            out.exit_code
        };
        RunStatus::from_exit_code(code)
    }

    /// Run `phases` phases of the tests selected by `filter`, power
    /// cycling between them, then clean up every DUT.
    pub async fn run(&self, filter: &str, phases: u32) -> Result<RunStatus> {
        ensure!(phases >= 2, "need at least two phases, got {}", phases);
        ensure!(
            self.wait_for_duts_connection(self.connect_timeout).await,
            "DUTs not reachable"
        );

        let res = self.run_phases(filter, phases).await;
        self.teardown().await;
        res
    }

    async fn run_phases(&self, filter: &str, phases: u32) -> Result<RunStatus> {
        let mut overall = RunStatus::Passed;
        let mut phase = Phase::FIRST;
        loop {
            let last = phase.number() >= phases;
            let post = if last {
                PostAction::Cleanup
            } else {
                PostAction::Inject
            };
            let out = self.phase_execute(phase, post, filter).await?;
            let status = self.phase_status(phase, post, &out);
            info!(self.log, "{}: {}", phase, status);
            match status {
                RunStatus::Passed => {}
                RunStatus::PartiallyPassed => {
                    warn!(
                        self.log,
                        "{}: some tests failed:\n{}", phase, out.content
                    );
                    overall = RunStatus::PartiallyPassed;
                }
                RunStatus::DimmOperationFailed => {
                    bail!("{}: DIMM operation failed, {}", phase, out);
                }
                RunStatus::Failed => {
                    bail!("{}: all tests failed, {}", phase, out);
                }
            }
            if last {
                return Ok(overall);
            }

            ensure!(self.run_power_cycle().await, "power cycle failed");
            ensure!(
                self.wait_for_duts_connection(self.reboot_timeout).await,
                "DUTs did not come back after the power cycle"
            );
            phase = phase.next();
        }
    }

    /// Best effort `cleanup` on every DUT.
    pub async fn teardown(&self) {
        for dut in self.duts.iter() {
            let bin = test_binary_command(dut.as_ref(), &self.test_binary);
            let addr = dut.address();
            match dut.execute(&format!("{} cleanup", bin)).await {
                Ok(out) if out.success() => {}
                Ok(out) => warn!(self.log, "{}: cleanup: {}", addr, out),
                Err(e) => warn!(self.log, "{}: cleanup: {:#}", addr, e),
            }
        }
    }
}
