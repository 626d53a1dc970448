// Copyright 2023 Oxide Computer Company
//! Talking to one device under test.
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use ras_common::shell::{execute_async, run_async, ssh_args};
use ras_common::status::CONNECTION_ERROR;
use ras_common::{CommandOutput, DutConfig};
use slog::{debug, o, Logger};
use tokio::time::{sleep, Duration, Instant};

/// Interval between two reachability checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait Dut: Send + Sync {
    fn address(&self) -> &str;

    /// Where the test binary lives on the DUT.
    fn bin_dir(&self) -> &Path;

    /// Config path on the DUT to hand to the test binary.
    fn config(&self) -> Option<&Path>;

    /// Run `cmd` on the DUT. An exit code of 255 means the connection
    /// failed or dropped, not that the command did.
    async fn execute(&self, cmd: &str) -> Result<CommandOutput>;

    async fn power_cycle(&self) -> Result<CommandOutput>;

    /// Poll with a no-op command once a second until one gets through or
    /// `timeout` has passed.
    async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(out) = self.execute(":").await {
                if out.exit_code != CONNECTION_ERROR {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

/// A DUT reached with the system `ssh`, power cycled by a local command.
#[derive(Debug)]
pub struct SshDut {
    cfg: DutConfig,
    log: Logger,
}

impl SshDut {
    pub fn new(cfg: DutConfig, log: &Logger) -> Self {
        let log = log.new(o!("dut" => cfg.address.clone()));
        SshDut { cfg, log }
    }
}

#[async_trait]
impl Dut for SshDut {
    fn address(&self) -> &str {
        &self.cfg.address
    }

    fn bin_dir(&self) -> &Path {
        &self.cfg.bin_dir
    }

    fn config(&self) -> Option<&Path> {
        self.cfg.config.as_deref()
    }

    async fn execute(&self, cmd: &str) -> Result<CommandOutput> {
        debug!(self.log, "ssh {}", cmd);
        let args = ssh_args(&self.cfg.address, &self.cfg.ssh_options, cmd);
        run_async("ssh", args).await
    }

    async fn power_cycle(&self) -> Result<CommandOutput> {
        debug!(self.log, "power cycle: {}", self.cfg.power_cycle);
        execute_async(&self.cfg.power_cycle).await
    }
}

/// The test binary on `dut`, with its config if one is set.
pub fn test_binary_command(dut: &dyn Dut, test_binary: &str) -> String {
    let bin: PathBuf = dut.bin_dir().join(test_binary);
    match dut.config() {
        Some(c) => format!("{} --config {}", bin.display(), c.display()),
        None => bin.display().to_string(),
    }
}
