// Copyright 2023 Oxide Computer Company
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ras_common::status::FAILURE;
use ras_common::{build_logger, ControllerConfig, RunStatus};
use slog::{error, info, Logger};
use tokio::runtime::Builder;
use tokio::time::Duration;

pub mod client;
pub mod control;
use client::{Dut, SshDut};
use control::RemoteExecutionController;

/// Drives the unsafe shutdown tests on remote machines, power cycling
/// them between phases.
#[derive(Debug, Parser)]
#[clap(name = "us-controller", term_width = 80)]
#[clap(about = "Unsafe shutdown test controller", long_about = None)]
struct Args {
    /// DUTs and the test binary to run on them.
    #[clap(
        long,
        short,
        global = true,
        env = "US_CONTROLLER_CONFIG",
        default_value = "controller.toml",
        action
    )]
    config: PathBuf,

    #[clap(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Run every phase, with a power cycle after each but the last.
    Run {
        /// gtest style filter handed to each phase.
        #[clap(long, default_value = "*", action)]
        filter: String,

        #[clap(long, default_value = "3", action)]
        phases: u32,

        /// How long the DUTs get to answer before the first phase.
        #[clap(
            long,
            default_value = "15s",
            value_parser = humantime::parse_duration
        )]
        connect_timeout: Duration,

        /// How long the DUTs get to come back after a power cycle.
        #[clap(
            long,
            default_value = "15m",
            value_parser = humantime::parse_duration
        )]
        reboot_timeout: Duration,
    },
    /// Power cycle every DUT.
    PowerCycle,
    /// Wait until every DUT answers.
    Wait {
        #[clap(
            long,
            default_value = "15s",
            value_parser = humantime::parse_duration
        )]
        timeout: Duration,
    },
}

async fn run_action(
    ctl: RemoteExecutionController,
    action: Action,
    log: &Logger,
) -> Result<RunStatus> {
    match action {
        Action::Run {
            filter,
            phases,
            connect_timeout,
            reboot_timeout,
        } => {
            let ctl = ctl.with_timeouts(connect_timeout, reboot_timeout);
            let status = ctl.run(&filter, phases).await?;
            info!(log, "tests {}", status);
            Ok(status)
        }
        Action::PowerCycle => {
            anyhow::ensure!(ctl.run_power_cycle().await, "power cycle failed");
            Ok(RunStatus::Passed)
        }
        Action::Wait { timeout } => {
            anyhow::ensure!(
                ctl.wait_for_duts_connection(timeout).await,
                "DUTs not reachable"
            );
            Ok(RunStatus::Passed)
        }
    }
}

fn controller(args: &Args, log: &Logger) -> Result<RemoteExecutionController> {
    let cfg = ControllerConfig::load(&args.config)?;
    let duts = cfg
        .duts
        .into_iter()
        .map(|d| Arc::new(SshDut::new(d, log)) as Arc<dyn Dut>)
        .collect();
    RemoteExecutionController::new(duts, &cfg.test_binary, log.clone())
}

fn main() {
    let args = Args::parse();
    let log = build_logger();

    let code = match controller(&args, &log) {
        Ok(ctl) => {
            let runtime = Builder::new_multi_thread()
                .thread_name("us-controller")
                .enable_all()
                .build();
            match runtime {
                Ok(rt) => {
                    match rt.block_on(run_action(ctl, args.action, &log)) {
                        Ok(status) => status.exit_code(),
                        Err(e) => {
                            error!(log, "{:#}", e);
                            FAILURE
                        }
                    }
                }
                Err(e) => {
                    error!(log, "tokio runtime: {}", e);
                    FAILURE
                }
            }
        }
        Err(e) => {
            error!(log, "{:?}: {:#}", args.config, e);
            FAILURE
        }
    };
    std::process::exit(code);
}
