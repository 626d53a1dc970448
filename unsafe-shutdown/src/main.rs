// Copyright 2023 Oxide Computer Company
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use ras_common::status::{FAILURE, SUCCESS};
use ras_common::{
    build_logger, phase_filter, LocalConfig, Phase, PostAction, TestFilter,
};
use ras_dimm::{collections_from_config, DimmCollection};
use slog::{error, Logger};

mod cases;
mod marker;
mod phase;
mod remote;
mod runner;

use phase::{execute_phase, PhaseContext, TestPhaseController};
use remote::node_from_config;

/// One phase of the unsafe shutdown tests, run on the machine under test.
#[derive(Debug, Parser)]
#[clap(name = "unsafe-shutdown", term_width = 80)]
#[clap(
    about = "Unsafe shutdown tests for persistent memory pools",
    long_about = None
)]
struct Args {
    /// Test configuration: DIMM collections, test directory, tools and
    /// the remote replica node.
    #[clap(
        long,
        short,
        global = true,
        env = "US_CONFIG",
        default_value = "config.toml",
        action
    )]
    config: PathBuf,

    #[clap(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Run the tests of one phase, then the post action.
    Run {
        /// `N` or `phase_N`. Phase 1 sets up, later phases first check
        /// the shutdown counters.
        phase: Phase,

        /// `inject` ends the phase with an unsafe shutdown injection,
        /// `cleanup` removes everything the tests left behind.
        #[clap(default_value = "cleanup")]
        post_action: PostAction,

        /// gtest style filter, narrowed to the tests of this phase.
        #[clap(long = "gtest_filter", default_value = "*", action)]
        gtest_filter: String,
    },
    /// Remove the test directory and empty every mountpoint.
    Cleanup,
    /// Print the names of the tests a run would execute.
    List {
        phase: Option<Phase>,

        #[clap(long = "gtest_filter", default_value = "*", action)]
        gtest_filter: String,
    },
}

fn load(
    config: &Path,
    log: &Logger,
) -> Result<(LocalConfig, Vec<DimmCollection>)> {
    let cfg = LocalConfig::load(config)?;
    let colls = collections_from_config(&cfg.devices, log)?;
    Ok((cfg, colls))
}

fn run_action(config: &Path, action: Action, log: &Logger) -> i32 {
    let (cfg, colls) = match load(config, log) {
        Ok(c) => c,
        Err(e) => {
            error!(log, "{:?}: {:#}", config, e);
            return FAILURE;
        }
    };
    let remote = node_from_config(cfg.remote.as_ref(), log);

    match action {
        Action::Run {
            phase,
            post_action,
            gtest_filter,
        } => execute_phase(
            &cfg,
            colls,
            remote,
            phase,
            post_action,
            &gtest_filter,
            log,
        ),
        Action::Cleanup => {
            let ctx = PhaseContext::new(
                Phase::FIRST,
                PostAction::Cleanup,
                cfg.test_dir.clone(),
                colls,
            )
            .with_remote(remote);
            match TestPhaseController::new(ctx, log.clone()).cleanup() {
                Ok(()) => SUCCESS,
                Err(e) => {
                    error!(log, "{:#}", e);
                    FAILURE
                }
            }
        }
        Action::List {
            phase,
            gtest_filter,
        } => {
            let ctx = PhaseContext::new(
                phase.unwrap_or(Phase::FIRST),
                PostAction::Cleanup,
                cfg.test_dir.clone(),
                colls,
            )
            .with_remote(remote);
            let filter = match phase {
                Some(p) => TestFilter::parse(&phase_filter(&gtest_filter, p)),
                None => TestFilter::parse(&gtest_filter),
            };
            for case in cases::all_cases(&ctx.inventory()) {
                if filter.matches(&case.name) {
                    println!("{}", case.name);
                }
            }
            SUCCESS
        }
    }
}

fn main() {
    let args = Args::parse();
    let log = build_logger();
    let code = run_action(&args.config, args.action, &log);
    std::process::exit(code);
}
