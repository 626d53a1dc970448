// Copyright 2023 Oxide Computer Company
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use ras_common::status::{DIMM_OPERATION_FAILED, FAILURE, SUCCESS};
use ras_common::{build_logger, LocalConfig};
use ras_dimm::{
    collections_from_config, discover_dimms, Dimm, DimmCollection,
    DimmError, InjectManager, NdctlDimm,
};
use slog::{error, info, Logger};
use thiserror::Error;

/// Record, inject and verify DIMM unsafe shutdown counters by hand.
#[derive(Debug, Parser)]
#[clap(name = "us-injecter", term_width = 80)]
#[clap(about = "Inject and verify DIMM unsafe shutdowns", long_about = None)]
struct Args {
    /// Config describing the DIMMs. Without one, the DIMMs behind each
    /// mountpoint are discovered with ndctl.
    #[clap(long, short, global = true, env = "US_CONFIG", action)]
    config: Option<PathBuf>,

    /// Directory holding the counter records, defaults to the first
    /// mountpoint.
    #[clap(long, global = true, action)]
    test_dir: Option<PathBuf>,

    #[clap(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Record the counters, then inject an unsafe shutdown into every DIMM.
    Inject {
        #[clap(required = true)]
        mountpoints: Vec<PathBuf>,
    },
    /// Verify the counters did not change since the last inject.
    CheckSafe {
        #[clap(required = true)]
        mountpoints: Vec<PathBuf>,
    },
    /// Verify the counters went up by exactly one since the last inject.
    CheckUnsafe {
        #[clap(required = true)]
        mountpoints: Vec<PathBuf>,
    },
}

fn collections(
    config: Option<&PathBuf>,
    mountpoints: &[PathBuf],
    log: &Logger,
) -> Result<Vec<DimmCollection>> {
    if let Some(path) = config {
        let cfg = LocalConfig::load(path)?;
        let all = collections_from_config(&cfg.devices, log)?;
        let mut out = Vec::new();
        for m in mountpoints {
            match all.iter().find(|c| c.mountpoint() == m.as_path()) {
                Some(c) => out.push(c.clone()),
                None => bail!("{:?} is not configured in {:?}", m, path),
            }
        }
        return Ok(out);
    }

    let mut out = Vec::new();
    for m in mountpoints {
        let mut dimms: Vec<Arc<dyn Dimm>> = Vec::new();
        for dev in discover_dimms(m)? {
            dimms.push(Arc::new(NdctlDimm::open(&dev)?));
        }
        out.push(DimmCollection::new(m, dimms));
    }
    Ok(out)
}

#[derive(Debug, Error)]
enum InjecterError {
    /// Recording or injecting a counter failed.
    #[error("dimm operation failed: {0}")]
    Dimm(DimmError),
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

impl InjecterError {
    fn exit_code(&self) -> i32 {
        match self {
            InjecterError::Dimm(_) => DIMM_OPERATION_FAILED,
            InjecterError::Setup(_) => FAILURE,
        }
    }
}

/// `Ok(false)` when the counters do not match what the action expects.
fn run(args: Args, log: &Logger) -> Result<bool, InjecterError> {
    let mountpoints = match &args.action {
        Action::Inject { mountpoints }
        | Action::CheckSafe { mountpoints }
        | Action::CheckUnsafe { mountpoints } => mountpoints.clone(),
    };
    let colls = collections(args.config.as_ref(), &mountpoints, log)?;
    let test_dir = args
        .test_dir
        .clone()
        .unwrap_or_else(|| mountpoints[0].clone());
    let im = InjectManager::new(test_dir, log.clone());

    match args.action {
        Action::Inject { .. } => {
            im.record_usc_all(&colls).map_err(InjecterError::Dimm)?;
            im.inject_all(&colls).map_err(InjecterError::Dimm)?;
            info!(log, "injected {} collection(s)", colls.len());
            Ok(true)
        }
        Action::CheckSafe { .. } => Ok(im.is_usc_increased_by(0, &colls)),
        Action::CheckUnsafe { .. } => Ok(im.is_usc_increased_by(1, &colls)),
    }
}

fn exit_code(args: Args, log: &Logger) -> i32 {
    match run(args, log) {
        Ok(true) => SUCCESS,
        Ok(false) => {
            error!(log, "shutdown counters do not match");
            FAILURE
        }
        Err(e) => {
            error!(log, "{:#}", e);
            e.exit_code()
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let log = build_logger();
    ExitCode::from(exit_code(args, &log) as u8)
}

#[cfg(test)]
mod test {
    use super::*;
    use ras_common::discard_logger;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    /// Two emulated mountpoints and the config naming them.
    struct Rig {
        dir: TempDir,
        config: PathBuf,
    }

    impl Rig {
        fn path(&self, name: &str) -> String {
            self.dir.path().join(name).display().to_string()
        }

        fn injecter(&self, args: &[&str]) -> i32 {
            let config = self.config.display().to_string();
            let records = self.path("records");
            let mut argv = vec![
                "us-injecter",
                "--config",
                &config,
                "--test-dir",
                &records,
            ];
            argv.extend_from_slice(args);
            exit_code(Args::try_parse_from(argv).unwrap(), &discard_logger())
        }
    }

    fn rig() -> Rig {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config.toml");
        let text = format!(
            r#"
test_dir = "{dir}/test"
[devices]
backend = "emulated"
state_dir = "{dir}/state"
[[devices.collection]]
mountpoint = "{dir}/pmem0"
dimms = ["nmem0", "nmem1"]
[[devices.collection]]
mountpoint = "{dir}/pmem1"
dimms = ["nmem2"]
"#,
            dir = dir.path().display()
        );
        std::fs::write(&config, text).unwrap();
        Rig { dir, config }
    }

    #[test]
    fn inject_then_check() {
        let r = rig();
        let pmem0 = r.path("pmem0");
        assert_eq!(r.injecter(&["inject", &pmem0]), SUCCESS);
        assert_eq!(r.injecter(&["check-unsafe", &pmem0]), SUCCESS);
        assert_eq!(r.injecter(&["check-safe", &pmem0]), FAILURE);

        let state = Path::new(&r.path("state")).join("nmem1.usc");
        assert_eq!(std::fs::read_to_string(state).unwrap(), "1");
        assert!(!Path::new(&r.path("state")).join("nmem2.usc").exists());
    }

    #[test]
    fn check_before_any_inject_fails() {
        let r = rig();
        let pmem1 = r.path("pmem1");
        assert_eq!(r.injecter(&["check-safe", &pmem1]), FAILURE);
        assert_eq!(r.injecter(&["check-unsafe", &pmem1]), FAILURE);
    }

    #[test]
    fn failed_injection_is_a_dimm_error() {
        let r = rig();
        let state = Path::new(&r.path("state")).to_path_buf();
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join("nmem2.usc"), "lots").unwrap();
        let (pmem0, pmem1) = (r.path("pmem0"), r.path("pmem1"));
        assert_eq!(
            r.injecter(&["inject", &pmem0, &pmem1]),
            DIMM_OPERATION_FAILED
        );
    }

    #[test]
    fn unknown_mountpoint_with_config() {
        let r = rig();
        let other = r.path("pmem9");
        assert_eq!(r.injecter(&["inject", &other]), FAILURE);
    }

    #[test]
    fn bad_config_is_a_setup_error() {
        let r = rig();
        std::fs::write(&r.config, "test_dir = [").unwrap();
        let pmem0 = r.path("pmem0");
        assert_eq!(r.injecter(&["inject", &pmem0]), FAILURE);
    }

    #[test]
    fn discovery_without_config() {
        let dir = tempdir().unwrap();
        let log = discard_logger();
        assert!(collections(None, &[dir.path().to_path_buf()], &log).is_err());

        let mount = dir.path().display().to_string();
        let args = Args::try_parse_from([
            "us-injecter",
            "--test-dir",
            &mount,
            "check-safe",
            &mount,
        ])
        .unwrap();
        let err = run(args, &log).unwrap_err();
        assert_eq!(err.exit_code(), FAILURE);
    }

    #[test]
    fn mountpoints_are_required() {
        assert!(Args::try_parse_from(["us-injecter", "inject"]).is_err());
    }
}
