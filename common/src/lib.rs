// Copyright 2023 Oxide Computer Company
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use ErrorKind::NotFound;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use slog::{o, Drain, Logger};
use tempfile::NamedTempFile;

pub mod config;
pub mod filter;
pub mod phase;
pub mod shell;
pub mod status;

pub use config::{
    is_designated_unsafe, CollectionConfig, ConfigError, ControllerConfig,
    DeviceBackend, DeviceConfig, DutConfig, LocalConfig, PoolLibraryKind,
    RemoteNodeConfig, ToolsConfig,
};
pub use filter::{phase_filter, TestFilter};
pub use phase::{Phase, PostAction};
pub use shell::CommandOutput;
pub use status::RunStatus;

/// Build the logger shared by every binary in the workspace.
///
/// Interactive sessions get the terminal formatter, anything else (ssh
/// captures, CI) gets bunyan JSON on stdout.
pub fn build_logger() -> Logger {
    build_logger_with_level(slog::Level::Info)
}

pub fn build_logger_with_level(level: slog::Level) -> Logger {
    if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = std::sync::Mutex::new(drain)
            .filter_level(level)
            .fuse();
        Logger::root(drain, o!())
    } else {
        let drain = slog_bunyan::with_name("unsafe-shutdown", std::io::stdout())
            .build()
            .fuse();
        let drain = std::sync::Mutex::new(drain)
            .filter_level(level)
            .fuse();
        Logger::root(drain, o!())
    }
}

/// A logger that drops everything, for tests.
pub fn discard_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

pub fn read_json_maybe<P, T>(file: P) -> Result<Option<T>>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let mut f = match File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == NotFound => return Ok(None),
        Err(e) => bail!("open {:?}: {:?}", file, e),
    };
    let mut buf = Vec::<u8>::new();
    f.read_to_end(&mut buf)
        .with_context(|| anyhow!("read {:?}", file))?;
    Ok(serde_json::from_slice(buf.as_slice())
        .with_context(|| anyhow!("parse {:?}", file))?)
}

pub fn write_json<P, T>(file: P, data: &T, clobber: bool) -> Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let mut buf = serde_json::to_vec_pretty(data)?;
    buf.push(b'\n');
    write_file_atomic(file, &buf, clobber)
}

/// Replace `file` with `contents` through a temporary file in the same
/// directory, so a crash leaves either the old or the new contents.
pub fn write_file_atomic<P>(
    file: P,
    contents: &[u8],
    clobber: bool,
) -> Result<()>
where
    P: AsRef<Path>,
{
    let file = file.as_ref();
    let dir = match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmpf = NamedTempFile::new_in(dir)
        .with_context(|| anyhow!("temp file in {:?}", dir))?;
    tmpf.write_all(contents)?;
    tmpf.flush()?;
    tmpf.as_file().sync_all()?;

    if clobber {
        tmpf.persist(file)
            .with_context(|| anyhow!("persist {:?}", file))?;
    } else {
        tmpf.persist_noclobber(file)
            .with_context(|| anyhow!("persist {:?}", file))?;
    }
    Ok(())
}
