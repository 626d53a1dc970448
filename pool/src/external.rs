// Copyright 2023 Oxide Computer Company
//! The real library, reached through two executables: `pmempool` and a
//! small `pool-io` helper linked against libpmemobj/blk/log.
//!
//! `pool-io` takes `<verb> <kind> <path> [json]`:
//!
//! * `create` creates the pool and leaves it open,
//! * `open` opens it and exits without closing,
//! * `append` opens it, appends the JSON encoded data and exits,
//! * `read` opens it and prints the pool contents as JSON,
//! * `close` opens it and closes it cleanly.
//!
//! Every verb exits 0 on success and with the failing errno otherwise.
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use ras_common::{shell, CommandOutput};
use slog::{debug, error, Logger};

use crate::library::{PoolData, PoolError, PoolHandle, PoolKind, PoolLibrary};

#[derive(Debug, Clone)]
pub struct ExternalPoolLibrary {
    pmempool: PathBuf,
    pool_io: PathBuf,
    log: Logger,
}

impl ExternalPoolLibrary {
    pub fn new(pmempool: &Path, pool_io: &Path, log: Logger) -> Self {
        ExternalPoolLibrary {
            pmempool: pmempool.to_path_buf(),
            pool_io: pool_io.to_path_buf(),
            log,
        }
    }
}

fn pool_io(
    bin: &Path,
    log: &Logger,
    verb: &str,
    kind: PoolKind,
    path: &Path,
    payload: Option<String>,
) -> Result<CommandOutput, PoolError> {
    let mut args = vec![
        verb.to_string(),
        kind.to_string(),
        path.display().to_string(),
    ];
    args.extend(payload);
    let out = shell::run(bin, &args).map_err(|e| PoolError::Failed {
        path: path.to_path_buf(),
        reason: format!("{:#}", e),
    })?;
    debug!(log, "{:?} {}: {}", bin, args.join(" "), out);
    if out.success() {
        return Ok(out);
    }
    error!(log, "{:?} {} failed: {}", bin, args.join(" "), out);
    Err(PoolError::from_errno(
        Errno::from_raw(out.exit_code),
        path,
        out.content.trim().to_string(),
    ))
}

impl PoolLibrary for ExternalPoolLibrary {
    fn create(
        &self,
        kind: PoolKind,
        path: &Path,
    ) -> Result<Box<dyn PoolHandle>, PoolError> {
        pool_io(&self.pool_io, &self.log, "create", kind, path, None)?;
        Ok(Box::new(ExternalHandle {
            bin: self.pool_io.clone(),
            log: self.log.clone(),
            kind,
            path: path.to_path_buf(),
        }))
    }

    fn open(
        &self,
        kind: PoolKind,
        path: &Path,
    ) -> Result<Box<dyn PoolHandle>, PoolError> {
        pool_io(&self.pool_io, &self.log, "open", kind, path, None)?;
        Ok(Box::new(ExternalHandle {
            bin: self.pool_io.clone(),
            log: self.log.clone(),
            kind,
            path: path.to_path_buf(),
        }))
    }

    fn pmempool(&self, args: &[&str]) -> anyhow::Result<CommandOutput> {
        let out = shell::run(&self.pmempool, args)?;
        debug!(self.log, "pmempool {}: {}", args.join(" "), out);
        Ok(out)
    }
}

struct ExternalHandle {
    bin: PathBuf,
    log: Logger,
    kind: PoolKind,
    path: PathBuf,
}

impl PoolHandle for ExternalHandle {
    fn path(&self) -> &Path {
        &self.path
    }

    fn kind(&self) -> PoolKind {
        self.kind
    }

    fn append(&mut self, data: &PoolData) -> Result<(), PoolError> {
        let json = serde_json::to_string(data).map_err(|e| PoolError::Failed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let (bin, log) = (&self.bin, &self.log);
        pool_io(bin, log, "append", self.kind, &self.path, Some(json))?;
        Ok(())
    }

    fn read(&mut self) -> Result<PoolData, PoolError> {
        let (bin, log) = (&self.bin, &self.log);
        let out = pool_io(bin, log, "read", self.kind, &self.path, None)?;
        serde_json::from_str(out.content.trim()).map_err(|e| PoolError::Failed {
            path: self.path.clone(),
            reason: format!("pool-io read: {}", e),
        })
    }

    fn close(self: Box<Self>) -> Result<(), PoolError> {
        pool_io(&self.bin, &self.log, "close", self.kind, &self.path, None)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ras_common::discard_logger;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    /// A shell script standing in for `pool-io`.
    fn fake_pool_io(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("pool-io");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .unwrap();
        path
    }

    fn io_library(pool_io: &Path) -> ExternalPoolLibrary {
        ExternalPoolLibrary::new(Path::new("true"), pool_io, discard_logger())
    }

    #[test]
    fn einval_exit_is_invalid_argument() {
        let dir = tempdir().unwrap();
        let bin = fake_pool_io(dir.path(), "echo pool needs recovery; exit 22");
        let lib = io_library(&bin);
        match lib.open(PoolKind::Obj, Path::new("/mnt/pool")) {
            Err(e) => {
                assert!(e.is_invalid_argument(), "{}", e);
                assert!(e.to_string().contains("pool needs recovery"));
            }
            Ok(_) => panic!("open succeeded"),
        }
    }

    #[test]
    fn read_parses_json() {
        let dir = tempdir().unwrap();
        let bin = fake_pool_io(
            dir.path(),
            r#"[ "$1" = read ] && echo '{"kind":"blk","data":[1,2,3]}'; exit 0"#,
        );
        let lib = io_library(&bin);
        let mut h = lib.open(PoolKind::Blk, Path::new("/mnt/pool")).unwrap();
        assert_eq!(h.kind(), PoolKind::Blk);
        assert_eq!(h.read().unwrap(), PoolData::Blk(vec![1, 2, 3]));
        h.append(&PoolData::Blk(vec![4])).unwrap();
        h.close().unwrap();
    }

    #[test]
    fn append_passes_json_argument() {
        let dir = tempdir().unwrap();
        let seen = dir.path().join("seen");
        let bin = fake_pool_io(
            dir.path(),
            &format!(
                r#"[ "$1" = append ] && printf '%s' "$4" > {}; exit 0"#,
                seen.display()
            ),
        );
        let lib = io_library(&bin);
        let mut h = lib.create(PoolKind::Log, Path::new("/mnt/log")).unwrap();
        h.append(&PoolData::Log("abc".into())).unwrap();
        assert_eq!(
            std::fs::read_to_string(&seen).unwrap(),
            r#"{"kind":"log","data":"abc"}"#
        );
    }

    #[test]
    fn pmempool_exit_code_is_returned() {
        let dir = tempdir().unwrap();
        let bin = fake_pool_io(dir.path(), "echo \"$@\"; exit 1");
        let lib = ExternalPoolLibrary::new(
            &bin,
            Path::new("pool-io"),
            discard_logger(),
        );
        let out = lib.pmempool(&["sync", "/mnt/pool.set"]).unwrap();
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.content, "sync /mnt/pool.set\n");
    }
}
