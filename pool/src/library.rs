// Copyright 2023 Oxide Computer Company
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use ras_common::CommandOutput;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Values every obj and blk test writes and expects back in order.
pub const TEST_VALUES: [i32; 9] = [-2, 0, 12345, 1412, 1231, 23, 432, 34, 3];

pub const LOG_TEXT: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing \
elit, sed do eiusmod tempor incididunt ut labore et dolore magna aliqua. Ut \
enim ad minim veniam, quis nostrud exercitation ullamco laboris nisi ut \
aliquip ex ea commodo consequat. Duis aute irure dolor in reprehenderit in \
voluptate velit esse cillum dolore eu fugiat nulla pariatur. Excepteur sint \
occaecat cupidatat non proident, sunt in culpa qui officia deserunt mollit \
anim id est laborum.";

/// The log text goes in as this many appends.
pub const LOG_CHUNKS: usize = 10;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Obj,
    Blk,
    Log,
}

/// Contents of a pool, as far as the tests care.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum PoolData {
    Obj(Vec<i32>),
    Blk(Vec<i32>),
    Log(String),
}

impl PoolData {
    pub fn empty(kind: PoolKind) -> Self {
        match kind {
            PoolKind::Obj => PoolData::Obj(Vec::new()),
            PoolKind::Blk => PoolData::Blk(Vec::new()),
            PoolKind::Log => PoolData::Log(String::new()),
        }
    }

    pub fn kind(&self) -> PoolKind {
        match self {
            PoolData::Obj(_) => PoolKind::Obj,
            PoolData::Blk(_) => PoolKind::Blk,
            PoolData::Log(_) => PoolKind::Log,
        }
    }

    /// Append `more` of the same kind; `false` on a kind mismatch.
    pub fn extend(&mut self, more: &PoolData) -> bool {
        match (self, more) {
            (PoolData::Obj(a), PoolData::Obj(b))
            | (PoolData::Blk(a), PoolData::Blk(b)) => {
                a.extend_from_slice(b);
                true
            }
            (PoolData::Log(a), PoolData::Log(b)) => {
                a.push_str(b);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("{path:?}: invalid argument: {reason}")]
    InvalidArgument { path: PathBuf, reason: String },
    #[error("{path:?}: no such pool")]
    NotFound { path: PathBuf },
    #[error("{path:?}: pool already exists")]
    AlreadyExists { path: PathBuf },
    #[error("{path:?}: {reason}")]
    Failed { path: PathBuf, reason: String },
}

impl PoolError {
    pub fn errno(&self) -> Errno {
        match self {
            PoolError::InvalidArgument { .. } => Errno::EINVAL,
            PoolError::NotFound { .. } => Errno::ENOENT,
            PoolError::AlreadyExists { .. } => Errno::EEXIST,
            PoolError::Failed { .. } => Errno::EIO,
        }
    }

    /// Rebuild an error from the errno a helper process exited with.
    pub fn from_errno(errno: Errno, path: &Path, reason: String) -> Self {
        let path = path.to_path_buf();
        match errno {
            Errno::EINVAL => PoolError::InvalidArgument { path, reason },
            Errno::ENOENT => PoolError::NotFound { path },
            Errno::EEXIST => PoolError::AlreadyExists { path },
            _ => PoolError::Failed { path, reason },
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, PoolError::InvalidArgument { .. })
    }
}

/// An open pool.
pub trait PoolHandle: Send {
    fn path(&self) -> &Path;
    fn kind(&self) -> PoolKind;
    fn append(&mut self, data: &PoolData) -> Result<(), PoolError>;
    fn read(&mut self) -> Result<PoolData, PoolError>;
    fn close(self: Box<Self>) -> Result<(), PoolError>;
}

/// The persistent memory library plus its `pmempool` tool.
pub trait PoolLibrary: Send + Sync {
    fn create(
        &self,
        kind: PoolKind,
        path: &Path,
    ) -> Result<Box<dyn PoolHandle>, PoolError>;

    /// Open a single file pool or a poolset.
    fn open(
        &self,
        kind: PoolKind,
        path: &Path,
    ) -> Result<Box<dyn PoolHandle>, PoolError>;

    /// Run `pmempool` with `args`; a non-zero exit is not an error here.
    fn pmempool(&self, args: &[&str]) -> anyhow::Result<CommandOutput>;
}

/// What [`write_test_pattern`] leaves in a pool of `kind`.
pub fn test_pattern(kind: PoolKind) -> PoolData {
    match kind {
        PoolKind::Obj => PoolData::Obj(TEST_VALUES.to_vec()),
        PoolKind::Blk => PoolData::Blk(TEST_VALUES.to_vec()),
        PoolKind::Log => PoolData::Log(LOG_TEXT.to_string()),
    }
}

pub fn write_test_pattern(
    handle: &mut dyn PoolHandle,
) -> Result<(), PoolError> {
    match handle.kind() {
        PoolKind::Log => {
            let chars: Vec<char> = LOG_TEXT.chars().collect();
            let per_chunk = chars.len().div_ceil(LOG_CHUNKS);
            for chunk in chars.chunks(per_chunk) {
                handle.append(&PoolData::Log(chunk.iter().collect()))?;
            }
            Ok(())
        }
        kind => handle.append(&test_pattern(kind)),
    }
}
