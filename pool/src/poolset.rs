// Copyright 2023 Oxide Computer Company
use std::fmt;
use std::path::{Path, PathBuf};

use ras_common::write_file_atomic;
use thiserror::Error;

pub const POOLSET_HEADER: &str = "PMEMPOOLSET";
pub const REPLICA_HEADER: &str = "REPLICA";
const OPTION_HEADER: &str = "OPTION";

#[derive(Debug, Error)]
pub enum PoolsetError {
    #[error("poolset line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("poolset {path:?}: {reason}")]
    Io { path: PathBuf, reason: String },
}

/// `"<size> <path>"`, one part line of a poolset file.
pub fn part_line(size: &str, path: &Path) -> String {
    format!("{} {}", size, path.display())
}

/// How a poolset file on a remote node is named in a `REPLICA` line. The
/// node resolves descriptors against its poolset directory, so an absolute
/// path is reached by climbing to the root first.
pub fn remote_descriptor(path: &Path) -> String {
    let rel = path.strip_prefix("/").unwrap_or(path);
    format!("../../{}", rel.display())
}

/// The absolute path a descriptor written by [`remote_descriptor`] points
/// at.
pub fn descriptor_path(descriptor: &str) -> PathBuf {
    let rest = Path::new(descriptor).components().skip_while(|c| {
        matches!(
            c,
            std::path::Component::ParentDir
                | std::path::Component::CurDir
                | std::path::Component::RootDir
        )
    });
    Path::new("/").join(rest.collect::<PathBuf>())
}

/// A poolset file to be: where it goes and the lines it holds, grouped in
/// sections. The first section is the primary replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poolset {
    dir: PathBuf,
    name: String,
    sections: Vec<Vec<String>>,
}

impl Poolset {
    pub fn new(
        dir: impl Into<PathBuf>,
        name: impl Into<String>,
        sections: Vec<Vec<String>>,
    ) -> Self {
        Poolset {
            dir: dir.into(),
            name: name.into(),
            sections,
        }
    }

    pub fn builder(
        dir: impl Into<PathBuf>,
        name: impl Into<String>,
    ) -> PoolsetBuilder {
        PoolsetBuilder {
            dir: dir.into(),
            name: name.into(),
            sections: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    pub fn sections(&self) -> &[Vec<String>] {
        &self.sections
    }

    /// The file as the pool tools expect it.
    pub fn content(&self) -> String {
        let mut out = String::new();
        for line in self.sections.iter().flatten() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn layout(&self) -> Result<PoolsetLayout, PoolsetError> {
        PoolsetLayout::parse(&self.content())
    }

    pub fn write_file(&self) -> Result<(), PoolsetError> {
        let path = self.full_path();
        write_file_atomic(&path, self.content().as_bytes(), true).map_err(|e| {
            PoolsetError::Io {
                path,
                reason: format!("{:#}", e),
            }
        })
    }

    pub fn file_exists(&self) -> bool {
        self.full_path().is_file()
    }
}

impl fmt::Display for Poolset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.full_path().display())?;
        for line in self.sections.iter().flatten() {
            write!(f, " [{}]", line)?;
        }
        Ok(())
    }
}

pub struct PoolsetBuilder {
    dir: PathBuf,
    name: String,
    sections: Vec<Vec<String>>,
}

impl PoolsetBuilder {
    /// The primary replica. Call once, first.
    pub fn primary(mut self, parts: Vec<String>) -> Self {
        let mut s = vec![POOLSET_HEADER.to_string()];
        s.extend(parts);
        self.sections.insert(0, s);
        self
    }

    pub fn replica(mut self, parts: Vec<String>) -> Self {
        let mut s = vec![REPLICA_HEADER.to_string()];
        s.extend(parts);
        self.sections.push(s);
        self
    }

    pub fn remote_replica(mut self, host: &str, descriptor: &str) -> Self {
        self.sections
            .push(vec![format!("{} {} {}", REPLICA_HEADER, host, descriptor)]);
        self
    }

    pub fn build(self) -> Poolset {
        Poolset {
            dir: self.dir,
            name: self.name,
            sections: self.sections,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartLayout {
    pub size: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaLayout {
    Local(Vec<PartLayout>),
    Remote { host: String, descriptor: String },
}

impl ReplicaLayout {
    pub fn parts(&self) -> &[PartLayout] {
        match self {
            ReplicaLayout::Local(p) => p,
            ReplicaLayout::Remote { .. } => &[],
        }
    }
}

/// A parsed poolset file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolsetLayout {
    pub options: Vec<String>,
    /// Replica 0 is the primary and always local.
    pub replicas: Vec<ReplicaLayout>,
}

fn valid_size(size: &str) -> bool {
    if size == "AUTO" {
        return true;
    }
    let digits = size.chars().take_while(char::is_ascii_digit).count();
    let unit = &size[digits..];
    digits > 0
        && matches!(
            unit,
            "" | "B" | "K" | "M" | "G" | "T" | "KB" | "MB" | "GB" | "TB" | "KiB"
                | "MiB" | "GiB" | "TiB"
        )
}

impl PoolsetLayout {
    pub fn parse(text: &str) -> Result<Self, PoolsetError> {
        let mut options = Vec::new();
        let mut replicas: Vec<ReplicaLayout> = Vec::new();
        let err = |line: usize, reason: &str| PoolsetError::Parse {
            line,
            reason: reason.to_string(),
        };

        for (i, raw) in text.lines().enumerate() {
            let n = i + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let words: Vec<&str> = line.split_whitespace().collect();

            if replicas.is_empty() {
                if line != POOLSET_HEADER {
                    return Err(err(n, "expected PMEMPOOLSET"));
                }
                replicas.push(ReplicaLayout::Local(Vec::new()));
                continue;
            }

            match words.as_slice() {
                [OPTION_HEADER, rest @ ..] if !rest.is_empty() => {
                    options.push(rest.join(" "));
                }
                [REPLICA_HEADER] => {
                    replicas.push(ReplicaLayout::Local(Vec::new()))
                }
                [REPLICA_HEADER, host, descriptor] => {
                    replicas.push(ReplicaLayout::Remote {
                        host: host.to_string(),
                        descriptor: descriptor.to_string(),
                    })
                }
                [REPLICA_HEADER, ..] => {
                    return Err(err(n, "malformed REPLICA line"))
                }
                [size, path] => {
                    if !valid_size(size) {
                        return Err(err(n, "bad part size"));
                    }
                    let part = PartLayout {
                        size: size.to_string(),
                        path: PathBuf::from(path),
                    };
                    match replicas.last_mut() {
                        Some(ReplicaLayout::Local(parts)) => parts.push(part),
                        _ => return Err(err(n, "part after remote replica")),
                    }
                }
                _ => return Err(err(n, "expected \"<size> <path>\"")),
            }
        }

        if replicas.is_empty() {
            return Err(err(0, "empty poolset"));
        }
        for (i, r) in replicas.iter().enumerate() {
            if let ReplicaLayout::Local(parts) = r {
                if parts.is_empty() {
                    return Err(PoolsetError::Parse {
                        line: 0,
                        reason: format!("replica {} has no parts", i),
                    });
                }
            }
        }
        Ok(PoolsetLayout { options, replicas })
    }

    pub fn primary(&self) -> &[PartLayout] {
        self.replicas[0].parts()
    }

    /// Parts of every local replica, primary first.
    pub fn all_parts(&self) -> impl Iterator<Item = &PartLayout> {
        self.replicas.iter().flat_map(|r| r.parts().iter())
    }
}

/// Is this file a poolset description rather than a pool?
pub fn is_poolset_file(path: &Path) -> bool {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            == Some(POOLSET_HEADER),
        Err(_) => false,
    }
}
