// Copyright 2023 Oxide Computer Company
use std::path::PathBuf;

use ras_common::write_file_atomic;
use slog::{debug, error, Logger};

use crate::{DimmCollection, DimmError};

/// Persists the shutdown count of every DIMM, one plain text file per DIMM
/// named after its uid, so the next boot can compare against it.
#[derive(Debug, Clone)]
pub struct UscRecorder {
    dir: PathBuf,
    log: Logger,
}

impl UscRecorder {
    pub fn new(dir: impl Into<PathBuf>, log: Logger) -> Self {
        UscRecorder {
            dir: dir.into(),
            log,
        }
    }

    pub fn record_path(&self, uid: &str) -> PathBuf {
        self.dir.join(uid.replace('/', "_"))
    }

    /// Record every DIMM of every collection.
    ///
    /// All counts are read before anything is written, so one unreadable
    /// DIMM leaves the previous records untouched.
    pub fn record_all(
        &self,
        colls: &[DimmCollection],
    ) -> Result<(), DimmError> {
        let mut counts = Vec::new();
        for coll in colls {
            for dimm in coll {
                match dimm.shutdown_count() {
                    Ok(c) => counts.push((dimm.uid().to_string(), c)),
                    Err(e) => {
                        error!(self.log, "{:?}: {}", coll.mountpoint(), e);
                        return Err(e);
                    }
                }
            }
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| DimmError::Record {
            dimm: String::new(),
            path: self.dir.clone(),
            reason: e.to_string(),
        })?;
        for (uid, count) in counts {
            let path = self.record_path(&uid);
            write_file_atomic(&path, count.to_string().as_bytes(), true)
                .map_err(|e| DimmError::Record {
                    dimm: uid.clone(),
                    path: path.clone(),
                    reason: format!("{:#}", e),
                })?;
            debug!(self.log, "recorded {} = {}", uid, count);
        }
        Ok(())
    }

    /// The count recorded for `uid`, if a readable record exists.
    pub fn read_recorded(&self, uid: &str) -> Option<u64> {
        let path = self.record_path(uid);
        match std::fs::read_to_string(&path) {
            Ok(s) => match s.trim().parse::<u64>() {
                Ok(c) => Some(c),
                Err(e) => {
                    error!(
                        self.log,
                        "{:?}: {:?} is not a count: {}", path, s, e
                    );
                    None
                }
            },
            Err(e) => {
                error!(self.log, "{:?}: {}", path, e);
                None
            }
        }
    }
}
