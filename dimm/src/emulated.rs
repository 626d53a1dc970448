// Copyright 2023 Oxide Computer Company
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ras_common::write_file_atomic;

use crate::{Dimm, DimmError};

/// A DIMM whose shutdown counter is a file, for hosts without persistent
/// memory. Injecting bumps the counter right away; there is no power loss
/// to wait for.
#[derive(Debug, Clone)]
pub struct EmulatedDimm {
    uid: String,
    counter: PathBuf,
}

impl EmulatedDimm {
    pub fn new(state_dir: &Path, uid: &str) -> Self {
        EmulatedDimm {
            uid: uid.to_string(),
            counter: state_dir.join(format!("{}.usc", uid)),
        }
    }

    fn read_error(&self, reason: impl ToString) -> DimmError {
        DimmError::ReadCount {
            dimm: self.uid.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Dimm for EmulatedDimm {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn shutdown_count(&self) -> Result<u64, DimmError> {
        let fail =
            |e: String| self.read_error(format!("{:?}: {}", self.counter, e));
        match std::fs::read_to_string(&self.counter) {
            Ok(s) => s.trim().parse::<u64>().map_err(|e| fail(e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(fail(e.to_string())),
        }
    }

    fn inject_unsafe_shutdown(&self) -> Result<(), DimmError> {
        let inject_error = |reason: String| DimmError::Inject {
            dimm: self.uid.clone(),
            reason,
        };
        let next = self
            .shutdown_count()
            .map_err(|e| inject_error(e.to_string()))?
            + 1;
        if let Some(dir) = self.counter.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| inject_error(format!("{:?}: {}", dir, e)))?;
        }
        write_file_atomic(&self.counter, next.to_string().as_bytes(), true)
            .map_err(|e| inject_error(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn starts_at_zero_and_counts_injections() {
        let dir = tempdir().unwrap();
        let d = EmulatedDimm::new(&dir.path().join("state"), "nmem0");
        assert_eq!(d.uid(), "nmem0");
        assert_eq!(d.shutdown_count().unwrap(), 0);
        d.inject_unsafe_shutdown().unwrap();
        d.inject_unsafe_shutdown().unwrap();
        assert_eq!(d.shutdown_count().unwrap(), 2);

        // A second handle on the same state sees the same count.
        let again = EmulatedDimm::new(&dir.path().join("state"), "nmem0");
        assert_eq!(again.shutdown_count().unwrap(), 2);
    }

    #[test]
    fn garbage_counter_is_a_read_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("nmem1.usc"), "lots").unwrap();
        let d = EmulatedDimm::new(dir.path(), "nmem1");
        assert!(matches!(
            d.shutdown_count(),
            Err(DimmError::ReadCount { .. })
        ));
        assert!(matches!(
            d.inject_unsafe_shutdown(),
            Err(DimmError::Inject { .. })
        ));
    }
}
