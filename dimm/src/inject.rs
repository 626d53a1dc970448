// Copyright 2023 Oxide Computer Company
use std::fmt;
use std::path::PathBuf;

use slog::{error, info, Logger};

use crate::{DimmCollection, DimmError, UscRecorder};

/// One DIMM whose counter did not move by the expected amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UscMismatch {
    pub uid: String,
    pub mountpoint: PathBuf,
    pub recorded: Option<u64>,
    pub current: Option<u64>,
    pub expected_delta: u64,
}

impl fmt::Display for UscMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<u64>| match v {
            Some(v) => v.to_string(),
            None => "unreadable".to_string(),
        };
        write!(
            f,
            "dimm {} on {:?}: recorded {}, current {}, expected increase {}",
            self.uid,
            self.mountpoint,
            show(self.recorded),
            show(self.current),
            self.expected_delta
        )
    }
}

/// Injects unsafe shutdowns and checks afterwards that they took.
#[derive(Debug, Clone)]
pub struct InjectManager {
    recorder: UscRecorder,
    log: Logger,
}

impl InjectManager {
    pub fn new(test_dir: impl Into<PathBuf>, log: Logger) -> Self {
        InjectManager {
            recorder: UscRecorder::new(test_dir, log.clone()),
            log,
        }
    }

    pub fn record_usc_all(
        &self,
        colls: &[DimmCollection],
    ) -> Result<(), DimmError> {
        self.recorder.record_all(colls)
    }

    /// Inject every DIMM of `colls`. Stops at the first failure; DIMMs
    /// already injected stay injected.
    pub fn inject_all(
        &self,
        colls: &[DimmCollection],
    ) -> Result<(), DimmError> {
        for coll in colls {
            for dimm in coll {
                if let Err(e) = dimm.inject_unsafe_shutdown() {
                    error!(self.log, "{:?}: {}", coll.mountpoint(), e);
                    return Err(e);
                }
                info!(
                    self.log,
                    "injected unsafe shutdown into {} ({:?})",
                    dimm.uid(),
                    coll.mountpoint()
                );
            }
        }
        Ok(())
    }

    /// Compare every DIMM against `recorded + expected_delta` and return
    /// all that disagree. A missing record is a mismatch.
    pub fn usc_mismatches(
        &self,
        expected_delta: u64,
        colls: &[DimmCollection],
    ) -> Vec<UscMismatch> {
        let mut out = Vec::new();
        for coll in colls {
            for dimm in coll {
                let recorded = self.recorder.read_recorded(dimm.uid());
                let current = match dimm.shutdown_count() {
                    Ok(c) => Some(c),
                    Err(e) => {
                        error!(self.log, "{}", e);
                        None
                    }
                };
                let ok = match (recorded, current) {
                    (Some(r), Some(c)) => {
                        r.checked_add(expected_delta) == Some(c)
                    }
                    _ => false,
                };
                if !ok {
                    let m = UscMismatch {
                        uid: dimm.uid().to_string(),
                        mountpoint: coll.mountpoint().to_path_buf(),
                        recorded,
                        current,
                        expected_delta,
                    };
                    error!(self.log, "{}", m);
                    out.push(m);
                }
            }
        }
        out
    }

    pub fn is_usc_increased_by(
        &self,
        expected_delta: u64,
        colls: &[DimmCollection],
    ) -> bool {
        self.usc_mismatches(expected_delta, colls).is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{collection, FakeDimm};
    use ras_common::discard_logger;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;
    use test_strategy::proptest;

    #[test]
    fn safe_and_unsafe_deltas() {
        let dir = tempdir().unwrap();
        let im = InjectManager::new(dir.path(), discard_logger());
        let u = FakeDimm::new("u", 5);
        let s = FakeDimm::new("s", 9);
        let unsafe_colls = vec![collection("/mnt/u", &[&u])];
        let safe_colls = vec![collection("/mnt/s", &[&s])];
        let all = vec![unsafe_colls[0].clone(), safe_colls[0].clone()];

        im.record_usc_all(&all).unwrap();
        im.inject_all(&unsafe_colls).unwrap();

        assert!(im.is_usc_increased_by(1, &unsafe_colls));
        assert!(im.is_usc_increased_by(0, &safe_colls));
        assert!(!im.is_usc_increased_by(0, &unsafe_colls));
        assert!(!im.is_usc_increased_by(1, &safe_colls));
    }

    #[test]
    fn double_injection_is_not_a_single_increase() {
        let dir = tempdir().unwrap();
        let im = InjectManager::new(dir.path(), discard_logger());
        let u = FakeDimm::new("u", 0);
        let colls = vec![collection("/mnt/u", &[&u])];
        im.record_usc_all(&colls).unwrap();
        im.inject_all(&colls).unwrap();
        im.inject_all(&colls).unwrap();
        assert!(!im.is_usc_increased_by(1, &colls));
        assert!(im.is_usc_increased_by(2, &colls));
    }

    #[test]
    fn every_mismatch_reported() {
        let dir = tempdir().unwrap();
        let im = InjectManager::new(dir.path(), discard_logger());
        let a = FakeDimm::new("a", 0);
        let b = FakeDimm::new("b", 0);
        let c = FakeDimm::new("c", 0);
        let colls =
            vec![collection("/mnt/0", &[&a, &b]), collection("/mnt/2", &[&c])];
        im.record_usc_all(&colls).unwrap();
        // Only b took the hit.
        b.count.store(1, Ordering::SeqCst);
        let m = im.usc_mismatches(1, &colls);
        let uids: Vec<_> = m.iter().map(|m| m.uid.as_str()).collect();
        assert_eq!(uids, vec!["a", "c"]);
        assert_eq!(m[1].mountpoint, PathBuf::from("/mnt/2"));
        assert_eq!(m[1].recorded, Some(0));
        assert_eq!(m[1].current, Some(0));
    }

    #[test]
    fn missing_record_is_a_mismatch() {
        let dir = tempdir().unwrap();
        let im = InjectManager::new(dir.path(), discard_logger());
        let a = FakeDimm::new("a", 0);
        let colls = vec![collection("/mnt/0", &[&a])];
        let m = im.usc_mismatches(0, &colls);
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].recorded, None);
        assert!(m[0].to_string().contains("unreadable"));
    }

    #[test]
    fn unreadable_counter_is_a_mismatch() {
        let dir = tempdir().unwrap();
        let im = InjectManager::new(dir.path(), discard_logger());
        let a = FakeDimm::new("a", 0);
        let colls = vec![collection("/mnt/0", &[&a])];
        im.record_usc_all(&colls).unwrap();
        a.fail_read.store(true, Ordering::SeqCst);
        assert!(!im.is_usc_increased_by(0, &colls));
    }

    #[test]
    fn inject_stops_at_first_failure() {
        let dir = tempdir().unwrap();
        let im = InjectManager::new(dir.path(), discard_logger());
        let a = FakeDimm::new("a", 0);
        let b = FakeDimm::new("b", 0);
        let c = FakeDimm::new("c", 0);
        b.fail_inject.store(true, Ordering::SeqCst);
        let colls = vec![collection("/mnt/0", &[&a, &b, &c])];
        assert!(matches!(
            im.inject_all(&colls),
            Err(DimmError::Inject { .. })
        ));
        assert_eq!(a.count.load(Ordering::SeqCst), 1);
        assert_eq!(c.count.load(Ordering::SeqCst), 0);
    }

    #[proptest]
    fn injections_add_up(
        #[strategy(0u64..1000)] start: u64,
        #[strategy(0u64..4)] injections: u64,
    ) {
        let dir = tempdir().unwrap();
        let im = InjectManager::new(dir.path(), discard_logger());
        let a = FakeDimm::new("a", start);
        let colls = vec![collection("/mnt/0", &[&a])];
        im.record_usc_all(&colls).unwrap();
        for _ in 0..injections {
            im.inject_all(&colls).unwrap();
        }
        assert!(im.is_usc_increased_by(injections, &colls));
        assert!(!im.is_usc_increased_by(injections + 1, &colls));
    }
}
