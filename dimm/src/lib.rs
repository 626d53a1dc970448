// Copyright 2023 Oxide Computer Company
//! Persistent memory DIMMs, their unsafe shutdown counters (USC) and the
//! machinery to record, inject and verify them across power cycles.
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ras_common::{DeviceBackend, DeviceConfig};
use slog::{info, Logger};
use thiserror::Error;

mod emulated;
mod inject;
mod ndctl;
mod usc;

pub use emulated::EmulatedDimm;
pub use inject::{InjectManager, UscMismatch};
pub use ndctl::{discover_dimms, NdctlDimm};
pub use usc::UscRecorder;

#[derive(Debug, Error)]
pub enum DimmError {
    #[error("{dimm}: cannot read shutdown count: {reason}")]
    ReadCount { dimm: String, reason: String },

    #[error("{dimm}: cannot inject unsafe shutdown: {reason}")]
    Inject { dimm: String, reason: String },

    #[error("cannot record shutdown count of {dimm} in {path:?}: {reason}")]
    Record {
        dimm: String,
        path: PathBuf,
        reason: String,
    },

    #[error("no dimm backs mountpoint {mountpoint:?}: {reason}")]
    Discovery { mountpoint: PathBuf, reason: String },
}

/// A single persistent memory module.
pub trait Dimm: fmt::Debug + Send + Sync {
    /// Stable identifier, also the name of its counter record.
    fn uid(&self) -> &str;

    /// The hardware maintained unsafe shutdown count, read fresh each call.
    fn shutdown_count(&self) -> Result<u64, DimmError>;

    /// Arm the DIMM so the next power loss counts as unsafe.
    fn inject_unsafe_shutdown(&self) -> Result<(), DimmError>;
}

/// The DIMMs behind one mountpoint, in configuration order.
#[derive(Debug, Clone)]
pub struct DimmCollection {
    mountpoint: PathBuf,
    dimms: Vec<Arc<dyn Dimm>>,
}

impl DimmCollection {
    pub fn new(
        mountpoint: impl Into<PathBuf>,
        dimms: Vec<Arc<dyn Dimm>>,
    ) -> Self {
        DimmCollection {
            mountpoint: mountpoint.into(),
            dimms,
        }
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Dimm>> {
        self.dimms.iter()
    }

    pub fn len(&self) -> usize {
        self.dimms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimms.is_empty()
    }

    /// Does `path` live on this collection's file system?
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.mountpoint)
    }
}

impl<'a> IntoIterator for &'a DimmCollection {
    type Item = &'a Arc<dyn Dimm>;
    type IntoIter = std::slice::Iter<'a, Arc<dyn Dimm>>;

    fn into_iter(self) -> Self::IntoIter {
        self.dimms.iter()
    }
}

/// Build the configured collections, in configuration order.
pub fn collections_from_config(
    cfg: &DeviceConfig,
    log: &Logger,
) -> Result<Vec<DimmCollection>, DimmError> {
    let mut out = Vec::with_capacity(cfg.collections.len());
    for c in cfg.collections.iter() {
        let dimms: Vec<Arc<dyn Dimm>> = match cfg.backend {
            DeviceBackend::Ndctl => {
                let devs = if c.dimms.is_empty() {
                    discover_dimms(&c.mountpoint)?
                } else {
                    c.dimms.clone()
                };
                let mut dimms: Vec<Arc<dyn Dimm>> = Vec::new();
                for dev in devs.iter() {
                    dimms.push(Arc::new(NdctlDimm::open(dev)?));
                }
                dimms
            }
            DeviceBackend::Emulated => {
                let Some(state_dir) = cfg.state_dir.as_ref() else {
                    return Err(DimmError::Discovery {
                        mountpoint: c.mountpoint.clone(),
                        reason: "emulated backend without state_dir".into(),
                    });
                };
                c.dimms
                    .iter()
                    .map(|id| {
                        Arc::new(EmulatedDimm::new(state_dir, id))
                            as Arc<dyn Dimm>
                    })
                    .collect()
            }
        };
        if dimms.is_empty() {
            return Err(DimmError::Discovery {
                mountpoint: c.mountpoint.clone(),
                reason: "no dimms".into(),
            });
        }
        info!(
            log,
            "{:?}: {}",
            c.mountpoint,
            dimms.iter().map(|d| d.uid()).collect::<Vec<_>>().join(", ")
        );
        out.push(DimmCollection::new(&c.mountpoint, dimms));
    }
    Ok(out)
}

/// Which collections take the unsafe shutdown in a test run.
///
/// Collection 0 is unsafe, collection 1 stays safe, any further
/// collections are unsafe again.
#[derive(Debug, Clone, Default)]
pub struct Designation {
    pub unsafe_colls: Vec<DimmCollection>,
    pub safe_colls: Vec<DimmCollection>,
}

impl Designation {
    pub fn from_collections(colls: &[DimmCollection]) -> Self {
        let mut d = Designation::default();
        for (i, c) in colls.iter().enumerate() {
            if ras_common::is_designated_unsafe(i) {
                d.unsafe_colls.push(c.clone());
            } else {
                d.safe_colls.push(c.clone());
            }
        }
        d
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use ras_common::{discard_logger, CollectionConfig};
    use tempfile::tempdir;
    use test_util::{collection, FakeDimm};

    #[test]
    fn designation_by_index() {
        let a = FakeDimm::new("a", 0);
        let colls = vec![
            collection("/mnt/0", &[&a]),
            collection("/mnt/1", &[&a]),
            collection("/mnt/2", &[&a]),
            collection("/mnt/3", &[&a]),
        ];
        let d = Designation::from_collections(&colls);
        let mounts = |cs: &[DimmCollection]| -> Vec<PathBuf> {
            cs.iter().map(|c| c.mountpoint().to_path_buf()).collect()
        };
        let (us, safe) = (mounts(&d.unsafe_colls), mounts(&d.safe_colls));
        assert_eq!(
            us,
            vec![Path::new("/mnt/0"), Path::new("/mnt/2"), Path::new("/mnt/3")]
        );
        assert_eq!(safe, vec![Path::new("/mnt/1")]);
    }

    #[test]
    fn designation_single_collection() {
        let a = FakeDimm::new("a", 0);
        let d = Designation::from_collections(&[collection("/mnt/0", &[&a])]);
        assert_eq!(d.unsafe_colls.len(), 1);
        assert!(d.safe_colls.is_empty());
    }

    #[test]
    fn collection_contains() {
        let a = FakeDimm::new("a", 0);
        let c = collection("/mnt/pmem0", &[&a]);
        assert!(c.contains(Path::new("/mnt/pmem0/pool")));
        assert!(!c.contains(Path::new("/mnt/pmem01/pool")));
        assert_eq!(c.len(), 1);
        assert_eq!((&c).into_iter().count(), 1);
    }

    #[test]
    fn emulated_collections_from_config() {
        let dir = tempdir().unwrap();
        let cfg = DeviceConfig {
            backend: DeviceBackend::Emulated,
            state_dir: Some(dir.path().to_path_buf()),
            collections: vec![
                CollectionConfig {
                    mountpoint: "/mnt/a".into(),
                    dimms: vec!["nmem0".into(), "nmem1".into()],
                },
                CollectionConfig {
                    mountpoint: "/mnt/b".into(),
                    dimms: vec!["nmem2".into()],
                },
            ],
        };
        let colls = collections_from_config(&cfg, &discard_logger()).unwrap();
        assert_eq!(colls.len(), 2);
        let uids: Vec<_> =
            colls[0].iter().map(|d| d.uid().to_string()).collect();
        assert_eq!(uids, vec!["nmem0", "nmem1"]);
        assert_eq!(colls[1].mountpoint(), Path::new("/mnt/b"));
    }

    #[test]
    fn emulated_without_dimms_fails() {
        let dir = tempdir().unwrap();
        let cfg = DeviceConfig {
            backend: DeviceBackend::Emulated,
            state_dir: Some(dir.path().to_path_buf()),
            collections: vec![CollectionConfig {
                mountpoint: "/mnt/a".into(),
                dimms: vec![],
            }],
        };
        assert!(matches!(
            collections_from_config(&cfg, &discard_logger()),
            Err(DimmError::Discovery { .. })
        ));
    }
}
