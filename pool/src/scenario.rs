// Copyright 2023 Oxide Computer Company
//! The fixed catalog of device topologies the recovery tests run against.
use std::fmt;
use std::path::{Path, PathBuf};

use crate::poolset::{part_line, remote_descriptor, Poolset};

pub const PART_SIZE: &str = "9MB";
pub const BIG_PART_SIZE: &str = "18MB";

/// What storage a test run has to place pool parts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInventory {
    pub unsafe_mountpoints: Vec<PathBuf>,
    pub safe_mountpoints: Vec<PathBuf>,
    /// Storage that is not persistent memory at all.
    pub non_dimm_dir: PathBuf,
    /// The node holding remote replicas, if there is one.
    pub remote: Option<RemoteInventory>,
}

/// The same, on the node that serves remote replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInventory {
    pub host: String,
    pub unsafe_mountpoints: Vec<PathBuf>,
    pub safe_mountpoints: Vec<PathBuf>,
    pub non_dimm_dir: PathBuf,
}

/// Where a part of a scenario lives, before it is tied to a real path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    Unsafe(usize),
    Safe(usize),
    NonDimm,
    RemoteUnsafe(usize),
    RemoteSafe(usize),
    RemoteNonDimm,
}

impl Loc {
    fn resolve<'a>(&self, inv: &'a DeviceInventory) -> Option<&'a Path> {
        let remote = inv.remote.as_ref();
        let path = match self {
            Loc::Unsafe(i) => inv.unsafe_mountpoints.get(*i)?,
            Loc::Safe(i) => inv.safe_mountpoints.get(*i)?,
            Loc::NonDimm => &inv.non_dimm_dir,
            Loc::RemoteUnsafe(i) => remote?.unsafe_mountpoints.get(*i)?,
            Loc::RemoteSafe(i) => remote?.safe_mountpoints.get(*i)?,
            Loc::RemoteNonDimm => &remote?.non_dimm_dir,
        };
        Some(path.as_path())
    }

    fn is_unsafe(&self) -> bool {
        matches!(self, Loc::Unsafe(_) | Loc::RemoteUnsafe(_))
    }
}

type PartDef = (Loc, &'static str, &'static str);

/// A replica that can rebuild the others: none of its parts took the
/// shutdown.
fn is_clean(parts: &[PartDef]) -> bool {
    parts.iter().all(|(loc, _, _)| !loc.is_unsafe())
}

fn resolve_parts(
    defs: &[PartDef],
    inv: &DeviceInventory,
) -> Option<Vec<String>> {
    defs.iter()
        .map(|(loc, file, size)| {
            loc.resolve(inv).map(|dir| part_line(size, &dir.join(file)))
        })
        .collect()
}

/// Distinct resolved mountpoints of the `wanted` locations, first use
/// first.
fn mountpoints_of<'a>(
    locs: impl Iterator<Item = &'a Loc>,
    wanted: fn(&Loc) -> bool,
    inv: &DeviceInventory,
) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    for loc in locs.filter(|l| wanted(l)) {
        if let Some(dir) = loc.resolve(inv) {
            if !out.iter().any(|m| m == dir) {
                out.push(dir.to_path_buf());
            }
        }
    }
    out
}

struct Pattern {
    description: &'static str,
    /// Where the poolset file itself goes.
    dir: Loc,
    file: &'static str,
    primary: &'static [PartDef],
    replicas: &'static [&'static [PartDef]],
}

use Loc::{NonDimm, RemoteNonDimm, RemoteSafe, RemoteUnsafe, Safe, Unsafe};

const SYNC_PATTERNS: [Pattern; 9] = [
    Pattern {
        description: "healthy replica on non-us dimm",
        dir: Safe(0),
        file: "pool_tc1.set",
        primary: &[
            (Unsafe(0), "tc1_master.part0", PART_SIZE),
            (Safe(0), "tc1_master.part1", PART_SIZE),
        ],
        replicas: &[&[
            (Safe(0), "tc1_replica.part0", PART_SIZE),
            (Safe(0), "tc1_replica.part1", PART_SIZE),
        ]],
    },
    Pattern {
        description: "healthy replica on non-dimm",
        dir: Unsafe(0),
        file: "pool_tc2.set",
        primary: &[
            (Unsafe(0), "tc2_master.part0", PART_SIZE),
            (Unsafe(0), "tc2_master.part1", PART_SIZE),
        ],
        replicas: &[&[
            (NonDimm, "tc2_replica.part0", PART_SIZE),
            (NonDimm, "tc2_replica.part1", PART_SIZE),
        ]],
    },
    Pattern {
        description: "healthy replica on non-us dimm, \
            second replica partially on us dimm",
        dir: Safe(0),
        file: "pool_tc3.set",
        primary: &[
            (Unsafe(0), "tc3_master.part0", PART_SIZE),
            (Safe(0), "tc3_master.part1", PART_SIZE),
        ],
        replicas: &[
            &[
                (Unsafe(0), "tc3_replica1.part0", PART_SIZE),
                (Safe(0), "tc3_replica1.part1", PART_SIZE),
            ],
            &[
                (Safe(0), "tc3_replica2.part0", PART_SIZE),
                (Safe(0), "tc3_replica2.part1", PART_SIZE),
            ],
        ],
    },
    Pattern {
        description: "master and replica on the same us dimm",
        dir: Unsafe(0),
        file: "pool1.set",
        primary: &[
            (Unsafe(0), "pool1_master.part0", PART_SIZE),
            (Unsafe(0), "pool1_master.part1", PART_SIZE),
            (Unsafe(0), "pool1_master.part2", PART_SIZE),
        ],
        replicas: &[&[
            (Unsafe(0), "pool1_replica.part0", PART_SIZE),
            (Unsafe(0), "pool1_replica.part1", BIG_PART_SIZE),
        ]],
    },
    Pattern {
        description: "master and replica partially on the same us and \
            non-us dimm",
        dir: Unsafe(0),
        file: "pool2.set",
        primary: &[
            (Unsafe(0), "pool2_master.part0", PART_SIZE),
            (Safe(0), "pool2_master.part1", PART_SIZE),
        ],
        replicas: &[&[
            (Safe(0), "pool2_replica.part0", PART_SIZE),
            (Unsafe(0), "pool2_replica.part1", BIG_PART_SIZE),
        ]],
    },
    Pattern {
        description: "master and replica on different us dimms",
        dir: Unsafe(0),
        file: "pool3.set",
        primary: &[
            (Unsafe(0), "pool3_master.part0", PART_SIZE),
            (Unsafe(0), "pool3_master.part1", PART_SIZE),
            (Unsafe(0), "pool3_master.part2", PART_SIZE),
        ],
        replicas: &[&[
            (Unsafe(1), "pool3_replica.part0", PART_SIZE),
            (Unsafe(1), "pool3_replica.part1", BIG_PART_SIZE),
        ]],
    },
    Pattern {
        description: "master and replica partially on two us dimms",
        dir: Unsafe(0),
        file: "pool4.set",
        primary: &[
            (Unsafe(0), "pool4_master.part0", PART_SIZE),
            (Unsafe(0), "pool4_master.part1", PART_SIZE),
            (Unsafe(1), "pool4_master.part2", PART_SIZE),
        ],
        replicas: &[&[
            (Unsafe(1), "pool4_replica.part0", PART_SIZE),
            (Unsafe(0), "pool4_replica.part1", BIG_PART_SIZE),
        ]],
    },
    Pattern {
        description: "master and replica partially on non-dimm and two \
            us dimms",
        dir: Unsafe(0),
        file: "pool5.set",
        primary: &[
            (Unsafe(0), "pool5_master.part0", PART_SIZE),
            (NonDimm, "pool5_master.part1", PART_SIZE),
            (Unsafe(0), "pool5_master.part2", PART_SIZE),
        ],
        replicas: &[&[
            (Unsafe(1), "pool5_replica.part0", PART_SIZE),
            (NonDimm, "pool5_replica.part1", BIG_PART_SIZE),
        ]],
    },
    Pattern {
        description: "master on us dimm 1, replicas on us dimms 1 and 2",
        dir: Unsafe(0),
        file: "pool6.set",
        primary: &[
            (Unsafe(0), "pool6_master.part0", PART_SIZE),
            (Unsafe(0), "pool6_master.part1", PART_SIZE),
            (Unsafe(0), "pool6_master.part2", PART_SIZE),
        ],
        replicas: &[
            &[
                (Unsafe(1), "pool6_replica1.part0", PART_SIZE),
                (Unsafe(1), "pool6_replica1.part1", BIG_PART_SIZE),
            ],
            &[
                (Unsafe(0), "pool6_replica2.part0", PART_SIZE),
                (Unsafe(0), "pool6_replica2.part1", BIG_PART_SIZE),
            ],
        ],
    },
];

impl Pattern {
    /// A replica with no part on unsafe storage can rebuild the primary.
    fn is_syncable(&self) -> bool {
        self.replicas.iter().any(|r| is_clean(r))
    }

    fn poolset(&self, inv: &DeviceInventory) -> Option<Poolset> {
        let dir = self.dir.resolve(inv)?;
        let mut b = Poolset::builder(dir, self.file)
            .primary(resolve_parts(self.primary, inv)?);
        for r in self.replicas {
            b = b.replica(resolve_parts(r, inv)?);
        }
        Some(b.build())
    }
}

/// One replica sync test case.
#[derive(Debug, Clone)]
pub struct SyncScenario {
    pub description: String,
    /// `None` when the run has too few DIMMs to place every part.
    pub poolset: Option<Poolset>,
    pub is_syncable: bool,
    pub enough_dimms: bool,
}

impl fmt::Display for SyncScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description)?;
        if !self.enough_dimms {
            write!(f, " (not enough dimms)")?;
        }
        Ok(())
    }
}

/// All nine sync topologies, always in the same order whatever the
/// inventory.
pub fn sync_local_replica_scenarios(
    inv: &DeviceInventory,
) -> Vec<SyncScenario> {
    SYNC_PATTERNS
        .iter()
        .map(|p| {
            let poolset = p.poolset(inv);
            SyncScenario {
                description: p.description.to_string(),
                enough_dimms: poolset.is_some(),
                poolset,
                is_syncable: p.is_syncable(),
            }
        })
        .collect()
}

/// A replica on the remote node: its own poolset file there, named by the
/// file name, placed next to its first part.
type RemoteDef = (&'static str, &'static [PartDef]);

struct RemotePattern {
    description: &'static str,
    file: &'static str,
    primary: &'static [PartDef],
    replicas: &'static [&'static [PartDef]],
    remote: &'static [RemoteDef],
}

const SYNC_REMOTE_PATTERNS: [RemotePattern; 5] = [
    RemotePattern {
        description: "healthy remote replica on non-us dimm",
        file: "pool7.set",
        primary: &[
            (Unsafe(0), "master7.part0", PART_SIZE),
            (Unsafe(0), "master7.part1", PART_SIZE),
            (Unsafe(0), "master7.part2", PART_SIZE),
        ],
        replicas: &[&[
            (Unsafe(1), "replica7.part0", PART_SIZE),
            (Unsafe(1), "replica7.part1", BIG_PART_SIZE),
        ]],
        remote: &[(
            "remote_pool1.set",
            &[
                (RemoteSafe(0), "remote1.part0", BIG_PART_SIZE),
                (RemoteSafe(0), "remote1.part1", PART_SIZE),
            ],
        )],
    },
    RemotePattern {
        description: "remote replica on us dimm, healthy local replica on \
            non-us dimm",
        file: "pool_8.set",
        primary: &[
            (Safe(0), "master8.part0", PART_SIZE),
            (Safe(0), "master8.part1", PART_SIZE),
            (Safe(0), "master8.part2", PART_SIZE),
        ],
        replicas: &[&[
            (Safe(0), "replica8.part0", PART_SIZE),
            (Safe(0), "replica8.part1", BIG_PART_SIZE),
        ]],
        remote: &[(
            "remote_pool2.set",
            &[
                (RemoteUnsafe(0), "remote2.part0", BIG_PART_SIZE),
                (RemoteUnsafe(0), "remote2.part1", PART_SIZE),
            ],
        )],
    },
    RemotePattern {
        description: "remote replica on us dimm, local replica on us dimm",
        file: "pool_9.set",
        primary: &[
            (Unsafe(0), "master9.part0", PART_SIZE),
            (Unsafe(0), "master9.part1", PART_SIZE),
            (Unsafe(0), "master9.part2", PART_SIZE),
        ],
        replicas: &[&[
            (Unsafe(0), "replica9.part0", PART_SIZE),
            (Unsafe(0), "replica9.part1", BIG_PART_SIZE),
        ]],
        remote: &[(
            "remote_pool3.set",
            &[
                (RemoteUnsafe(0), "remote3.part0", BIG_PART_SIZE),
                (RemoteUnsafe(0), "remote3.part1", PART_SIZE),
            ],
        )],
    },
    RemotePattern {
        description: "two remote replicas, one on us dimm, second on \
            non-dimm",
        file: "pool_10.set",
        primary: &[
            (Unsafe(0), "master10.part0", PART_SIZE),
            (Unsafe(0), "master10.part1", PART_SIZE),
            (Unsafe(0), "master10.part2", PART_SIZE),
        ],
        replicas: &[],
        remote: &[
            (
                "remote_pool4.set",
                &[
                    (RemoteUnsafe(0), "remote4.part0", BIG_PART_SIZE),
                    (RemoteUnsafe(0), "remote4.part1", PART_SIZE),
                ],
            ),
            (
                "remote_pool5.set",
                &[
                    (RemoteNonDimm, "remote5.part0", BIG_PART_SIZE),
                    (RemoteNonDimm, "remote5.part1", PART_SIZE),
                ],
            ),
        ],
    },
    RemotePattern {
        description: "one remote replica on us dimm",
        file: "pool_13.set",
        primary: &[
            (Unsafe(0), "master13.part0", PART_SIZE),
            (Unsafe(0), "master13.part1", PART_SIZE),
            (Unsafe(0), "master13.part2", PART_SIZE),
        ],
        replicas: &[],
        remote: &[(
            "remote_pool6.set",
            &[
                (RemoteUnsafe(0), "remote6.part0", BIG_PART_SIZE),
                (RemoteUnsafe(0), "remote6.part1", PART_SIZE),
            ],
        )],
    },
];

/// A poolset file to be written on the remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePoolset {
    pub host: String,
    pub poolset: Poolset,
    /// Mountpoints on the node whose counters must have gone up by one.
    pub unsafe_mountpoints: Vec<PathBuf>,
}

impl RemotePoolset {
    /// The name the local poolset gives this replica.
    pub fn descriptor(&self) -> String {
        remote_descriptor(&self.poolset.full_path())
    }
}

/// One remote replica sync test case.
#[derive(Debug, Clone)]
pub struct SyncRemoteScenario {
    pub description: String,
    /// `None` when either node has too few DIMMs to place every part.
    pub poolset: Option<Poolset>,
    pub remote_poolsets: Vec<RemotePoolset>,
    /// Local mountpoints whose counters must have gone up by one.
    pub unsafe_mountpoints: Vec<PathBuf>,
    pub is_syncable: bool,
    pub enough_dimms: bool,
}

impl fmt::Display for SyncRemoteScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description)?;
        if !self.enough_dimms {
            write!(f, " (not enough dimms)")?;
        }
        Ok(())
    }
}

impl RemotePattern {
    fn is_syncable(&self) -> bool {
        self.replicas.iter().any(|r| is_clean(r))
            || self.remote.iter().any(|(_, parts)| is_clean(parts))
    }

    fn local_locs(&self) -> impl Iterator<Item = &Loc> {
        std::iter::once(&Unsafe(0)).chain(
            self.primary
                .iter()
                .chain(self.replicas.iter().flat_map(|r| r.iter()))
                .map(|(loc, _, _)| loc),
        )
    }

    fn remote_poolsets(
        &self,
        inv: &DeviceInventory,
    ) -> Option<Vec<RemotePoolset>> {
        let host = &inv.remote.as_ref()?.host;
        self.remote
            .iter()
            .map(|(file, parts)| {
                let dir = parts.first()?.0.resolve(inv)?;
                Some(RemotePoolset {
                    host: host.clone(),
                    poolset: Poolset::builder(dir, *file)
                        .primary(resolve_parts(parts, inv)?)
                        .build(),
                    unsafe_mountpoints: mountpoints_of(
                        parts.iter().map(|(loc, _, _)| loc),
                        |l| matches!(l, RemoteUnsafe(_)),
                        inv,
                    ),
                })
            })
            .collect()
    }

    fn poolset(
        &self,
        inv: &DeviceInventory,
        remote: &[RemotePoolset],
    ) -> Option<Poolset> {
        let dir = Unsafe(0).resolve(inv)?;
        let mut b = Poolset::builder(dir, self.file)
            .primary(resolve_parts(self.primary, inv)?);
        for r in self.replicas {
            b = b.replica(resolve_parts(r, inv)?);
        }
        for r in remote {
            b = b.remote_replica(&r.host, &r.descriptor());
        }
        Some(b.build())
    }
}

/// All five remote sync topologies, always in the same order whatever the
/// inventory. The local poolset file lives on the first unsafe DIMM.
pub fn sync_remote_replica_scenarios(
    inv: &DeviceInventory,
) -> Vec<SyncRemoteScenario> {
    SYNC_REMOTE_PATTERNS
        .iter()
        .map(|p| {
            let placed = p.remote_poolsets(inv).and_then(|remote| {
                p.poolset(inv, &remote).map(|local| (local, remote))
            });
            let (poolset, remote_poolsets) = match placed {
                Some((local, remote)) => (Some(local), remote),
                None => (None, Vec::new()),
            };
            SyncRemoteScenario {
                description: p.description.to_string(),
                enough_dimms: poolset.is_some(),
                poolset,
                remote_poolsets,
                unsafe_mountpoints: mountpoints_of(
                    p.local_locs(),
                    |l| matches!(l, Unsafe(_)),
                    inv,
                ),
                is_syncable: p.is_syncable(),
            }
        })
        .collect()
}

/// Poolsets for growing a replica onto an unsafe DIMM and dropping the old
/// one.
#[derive(Debug, Clone)]
pub struct TransformScenario {
    pub origin: Poolset,
    pub added: Poolset,
    pub final_poolset: Poolset,
}

pub fn transform_scenario(inv: &DeviceInventory) -> Option<TransformScenario> {
    let us = inv.unsafe_mountpoints.first()?;
    let safe = inv.safe_mountpoints.first()?;

    let primary: Vec<String> = (0..3)
        .map(|i| part_line(PART_SIZE, &us.join(format!("master11.part{}", i))))
        .collect();
    let safe_replica = vec![
        part_line(PART_SIZE, &safe.join("replica11.part0")),
        part_line(BIG_PART_SIZE, &safe.join("replica11.part1")),
    ];
    let us_replica = vec![
        part_line(PART_SIZE, &us.join("replica12.part0")),
        part_line(BIG_PART_SIZE, &us.join("replica12.part1")),
    ];

    Some(TransformScenario {
        origin: Poolset::builder(us, "pool_transform_origin.set")
            .primary(primary.clone())
            .replica(safe_replica.clone())
            .build(),
        added: Poolset::builder(us, "pool_transform_added.set")
            .primary(primary.clone())
            .replica(safe_replica)
            .replica(us_replica.clone())
            .build(),
        final_poolset: Poolset::builder(us, "pool_transform_final.set")
            .primary(primary)
            .replica(us_replica)
            .build(),
    })
}

/// Moving a single file pool between two kinds of storage.
#[derive(Debug, Clone)]
pub struct MoveScenario {
    pub description: String,
    pub src_dir: PathBuf,
    pub dest_dir: PathBuf,
    /// Mountpoints whose counters must have gone up by one.
    pub unsafe_mountpoints: Vec<PathBuf>,
    /// Mountpoints whose counters must be unchanged.
    pub safe_mountpoints: Vec<PathBuf>,
    pub enough_dimms: bool,
}

impl fmt::Display for MoveScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description)?;
        if !self.enough_dimms {
            write!(f, " (not enough dimms)")?;
        }
        Ok(())
    }
}

fn move_scenario(
    inv: &DeviceInventory,
    description: &str,
    src: Loc,
    dest: Loc,
) -> MoveScenario {
    let src_dir = src.resolve(inv);
    let dest_dir = dest.resolve(inv);
    let mut unsafe_mountpoints = Vec::new();
    let mut safe_mountpoints = Vec::new();
    for (loc, dir) in [(src, src_dir), (dest, dest_dir)] {
        if let Some(dir) = dir {
            match loc {
                Unsafe(_) => unsafe_mountpoints.push(dir.to_path_buf()),
                Safe(_) => safe_mountpoints.push(dir.to_path_buf()),
                _ => {}
            }
        }
    }
    MoveScenario {
        description: description.to_string(),
        enough_dimms: src_dir.is_some() && dest_dir.is_some(),
        src_dir: src_dir.map(Path::to_path_buf).unwrap_or_default(),
        dest_dir: dest_dir.map(Path::to_path_buf).unwrap_or_default(),
        unsafe_mountpoints,
        safe_mountpoints,
    }
}

/// Moves where at least one end took the unsafe shutdown.
pub fn move_scenarios_with_us(inv: &DeviceInventory) -> Vec<MoveScenario> {
    vec![
        move_scenario(inv, "from us dimm to non-dimm", Unsafe(0), NonDimm),
        move_scenario(inv, "from non-dimm to us dimm", NonDimm, Unsafe(0)),
        move_scenario(inv, "from us dimm to non-us dimm", Unsafe(0), Safe(0)),
        move_scenario(
            inv,
            "from us dimm to another us dimm",
            Unsafe(1),
            Unsafe(0),
        ),
    ]
}

/// Moves that never touch a DIMM which took the unsafe shutdown.
pub fn move_scenarios_without_us(inv: &DeviceInventory) -> Vec<MoveScenario> {
    vec![
        move_scenario(inv, "from non-us dimm to non-dimm", Safe(0), NonDimm),
        move_scenario(inv, "from non-dimm to non-us dimm", NonDimm, Safe(0)),
    ]
}
