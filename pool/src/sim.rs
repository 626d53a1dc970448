// Copyright 2023 Oxide Computer Company
//! A stand-in for the persistent memory library that keeps just enough
//! state to behave like it across unsafe shutdowns.
//!
//! Each pool is a JSON file. A single file pool keeps its state in the
//! pool file; a poolset keeps it in the first part of the primary replica
//! and leaves the other parts as empty files. Opening a pool stamps every
//! part with the identity and shutdown counts of the DIMMs under it and
//! marks the pool dirty; closing clears the mark. If a dirty pool finds a
//! part whose stamp no longer matches, that part's replica is bad until
//! `pmempool check -r` (primary) or `pmempool sync` (others) fixes it.
//!
//! A remote replica is the primary replica of the poolset file its
//! descriptor names. The parts are stamped like any other, so the node's
//! DIMMs must be among the collections the library is given.
use std::path::{Path, PathBuf};

use ras_common::{read_json_maybe, write_json, CommandOutput};
use ras_dimm::DimmCollection;
use serde::{Deserialize, Serialize};
use slog::{info, warn, Logger};

use crate::library::{PoolData, PoolError, PoolHandle, PoolKind, PoolLibrary};
use crate::poolset::{
    descriptor_path, is_poolset_file, PartLayout, PoolsetLayout,
    ReplicaLayout,
};

/// The storage under one part, as last seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DeviceStamp {
    /// `None` for storage that is not persistent memory.
    mountpoint: Option<PathBuf>,
    counts: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimPart {
    path: PathBuf,
    stamp: Option<DeviceStamp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimReplica {
    parts: Vec<SimPart>,
    healthy: bool,
    data: PoolData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimPoolState {
    kind: PoolKind,
    dirty: bool,
    replicas: Vec<SimReplica>,
}

#[derive(Debug, Clone)]
pub struct SimPoolLibrary {
    colls: Vec<DimmCollection>,
    log: Logger,
}

fn failed(path: &Path, reason: impl ToString) -> PoolError {
    PoolError::Failed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn load_state(state_path: &Path) -> Result<SimPoolState, PoolError> {
    match read_json_maybe(state_path) {
        Ok(Some(s)) => Ok(s),
        Ok(None) => Err(PoolError::NotFound {
            path: state_path.to_path_buf(),
        }),
        Err(e) => Err(failed(state_path, format!("{:#}", e))),
    }
}

fn save_state(
    state_path: &Path,
    state: &SimPoolState,
) -> Result<(), PoolError> {
    write_json(state_path, state, true)
        .map_err(|e| failed(state_path, format!("{:#}", e)))
}

fn read_layout(path: &Path) -> Result<PoolsetLayout, PoolError> {
    let text = std::fs::read_to_string(path).map_err(|e| failed(path, e))?;
    PoolsetLayout::parse(&text).map_err(|e| PoolError::InvalidArgument {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Part paths of every replica of a poolset, remote ones included.
fn replica_paths(
    set: &Path,
    layout: &PoolsetLayout,
) -> Result<Vec<Vec<PathBuf>>, PoolError> {
    let paths = |parts: &[PartLayout]| -> Vec<PathBuf> {
        parts.iter().map(|p| p.path.clone()).collect()
    };
    layout
        .replicas
        .iter()
        .map(|r| match r {
            ReplicaLayout::Local(parts) => Ok(paths(parts)),
            ReplicaLayout::Remote { host, descriptor } => {
                let remote = descriptor_path(descriptor);
                let layout = read_layout(&remote).map_err(|e| {
                    failed(set, format!("replica on {}: {}", host, e))
                })?;
                if layout.replicas.len() > 1 {
                    return Err(failed(
                        &remote,
                        "a remote poolset has a single replica",
                    ));
                }
                Ok(paths(layout.primary()))
            }
        })
        .collect()
}

fn part_paths(state: &SimPoolState) -> Vec<Vec<PathBuf>> {
    state
        .replicas
        .iter()
        .map(|r| r.parts.iter().map(|p| p.path.clone()).collect())
        .collect()
}

impl SimPoolLibrary {
    pub fn new(colls: Vec<DimmCollection>, log: Logger) -> Self {
        SimPoolLibrary { colls, log }
    }

    fn stamp(&self, path: &Path) -> Result<DeviceStamp, PoolError> {
        let coll = self
            .colls
            .iter()
            .filter(|c| c.contains(path))
            .max_by_key(|c| c.mountpoint().as_os_str().len());
        let Some(coll) = coll else {
            return Ok(DeviceStamp {
                mountpoint: None,
                counts: Vec::new(),
            });
        };
        let mut counts = Vec::new();
        for dimm in coll {
            let c = dimm.shutdown_count().map_err(|e| failed(path, e))?;
            counts.push((dimm.uid().to_string(), c));
        }
        Ok(DeviceStamp {
            mountpoint: Some(coll.mountpoint().to_path_buf()),
            counts,
        })
    }

    fn restamp(&self, replica: &mut SimReplica) -> Result<(), PoolError> {
        for part in replica.parts.iter_mut() {
            part.stamp = Some(self.stamp(&part.path)?);
        }
        Ok(())
    }

    /// Where the state of the pool at `path` lives. A single file pool is
    /// tracked at whatever path it has now.
    fn locate(
        &self,
        path: &Path,
    ) -> Result<(PathBuf, SimPoolState), PoolError> {
        if is_poolset_file(path) {
            let layout = read_layout(path)?;
            let state_path = layout.primary()[0].path.clone();
            let state = load_state(&state_path)?;
            Ok((state_path, state))
        } else {
            let mut state = load_state(path)?;
            if let Some(part) = state
                .replicas
                .first_mut()
                .and_then(|r| r.parts.first_mut())
            {
                part.path = path.to_path_buf();
            }
            Ok((path.to_path_buf(), state))
        }
    }

    /// Mark replicas bad whose storage changed under a dirty pool.
    fn detect_unsafe_shutdown(
        &self,
        pool: &Path,
        state: &mut SimPoolState,
    ) -> Result<(), PoolError> {
        if !state.dirty {
            return Ok(());
        }
        for (i, replica) in state.replicas.iter_mut().enumerate() {
            if !replica.healthy {
                continue;
            }
            for part in replica.parts.iter() {
                let now = self.stamp(&part.path)?;
                if part.stamp.as_ref() != Some(&now) {
                    warn!(
                        self.log,
                        "{:?}: replica {} part {:?} went through an unsafe \
                         shutdown",
                        pool,
                        i,
                        part.path
                    );
                    replica.healthy = false;
                    break;
                }
            }
        }
        Ok(())
    }

    fn new_replica(
        &self,
        paths: Vec<PathBuf>,
        data: PoolData,
    ) -> Result<SimReplica, PoolError> {
        let mut r = SimReplica {
            parts: paths
                .into_iter()
                .map(|path| SimPart { path, stamp: None })
                .collect(),
            healthy: true,
            data,
        };
        self.restamp(&mut r)?;
        Ok(r)
    }

    /// Empty files for every part except the one holding the state.
    fn touch_parts(
        &self,
        paths: &[Vec<PathBuf>],
        state_path: &Path,
    ) -> Result<(), String> {
        for p in paths.iter().flatten() {
            if p != state_path && !p.exists() {
                std::fs::write(p, b"").map_err(|e| format!("{:?}: {}", p, e))?;
            }
        }
        Ok(())
    }

    fn tool_create(&self, args: &[&str]) -> Result<String, String> {
        let (kind, set) = match args {
            [kind, set] => (kind, set),
            _ => return Err("usage: create <obj|blk|log> <poolset>".into()),
        };
        let kind: PoolKind = kind
            .parse()
            .map_err(|_| format!("bad pool type {:?}", kind))?;
        let set = Path::new(set);
        let layout = read_layout(set).map_err(|e| e.to_string())?;
        let state_path = layout.primary()[0].path.clone();
        if state_path.exists() {
            return Err(format!("{:?}: pool already exists", state_path));
        }

        let paths =
            replica_paths(set, &layout).map_err(|e| e.to_string())?;
        let mut replicas = Vec::new();
        for p in paths.iter() {
            replicas.push(
                self.new_replica(p.clone(), PoolData::empty(kind))
                    .map_err(|e| e.to_string())?,
            );
        }
        self.touch_parts(&paths, &state_path)?;
        let state = SimPoolState {
            kind,
            dirty: false,
            replicas,
        };
        save_state(&state_path, &state).map_err(|e| e.to_string())?;
        Ok(format!("created {} pool from {:?}", kind, set))
    }

    fn tool_check(&self, args: &[&str]) -> Result<String, String> {
        let Some((path, flags)) = args.split_last() else {
            return Err("usage: check [-ry] <file>".into());
        };
        let repair = flags.iter().any(|f| {
            let short = f.starts_with('-') && !f.starts_with("--");
            *f == "--repair" || (short && f.contains('r'))
        });
        let path = Path::new(path);
        let (state_path, mut state) =
            self.locate(path).map_err(|e| e.to_string())?;
        self.detect_unsafe_shutdown(path, &mut state)
            .map_err(|e| e.to_string())?;

        if repair && !state.replicas[0].healthy {
            state.replicas[0].healthy = true;
            self.restamp(&mut state.replicas[0])
                .map_err(|e| e.to_string())?;
            info!(self.log, "{:?}: primary replica repaired", path);
        }
        let bad = state.replicas.iter().any(|r| !r.healthy);
        save_state(&state_path, &state).map_err(|e| e.to_string())?;

        if !repair && !state.replicas[0].healthy {
            return Err(format!("{:?}: not consistent", path));
        }
        if bad {
            Ok(format!("{:?}: primary consistent, replicas need sync", path))
        } else {
            Ok(format!("{:?}: consistent", path))
        }
    }

    fn tool_sync(&self, args: &[&str]) -> Result<String, String> {
        let Some(path) = args.iter().rev().find(|a| !a.starts_with('-')) else {
            return Err("usage: sync <poolset>".into());
        };
        let path = Path::new(path);
        let (state_path, mut state) =
            self.locate(path).map_err(|e| e.to_string())?;
        self.detect_unsafe_shutdown(path, &mut state)
            .map_err(|e| e.to_string())?;

        let Some(src) = state.replicas.iter().position(|r| r.healthy) else {
            save_state(&state_path, &state).map_err(|e| e.to_string())?;
            return Err(format!("{:?}: no healthy replica to sync from", path));
        };
        let data = state.replicas[src].data.clone();
        let mut fixed = 0;
        for replica in state.replicas.iter_mut().filter(|r| !r.healthy) {
            replica.data = data.clone();
            replica.healthy = true;
            self.restamp(replica).map_err(|e| e.to_string())?;
            fixed += 1;
        }
        save_state(&state_path, &state).map_err(|e| e.to_string())?;
        Ok(format!(
            "{:?}: synced {} replica(s) from replica {}",
            path, fixed, src
        ))
    }

    fn tool_transform(&self, args: &[&str]) -> Result<String, String> {
        let (src, dst) = match args {
            [src, dst] => (Path::new(src), Path::new(dst)),
            _ => return Err("usage: transform <src> <dst>".into()),
        };
        let (state_path, mut state) =
            self.locate(src).map_err(|e| e.to_string())?;
        self.detect_unsafe_shutdown(src, &mut state)
            .map_err(|e| e.to_string())?;
        save_state(&state_path, &state).map_err(|e| e.to_string())?;
        if let Some(i) = state.replicas.iter().position(|r| !r.healthy) {
            return Err(format!("{:?}: replica {} is damaged", src, i));
        }

        let layout = read_layout(dst).map_err(|e| e.to_string())?;
        let new_paths =
            replica_paths(dst, &layout).map_err(|e| e.to_string())?;
        let old_paths = part_paths(&state);
        if new_paths[0] != old_paths[0] {
            return Err("transform must keep the primary replica".into());
        }

        let data = state.replicas[0].data.clone();
        let mut replicas = Vec::new();
        for paths in new_paths.iter() {
            match old_paths.iter().position(|p| p == paths) {
                Some(i) => replicas.push(state.replicas[i].clone()),
                None => replicas.push(
                    self.new_replica(paths.clone(), data.clone())
                        .map_err(|e| e.to_string())?,
                ),
            }
        }
        self.touch_parts(&new_paths, &state_path)?;
        state.replicas = replicas;
        save_state(&state_path, &state).map_err(|e| e.to_string())?;
        Ok(format!("{:?} -> {:?}", src, dst))
    }
}

impl PoolLibrary for SimPoolLibrary {
    fn create(
        &self,
        kind: PoolKind,
        path: &Path,
    ) -> Result<Box<dyn PoolHandle>, PoolError> {
        if path.exists() {
            return Err(PoolError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }
        let replica =
            self.new_replica(vec![path.to_path_buf()], PoolData::empty(kind))?;
        let state = SimPoolState {
            kind,
            dirty: true,
            replicas: vec![replica],
        };
        save_state(path, &state)?;
        Ok(Box::new(SimHandle {
            state_path: path.to_path_buf(),
            path: path.to_path_buf(),
            kind,
        }))
    }

    fn open(
        &self,
        kind: PoolKind,
        path: &Path,
    ) -> Result<Box<dyn PoolHandle>, PoolError> {
        let (state_path, mut state) = self.locate(path)?;
        if state.kind != kind {
            return Err(PoolError::InvalidArgument {
                path: path.to_path_buf(),
                reason: format!("not a {} pool", kind),
            });
        }
        self.detect_unsafe_shutdown(path, &mut state)?;
        if let Some(i) = state.replicas.iter().position(|r| !r.healthy) {
            save_state(&state_path, &state)?;
            return Err(PoolError::InvalidArgument {
                path: path.to_path_buf(),
                reason: format!(
                    "replica {} needs recovery after unsafe shutdown",
                    i
                ),
            });
        }
        for replica in state.replicas.iter_mut() {
            self.restamp(replica)?;
        }
        state.dirty = true;
        save_state(&state_path, &state)?;
        Ok(Box::new(SimHandle {
            state_path,
            path: path.to_path_buf(),
            kind,
        }))
    }

    fn pmempool(&self, args: &[&str]) -> anyhow::Result<CommandOutput> {
        let res = match args {
            ["create", rest @ ..] => self.tool_create(rest),
            ["check", rest @ ..] => self.tool_check(rest),
            ["sync", rest @ ..] => self.tool_sync(rest),
            ["transform", rest @ ..] => self.tool_transform(rest),
            _ => Err(format!("unsupported command {:?}", args)),
        };
        let out = match res {
            Ok(msg) => CommandOutput {
                exit_code: 0,
                content: format!("{}\n", msg),
            },
            Err(msg) => CommandOutput {
                exit_code: 1,
                content: format!("error: {}\n", msg),
            },
        };
        info!(self.log, "pmempool {}: {}", args.join(" "), out);
        Ok(out)
    }
}

struct SimHandle {
    state_path: PathBuf,
    path: PathBuf,
    kind: PoolKind,
}

impl PoolHandle for SimHandle {
    fn path(&self) -> &Path {
        &self.path
    }

    fn kind(&self) -> PoolKind {
        self.kind
    }

    fn append(&mut self, data: &PoolData) -> Result<(), PoolError> {
        let mut state = load_state(&self.state_path)?;
        for replica in state.replicas.iter_mut() {
            if !replica.data.extend(data) {
                return Err(PoolError::InvalidArgument {
                    path: self.path.clone(),
                    reason: format!("cannot append {} data", data.kind()),
                });
            }
        }
        save_state(&self.state_path, &state)
    }

    fn read(&mut self) -> Result<PoolData, PoolError> {
        let state = load_state(&self.state_path)?;
        Ok(state.replicas[0].data.clone())
    }

    fn close(self: Box<Self>) -> Result<(), PoolError> {
        let mut state = load_state(&self.state_path)?;
        state.dirty = false;
        save_state(&self.state_path, &state)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::library::{test_pattern, write_test_pattern, TEST_VALUES};
    use crate::poolset::{part_line, remote_descriptor, Poolset};
    use ras_common::discard_logger;
    use ras_dimm::{Dimm, EmulatedDimm};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Rig {
        _dir: TempDir,
        us: PathBuf,
        safe: PathBuf,
        plain: PathBuf,
        us_dimm: EmulatedDimm,
        lib: SimPoolLibrary,
    }

    fn rig() -> Rig {
        let dir = tempdir().unwrap();
        let state = dir.path().join("state");
        let us = dir.path().join("us");
        let safe = dir.path().join("safe");
        let plain = dir.path().join("plain");
        for d in [&us, &safe, &plain] {
            std::fs::create_dir_all(d).unwrap();
        }
        let us_dimm = EmulatedDimm::new(&state, "nmem0");
        let safe_dimm = EmulatedDimm::new(&state, "nmem1");
        let colls = vec![
            DimmCollection::new(
                &us,
                vec![Arc::new(us_dimm.clone()) as Arc<dyn Dimm>],
            ),
            DimmCollection::new(
                &safe,
                vec![Arc::new(safe_dimm) as Arc<dyn Dimm>],
            ),
        ];
        Rig {
            _dir: dir,
            us,
            safe,
            plain,
            us_dimm,
            lib: SimPoolLibrary::new(colls, discard_logger()),
        }
    }

    #[test]
    fn dirty_pool_needs_repair_after_us() {
        let r = rig();
        let pool = r.us.join("obj_pool");
        let mut h = r.lib.create(PoolKind::Obj, &pool).unwrap();
        write_test_pattern(h.as_mut()).unwrap();
        drop(h);

        r.us_dimm.inject_unsafe_shutdown().unwrap();

        let e = r.lib.open(PoolKind::Obj, &pool).err().unwrap();
        assert!(e.is_invalid_argument(), "{}", e);
        // Still broken on a second try.
        assert!(r.lib.open(PoolKind::Obj, &pool).is_err());

        let out = r
            .lib
            .pmempool(&["check", "-ry", pool.to_str().unwrap()])
            .unwrap();
        assert_eq!(out.exit_code, 0, "{}", out);
        let mut h = r.lib.open(PoolKind::Obj, &pool).unwrap();
        assert_eq!(h.read().unwrap(), PoolData::Obj(TEST_VALUES.to_vec()));
        h.close().unwrap();
    }

    #[test]
    fn clean_pool_survives_us() {
        let r = rig();
        let pool = r.us.join("log_pool");
        let mut h = r.lib.create(PoolKind::Log, &pool).unwrap();
        write_test_pattern(h.as_mut()).unwrap();
        h.close().unwrap();

        r.us_dimm.inject_unsafe_shutdown().unwrap();

        let mut h = r.lib.open(PoolKind::Log, &pool).unwrap();
        assert_eq!(h.read().unwrap(), test_pattern(PoolKind::Log));
    }

    #[test]
    fn dirty_pool_on_untouched_dimm_opens() {
        let r = rig();
        let pool = r.safe.join("blk_pool");
        let mut h = r.lib.create(PoolKind::Blk, &pool).unwrap();
        write_test_pattern(h.as_mut()).unwrap();
        drop(h);
        r.us_dimm.inject_unsafe_shutdown().unwrap();
        assert!(r.lib.open(PoolKind::Blk, &pool).is_ok());
    }

    #[test]
    fn wrong_kind_and_missing() {
        let r = rig();
        let pool = r.safe.join("p");
        r.lib.create(PoolKind::Obj, &pool).unwrap().close().unwrap();
        let e = r.lib.open(PoolKind::Log, &pool).err().unwrap();
        assert!(e.is_invalid_argument());
        assert!(matches!(
            r.lib.open(PoolKind::Obj, &r.safe.join("nope")).err().unwrap(),
            PoolError::NotFound { .. }
        ));
        assert!(matches!(
            r.lib.create(PoolKind::Obj, &pool).err().unwrap(),
            PoolError::AlreadyExists { .. }
        ));
    }

    #[test]
    fn moved_dirty_pool_is_detected() {
        let r = rig();
        let pool = r.plain.join("pool");
        let mut h = r.lib.create(PoolKind::Obj, &pool).unwrap();
        write_test_pattern(h.as_mut()).unwrap();
        drop(h);

        let moved = r.safe.join("pool");
        std::fs::rename(&pool, &moved).unwrap();
        let e = r.lib.open(PoolKind::Obj, &moved).err().unwrap();
        assert!(e.is_invalid_argument());
        let out = r
            .lib
            .pmempool(&["check", "-ry", moved.to_str().unwrap()])
            .unwrap();
        assert!(out.success());
        assert!(r.lib.open(PoolKind::Obj, &moved).is_ok());
    }

    fn poolset(r: &Rig, name: &str, replica_dir: &Path) -> Poolset {
        Poolset::builder(&r.us, name)
            .primary(vec![
                part_line("9MB", &r.us.join(format!("{}_master.part0", name))),
                part_line(
                    "9MB",
                    &r.safe.join(format!("{}_master.part1", name)),
                ),
            ])
            .replica(vec![part_line(
                "9MB",
                &replica_dir.join(format!("{}_replica.part0", name)),
            )])
            .build()
    }

    fn create_and_fill(r: &Rig, ps: &Poolset) {
        ps.write_file().unwrap();
        let set = ps.full_path();
        let out = r
            .lib
            .pmempool(&["create", "obj", set.to_str().unwrap()])
            .unwrap();
        assert!(out.success(), "{}", out);
        let again = r
            .lib
            .pmempool(&["create", "obj", set.to_str().unwrap()])
            .unwrap();
        assert!(!again.success());
        let mut h = r.lib.open(PoolKind::Obj, &set).unwrap();
        write_test_pattern(h.as_mut()).unwrap();
    }

    #[test]
    fn sync_from_healthy_replica() {
        let r = rig();
        let ps = poolset(&r, "healthy", &r.safe);
        create_and_fill(&r, &ps);
        let set = ps.full_path();
        assert!(r.safe.join("healthy_master.part1").exists());

        r.us_dimm.inject_unsafe_shutdown().unwrap();

        assert!(r.lib.open(PoolKind::Obj, &set).is_err());
        let out = r.lib.pmempool(&["sync", set.to_str().unwrap()]).unwrap();
        assert_eq!(out.exit_code, 0, "{}", out);
        let mut h = r.lib.open(PoolKind::Obj, &set).unwrap();
        assert_eq!(h.read().unwrap(), test_pattern(PoolKind::Obj));
    }

    #[test]
    fn sync_without_healthy_replica() {
        let r = rig();
        let ps = poolset(&r, "shared", &r.us);
        create_and_fill(&r, &ps);
        let set = ps.full_path();
        let set_str = set.to_str().unwrap();

        r.us_dimm.inject_unsafe_shutdown().unwrap();

        let out = r.lib.pmempool(&["sync", set_str]).unwrap();
        assert_eq!(out.exit_code, 1);
        assert!(r.lib.open(PoolKind::Obj, &set).is_err());
        assert!(r.lib.pmempool(&["check", "-ry", set_str]).unwrap().success());
        assert!(r.lib.open(PoolKind::Obj, &set).is_err());
        assert!(r.lib.pmempool(&["sync", set_str]).unwrap().success());
        let mut h = r.lib.open(PoolKind::Obj, &set).unwrap();
        assert_eq!(h.read().unwrap(), test_pattern(PoolKind::Obj));
    }

    /// A poolset with its only replica on the "remote" side, kept in
    /// `remote_dir`.
    fn remote_poolset(r: &Rig, name: &str, remote_dir: &Path) -> Poolset {
        let part = |i| remote_dir.join(format!("{}_r.part{}", name, i));
        let remote =
            Poolset::builder(remote_dir, format!("{}_remote.set", name))
                .primary(vec![
                    part_line("18MB", &part(0)),
                    part_line("9MB", &part(1)),
                ])
                .build();
        remote.write_file().unwrap();
        Poolset::builder(&r.us, format!("{}.set", name))
            .primary(vec![part_line(
                "9MB",
                &r.us.join(format!("{}_master.part0", name)),
            )])
            .remote_replica("node-2", &remote_descriptor(&remote.full_path()))
            .build()
    }

    #[test]
    fn sync_from_remote_replica() {
        let r = rig();
        let ps = remote_poolset(&r, "far", &r.safe);
        create_and_fill(&r, &ps);
        assert!(r.safe.join("far_r.part1").exists());
        let set = ps.full_path();

        r.us_dimm.inject_unsafe_shutdown().unwrap();

        assert!(r.lib.open(PoolKind::Obj, &set).is_err());
        let out = r.lib.pmempool(&["sync", set.to_str().unwrap()]).unwrap();
        assert_eq!(out.exit_code, 0, "{}", out);
        let mut h = r.lib.open(PoolKind::Obj, &set).unwrap();
        assert_eq!(h.read().unwrap(), test_pattern(PoolKind::Obj));
    }

    #[test]
    fn remote_replica_on_unsafe_dimm() {
        let r = rig();
        let ps = remote_poolset(&r, "near", &r.us);
        create_and_fill(&r, &ps);
        let set = ps.full_path();
        let set_str = set.to_str().unwrap();

        r.us_dimm.inject_unsafe_shutdown().unwrap();

        assert_eq!(r.lib.pmempool(&["sync", set_str]).unwrap().exit_code, 1);
        assert!(r.lib.pmempool(&["check", "-ry", set_str]).unwrap().success());
        assert!(r.lib.pmempool(&["sync", set_str]).unwrap().success());
        assert!(r.lib.open(PoolKind::Obj, &set).is_ok());
    }

    #[test]
    fn missing_remote_poolset() {
        let r = rig();
        let ps = Poolset::builder(&r.us, "lost.set")
            .primary(vec![part_line("9MB", &r.us.join("lost.part0"))])
            .remote_replica(
                "node-2",
                &remote_descriptor(&r.plain.join("nothing.set")),
            )
            .build();
        ps.write_file().unwrap();
        let out = r
            .lib
            .pmempool(&["create", "obj", ps.full_path().to_str().unwrap()])
            .unwrap();
        assert_eq!(out.exit_code, 1);
        assert!(out.content.contains("node-2"), "{}", out);
        assert!(!r.us.join("lost.part0").exists());
    }

    #[test]
    fn transform_needs_healthy_replicas() {
        let r = rig();
        let origin = poolset(&r, "origin", &r.safe);
        create_and_fill(&r, &origin);

        // Same primary, replica moved to the unsafe DIMM.
        let added = Poolset::new(
            &r.us,
            "added.set",
            vec![
                origin.sections()[0].clone(),
                origin.sections()[1].clone(),
                vec![
                    "REPLICA".to_string(),
                    part_line("9MB", &r.us.join("added_replica.part0")),
                ],
            ],
        );
        added.write_file().unwrap();
        let o = origin.full_path();
        let a = added.full_path();
        let (o, a) = (o.to_str().unwrap(), a.to_str().unwrap());

        r.us_dimm.inject_unsafe_shutdown().unwrap();

        assert_eq!(r.lib.pmempool(&["transform", o, a]).unwrap().exit_code, 1);
        assert!(r.lib.pmempool(&["sync", o]).unwrap().success());
        let out = r.lib.pmempool(&["transform", o, a]).unwrap();
        assert!(out.success(), "{}", out);
        assert!(r.us.join("added_replica.part0").exists());

        let mut h = r.lib.open(PoolKind::Obj, &added.full_path()).unwrap();
        assert_eq!(h.read().unwrap(), test_pattern(PoolKind::Obj));
    }

    #[test]
    fn transform_keeps_primary() {
        let r = rig();
        let origin = poolset(&r, "keep", &r.safe);
        create_and_fill(&r, &origin);
        let other = Poolset::builder(&r.us, "other.set")
            .primary(vec![part_line("9MB", &r.us.join("elsewhere"))])
            .build();
        other.write_file().unwrap();
        let out = r
            .lib
            .pmempool(&[
                "transform",
                origin.full_path().to_str().unwrap(),
                other.full_path().to_str().unwrap(),
            ])
            .unwrap();
        assert_eq!(out.exit_code, 1);
    }

    #[test]
    fn unknown_tool_command() {
        let r = rig();
        assert_eq!(r.lib.pmempool(&["info", "x"]).unwrap().exit_code, 1);
        assert_eq!(r.lib.pmempool(&[]).unwrap().exit_code, 1);
    }
}
