// Copyright 2023 Oxide Computer Company
//! Real NVDIMMs, driven through the `ndctl` utility.
use std::path::{Path, PathBuf};

use ras_common::shell;
use serde_json::Value;

use crate::{Dimm, DimmError};

const NDCTL: &str = "ndctl";

#[derive(Debug, Clone)]
pub struct NdctlDimm {
    /// Kernel device name, `nmem0`.
    dev: String,
    /// The DIMM's own id, stable across reboots and renumbering.
    uid: String,
}

impl NdctlDimm {
    /// Look up `dev` and remember its id.
    pub fn open(dev: &str) -> Result<Self, DimmError> {
        let json = ndctl_json(&["list", "-D", "-d", dev]).map_err(|reason| {
            DimmError::ReadCount {
                dimm: dev.to_string(),
                reason,
            }
        })?;
        let uid = find_dimm(&json, dev)
            .and_then(|d| d.get("id"))
            .and_then(Value::as_str)
            .unwrap_or(dev)
            .to_string();
        Ok(NdctlDimm {
            dev: dev.to_string(),
            uid,
        })
    }

    pub fn dev(&self) -> &str {
        &self.dev
    }
}

impl Dimm for NdctlDimm {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn shutdown_count(&self) -> Result<u64, DimmError> {
        let err = |reason: String| DimmError::ReadCount {
            dimm: self.uid.clone(),
            reason,
        };
        let json =
            ndctl_json(&["list", "-D", "-H", "-d", &self.dev]).map_err(err)?;
        parse_shutdown_count(&json, &self.dev).map_err(err)
    }

    fn inject_unsafe_shutdown(&self) -> Result<(), DimmError> {
        let err = |reason: String| DimmError::Inject {
            dimm: self.uid.clone(),
            reason,
        };
        let args = ["inject-smart", "--unsafe-shutdown", self.dev.as_str()];
        let out =
            shell::run(NDCTL, args).map_err(|e| err(format!("{:#}", e)))?;
        if !out.success() {
            return Err(err(format!("ndctl inject-smart: {}", out)));
        }
        Ok(())
    }
}

fn ndctl_json(args: &[&str]) -> Result<Value, String> {
    let out = shell::run(NDCTL, args).map_err(|e| format!("{:#}", e))?;
    if !out.success() {
        return Err(format!("ndctl {}: {}", args.join(" "), out));
    }
    serde_json::from_str(&out.content)
        .map_err(|e| format!("ndctl {}: bad json: {}", args.join(" "), e))
}

/// ndctl prints a bare object for one match and an array for several.
fn find_dimm<'a>(json: &'a Value, dev: &str) -> Option<&'a Value> {
    let is_dev = |v: &&Value| v.get("dev").and_then(Value::as_str) == Some(dev);
    match json {
        Value::Array(list) => list.iter().find(is_dev),
        Value::Object(_) => Some(json).filter(is_dev),
        _ => None,
    }
}

fn parse_shutdown_count(json: &Value, dev: &str) -> Result<u64, String> {
    let dimm =
        find_dimm(json, dev).ok_or_else(|| format!("{} not listed", dev))?;
    dimm.get("health")
        .and_then(|h| h.get("shutdown_count"))
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("{} reports no health.shutdown_count", dev))
}

/// Find the block device mounted at `mountpoint` in /proc/mounts content.
fn block_device_for(mounts: &str, mountpoint: &Path) -> Option<String> {
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let dev = fields.next()?;
        let dir = fields.next()?;
        if Path::new(dir) == mountpoint {
            dev.strip_prefix("/dev/").map(str::to_string)
        } else {
            None
        }
    })
}

/// DIMMs interleaved into the region that holds `blockdev`.
fn dimms_for_blockdev(json: &Value, blockdev: &str) -> Vec<String> {
    let regions = match json {
        Value::Object(o) => o.get("regions").and_then(Value::as_array),
        Value::Array(a) => Some(a),
        _ => None,
    };
    let Some(regions) = regions else {
        return Vec::new();
    };

    let holds_blockdev = |r: &&Value| {
        r.get("namespaces")
            .and_then(Value::as_array)
            .map(|ns| {
                ns.iter().any(|n| {
                    n.get("blockdev").and_then(Value::as_str) == Some(blockdev)
                })
            })
            .unwrap_or(false)
    };

    regions
        .iter()
        .find(holds_blockdev)
        .and_then(|r| r.get("mappings"))
        .and_then(Value::as_array)
        .map(|m| {
            m.iter()
                .filter_map(|m| m.get("dimm").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Work out which DIMMs back the file system mounted at `mountpoint`.
pub fn discover_dimms(mountpoint: &Path) -> Result<Vec<String>, DimmError> {
    let err = |reason: String| DimmError::Discovery {
        mountpoint: PathBuf::from(mountpoint),
        reason,
    };
    let mounts = std::fs::read_to_string("/proc/mounts")
        .map_err(|e| err(format!("/proc/mounts: {}", e)))?;
    let blockdev = block_device_for(&mounts, mountpoint)
        .ok_or_else(|| err("not a mounted block device".into()))?;
    let json = ndctl_json(&["list", "-R", "-N", "-D"]).map_err(err)?;
    let dimms = dimms_for_blockdev(&json, &blockdev);
    if dimms.is_empty() {
        return Err(err(format!("no region holds {}", blockdev)));
    }
    Ok(dimms)
}
