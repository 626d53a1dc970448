// Copyright 2023 Oxide Computer Company
//! TOML configuration for the on-host test binary and the controller.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn load_toml<T>(path: &Path) -> Result<T, ConfigError>
where
    for<'de> T: Deserialize<'de>,
{
    let text =
        std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceBackend {
    #[default]
    Ndctl,
    Emulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolLibraryKind {
    #[default]
    External,
    Simulated,
}

/// One mountpoint and the DIMMs that back it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub mountpoint: PathBuf,
    #[serde(default)]
    pub dimms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub backend: DeviceBackend,
    /// Where emulated DIMMs keep their counters.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default, rename = "collection")]
    pub collections: Vec<CollectionConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub library: PoolLibraryKind,
    #[serde(default = "default_pmempool")]
    pub pmempool: PathBuf,
    #[serde(default = "default_pool_io")]
    pub pool_io: PathBuf,
}

fn default_pmempool() -> PathBuf {
    PathBuf::from("pmempool")
}

fn default_pool_io() -> PathBuf {
    PathBuf::from("pool-io")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        ToolsConfig {
            library: PoolLibraryKind::default(),
            pmempool: default_pmempool(),
            pool_io: default_pool_io(),
        }
    }
}

/// Whether the mountpoint at `index` in a configured list takes the
/// unsafe shutdown. Index 1 is the one kept safe.
pub fn is_designated_unsafe(index: usize) -> bool {
    index != 1
}

/// The node serving remote replicas, reached over ssh from the DUT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNodeConfig {
    pub address: String,
    /// Where `us-injecter` is installed on the node.
    pub bin_dir: PathBuf,
    /// Scratch storage on the node that is not persistent memory.
    pub test_dir: PathBuf,
    /// Designated like the local collections.
    #[serde(default)]
    pub mountpoints: Vec<PathBuf>,
    /// Config path on the node, forwarded to `us-injecter`.
    #[serde(default)]
    pub config: Option<PathBuf>,
    #[serde(default)]
    pub ssh_options: Vec<String>,
    /// Run the node's commands on this host instead of over ssh.
    #[serde(default)]
    pub loopback: bool,
}

impl RemoteNodeConfig {
    pub fn unsafe_mountpoints(&self) -> Vec<PathBuf> {
        self.designated(true)
    }

    pub fn safe_mountpoints(&self) -> Vec<PathBuf> {
        self.designated(false)
    }

    fn designated(&self, want_unsafe: bool) -> Vec<PathBuf> {
        self.mountpoints
            .iter()
            .enumerate()
            .filter(|(i, _)| is_designated_unsafe(*i) == want_unsafe)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

/// Configuration of the test binary running on a DUT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    pub test_dir: PathBuf,
    #[serde(default)]
    pub tools: ToolsConfig,
    pub devices: DeviceConfig,
    #[serde(default)]
    pub remote: Option<RemoteNodeConfig>,
}

impl LocalConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg: LocalConfig = load_toml(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.test_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("test_dir is empty".into()));
        }
        if self.devices.collections.is_empty() {
            return Err(ConfigError::Invalid(
                "no device collections configured".into(),
            ));
        }
        if self.devices.backend == DeviceBackend::Emulated {
            if self.devices.state_dir.is_none() {
                return Err(ConfigError::Invalid(
                    "emulated backend needs state_dir".into(),
                ));
            }
            if let Some(c) =
                self.devices.collections.iter().find(|c| c.dimms.is_empty())
            {
                return Err(ConfigError::Invalid(format!(
                    "emulated collection {:?} lists no dimms",
                    c.mountpoint
                )));
            }
        }
        if let Some(r) = &self.remote {
            if r.address.is_empty() {
                return Err(ConfigError::Invalid(
                    "remote node has no address".into(),
                ));
            }
            if r.test_dir.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(
                    "remote node has no test_dir".into(),
                ));
            }
        }
        Ok(())
    }
}

/// A device under test, as seen from the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DutConfig {
    pub address: String,
    pub bin_dir: PathBuf,
    /// Local command that power cycles this DUT.
    pub power_cycle: String,
    #[serde(default)]
    pub ssh_options: Vec<String>,
    /// Config path on the DUT, forwarded to the test binary.
    #[serde(default)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(rename = "dut")]
    pub duts: Vec<DutConfig>,
    #[serde(default = "default_test_binary")]
    pub test_binary: String,
}

fn default_test_binary() -> String {
    "unsafe-shutdown".to_string()
}

impl ControllerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg: ControllerConfig = load_toml(path)?;
        if cfg.duts.is_empty() {
            return Err(ConfigError::Invalid("no dut configured".into()));
        }
        Ok(cfg)
    }
}
