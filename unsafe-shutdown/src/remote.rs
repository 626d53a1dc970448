// Copyright 2023 Oxide Computer Company
//! The node holding remote replicas. The tests reach it over ssh and drive
//! its DIMMs through `us-injecter` installed there.
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ras_common::shell::{quote, RemoteShell};
use ras_common::{CommandOutput, LocalConfig, RemoteNodeConfig};
use ras_dimm::{collections_from_config, DimmCollection};
use ras_pool::RemoteInventory;
use slog::{info, o, Logger};

pub trait RemoteNode: fmt::Debug + Send + Sync {
    fn inventory(&self) -> RemoteInventory;

    /// Create the test directory and the mountpoints.
    fn setup(&self) -> Result<()>;

    fn write_file(&self, path: &Path, contents: &str) -> Result<()>;

    /// Record the counters of the DIMMs under `mountpoints`, then inject
    /// an unsafe shutdown into each.
    fn inject(&self, mountpoints: &[PathBuf]) -> Result<()>;

    /// Whether every DIMM under `mountpoints` went up by exactly one since
    /// [`RemoteNode::inject`].
    fn check_unsafe(&self, mountpoints: &[PathBuf]) -> Result<bool>;

    /// Remove the test directory and empty the mountpoints.
    fn cleanup(&self) -> Result<()>;

    /// DIMMs of the node this host sees directly, so the simulated pool
    /// library can stamp remote parts.
    fn visible_collections(
        &self,
        log: &Logger,
    ) -> Result<Vec<DimmCollection>>;
}

fn path_arg(p: &Path) -> String {
    quote(&p.to_string_lossy())
}

/// A node driven by shell commands, over ssh or on this host.
#[derive(Debug)]
pub struct ShellNode {
    cfg: RemoteNodeConfig,
    shell: RemoteShell,
    log: Logger,
}

impl ShellNode {
    pub fn new(cfg: RemoteNodeConfig, log: Logger) -> Self {
        let shell = if cfg.loopback {
            RemoteShell::loopback(&cfg.address)
        } else {
            RemoteShell::ssh(&cfg.address, &cfg.ssh_options)
        };
        let log = log.new(o!("node" => cfg.address.clone()));
        ShellNode { cfg, shell, log }
    }

    fn injecter_command(
        &self,
        action: &str,
        mountpoints: &[PathBuf],
    ) -> String {
        let mut cmd = path_arg(&self.cfg.bin_dir.join("us-injecter"));
        if let Some(c) = &self.cfg.config {
            cmd.push_str(&format!(" --config {}", path_arg(c)));
        }
        cmd.push_str(&format!(
            " --test-dir {} {}",
            path_arg(&self.cfg.test_dir),
            action
        ));
        for m in mountpoints {
            cmd.push(' ');
            cmd.push_str(&path_arg(m));
        }
        cmd
    }

    fn setup_command(&self) -> String {
        let mut cmd = format!("mkdir -p {}", path_arg(&self.cfg.test_dir));
        for m in self.cfg.mountpoints.iter() {
            cmd.push(' ');
            cmd.push_str(&path_arg(m));
        }
        cmd
    }

    fn cleanup_command(&self) -> String {
        let test_dir = path_arg(&self.cfg.test_dir);
        let mut steps = vec![format!("rm -rf {}", test_dir)];
        for m in self.cfg.mountpoints.iter() {
            steps.push(format!(
                "if [ -d {0} ]; then find {0} -mindepth 1 -delete; fi",
                path_arg(m)
            ));
        }
        steps.join(" && ")
    }

    fn write_command(path: &Path, contents: &str) -> String {
        let dir = path.parent().unwrap_or(Path::new("/"));
        format!(
            "mkdir -p {} && printf %s {} > {}",
            path_arg(dir),
            quote(contents),
            path_arg(path)
        )
    }

    fn execute(&self, cmd: &str) -> Result<CommandOutput> {
        info!(self.log, "{}", cmd);
        self.shell
            .execute(cmd)
            .with_context(|| format!("on {}", self.shell.address()))
    }

    fn execute_ok(&self, cmd: &str) -> Result<()> {
        let out = self.execute(cmd)?;
        if !out.success() {
            bail!("on {}: {}: {}", self.shell.address(), cmd, out);
        }
        Ok(())
    }
}

impl RemoteNode for ShellNode {
    fn inventory(&self) -> RemoteInventory {
        RemoteInventory {
            host: self.cfg.address.clone(),
            unsafe_mountpoints: self.cfg.unsafe_mountpoints(),
            safe_mountpoints: self.cfg.safe_mountpoints(),
            non_dimm_dir: self.cfg.test_dir.clone(),
        }
    }

    fn setup(&self) -> Result<()> {
        self.execute_ok(&self.setup_command())
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        self.execute_ok(&Self::write_command(path, contents))
    }

    fn inject(&self, mountpoints: &[PathBuf]) -> Result<()> {
        self.execute_ok(&self.injecter_command("inject", mountpoints))
    }

    fn check_unsafe(&self, mountpoints: &[PathBuf]) -> Result<bool> {
        let out =
            self.execute(&self.injecter_command("check-unsafe", mountpoints))?;
        match out.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            _ => bail!("on {}: check-unsafe: {}", self.shell.address(), out),
        }
    }

    fn cleanup(&self) -> Result<()> {
        self.execute_ok(&self.cleanup_command())
    }

    fn visible_collections(
        &self,
        log: &Logger,
    ) -> Result<Vec<DimmCollection>> {
        match (&self.cfg.config, self.cfg.loopback) {
            (Some(path), true) => {
                let cfg = LocalConfig::load(path)?;
                Ok(collections_from_config(&cfg.devices, log)?)
            }
            _ => Ok(Vec::new()),
        }
    }
}

pub fn node_from_config(
    cfg: Option<&RemoteNodeConfig>,
    log: &Logger,
) -> Option<Arc<dyn RemoteNode>> {
    cfg.map(|c| {
        Arc::new(ShellNode::new(c.clone(), log.clone())) as Arc<dyn RemoteNode>
    })
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use ras_dimm::InjectManager;

    /// A node whose DIMMs are in this process.
    #[derive(Debug)]
    pub struct InProcessNode {
        pub inventory: RemoteInventory,
        pub colls: Vec<DimmCollection>,
        pub inject: InjectManager,
    }

    impl InProcessNode {
        fn colls_at(
            &self,
            mountpoints: &[PathBuf],
        ) -> Result<Vec<DimmCollection>> {
            mountpoints
                .iter()
                .map(|m| {
                    self.colls
                        .iter()
                        .find(|c| c.mountpoint() == m)
                        .cloned()
                        .with_context(|| format!("{:?} not on the node", m))
                })
                .collect()
        }
    }

    impl RemoteNode for InProcessNode {
        fn inventory(&self) -> RemoteInventory {
            self.inventory.clone()
        }

        fn setup(&self) -> Result<()> {
            std::fs::create_dir_all(&self.inventory.non_dimm_dir)?;
            for c in self.colls.iter() {
                std::fs::create_dir_all(c.mountpoint())?;
            }
            Ok(())
        }

        fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            Ok(std::fs::write(path, contents)?)
        }

        fn inject(&self, mountpoints: &[PathBuf]) -> Result<()> {
            let colls = self.colls_at(mountpoints)?;
            self.inject.record_usc_all(&colls)?;
            self.inject.inject_all(&colls)?;
            Ok(())
        }

        fn check_unsafe(&self, mountpoints: &[PathBuf]) -> Result<bool> {
            let colls = self.colls_at(mountpoints)?;
            Ok(self.inject.is_usc_increased_by(1, &colls))
        }

        fn cleanup(&self) -> Result<()> {
            let dir = &self.inventory.non_dimm_dir;
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
            for c in self.colls.iter().filter(|c| c.mountpoint().exists()) {
                for entry in std::fs::read_dir(c.mountpoint())? {
                    let path = entry?.path();
                    if path.is_dir() {
                        std::fs::remove_dir_all(&path)?;
                    } else {
                        std::fs::remove_file(&path)?;
                    }
                }
            }
            Ok(())
        }

        fn visible_collections(
            &self,
            _log: &Logger,
        ) -> Result<Vec<DimmCollection>> {
            Ok(self.colls.clone())
        }
    }
}
