// Copyright 2023 Oxide Computer Company
//! Running local commands and capturing what they print.
use std::ffi::OsStr;
use std::fmt;
use std::process::{Command, Output};

use anyhow::{Context, Result};

/// Exit code plus everything the command printed (stdout, then stderr).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub content: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl fmt::Display for CommandOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit code {}", self.exit_code)?;
        if !self.content.trim().is_empty() {
            write!(f, ", output:\n{}", self.content.trim_end())?;
        }
        Ok(())
    }
}

impl From<Output> for CommandOutput {
    fn from(out: Output) -> Self {
        let mut content = String::from_utf8_lossy(&out.stdout).into_owned();
        content.push_str(&String::from_utf8_lossy(&out.stderr));
        CommandOutput {
            // Killed by a signal.
            exit_code: out.status.code().unwrap_or(-1),
            content,
        }
    }
}

/// Run `cmd` through `sh -c`.
pub fn execute(cmd: &str) -> Result<CommandOutput> {
    let out = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .with_context(|| format!("spawn sh -c {:?}", cmd))?;
    Ok(out.into())
}

/// Run `program` directly with `args`, no shell involved.
pub fn run<S, I, A>(program: S, args: I) -> Result<CommandOutput>
where
    S: AsRef<OsStr>,
    I: IntoIterator<Item = A>,
    A: AsRef<OsStr>,
{
    let program = program.as_ref();
    let out = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("spawn {:?}", program))?;
    Ok(out.into())
}

/// Quote `s` for a POSIX shell: single quotes, with embedded single quotes
/// closed, escaped and reopened.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

/// Arguments for `ssh` running `cmd` on `address`. The connection gives up
/// quickly once the peer stops answering, so a power cycle shows up as
/// exit code 255.
pub fn ssh_args(address: &str, options: &[String], cmd: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "-o",
        "ServerAliveInterval=1",
        "-o",
        "PasswordAuthentication=no",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    args.extend(options.iter().cloned());
    args.push(address.to_string());
    args.push(cmd.to_string());
    args
}

/// Runs shell commands on another host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteShell {
    address: String,
    options: Vec<String>,
    /// The host shares this one's file systems; run through `sh -c`.
    loopback: bool,
}

impl RemoteShell {
    pub fn ssh(address: &str, options: &[String]) -> Self {
        RemoteShell {
            address: address.to_string(),
            options: options.to_vec(),
            loopback: false,
        }
    }

    pub fn loopback(address: &str) -> Self {
        RemoteShell {
            address: address.to_string(),
            options: Vec::new(),
            loopback: true,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn execute(&self, cmd: &str) -> Result<CommandOutput> {
        if self.loopback {
            execute(cmd)
        } else {
            run("ssh", ssh_args(&self.address, &self.options, cmd))
        }
    }
}

/// Async flavor of [`execute`], for the controller.
pub async fn execute_async(cmd: &str) -> Result<CommandOutput> {
    let out = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .with_context(|| format!("spawn sh -c {:?}", cmd))?;
    Ok(out.into())
}

/// Async flavor of [`run`].
pub async fn run_async<S, I, A>(program: S, args: I) -> Result<CommandOutput>
where
    S: AsRef<OsStr>,
    I: IntoIterator<Item = A>,
    A: AsRef<OsStr>,
{
    let program = program.as_ref();
    let out = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("spawn {:?}", program))?;
    Ok(out.into())
}
