//! Host-side command execution
//!
//! The dispatcher host runs the image tool, the partition table dump, loop
//! mounts and tar. Everything goes through [`HostOps`] so deploy paths can
//! be exercised against a recording fake.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{Error, Result};

/// A program invocation on the dispatcher host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    pub sudo: bool,
    pub current_dir: Option<PathBuf>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            sudo: false,
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        let arg = path.display().to_string();
        self.arg(arg)
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run through `sudo` when `enabled`
    pub fn sudo(mut self, enabled: bool) -> Self {
        self.sudo = enabled;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Full argument vector as executed, including `sudo`
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        if self.sudo {
            argv.push("sudo".to_string());
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Exit status and combined output of a host command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOutput {
    pub status: i32,
    pub output: String,
}

impl HostOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            status: 0,
            output: output.into(),
        }
    }

    pub fn failed(status: i32, output: impl Into<String>) -> Self {
        Self {
            status,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs programs on the dispatcher host
#[async_trait]
pub trait HostOps: Send + Sync {
    /// Run a command to completion; a nonzero status is not an error
    async fn run(&self, command: &HostCommand) -> Result<HostOutput>;

    /// Run a command that must succeed, surfacing its output otherwise
    async fn run_checked(&self, command: &HostCommand) -> Result<HostOutput> {
        let output = self.run(command).await?;
        if !output.success() {
            return Err(Error::ToolFailed {
                tool: command.program.clone(),
                status: output.status,
                output: output.output.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Host operations backed by real processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

#[async_trait]
impl HostOps for SystemHost {
    async fn run(&self, command: &HostCommand) -> Result<HostOutput> {
        let argv = command.argv();
        debug!("host: {}", command);

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| Error::ToolFailed {
            tool: command.program.clone(),
            status: -1,
            output: format!("failed to start: {}", e),
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        // Killed by a signal: no exit code
        let status = output.status.code().unwrap_or(-1);
        if status != 0 {
            debug!("host: {} exited with {}", command.program, status);
        }

        Ok(HostOutput {
            status,
            output: combined,
        })
    }
}
