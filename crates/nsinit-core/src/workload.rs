//! Workload descriptor started by the init process

use crate::{NsinitError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Where a standard stream of the workload goes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Redirect {
    /// Share the init process's stream
    #[default]
    Inherit,
    /// /dev/null
    Null,
    /// Truncate (or open for reading, for stdin) the given file
    File(PathBuf),
    /// Append to the given file
    Append(PathBuf),
}

impl Redirect {
    fn to_stdio(&self, input: bool) -> Result<Stdio> {
        let stdio = match self {
            Self::Inherit => Stdio::inherit(),
            Self::Null => Stdio::null(),
            Self::File(path) if input => File::open(path).map(Stdio::from).map_err(|e| {
                NsinitError::Workload(format!("failed to open {}: {e}", path.display()))
            })?,
            Self::File(path) => File::create(path).map(Stdio::from).map_err(|e| {
                NsinitError::Workload(format!("failed to create {}: {e}", path.display()))
            })?,
            Self::Append(path) => OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map(Stdio::from)
                .map_err(|e| {
                    NsinitError::Workload(format!("failed to open {}: {e}", path.display()))
                })?,
        };
        Ok(stdio)
    }
}

/// Command line, environment and I/O of a process to run in the namespace
///
/// Only `program` is required when deserializing; every other field
/// falls back to its empty value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to execute, resolved through PATH like `Command::new`
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Start from an empty environment instead of the init process's
    #[serde(default)]
    pub clear_env: bool,
    /// Working directory
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub stdin: Redirect,
    #[serde(default)]
    pub stdout: Redirect,
    #[serde(default)]
    pub stderr: Redirect,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            clear_env: false,
            cwd: None,
            stdin: Redirect::Inherit,
            stdout: Redirect::Inherit,
            stderr: Redirect::Inherit,
        }
    }

    /// `sh -c <script>`
    #[must_use]
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("/bin/sh").arg("-c").arg(script)
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn clear_env(mut self, clear: bool) -> Self {
        self.clear_env = clear;
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn stdin(mut self, redirect: Redirect) -> Self {
        self.stdin = redirect;
        self
    }

    #[must_use]
    pub fn stdout(mut self, redirect: Redirect) -> Self {
        self.stdout = redirect;
        self
    }

    #[must_use]
    pub fn stderr(mut self, redirect: Redirect) -> Self {
        self.stderr = redirect;
        self
    }

    /// Build the `Command` without starting it
    pub fn command(&self) -> Result<Command> {
        if self.program.as_os_str().is_empty() {
            return Err(NsinitError::Workload("empty program".into()));
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if self.clear_env {
            cmd.env_clear();
        }
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));

        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        cmd.stdin(self.stdin.to_stdio(true)?)
            .stdout(self.stdout.to_stdio(false)?)
            .stderr(self.stderr.to_stdio(false)?);

        Ok(cmd)
    }

    /// Start the workload as a child of the calling process.
    ///
    /// The returned pid is never waited on through `std::process::Child`;
    /// the init process reaps it together with every other descendant.
    pub fn spawn(&self) -> Result<u32> {
        let child = self.command()?.spawn().map_err(|e| {
            NsinitError::Workload(format!("failed to spawn {}: {e}", self.program.display()))
        })?;

        let pid = child.id();
        tracing::debug!(pid, program = %self.program.display(), "workload started");

        Ok(pid)
    }
}
