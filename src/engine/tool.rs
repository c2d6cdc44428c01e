//! engine::tool
//!
//! Launching the provisioning tool.
//!
//! # Architecture
//!
//! The pipeline builds [`ToolInvocation`] values and hands them to a
//! [`ToolRunner`]. [`TerraformCli`] spawns the configured binary with
//! `tokio::process`; tests substitute a recording runner.
//!
//! # Invariants
//!
//! - The tool always runs in the module directory
//! - A running child is killed when its `run` future is dropped, which is
//!   how cancellation reaches the tool
//! - Both output streams are captured; echoing them is optional

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::Operation;
use crate::remote::BackendConfig;

/// Errors from running the provisioning tool.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The binary could not be started.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and reported failure.
    #[error("'{program} {command}' exited with {}{}", exit_label(.code), stderr_tail(.stderr))]
    NonZeroExit {
        program: String,
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Reading the child's output or waiting for it failed.
    #[error("i/o error while running '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

fn stderr_tail(stderr: &str) -> String {
    let last = stderr.lines().rev().find(|l| !l.trim().is_empty());
    match last {
        Some(line) => format!(": {}", line.trim()),
        None => String::new(),
    }
}

/// One run of the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Binary name or path
    pub program: String,
    /// Working directory (the module directory)
    pub dir: PathBuf,
    pub args: Vec<String>,
}

impl ToolInvocation {
    /// Subcommand name (first argument), for messages.
    pub fn command(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }

    /// `init -input=false`, with `-backend-config` arguments when the module
    /// has remote state.
    pub fn init(program: &str, dir: &Path, backend: Option<&BackendConfig>) -> Self {
        let mut args = vec!["init".to_string(), "-input=false".to_string()];
        if let Some(backend) = backend {
            args.extend(backend.to_args());
        }
        Self {
            program: program.to_string(),
            dir: dir.to_path_buf(),
            args,
        }
    }

    /// The operation itself with `-var` pairs and extra arguments.
    ///
    /// # Example
    ///
    /// ```
    /// use std::collections::BTreeMap;
    /// use std::path::Path;
    /// use stackguard::engine::{Operation, ToolInvocation};
    ///
    /// let vars = BTreeMap::from([("env".to_string(), "qa".to_string())]);
    /// let inv = ToolInvocation::operation(
    ///     "terraform",
    ///     Path::new("/live/qa/app"),
    ///     Operation::Apply,
    ///     &vars,
    ///     &[],
    /// );
    /// assert_eq!(
    ///     inv.args,
    ///     vec!["apply", "-input=false", "-auto-approve", "-var", "env=qa"]
    /// );
    /// ```
    pub fn operation(
        program: &str,
        dir: &Path,
        operation: Operation,
        vars: &BTreeMap<String, String>,
        extra_args: &[String],
    ) -> Self {
        let mut args: Vec<String> = operation.tool_args().iter().map(|a| a.to_string()).collect();
        for (name, value) in vars {
            args.push("-var".to_string());
            args.push(format!("{}={}", name, value));
        }
        args.extend(extra_args.iter().cloned());
        Self {
            program: program.to_string(),
            dir: dir.to_path_buf(),
            args,
        }
    }
}

/// Captured result of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs the provisioning tool.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run `invocation` to completion.
    ///
    /// # Errors
    ///
    /// [`RunnerError::NonZeroExit`] if the tool fails, [`RunnerError::Spawn`]
    /// if it cannot be started.
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, RunnerError>;
}

/// Runner that spawns a real process.
#[derive(Debug, Clone, Default)]
pub struct TerraformCli {
    echo: bool,
}

impl TerraformCli {
    /// Create a runner. With `echo`, the child's output is forwarded line by
    /// line to our stdout and stderr as it arrives.
    pub fn new(echo: bool) -> Self {
        Self { echo }
    }
}

#[async_trait]
impl ToolRunner for TerraformCli {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, RunnerError> {
        info!(
            program = %invocation.program,
            dir = %invocation.dir.display(),
            command = invocation.command(),
            "running tool"
        );
        debug!(args = ?invocation.args, "tool arguments");

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let io_err = |source| RunnerError::Io {
            program: invocation.program.clone(),
            source,
        };

        let (status, stdout, stderr) = tokio::join!(
            child.wait(),
            collect(stdout, self.echo.then_some(Stream::Out)),
            collect(stderr, self.echo.then_some(Stream::Err)),
        );
        let status = status.map_err(io_err)?;
        let stdout = stdout.map_err(io_err)?;
        let stderr = stderr.map_err(io_err)?;

        if !status.success() {
            return Err(RunnerError::NonZeroExit {
                program: invocation.program.clone(),
                command: invocation.command().to_string(),
                code: status.code(),
                stderr,
            });
        }

        Ok(ToolOutput { stdout, stderr })
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Out,
    Err,
}

/// Read `reader` to the end, optionally echoing each line.
async fn collect<R>(reader: Option<R>, echo: Option<Stream>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(String::new());
    };

    let mut lines = BufReader::new(reader).lines();
    let mut captured = String::new();
    while let Some(line) = lines.next_line().await? {
        match echo {
            Some(Stream::Out) => println!("{}", line),
            Some(Stream::Err) => eprintln!("{}", line),
            None => {}
        }
        captured.push_str(&line);
        captured.push('\n');
    }
    Ok(captured)
}
