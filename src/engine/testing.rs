//! engine::testing
//!
//! Test doubles for the engine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::tool::{RunnerError, ToolInvocation, ToolOutput, ToolRunner};
use crate::core::config::{resolve_dir, ResolvedConfig, Substitutions, CONFIG_FILE_NAME};

/// Runner that records invocations instead of spawning anything.
#[derive(Debug, Clone, Default)]
pub struct RecordingRunner {
    calls: Arc<Mutex<Vec<ToolInvocation>>>,
    /// Subcommand -> directory suffix that fails (empty suffix fails everywhere)
    fail: Arc<Mutex<HashMap<String, String>>>,
    hang_on: Option<String>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `command` in any directory ending with `dir_suffix`.
    pub fn fail_on(self, command: &str, dir_suffix: &str) -> Self {
        self.fail
            .lock()
            .unwrap()
            .insert(command.to_string(), dir_suffix.to_string());
        self
    }

    /// Block forever on `command`.
    pub fn hang_on(mut self, command: &str) -> Self {
        self.hang_on = Some(command.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Directories in which `command` ran, in call order.
    pub fn dirs_for(&self, command: &str) -> Vec<std::path::PathBuf> {
        self.calls()
            .into_iter()
            .filter(|c| c.command() == command)
            .map(|c| c.dir)
            .collect()
    }
}

#[async_trait]
impl ToolRunner for RecordingRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, RunnerError> {
        self.calls.lock().unwrap().push(invocation.clone());

        if self.hang_on.as_deref() == Some(invocation.command()) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let failing = self
            .fail
            .lock()
            .unwrap()
            .get(invocation.command())
            .cloned();
        if let Some(suffix) = failing {
            if invocation.dir.ends_with(&suffix) || suffix.is_empty() {
                return Err(RunnerError::NonZeroExit {
                    program: invocation.program.clone(),
                    command: invocation.command().to_string(),
                    code: Some(1),
                    stderr: "Error: simulated failure\n".into(),
                });
            }
        }

        Ok(ToolOutput {
            stdout: format!("{} complete\n", invocation.command()),
            stderr: String::new(),
        })
    }
}

/// Write a module configuration into `dir` (creating it).
pub fn write_module(dir: &Path, contents: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(CONFIG_FILE_NAME), contents).unwrap();
}

/// Write and resolve a module configuration.
pub fn module(dir: &Path, contents: &str) -> ResolvedConfig {
    write_module(dir, contents);
    resolve_dir(dir, &Substitutions::new()).unwrap()
}
