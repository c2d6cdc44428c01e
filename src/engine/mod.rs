//! engine
//!
//! Runs the provisioning tool against one module or a whole stack.
//!
//! # Architecture
//!
//! A single-module command flows through [`ModulePipeline`]:
//!
//! ```text
//! Resolve config -> Ensure remote state -> Acquire lock -> Run tool -> Release lock
//! ```
//!
//! A stack command runs the same pipeline for every module under a root,
//! in dependency order:
//!
//! ```text
//! Discover -> Order -> Execute (fail-stop)
//! ```
//!
//! # Modules
//!
//! - [`tool`]: Tool invocations and the process runner
//! - [`pipeline`]: One module, end to end
//! - [`discover`]: Finding modules under a root
//! - [`stack`]: Ordering and fail-stop execution
//!
//! # Invariants
//!
//! - A lock taken for a module is released before its pipeline returns,
//!   whether the tool succeeded, failed or was cancelled
//! - `plan` never takes a lock
//! - Stacks run sequentially; the first failure stops the run

pub mod discover;
pub mod pipeline;
pub mod stack;
#[cfg(test)]
pub(crate) mod testing;
pub mod tool;

pub use discover::{discover, Module};
pub use pipeline::{ModuleLock, ModulePipeline, ModuleReport, PipelineError, PipelineOptions};
pub use stack::{
    order_modules, plan_stack, ModuleFailure, StackError, StackOptions, StackResult, StackRunner,
};
pub use tool::{RunnerError, TerraformCli, ToolInvocation, ToolOutput, ToolRunner};

use std::fmt;
use std::path::PathBuf;

/// Execution context for commands.
///
/// Contains global settings derived from CLI flags that affect command behavior.
#[derive(Debug, Clone)]
pub struct Context {
    /// Working directory override.
    pub cwd: Option<PathBuf>,
    /// Debug logging enabled.
    pub debug: bool,
    /// Quiet mode (minimal output).
    pub quiet: bool,
    /// Interactive mode enabled.
    pub interactive: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            cwd: None,
            debug: false,
            quiet: false,
            interactive: true,
        }
    }
}

/// What to do to a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Plan,
    Apply,
    Destroy,
}

impl Operation {
    /// Whether the operation changes state (and therefore locks).
    pub fn is_mutating(self) -> bool {
        matches!(self, Operation::Apply | Operation::Destroy)
    }

    /// Whether a stack runs this operation in reverse dependency order.
    pub fn reverses_order(self) -> bool {
        matches!(self, Operation::Destroy)
    }

    /// Subcommand and fixed flags passed to the tool.
    pub fn tool_args(self) -> &'static [&'static str] {
        match self {
            Operation::Plan => &["plan", "-input=false"],
            Operation::Apply => &["apply", "-input=false", "-auto-approve"],
            Operation::Destroy => &["destroy", "-auto-approve"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Plan => "plan",
            Operation::Apply => "apply",
            Operation::Destroy => "destroy",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
