//! engine::stack
//!
//! Ordered, fail-stop execution of every module under a root.
//!
//! # Phases
//!
//! ```text
//! Discovering -> Ordering -> Executing -> Done | Failed
//! ```
//!
//! Discovery and ordering finish before anything runs, so an unknown
//! dependency or a cycle is reported without touching any module.
//!
//! # Invariants
//!
//! - `plan` and `apply` visit dependencies before dependents; `destroy`
//!   visits dependents first
//! - Ties are broken by directory name, so the order is deterministic
//! - Modules run one at a time; the first failure stops the run and
//!   completed modules are left as they are
//! - Cancellation is checked before each module and inside the pipeline

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::discover::{discover, Module};
use super::pipeline::{ModulePipeline, ModuleReport, PipelineError};
use super::Operation;
use crate::core::config::{ConfigError, Substitutions};
use crate::core::graph::DependencyGraph;

/// Errors that prevent a stack from running at all.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("no modules found under '{}'", root.display())]
    NoModulesFound { root: PathBuf },

    #[error(
        "module '{}' depends on '{}', which is not a module of this stack",
        module.display(),
        dependency.display()
    )]
    UnresolvedDependency { module: PathBuf, dependency: PathBuf },

    #[error("dependency cycle: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<PathBuf> },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn format_cycle(cycle: &[PathBuf]) -> String {
    cycle
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Stack execution phase, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discovering,
    Ordering,
    Executing,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Discovering => "discovering",
            Phase::Ordering => "ordering",
            Phase::Executing => "executing",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Options for a stack run.
#[derive(Debug, Clone, Default)]
pub struct StackOptions {
    /// Placeholder values applied to every configuration
    pub substitutions: Substitutions,
}

/// The module that stopped a stack run.
#[derive(Debug)]
pub struct ModuleFailure {
    pub dir: PathBuf,
    pub error: PipelineError,
}

/// Outcome of a stack run.
#[derive(Debug)]
pub struct StackResult {
    pub operation: Operation,
    /// Every module in execution order
    pub order: Vec<PathBuf>,
    /// Modules that completed, in execution order
    pub succeeded: Vec<ModuleReport>,
    pub failed: Option<ModuleFailure>,
    /// Modules after the failure, in execution order
    pub not_attempted: Vec<PathBuf>,
}

impl StackResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }
}

/// Discover and order the modules under `root` without running anything.
///
/// # Errors
///
/// [`StackError::NoModulesFound`], [`StackError::UnresolvedDependency`],
/// [`StackError::CyclicDependency`], or a configuration error.
pub fn plan_stack(
    operation: Operation,
    root: &Path,
    options: &StackOptions,
) -> Result<Vec<Module>, StackError> {
    info!(phase = %Phase::Discovering, root = %root.display(), "stack");
    let modules = discover(root, &options.substitutions)?;
    if modules.is_empty() {
        return Err(StackError::NoModulesFound {
            root: root.to_path_buf(),
        });
    }

    info!(phase = %Phase::Ordering, modules = modules.len(), "stack");
    let mut ordered = order_modules(modules)?;
    if operation.reverses_order() {
        ordered.reverse();
    }
    Ok(ordered)
}

/// Sort `modules` so every module follows its dependencies.
pub fn order_modules(modules: Vec<Module>) -> Result<Vec<Module>, StackError> {
    let known: BTreeSet<PathBuf> = modules.iter().map(|m| m.dir.clone()).collect();

    let mut graph = DependencyGraph::new();
    for module in &modules {
        graph.add_node(module.dir.clone());
        for dependency in &module.dependencies {
            if !known.contains(dependency) {
                return Err(StackError::UnresolvedDependency {
                    module: module.dir.clone(),
                    dependency: dependency.clone(),
                });
            }
            graph.add_dependency(module.dir.clone(), dependency.clone());
        }
    }

    let order = graph
        .topological_order()
        .map_err(|cycle| StackError::CyclicDependency { cycle })?;

    let mut by_dir: BTreeMap<PathBuf, Module> =
        modules.into_iter().map(|m| (m.dir.clone(), m)).collect();
    Ok(order
        .into_iter()
        .filter_map(|dir| by_dir.remove(&dir))
        .collect())
}

/// Runs a whole stack through a [`ModulePipeline`].
#[derive(Debug, Clone)]
pub struct StackRunner {
    pipeline: ModulePipeline,
}

impl StackRunner {
    pub fn new(pipeline: ModulePipeline) -> Self {
        Self { pipeline }
    }

    /// Run `operation` against every module under `root`.
    ///
    /// Module failures do not make this an `Err`; they are reported in
    /// [`StackResult::failed`].
    pub async fn run(
        &self,
        operation: Operation,
        root: &Path,
        options: &StackOptions,
        cancel: &CancellationToken,
    ) -> Result<StackResult, StackError> {
        let modules = plan_stack(operation, root, options)?;
        let order: Vec<PathBuf> = modules.iter().map(|m| m.dir.clone()).collect();

        info!(phase = %Phase::Executing, operation = %operation, modules = order.len(), "stack");
        let mut succeeded = Vec::new();
        let mut failed = None;
        let mut remaining = modules.into_iter();

        for module in remaining.by_ref() {
            let result = if cancel.is_cancelled() {
                Err(PipelineError::Cancelled)
            } else {
                self.pipeline.run(operation, &module.config, cancel).await
            };

            match result {
                Ok(report) => succeeded.push(report),
                Err(error) => {
                    error!(module = %module.dir.display(), error = %error, "module failed, stopping stack");
                    failed = Some(ModuleFailure {
                        dir: module.dir,
                        error,
                    });
                    break;
                }
            }
        }

        let not_attempted: Vec<PathBuf> = remaining.map(|m| m.dir).collect();
        let phase = if failed.is_some() {
            Phase::Failed
        } else {
            Phase::Done
        };
        info!(
            phase = %phase,
            succeeded = succeeded.len(),
            not_attempted = not_attempted.len(),
            "stack"
        );

        Ok(StackResult {
            operation,
            order,
            succeeded,
            failed,
            not_attempted,
        })
    }
}
