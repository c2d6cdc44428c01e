//! cli::commands
//!
//! Command dispatch and handlers.
//!
//! # Architecture
//!
//! Each command handler:
//! 1. Loads settings and resolves the module (or stack root)
//! 2. Calls the engine to execute the command
//! 3. Formats and displays output
//!
//! Handlers do NOT touch lock tables or buckets except through the engine
//! and the `remote` helpers.
//!
//! # Async Commands
//!
//! Everything that talks to a backend or runs the tool is async. Handlers
//! run it on an [`Interruptible`] runtime whose cancellation token fires on
//! Ctrl-C, so a locked run stops its tool and releases the lock.

mod cleanup;
mod completion;
mod lock;
mod module;
mod stack;

pub use cleanup::cleanup;
pub use completion::completion;
pub use lock::{acquire_lock, lock_status, release_lock};
pub use module::run_module;
pub use stack::run_stack;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cli::args::{Cli, Command};
use crate::core::config::{resolve, resolve_dir, ResolvedConfig, Substitutions};
use crate::core::settings::Settings;
use crate::core::types::HolderId;
use crate::engine::{Context, ModulePipeline, Operation, PipelineOptions, TerraformCli};
use crate::remote::DefaultBackends;
use crate::ui::output::Verbosity;

/// Dispatch a command to its handler.
pub fn dispatch(cli: Cli, ctx: &Context) -> Result<()> {
    if let Command::Completion { shell } = cli.command {
        return completion(shell);
    }

    let session = Session::open(&cli, ctx)?;
    match cli.command {
        Command::Apply => run_module(&session, Operation::Apply),
        Command::Plan => run_module(&session, Operation::Plan),
        Command::Destroy => run_module(&session, Operation::Destroy),
        Command::AcquireLock => acquire_lock(&session),
        Command::ReleaseLock => release_lock(&session),
        Command::LockStatus => lock_status(&session),
        Command::SpinUp => run_stack(&session, Operation::Apply),
        Command::TearDown => run_stack(&session, Operation::Destroy),
        Command::Cleanup { keep_table, yes } => cleanup(&session, keep_table, yes),
        Command::Completion { shell } => completion(shell),
    }
}

/// Settings and flags shared by every backend-facing command.
pub struct Session<'a> {
    ctx: &'a Context,
    /// Loaded user settings
    pub settings: Settings,
    /// Placeholder values from `--substitute`
    pub substitutions: Substitutions,
    /// Pipeline options after CLI overrides
    pub options: PipelineOptions,
    /// Root of the local backend
    pub local_root: PathBuf,
    /// Module configuration file from `--module-config`
    pub module_config: Option<PathBuf>,
}

impl<'a> Session<'a> {
    /// Load settings and apply CLI overrides.
    pub fn open(cli: &Cli, ctx: &'a Context) -> Result<Self> {
        let settings = match &cli.config {
            Some(path) => Settings::load_from(path),
            None => Settings::load(),
        }
        .context("Failed to load settings")?;
        if let Some(path) = settings.loaded_from() {
            debug!(path = %path.display(), "loaded settings");
        }

        let substitutions = Substitutions::from_pairs(&cli.substitutions)
            .context("Invalid --substitute value")?;

        let holder = match &cli.holder {
            Some(holder) => HolderId::new(holder.clone()).context("Invalid --holder")?,
            None => settings.holder().context("Invalid holder in settings")?,
        };
        let tool = cli.tool.clone().unwrap_or_else(|| settings.tool().to_string());

        let mut options = PipelineOptions::new(tool, holder);
        options.lock_defaults = settings.lock_defaults();
        options.retry = settings.retry_policy();
        options.vars = parse_vars(&cli.vars)?;

        let local_root = cli
            .local_root
            .clone()
            .unwrap_or_else(|| settings.local_root());

        Ok(Self {
            ctx,
            settings,
            substitutions,
            options,
            local_root,
            module_config: cli.module_config.clone(),
        })
    }

    /// Module directory or stack root.
    pub fn working_dir(&self) -> Result<PathBuf> {
        let dir = match &self.ctx.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to read the current directory")?,
        };
        dir.canonicalize()
            .with_context(|| format!("Working directory {} not found", dir.display()))
    }

    /// Resolve the module in the working directory.
    ///
    /// With `--module-config`, that file is resolved instead and the module
    /// still runs in the working directory.
    pub fn resolve_module(&self) -> Result<ResolvedConfig> {
        let dir = self.working_dir()?;
        match &self.module_config {
            Some(path) => resolve(path, &self.substitutions)
                .map(|resolved| resolved.in_dir(&dir))
                .with_context(|| format!("Failed to resolve module config {}", path.display())),
            None => resolve_dir(&dir, &self.substitutions)
                .with_context(|| format!("Failed to resolve module {}", dir.display())),
        }
    }

    /// Backends served by this session.
    pub fn backends(&self) -> Arc<DefaultBackends> {
        Arc::new(DefaultBackends::new(self.local_root.clone()))
    }

    /// Pipeline wired to the real tool and backends.
    pub fn pipeline(&self) -> ModulePipeline {
        ModulePipeline::new(
            self.backends(),
            Arc::new(TerraformCli::new(!self.ctx.quiet)),
            self.options.clone(),
        )
    }

    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.ctx.quiet, self.ctx.debug)
    }

    pub fn interactive(&self) -> bool {
        self.ctx.interactive
    }
}

/// Tokio runtime whose token is cancelled on Ctrl-C.
pub struct Interruptible {
    rt: Runtime,
    cancel: CancellationToken,
}

impl Interruptible {
    pub fn new() -> Result<Self> {
        let rt = Runtime::new().context("Failed to start async runtime")?;
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        rt.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping");
                token.cancel();
            }
        });

        Ok(Self { rt, cancel })
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.rt.block_on(future)
    }
}

fn parse_vars(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    for pair in pairs {
        let Some((name, value)) = pair.split_once('=') else {
            bail!("Invalid --var '{}': expected NAME=VALUE", pair);
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("Invalid --var '{}': empty name", pair);
        }
        vars.insert(name.to_string(), value.to_string());
    }
    Ok(vars)
}
