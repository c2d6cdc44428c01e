//! engine::pipeline
//!
//! One module, end to end.
//!
//! # Architecture
//!
//! ```text
//! ensure remote state -> acquire lock -> init -> operation -> release lock
//! ```
//!
//! Each step is skipped when the configuration does not ask for it: no
//! `[remote_state]` means no bootstrap and a bare `init`; no `[lock]`, or a
//! read-only operation, means no lock. Backends are obtained from a
//! [`BackendProvider`] per run, never cached.
//!
//! # Cancellation
//!
//! The [`CancellationToken`] is checked before the run starts, raced against
//! lock acquisition and raced against every tool invocation. A cancelled
//! tool run drops the child process (which kills it) and the lock is still
//! released before [`PipelineError::Cancelled`] is returned. An acquire
//! interrupted mid-flight may already have written its record, so the
//! holder's record is deleted on that path too.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::tool::{RunnerError, ToolInvocation, ToolOutput, ToolRunner};
use super::Operation;
use crate::core::config::{
    ConfigError, LockDefaults, LockSettings, RemoteStateDescriptor, ResolvedConfig, StoreBackend,
};
use crate::core::retry::RetryPolicy;
use crate::core::types::{HolderId, StateId};
use crate::lock::{LockError, LockManager, ReleaseOutcome};
use crate::remote::state::ensure_lock_table;
use crate::remote::{
    BackendConfig, BackendProvider, CreateOutcome, RemoteStateError, RemoteStateManager,
    StoreError,
};

/// Errors from running one module.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A backend could not be opened.
    #[error("backend unavailable: {0}")]
    Backend(#[from] StoreError),

    #[error(transparent)]
    RemoteState(#[from] RemoteStateError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("operation cancelled")]
    Cancelled,
}

/// Settings shared by every module of a run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Tool binary
    pub tool: String,
    /// Identity recorded in lock records
    pub holder: HolderId,
    /// Lock retry settings for modules that leave them unset
    pub lock_defaults: LockDefaults,
    /// Retry policy for store calls
    pub retry: RetryPolicy,
    /// Variables that override the configuration's `[terraform.vars]`
    pub vars: BTreeMap<String, String>,
}

impl PipelineOptions {
    /// Options with default lock and retry settings and no variables.
    pub fn new(tool: impl Into<String>, holder: HolderId) -> Self {
        Self {
            tool: tool.into(),
            holder,
            lock_defaults: LockDefaults::default(),
            retry: RetryPolicy::default(),
            vars: BTreeMap::new(),
        }
    }
}

/// What a successful module run did.
#[derive(Debug, Clone)]
pub struct ModuleReport {
    pub dir: PathBuf,
    pub operation: Operation,
    /// Backend handed to `init`, if the module has remote state
    pub backend: Option<BackendConfig>,
    /// State id that was locked for the run
    pub locked: Option<StateId>,
    /// Output of each tool invocation, in order
    pub outputs: Vec<ToolOutput>,
}

/// A module's lock, ready to use.
#[derive(Debug)]
pub struct ModuleLock {
    pub manager: LockManager,
    pub settings: LockSettings,
}

/// Runs the tool against single modules.
#[derive(Clone)]
pub struct ModulePipeline {
    backends: Arc<dyn BackendProvider>,
    runner: Arc<dyn ToolRunner>,
    options: PipelineOptions,
}

impl std::fmt::Debug for ModulePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModulePipeline")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ModulePipeline {
    pub fn new(
        backends: Arc<dyn BackendProvider>,
        runner: Arc<dyn ToolRunner>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            backends,
            runner,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run `operation` against the module configured by `resolved`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::RemoteState`] if the bucket or table cannot be
    ///   bootstrapped
    /// - [`PipelineError::Lock`] if the lock stays held elsewhere or the
    ///   table fails
    /// - [`PipelineError::Runner`] if the tool fails
    /// - [`PipelineError::Cancelled`] if `cancel` fires first
    pub async fn run(
        &self,
        operation: Operation,
        resolved: &ResolvedConfig,
        cancel: &CancellationToken,
    ) -> Result<ModuleReport, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let dir = resolved.dir();
        info!(module = %dir.display(), operation = %operation, "running module");

        let descriptor = resolved
            .config
            .remote_state_descriptor()
            .map_err(|message| invalid(resolved, message))?;
        let lock = self.module_lock(resolved).await?;

        let backend = match &descriptor {
            Some(descriptor) => Some(self.ensure_remote_state(descriptor, lock.as_ref()).await?),
            None => None,
        };

        let invocations = self.invocations(operation, resolved, backend.as_ref());
        let lock = lock.filter(|_| operation.is_mutating());

        let outputs = match &lock {
            None => self.run_tools(&invocations, cancel).await?,
            Some(lock) => {
                if descriptor.is_none() {
                    lock.ensure_table(&self.options.retry).await?;
                }
                self.run_locked(lock, &invocations, cancel).await?
            }
        };

        info!(module = %dir.display(), operation = %operation, "module complete");
        Ok(ModuleReport {
            dir: dir.to_path_buf(),
            operation,
            backend,
            locked: lock.map(|l| l.settings.state_id),
            outputs,
        })
    }

    /// Open the lock table for `resolved`, or `None` if it does not lock.
    ///
    /// The table itself is not created; see [`ModuleLock::ensure_table`].
    pub async fn module_lock(
        &self,
        resolved: &ResolvedConfig,
    ) -> Result<Option<ModuleLock>, PipelineError> {
        let settings = resolved
            .config
            .lock_settings(&self.options.lock_defaults)
            .map_err(|message| invalid(resolved, message))?;
        let Some(settings) = settings else {
            return Ok(None);
        };

        let state_region = resolved
            .config
            .remote_state_descriptor()
            .map_err(|message| invalid(resolved, message))?
            .filter(|d| d.backend == StoreBackend::S3)
            .map(|d| d.region);
        let region = settings.region.clone().or(state_region);

        let table = self
            .backends
            .lock_table(settings.backend, region.as_deref())
            .await?;
        let manager = LockManager::new(table, settings.table.clone(), self.options.retry.clone());
        Ok(Some(ModuleLock { manager, settings }))
    }

    async fn ensure_remote_state(
        &self,
        descriptor: &RemoteStateDescriptor,
        lock: Option<&ModuleLock>,
    ) -> Result<BackendConfig, PipelineError> {
        let store = self
            .backends
            .object_store(descriptor.backend, &descriptor.region)
            .await?;
        let mut manager = RemoteStateManager::new(store, self.options.retry.clone());
        if let Some(lock) = lock {
            manager = manager.with_lock_table(lock.manager.table());
        }
        Ok(manager.ensure(descriptor).await?)
    }

    async fn run_locked(
        &self,
        lock: &ModuleLock,
        invocations: &[ToolInvocation],
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolOutput>, PipelineError> {
        let settings = &lock.settings;
        let guard = tokio::select! {
            guard = lock.manager.acquire_guard(
                &settings.state_id,
                &self.options.holder,
                settings.max_retries,
                settings.retry_interval,
            ) => guard?,
            _ = cancel.cancelled() => {
                // The write may have landed before the acquire was dropped.
                lock.release_abandoned(&self.options.holder).await;
                return Err(PipelineError::Cancelled);
            }
        };

        let result = self.run_tools(invocations, cancel).await;
        let released = guard.release().await;

        match (result, released) {
            (Ok(outputs), Ok(_)) => Ok(outputs),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!(
                    state = %settings.state_id,
                    error = %release_err,
                    "failed to release lock after failed run"
                );
                Err(e)
            }
        }
    }

    async fn run_tools(
        &self,
        invocations: &[ToolInvocation],
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolOutput>, PipelineError> {
        let mut outputs = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            let output = tokio::select! {
                result = self.runner.run(invocation) => result?,
                _ = cancel.cancelled() => {
                    warn!(
                        dir = %invocation.dir.display(),
                        command = invocation.command(),
                        "cancelled, stopping tool"
                    );
                    return Err(PipelineError::Cancelled);
                }
            };
            outputs.push(output);
        }
        Ok(outputs)
    }

    fn invocations(
        &self,
        operation: Operation,
        resolved: &ResolvedConfig,
        backend: Option<&BackendConfig>,
    ) -> Vec<ToolInvocation> {
        let dir = resolved.dir();
        let mut vars = resolved.config.vars();
        vars.extend(self.options.vars.clone());

        vec![
            ToolInvocation::init(&self.options.tool, dir, backend),
            ToolInvocation::operation(
                &self.options.tool,
                dir,
                operation,
                &vars,
                &resolved.config.extra_args(),
            ),
        ]
    }
}

impl ModuleLock {
    /// Create the lock table if it does not exist.
    pub async fn ensure_table(&self, retry: &RetryPolicy) -> Result<CreateOutcome, RemoteStateError> {
        ensure_lock_table(self.manager.table().as_ref(), &self.settings.table, retry).await
    }

    /// Remove any record `holder` wrote during an acquire that was
    /// interrupted before it returned.
    ///
    /// Only a record owned by `holder` is deleted. Failures are logged.
    pub async fn release_abandoned(&self, holder: &HolderId) {
        let state_id = &self.settings.state_id;
        match self.manager.release(state_id, holder).await {
            Ok(ReleaseOutcome::Released) => {
                info!(state = %state_id, holder = %holder, "released lock taken by interrupted acquire");
            }
            Ok(_) => {}
            Err(e) => warn!(
                state = %state_id,
                error = %e,
                "failed to clean up after interrupted lock acquire"
            ),
        }
    }
}

fn invalid(resolved: &ResolvedConfig, message: String) -> ConfigError {
    ConfigError::Validation {
        path: resolved.path().to_path_buf(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retry::Backoff;
    use crate::engine::testing::{module, RecordingRunner};
    use crate::remote::memory::{MemoryBackend, Op};
    use std::time::Duration;
    use tempfile::TempDir;

    const FULL: &str = r#"
[lock]
state_file_id = "qa/my-app"
table_name = "locks"
max_lock_retries = 1
lock_retry_interval_secs = 0

[remote_state]
backend = "s3"

[remote_state.config]
bucket = "state-bucket"
key = "qa/my-app/terraform.tfstate"
region = "us-west-2"

[terraform]
vars = { env = "qa", size = "small" }
extra_args = ["-parallelism=4"]
"#;

    const LOCK_ONLY: &str = r#"
[lock]
state_file_id = "lock-only"
table_name = "locks"
max_lock_retries = 0
"#;

    fn pipeline(backend: &MemoryBackend, runner: &RecordingRunner) -> ModulePipeline {
        let mut options = PipelineOptions::new("terraform", HolderId::new("tester@ci").unwrap());
        options.retry = RetryPolicy::new(2, Duration::from_millis(1), Backoff::Fixed);
        ModulePipeline::new(Arc::new(backend.clone()), Arc::new(runner.clone()), options)
    }

    #[tokio::test]
    async fn apply_bootstraps_locks_and_releases() {
        let temp = TempDir::new().unwrap();
        let resolved = module(&temp.path().join("app"), FULL);
        let backend = MemoryBackend::new();
        let runner = RecordingRunner::new();

        let report = pipeline(&backend, &runner)
            .run(Operation::Apply, &resolved, &CancellationToken::new())
            .await
            .unwrap();

        let bucket = backend.bucket("state-bucket").unwrap();
        assert!(bucket.versioning && bucket.encryption);
        assert!(backend.has_table("locks"));
        assert_eq!(backend.count(Op::PutIfAbsent), 1);
        assert_eq!(backend.count(Op::DeleteIfHolder), 1);
        assert!(backend
            .record("locks", &StateId::new("qa/my-app").unwrap())
            .is_none());

        assert_eq!(report.locked.unwrap().as_str(), "qa/my-app");
        assert_eq!(report.outputs.len(), 2);

        let calls = runner.calls();
        assert_eq!(calls[0].command(), "init");
        assert!(calls[0]
            .args
            .contains(&"-backend-config=bucket=state-bucket".to_string()));
        assert_eq!(
            calls[1].args,
            vec![
                "apply",
                "-input=false",
                "-auto-approve",
                "-var",
                "env=qa",
                "-var",
                "size=small",
                "-parallelism=4",
            ]
        );
    }

    #[tokio::test]
    async fn plan_takes_no_lock() {
        let temp = TempDir::new().unwrap();
        let resolved = module(&temp.path().join("app"), FULL);
        let backend = MemoryBackend::new();
        let runner = RecordingRunner::new();

        let report = pipeline(&backend, &runner)
            .run(Operation::Plan, &resolved, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.locked.is_none());
        assert_eq!(backend.count(Op::PutIfAbsent), 0);
        assert_eq!(runner.calls()[1].args[0], "plan");
    }

    #[tokio::test]
    async fn lock_only_module_still_locks() {
        let temp = TempDir::new().unwrap();
        let resolved = module(&temp.path().join("app"), LOCK_ONLY);
        let backend = MemoryBackend::new();
        let runner = RecordingRunner::new();

        let report = pipeline(&backend, &runner)
            .run(Operation::Destroy, &resolved, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.backend.is_none());
        assert!(backend.has_table("locks"));
        assert_eq!(backend.count(Op::PutIfAbsent), 1);
        assert_eq!(backend.count(Op::CreateBucket), 0);
        assert_eq!(runner.calls()[0].args, vec!["init", "-input=false"]);
    }

    #[tokio::test]
    async fn tool_failure_still_releases() {
        let temp = TempDir::new().unwrap();
        let resolved = module(&temp.path().join("app"), FULL);
        let backend = MemoryBackend::new();
        let runner = RecordingRunner::new().fail_on("apply", "");

        let err = pipeline(&backend, &runner)
            .run(Operation::Apply, &resolved, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Runner(RunnerError::NonZeroExit { .. })));
        assert!(backend
            .record("locks", &StateId::new("qa/my-app").unwrap())
            .is_none());
    }

    #[tokio::test]
    async fn held_lock_blocks_tool() {
        let temp = TempDir::new().unwrap();
        let resolved = module(&temp.path().join("app"), FULL);
        let backend = MemoryBackend::new();
        let runner = RecordingRunner::new();
        let pipeline = pipeline(&backend, &runner);

        let lock = pipeline.module_lock(&resolved).await.unwrap().unwrap();
        lock.ensure_table(&RetryPolicy::no_retry()).await.unwrap();
        lock.manager
            .acquire(
                &lock.settings.state_id,
                &HolderId::new("someone-else").unwrap(),
                0,
                Duration::ZERO,
            )
            .await
            .unwrap();

        let err = pipeline
            .run(Operation::Apply, &resolved, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Unable to acquire lock"));
        assert!(err.to_string().contains("someone-else"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn cancellation_kills_run_and_releases() {
        let temp = TempDir::new().unwrap();
        let resolved = module(&temp.path().join("app"), FULL);
        let backend = MemoryBackend::new();
        let runner = RecordingRunner::new().hang_on("apply");
        let cancel = CancellationToken::new();

        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let err = pipeline(&backend, &runner)
            .run(Operation::Apply, &resolved, &cancel)
            .await
            .unwrap_err();
        trigger.await.unwrap();

        assert!(matches!(err, PipelineError::Cancelled));
        assert!(backend
            .record("locks", &StateId::new("qa/my-app").unwrap())
            .is_none());
    }

    #[tokio::test]
    async fn cancellation_during_slow_acquire_leaves_no_record() {
        let temp = TempDir::new().unwrap();
        let resolved = module(&temp.path().join("app"), FULL);
        let backend = MemoryBackend::new().delay_ack(Op::PutIfAbsent, Duration::from_millis(500));
        let runner = RecordingRunner::new();
        let cancel = CancellationToken::new();

        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let err = pipeline(&backend, &runner)
            .run(Operation::Apply, &resolved, &cancel)
            .await
            .unwrap_err();
        trigger.await.unwrap();

        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(backend.count(Op::PutIfAbsent), 1);
        assert_eq!(backend.count(Op::DeleteIfHolder), 1);
        assert!(backend
            .record("locks", &StateId::new("qa/my-app").unwrap())
            .is_none());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn dropped_run_releases_in_background() {
        let temp = TempDir::new().unwrap();
        let resolved = module(&temp.path().join("app"), FULL);
        let backend = MemoryBackend::new();
        let runner = RecordingRunner::new().hang_on("apply");
        let pipeline = pipeline(&backend, &runner);
        let state = StateId::new("qa/my-app").unwrap();

        let timed_out = tokio::time::timeout(
            Duration::from_millis(50),
            pipeline.run(Operation::Apply, &resolved, &CancellationToken::new()),
        )
        .await;
        assert!(timed_out.is_err());

        for _ in 0..50 {
            if backend.record("locks", &state).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("abandoned run never released the lock");
    }

    #[tokio::test]
    async fn cancelled_before_start_does_nothing() {
        let temp = TempDir::new().unwrap();
        let resolved = module(&temp.path().join("app"), FULL);
        let backend = MemoryBackend::new();
        let runner = RecordingRunner::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline(&backend, &runner)
            .run(Operation::Apply, &resolved, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled));
        assert!(backend.operations().is_empty());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn option_vars_override_config_vars() {
        let temp = TempDir::new().unwrap();
        let resolved = module(&temp.path().join("app"), FULL);
        let backend = MemoryBackend::new();
        let runner = RecordingRunner::new();
        let mut pipeline = pipeline(&backend, &runner);
        pipeline
            .options
            .vars
            .insert("env".to_string(), "prod".to_string());

        pipeline
            .run(Operation::Plan, &resolved, &CancellationToken::new())
            .await
            .unwrap();

        let args = &runner.calls()[1].args;
        assert!(args.contains(&"env=prod".to_string()));
        assert!(!args.contains(&"env=qa".to_string()));
    }

    #[tokio::test]
    async fn bootstrap_failure_stops_before_lock() {
        let temp = TempDir::new().unwrap();
        let resolved = module(&temp.path().join("app"), FULL);
        let backend = MemoryBackend::new()
            .fail_on(Op::CreateBucket, StoreError::AccessDenied("denied".into()));
        let runner = RecordingRunner::new();

        let err = pipeline(&backend, &runner)
            .run(Operation::Apply, &resolved, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::RemoteState(_)));
        assert_eq!(backend.count(Op::PutIfAbsent), 0);
        assert!(runner.calls().is_empty());
    }
}
