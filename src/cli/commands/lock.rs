//! acquire-lock / release-lock / lock-status - Manual lock handling
//!
//! A lock taken with `acquire-lock` outlives the command. It is only removed
//! by `release-lock` from the same holder.

use anyhow::{anyhow, bail, Context as _, Result};
use tokio_util::sync::CancellationToken;

use super::{Interruptible, Session};
use crate::core::config::ResolvedConfig;
use crate::engine::{ModuleLock, ModulePipeline};
use crate::lock::ReleaseOutcome;
use crate::remote::LockRecord;
use crate::ui::output;

async fn open_lock(pipeline: &ModulePipeline, resolved: &ResolvedConfig) -> Result<ModuleLock> {
    pipeline
        .module_lock(resolved)
        .await?
        .ok_or_else(|| anyhow!("module has no [lock] section"))
}

/// Acquire the module's lock and leave it held.
pub fn acquire_lock(session: &Session) -> Result<()> {
    let resolved = session.resolve_module()?;
    let pipeline = session.pipeline();
    let rt = Interruptible::new()?;

    let record = rt
        .block_on(hold_lock(&pipeline, &resolved, rt.token()))
        .with_context(|| format!("Failed to lock module {}", resolved.dir().display()))?;

    output::success(
        format!("acquired lock for state {} as {}", record.state_id, record.holder),
        session.verbosity(),
    );
    Ok(())
}

/// Take the module's lock for the pipeline's holder.
///
/// If `cancel` fires mid-acquire, any record this holder already wrote is
/// deleted before returning.
async fn hold_lock(
    pipeline: &ModulePipeline,
    resolved: &ResolvedConfig,
    cancel: &CancellationToken,
) -> Result<LockRecord> {
    let options = pipeline.options();
    let lock = open_lock(pipeline, resolved).await?;
    lock.ensure_table(&options.retry).await?;
    let acquire = lock.manager.acquire(
        &lock.settings.state_id,
        &options.holder,
        lock.settings.max_retries,
        lock.settings.retry_interval,
    );
    tokio::select! {
        record = acquire => Ok(record?),
        _ = cancel.cancelled() => {
            lock.release_abandoned(&options.holder).await;
            bail!("interrupted while waiting for the lock")
        }
    }
}

/// Release the module's lock if this holder has it.
pub fn release_lock(session: &Session) -> Result<()> {
    let resolved = session.resolve_module()?;
    let pipeline = session.pipeline();
    let holder = &pipeline.options().holder;
    let rt = Interruptible::new()?;

    let (state_id, outcome) = rt
        .block_on(async {
            let lock = open_lock(&pipeline, &resolved).await?;
            let outcome = lock.manager.release(&lock.settings.state_id, holder).await?;
            Ok::<_, anyhow::Error>((lock.settings.state_id, outcome))
        })
        .with_context(|| format!("Failed to unlock module {}", resolved.dir().display()))?;

    let verbosity = session.verbosity();
    match outcome {
        ReleaseOutcome::Released => {
            output::success(format!("released lock for state {}", state_id), verbosity)
        }
        ReleaseOutcome::NotHeld { current: None } => {
            output::print(format!("state {} is not locked", state_id), verbosity)
        }
        ReleaseOutcome::NotHeld {
            current: Some(current),
        } => output::warn(
            format!(
                "state {} is locked by {}, not {}; left in place",
                state_id, current, holder
            ),
            verbosity,
        ),
    }
    Ok(())
}

/// Print who holds the module's lock.
pub fn lock_status(session: &Session) -> Result<()> {
    let resolved = session.resolve_module()?;
    let pipeline = session.pipeline();
    let rt = Interruptible::new()?;

    let (state_id, record) = rt
        .block_on(async {
            let lock = open_lock(&pipeline, &resolved).await?;
            let record = lock.manager.status(&lock.settings.state_id).await?;
            Ok::<_, anyhow::Error>((lock.settings.state_id, record))
        })
        .with_context(|| {
            format!("Failed to read lock for module {}", resolved.dir().display())
        })?;

    // Status is the command's result, so it prints even with --quiet.
    match record {
        Some(record) => println!("{}", output::format_lock(&record)),
        None => println!("state {} is not locked", state_id),
    }
    Ok(())
}
