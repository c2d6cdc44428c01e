//! cleanup - Delete the module's state bucket and lock table

use anyhow::{anyhow, bail, Context as _, Result};

use super::{Interruptible, Session};
use crate::remote::cleanup::{drop_lock_table, purge_bucket};
use crate::remote::BackendProvider;
use crate::ui::{output, prompts};

/// Delete every version in the module's bucket, the bucket, and (unless
/// `keep_table`) the lock table.
pub fn cleanup(session: &Session, keep_table: bool, yes: bool) -> Result<()> {
    let resolved = session.resolve_module()?;
    let descriptor = resolved
        .config
        .remote_state_descriptor()
        .map_err(|message| anyhow!(message))
        .with_context(|| format!("Invalid [remote_state] in {}", resolved.path().display()))?
        .ok_or_else(|| anyhow!("module {} has no [remote_state] section", resolved.dir().display()))?;

    if !yes {
        let question = format!(
            "Delete bucket {} and every state version in it?",
            descriptor.bucket
        );
        let confirmed = prompts::confirm(&question, false, session.interactive())
            .context("Refusing to delete without --yes")?;
        if !confirmed {
            bail!("cleanup aborted");
        }
    }

    let verbosity = session.verbosity();
    let pipeline = session.pipeline();
    let retry = &pipeline.options().retry;
    let backends = session.backends();
    let rt = Interruptible::new()?;

    rt.block_on(async {
        let store = backends
            .object_store(descriptor.backend, &descriptor.region)
            .await?;
        match purge_bucket(store.as_ref(), &descriptor.bucket, retry).await? {
            Some(versions) => output::success(
                format!("deleted bucket {} ({} versions)", descriptor.bucket, versions),
                verbosity,
            ),
            None => output::print(
                format!("bucket {} does not exist", descriptor.bucket),
                verbosity,
            ),
        }

        if keep_table {
            return Ok(());
        }
        let Some(lock) = pipeline.module_lock(&resolved).await? else {
            return Ok(());
        };
        let table = lock.manager.table();
        if drop_lock_table(table.as_ref(), &lock.settings.table, retry).await? {
            output::success(format!("deleted lock table {}", lock.settings.table), verbosity);
        } else {
            output::print(
                format!("lock table {} does not exist", lock.settings.table),
                verbosity,
            );
        }
        Ok::<_, anyhow::Error>(())
    })
    .with_context(|| format!("Failed to clean up module {}", resolved.dir().display()))
}
