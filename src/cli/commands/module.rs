//! apply / plan / destroy - Run one module through the pipeline

use anyhow::{Context as _, Result};

use super::{Interruptible, Session};
use crate::engine::Operation;
use crate::ui::output;

/// Run `operation` against the module in the working directory.
pub fn run_module(session: &Session, operation: Operation) -> Result<()> {
    let resolved = session.resolve_module()?;
    let pipeline = session.pipeline();
    let rt = Interruptible::new()?;

    let report = rt
        .block_on(pipeline.run(operation, &resolved, rt.token()))
        .with_context(|| format!("{} failed for module {}", operation, resolved.dir().display()))?;

    let verbosity = session.verbosity();
    if let Some(state_id) = &report.locked {
        output::print(format!("released lock for state {}", state_id), verbosity);
    }
    output::success(
        format!("{} complete: {}", operation, report.dir.display()),
        verbosity,
    );
    Ok(())
}
