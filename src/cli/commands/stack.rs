//! spin-up / tear-down - Run every module under the working directory

use anyhow::{Context as _, Result};

use super::{Interruptible, Session};
use crate::engine::{Operation, StackOptions, StackRunner};
use crate::ui::output;

/// Run `operation` across the stack rooted at the working directory.
///
/// Prints a per-module summary and fails if any module failed.
pub fn run_stack(session: &Session, operation: Operation) -> Result<()> {
    let root = session.working_dir()?;
    let runner = StackRunner::new(session.pipeline());
    let options = StackOptions {
        substitutions: session.substitutions.clone(),
    };
    let rt = Interruptible::new()?;

    let result = rt
        .block_on(runner.run(operation, &root, &options, rt.token()))
        .with_context(|| format!("Failed to plan stack {}", root.display()))?;

    output::print(output::format_stack_summary(&result, &root), session.verbosity());

    if let Some(failure) = result.failed {
        let error = anyhow::Error::new(failure.error);
        return Err(error.context(format!(
            "{} failed for module {}",
            operation,
            output::format_module(&failure.dir, &root)
        )));
    }
    Ok(())
}
