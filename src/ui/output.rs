//! ui::output
//!
//! Output formatting and display.
//!
//! # Design
//!
//! Output is formatted consistently and respects the quiet flag. Results go
//! to stdout; warnings and errors go to stderr. Diagnostics belong in
//! `tracing`, not here.

use std::fmt::Display;
use std::path::Path;

use crate::engine::StackResult;
use crate::remote::LockRecord;

/// Output verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Quiet mode - minimal output
    Quiet,
    /// Normal mode - standard output
    Normal,
    /// Debug mode - verbose output
    Debug,
}

impl Verbosity {
    /// Create verbosity from flags.
    pub fn from_flags(quiet: bool, debug: bool) -> Self {
        if quiet {
            Verbosity::Quiet
        } else if debug {
            Verbosity::Debug
        } else {
            Verbosity::Normal
        }
    }
}

/// Print a message (respects quiet mode).
pub fn print(message: impl Display, verbosity: Verbosity) {
    if verbosity != Verbosity::Quiet {
        println!("{}", message);
    }
}

/// Print an error message (always shown).
pub fn error(message: impl Display) {
    eprintln!("error: {}", message);
}

/// Print a warning message (respects quiet mode).
pub fn warn(message: impl Display, verbosity: Verbosity) {
    if verbosity != Verbosity::Quiet {
        eprintln!("warning: {}", message);
    }
}

/// Print a success message (respects quiet mode).
pub fn success(message: impl Display, verbosity: Verbosity) {
    if verbosity != Verbosity::Quiet {
        println!("{}", message);
    }
}

/// One-line description of a held lock.
pub fn format_lock(record: &LockRecord) -> String {
    format!(
        "state {} is locked by {} since {}",
        record.state_id, record.holder, record.acquired_at
    )
}

/// Display `path` relative to `root` when it is inside it.
pub fn format_module(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.display().to_string(),
        Err(_) => path.display().to_string(),
    }
}

/// Multi-line summary of a stack run.
pub fn format_stack_summary(result: &StackResult, root: &Path) -> String {
    let mut lines = Vec::new();
    for report in &result.succeeded {
        lines.push(format!("  ok       {}", format_module(&report.dir, root)));
    }
    if let Some(failure) = &result.failed {
        lines.push(format!("  failed   {}", format_module(&failure.dir, root)));
    }
    for dir in &result.not_attempted {
        lines.push(format!("  skipped  {}", format_module(dir, root)));
    }
    format!("{} summary:\n{}", result.operation, lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{HolderId, StateId};
    use crate::engine::{ModuleFailure, ModuleReport, Operation, PipelineError};
    use std::path::PathBuf;

    #[test]
    fn verbosity_from_flags() {
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Debug);
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
    }

    #[test]
    fn lock_line_names_holder() {
        let record = LockRecord::new(
            StateId::new("qa/my-app").unwrap(),
            HolderId::new("alice@laptop").unwrap(),
        );
        let line = format_lock(&record);
        assert!(line.starts_with("state qa/my-app is locked by alice@laptop since "));
    }

    #[test]
    fn module_paths_relative_to_root() {
        let root = Path::new("/live");
        assert_eq!(format_module(Path::new("/live/qa/app"), root), "qa/app");
        assert_eq!(format_module(Path::new("/live"), root), ".");
        assert_eq!(format_module(Path::new("/other"), root), "/other");
    }

    #[test]
    fn stack_summary_lists_every_module() {
        let root = PathBuf::from("/live");
        let result = StackResult {
            operation: Operation::Apply,
            order: vec![root.join("mgmt"), root.join("stage"), root.join("prod")],
            succeeded: vec![ModuleReport {
                dir: root.join("mgmt"),
                operation: Operation::Apply,
                backend: None,
                locked: None,
                outputs: Vec::new(),
            }],
            failed: Some(ModuleFailure {
                dir: root.join("stage"),
                error: PipelineError::Cancelled,
            }),
            not_attempted: vec![root.join("prod")],
        };

        let summary = format_stack_summary(&result, &root);
        assert_eq!(
            summary,
            "apply summary:\n  ok       mgmt\n  failed   stage\n  skipped  prod"
        );
    }
}
