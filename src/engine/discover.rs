//! engine::discover
//!
//! Finding the modules of a stack.
//!
//! Every `stackguard.toml` under the root is resolved. A file that another
//! discovered file includes is a shared parent, not a module; a parent that
//! only makes sense through its children may fail to resolve on its own, and
//! that failure is ignored. Hidden directories (`.terraform`, `.git`, ...)
//! are never entered.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::core::config::{resolve, ConfigError, ResolvedConfig, Substitutions, CONFIG_FILE_NAME};

/// A module found under a stack root.
#[derive(Debug, Clone)]
pub struct Module {
    /// Canonical module directory
    pub dir: PathBuf,
    pub config: ResolvedConfig,
    /// Directories this module depends on (canonical when they exist)
    pub dependencies: Vec<PathBuf>,
}

impl Module {
    /// Build a module from a resolved configuration.
    pub fn from_config(config: ResolvedConfig) -> Self {
        let dir = config.dir().to_path_buf();
        let dependencies = config
            .config
            .dependency_dirs(&dir)
            .into_iter()
            .map(|p| fs::canonicalize(&p).unwrap_or(p))
            .collect();
        Self {
            dir,
            config,
            dependencies,
        }
    }

    pub fn config_path(&self) -> &Path {
        self.config.path()
    }
}

/// Find and resolve every module under `root`, sorted by directory.
///
/// # Errors
///
/// - [`ConfigError::NotFound`] if `root` is not a directory
/// - The first resolution error of a file that is not a shared parent
pub fn discover(root: &Path, subs: &Substitutions) -> Result<Vec<Module>, ConfigError> {
    if !root.is_dir() {
        return Err(ConfigError::NotFound {
            path: root.to_path_buf(),
        });
    }

    let mut resolved = Vec::new();
    let mut failures = Vec::new();
    for path in config_files(root)? {
        match resolve(&path, subs) {
            Ok(config) => resolved.push(config),
            Err(err) => failures.push((path, err)),
        }
    }

    let parents: BTreeSet<PathBuf> = resolved
        .iter()
        .flat_map(|r| r.include_chain().iter().cloned())
        .collect();

    for (path, err) in failures {
        let canonical = fs::canonicalize(&path).unwrap_or(path);
        if !parents.contains(&canonical) {
            return Err(err);
        }
        debug!(path = %canonical.display(), error = %err, "ignoring unresolvable shared parent");
    }

    let mut modules: Vec<Module> = resolved
        .into_iter()
        .filter(|r| {
            let parent = parents.contains(r.path());
            if parent {
                debug!(path = %r.path().display(), "shared parent, not a module");
            }
            !parent
        })
        .map(Module::from_config)
        .collect();
    modules.sort_by(|a, b| a.dir.cmp(&b.dir));

    debug!(root = %root.display(), modules = modules.len(), "discovered modules");
    Ok(modules)
}

fn config_files(root: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden_dir(e));

    for entry in walker {
        let entry = entry.map_err(|e| ConfigError::ReadError {
            path: e.path().unwrap_or(root).to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_file() && entry.file_name() == CONFIG_FILE_NAME {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn is_hidden_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir() && entry.file_name().to_string_lossy().starts_with('.')
}
