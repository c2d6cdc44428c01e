//! core::config
//!
//! Module configuration loading, include resolution and merging.
//!
//! # Overview
//!
//! Each module directory holds a `stackguard.toml`. A file may name one
//! parent through `[include]`; the parent may include another, and so on.
//! Resolution happens in explicit passes:
//!
//! 1. **Chain**: read each file raw, evaluate only `include.path`, and follow
//!    it upward. Revisiting a file fails with [`ConfigError::CyclicInclude`].
//! 2. **Interpolate**: with the chain known, substitute placeholders and
//!    built-ins in every string of every file.
//! 3. **Merge**: deserialize each file and layer them from the top of the
//!    chain down to the module (child wins).
//!
//! The result is an immutable [`ResolvedConfig`]. Nothing is written back.
//!
//! # Example
//!
//! ```no_run
//! use stackguard::core::config::{resolve, Substitutions};
//! use std::path::Path;
//!
//! let subs = Substitutions::for_bucket("my-state-bucket").unwrap();
//! let resolved = resolve(Path::new("live/qa/my-app/stackguard.toml"), &subs).unwrap();
//! println!("includes: {:?}", resolved.include_chain());
//! ```

pub mod interpolate;
pub mod schema;

pub use interpolate::{Substitutions, BUCKET_PLACEHOLDER};
pub use schema::{
    LockBackend, LockDefaults, LockSettings, ModuleConfig, RemoteStateDescriptor, StoreBackend,
};

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use interpolate::{interpolate, interpolate_tree, relative_path, InterpolationContext};

/// Well-known configuration file name inside each module directory.
pub const CONFIG_FILE_NAME: &str = "stackguard.toml";

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: '{}'", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read config file '{}': {source}", path.display())]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("cyclic include: {}", format_chain(.chain))]
    CyclicInclude { chain: Vec<PathBuf> },

    #[error("no {CONFIG_FILE_NAME} found in any folder above '{}'", path.display())]
    ParentNotFound { path: PathBuf },

    #[error("invalid configuration '{}': {message}", path.display())]
    Validation { path: PathBuf, message: String },

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

fn format_chain(chain: &[PathBuf]) -> String {
    chain
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A fully resolved module configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    /// The merged configuration.
    pub config: ModuleConfig,
    /// The module's own configuration file.
    path: PathBuf,
    /// Directory the tool runs in.
    dir: PathBuf,
    /// Included files, nearest parent first.
    include_chain: Vec<PathBuf>,
}

impl ResolvedConfig {
    /// Path of the module's own configuration file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory of the module. Defaults to the configuration's directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run the module from `dir` instead of the configuration's directory.
    ///
    /// Used when the configuration file lives elsewhere. Includes and
    /// built-ins were already evaluated relative to the file itself.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Included files, nearest parent first.
    pub fn include_chain(&self) -> &[PathBuf] {
        &self.include_chain
    }

    /// Whether `path` is one of this configuration's parents.
    pub fn includes(&self, path: &Path) -> bool {
        self.include_chain.iter().any(|p| p == path)
    }
}

/// One file of an include chain, read but not yet interpreted.
struct RawConfig {
    path: PathBuf,
    value: toml::Value,
}

/// Resolve the configuration file at `path`.
///
/// # Errors
///
/// - [`ConfigError::NotFound`] if `path` (or any included file) is missing
/// - [`ConfigError::CyclicInclude`] if the include chain loops
/// - [`ConfigError::Parse`] / [`ConfigError::Validation`] for bad contents
pub fn resolve(path: &Path, subs: &Substitutions) -> Result<ResolvedConfig, ConfigError> {
    let chain = load_chain(path, subs)?;

    // `path_relative_to_include()` is the module's directory as seen from
    // the file it includes directly.
    let module_dir = parent_dir(&chain[0].path);
    let relative = if chain.len() > 1 {
        let include_dir = parent_dir(&chain[1].path);
        relative_path(&include_dir, &module_dir)
            .to_string_lossy()
            .replace('\\', "/")
    } else {
        ".".to_string()
    };

    let mut merged: Option<ModuleConfig> = None;
    for raw in chain.iter().rev() {
        let mut value = raw.value.clone();
        let ctx = InterpolationContext {
            file: &raw.path,
            relative_to_include: Some(&relative),
        };
        interpolate_tree(&mut value, subs, &ctx)?;

        let config: ModuleConfig = value.try_into().map_err(|e: toml::de::Error| {
            ConfigError::Parse {
                path: raw.path.clone(),
                message: e.to_string(),
            }
        })?;

        merged = Some(match merged {
            Some(parent) => config.merge_parent(parent),
            None => config,
        });
    }

    let config = merged.unwrap_or_default();
    let path = chain[0].path.clone();
    config.validate(&path)?;

    Ok(ResolvedConfig {
        config,
        dir: module_dir,
        path,
        include_chain: chain[1..].iter().map(|r| r.path.clone()).collect(),
    })
}

/// Resolve the configuration of the module in `dir`.
pub fn resolve_dir(dir: &Path, subs: &Substitutions) -> Result<ResolvedConfig, ConfigError> {
    resolve(&dir.join(CONFIG_FILE_NAME), subs)
}

/// Read `path` and every file it includes, module first.
fn load_chain(path: &Path, subs: &Substitutions) -> Result<Vec<RawConfig>, ConfigError> {
    let mut chain: Vec<RawConfig> = Vec::new();
    let mut next = Some(path.to_path_buf());

    while let Some(current) = next.take() {
        let canonical = canonicalize(&current)?;

        if chain.iter().any(|r| r.path == canonical) {
            let mut cycle: Vec<PathBuf> = chain.iter().map(|r| r.path.clone()).collect();
            cycle.push(canonical);
            return Err(ConfigError::CyclicInclude { chain: cycle });
        }

        debug!(path = %canonical.display(), "loading configuration");
        let value = read_raw(&canonical)?;
        next = include_target(&canonical, &value, subs)?;
        chain.push(RawConfig {
            path: canonical,
            value,
        });
    }

    Ok(chain)
}

fn canonicalize(path: &Path) -> Result<PathBuf, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    fs::canonicalize(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })
}

fn read_raw(path: &Path) -> Result<toml::Value, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    let table: toml::Table = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(toml::Value::Table(table))
}

/// The file named by `include.path`, resolved against `file`'s directory.
fn include_target(
    file: &Path,
    value: &toml::Value,
    subs: &Substitutions,
) -> Result<Option<PathBuf>, ConfigError> {
    let Some(include) = value.get("include") else {
        return Ok(None);
    };
    let raw = include
        .get("path")
        .and_then(toml::Value::as_str)
        .ok_or_else(|| ConfigError::Parse {
            path: file.to_path_buf(),
            message: "include.path must be a string".into(),
        })?;

    let ctx = InterpolationContext {
        file,
        relative_to_include: None,
    };
    let target = PathBuf::from(interpolate(raw, subs, &ctx)?);
    let target = if target.is_absolute() {
        target
    } else {
        parent_dir(file).join(target)
    };
    Ok(Some(target))
}

fn parent_dir(file: &Path) -> PathBuf {
    file.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
