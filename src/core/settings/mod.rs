//! core::settings
//!
//! User settings and loading.
//!
//! # Precedence
//!
//! Values are resolved in this order (later overrides earlier):
//! 1. Default values
//! 2. User settings file
//! 3. Module configuration (lock retries only)
//! 4. CLI flags (not handled here)
//!
//! # Locations
//!
//! Searched in order, first match wins:
//! 1. `$STACKGUARD_CONFIG` if set
//! 2. `$XDG_CONFIG_HOME/stackguard/config.toml`
//! 3. `~/.stackguard/config.toml`
//!
//! # Example
//!
//! ```no_run
//! use stackguard::core::settings::Settings;
//!
//! let settings = Settings::load().unwrap();
//! println!("tool: {}", settings.tool());
//! println!("holder: {}", settings.holder().unwrap());
//! ```

pub mod schema;

pub use schema::{RetrySettings, UserSettings};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::core::config::LockDefaults;
use crate::core::retry::{Backoff, RetryPolicy, DEFAULT_INITIAL_INTERVAL, DEFAULT_MAX_INTERVAL};
use crate::core::types::{HolderId, TypeError};

/// Default provisioning tool binary.
pub const DEFAULT_TOOL: &str = "terraform";

/// Errors from settings operations.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file '{}': {source}", path.display())]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse settings file '{}': {message}", path.display())]
    ParseError { path: PathBuf, message: String },

    #[error("invalid setting: {0}")]
    InvalidValue(String),

    #[error("home directory not found")]
    NoHomeDir,
}

/// Loaded user settings with defaults applied through accessors.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Raw settings as read from disk
    pub user: UserSettings,
    /// Path the settings were loaded from (if any)
    path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the standard locations.
    ///
    /// # Errors
    ///
    /// Returns an error if a settings file exists but cannot be parsed.
    /// A missing file is not an error (defaults are used).
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_with(|name| std::env::var(name).ok(), dirs::home_dir())
    }

    /// Load settings using an explicit environment lookup and home directory.
    pub fn load_with<F>(env: F, home: Option<PathBuf>) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for path in Self::candidates(&env, home.as_deref()) {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load settings from a specific file.
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path).map_err(|e| SettingsError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let user: UserSettings =
            toml::from_str(&contents).map_err(|e| SettingsError::ParseError {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        user.validate()?;

        Ok(Self {
            user,
            path: Some(path.to_path_buf()),
        })
    }

    fn candidates<F>(env: &F, home: Option<&Path>) -> Vec<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut paths = Vec::new();
        if let Some(path) = env("STACKGUARD_CONFIG") {
            paths.push(PathBuf::from(path));
        }
        if let Some(xdg_home) = env("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg_home).join("stackguard/config.toml"));
        }
        if let Some(home) = home {
            paths.push(home.join(".stackguard/config.toml"));
        }
        paths
    }

    /// Canonical settings path, `~/.stackguard/config.toml`.
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        let home = dirs::home_dir().ok_or(SettingsError::NoHomeDir)?;
        Ok(home.join(".stackguard/config.toml"))
    }

    /// Path the settings were loaded from.
    pub fn loaded_from(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // =========================================================================
    // Accessors with defaults
    // =========================================================================

    /// Provisioning tool binary.
    ///
    /// Defaults to "terraform".
    pub fn tool(&self) -> &str {
        self.user.tool.as_deref().unwrap_or(DEFAULT_TOOL)
    }

    /// Lock holder identity.
    ///
    /// Defaults to `$USER@$HOSTNAME`.
    pub fn holder(&self) -> Result<HolderId, TypeError> {
        match &self.user.holder {
            Some(holder) => HolderId::new(holder.clone()),
            None => Ok(HolderId::current()),
        }
    }

    /// Root directory of the local backend.
    ///
    /// Defaults to `<data dir>/stackguard`, or `.stackguard` in the current
    /// directory when no data directory is known.
    pub fn local_root(&self) -> PathBuf {
        self.user.local_root.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|d| d.join("stackguard"))
                .unwrap_or_else(|| PathBuf::from(".stackguard"))
        })
    }

    /// Fallback lock retry settings.
    pub fn lock_defaults(&self) -> LockDefaults {
        let defaults = LockDefaults::default();
        LockDefaults {
            max_retries: self.user.max_lock_retries.unwrap_or(defaults.max_retries),
            retry_interval: self
                .user
                .lock_retry_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_interval),
        }
    }

    /// Retry policy for remote store calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = self.user.retry.clone().unwrap_or_default();
        let default = RetryPolicy::default();
        let initial = retry
            .initial_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_INITIAL_INTERVAL);
        RetryPolicy {
            max_attempts: retry.max_attempts.unwrap_or(default.max_attempts).max(1),
            initial_interval: initial,
            max_interval: retry
                .max_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_MAX_INTERVAL)
                .max(initial),
            backoff: retry.backoff.unwrap_or(Backoff::Exponential),
        }
    }
}
