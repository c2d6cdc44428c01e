//! core::settings::schema
//!
//! User settings schema.
//!
//! # Example
//!
//! ```toml
//! tool = "terraform"
//! holder = "ci@build-01"
//! local_root = "/var/lib/stackguard"
//! max_lock_retries = 30
//! lock_retry_interval_secs = 5
//!
//! [retry]
//! max_attempts = 5
//! initial_interval_ms = 500
//! max_interval_ms = 10000
//! backoff = "exponential"
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::SettingsError;
use crate::core::retry::Backoff;
use crate::core::types::HolderId;

/// User-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct UserSettings {
    /// Provisioning tool binary (default: "terraform")
    pub tool: Option<String>,

    /// Lock holder identity (default: `$USER@$HOSTNAME`)
    pub holder: Option<String>,

    /// Root directory of the local backend
    pub local_root: Option<PathBuf>,

    /// Default extra acquire attempts while a lock is held
    pub max_lock_retries: Option<u32>,

    /// Default seconds between acquire attempts
    pub lock_retry_interval_secs: Option<u64>,

    /// Retry policy for remote store calls
    pub retry: Option<RetrySettings>,
}

impl UserSettings {
    /// Validate the settings values.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::InvalidValue` if any value is invalid.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if let Some(tool) = &self.tool {
            if tool.trim().is_empty() {
                return Err(SettingsError::InvalidValue("tool cannot be empty".into()));
            }
        }

        if let Some(holder) = &self.holder {
            HolderId::new(holder.clone())
                .map_err(|e| SettingsError::InvalidValue(format!("invalid holder: {}", e)))?;
        }

        if let Some(retry) = &self.retry {
            retry.validate()?;
        }

        Ok(())
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Total attempts including the first
    pub max_attempts: Option<u32>,

    /// First backoff interval in milliseconds
    pub initial_interval_ms: Option<u64>,

    /// Backoff ceiling in milliseconds
    pub max_interval_ms: Option<u64>,

    /// "fixed" or "exponential"
    pub backoff: Option<Backoff>,
}

impl RetrySettings {
    fn validate(&self) -> Result<(), SettingsError> {
        if self.max_attempts == Some(0) {
            return Err(SettingsError::InvalidValue(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if let (Some(initial), Some(max)) = (self.initial_interval_ms, self.max_interval_ms) {
            if initial > max {
                return Err(SettingsError::InvalidValue(format!(
                    "retry.initial_interval_ms ({}) exceeds retry.max_interval_ms ({})",
                    initial, max
                )));
            }
        }
        Ok(())
    }
}
