//! core::config::schema
//!
//! Module configuration schema types.
//!
//! # Layout
//!
//! Every module directory holds a `stackguard.toml`:
//!
//! ```toml
//! [include]
//! path = "${find_in_parent_folders()}"
//!
//! [lock]
//! backend = "dynamodb"
//! state_file_id = "qa/my-app"
//! table_name = "stackguard_locks"
//! max_lock_retries = 1
//!
//! [remote_state]
//! backend = "s3"
//!
//! [remote_state.config]
//! bucket = "__FILL_IN_BUCKET_NAME__"
//! key = "${path_relative_to_include()}/terraform.tfstate"
//! region = "us-west-2"
//! encrypt = true
//!
//! [dependencies]
//! paths = ["../mgmt"]
//!
//! [terraform]
//! extra_args = ["-parallelism=4"]
//!
//! [terraform.vars]
//! environment = "qa"
//! ```
//!
//! # Merge
//!
//! [`ModuleConfig::merge_parent`] layers a child over its included parent:
//! scalar fields override one by one, maps merge key by key, and list-valued
//! fields are taken wholesale from the child when it sets them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::core::types::{BucketName, StateId, TableName};

/// Default lock table name.
pub const DEFAULT_LOCK_TABLE: &str = "stackguard_locks";

/// Default number of extra acquire attempts when a lock is held.
pub const DEFAULT_MAX_LOCK_RETRIES: u32 = 360;

/// Default wait between acquire attempts.
pub const DEFAULT_LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Region used by the local backend when none is configured.
pub const LOCAL_REGION: &str = "local";

/// A module configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ModuleConfig {
    /// Parent configuration to inherit from
    pub include: Option<IncludeConfig>,

    /// Distributed lock settings
    pub lock: Option<LockConfig>,

    /// Remote state backend settings
    pub remote_state: Option<RemoteStateConfig>,

    /// Modules that must be applied before this one
    pub dependencies: Option<DependenciesConfig>,

    /// Inline provisioning-tool settings
    pub terraform: Option<TerraformConfig>,
}

/// `[include]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IncludeConfig {
    /// Path of the parent configuration, relative to this file's directory
    pub path: String,
}

/// `[lock]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    /// Lock backend ("dynamodb" or "local")
    pub backend: Option<String>,

    /// State identifier the lock is keyed by
    pub state_file_id: Option<String>,

    /// Lock table name
    pub table_name: Option<String>,

    /// Region of the lock table (must match the remote state region)
    pub aws_region: Option<String>,

    /// Extra acquire attempts while the lock is held elsewhere
    pub max_lock_retries: Option<u32>,

    /// Seconds between acquire attempts
    pub lock_retry_interval_secs: Option<u64>,
}

/// `[remote_state]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteStateConfig {
    /// Object store backend ("s3" or "local")
    pub backend: Option<String>,

    /// Backend settings, forwarded to the tool as backend configuration
    pub config: BTreeMap<String, toml::Value>,
}

/// `[dependencies]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DependenciesConfig {
    /// Module directories this module depends on, relative to it
    pub paths: Vec<String>,
}

/// `[terraform]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TerraformConfig {
    /// Variables passed to the tool as `-var name=value`
    pub vars: Option<BTreeMap<String, String>>,

    /// Extra arguments appended to every tool command
    pub extra_args: Option<Vec<String>>,
}

/// Object store backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Filesystem-backed store under the local root
    Local,
    /// Amazon S3
    S3,
}

impl StoreBackend {
    fn parse(name: &str) -> Result<Self, String> {
        match name {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            other => Err(format!(
                "unsupported remote_state backend '{}', must be one of: s3, local",
                other
            )),
        }
    }
}

/// Lock table backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackend {
    /// Filesystem-backed table under the local root
    Local,
    /// Amazon DynamoDB
    DynamoDb,
}

impl LockBackend {
    fn parse(name: &str) -> Result<Self, String> {
        match name {
            "local" => Ok(Self::Local),
            "dynamodb" => Ok(Self::DynamoDb),
            other => Err(format!(
                "unsupported lock backend '{}', must be one of: dynamodb, local",
                other
            )),
        }
    }
}

/// Fallbacks for lock settings the configuration leaves unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockDefaults {
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for LockDefaults {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_LOCK_RETRIES,
            retry_interval: DEFAULT_LOCK_RETRY_INTERVAL,
        }
    }
}

/// Typed view of a validated `[lock]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSettings {
    pub backend: LockBackend,
    pub state_id: StateId,
    pub table: TableName,
    pub region: Option<String>,
    pub max_retries: u32,
    pub retry_interval: Duration,
}

/// Remote state descriptor derived from a validated `[remote_state]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStateDescriptor {
    pub backend: StoreBackend,
    /// Globally unique store identifier
    pub bucket: BucketName,
    pub region: String,
    /// State object key inside the bucket
    pub key: String,
    /// Lock table to create next to the bucket, if the module locks
    pub lock_table: Option<TableName>,
    pub encrypt: bool,
    pub versioning: bool,
    /// Remaining backend settings, forwarded untouched
    pub extra: BTreeMap<String, String>,
}

impl ModuleConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Layer `self` (the child) over `parent`.
    ///
    /// The child's `include` is kept; the parent's is never inherited.
    pub fn merge_parent(self, parent: ModuleConfig) -> ModuleConfig {
        ModuleConfig {
            include: self.include,
            lock: merge_option(self.lock, parent.lock, LockConfig::merge_parent),
            remote_state: merge_option(
                self.remote_state,
                parent.remote_state,
                RemoteStateConfig::merge_parent,
            ),
            dependencies: self.dependencies.or(parent.dependencies),
            terraform: merge_option(self.terraform, parent.terraform, TerraformConfig::merge_parent),
        }
    }

    /// Dependency paths as declared (relative to the module directory).
    pub fn dependency_paths(&self) -> &[String] {
        self.dependencies
            .as_ref()
            .map(|d| d.paths.as_slice())
            .unwrap_or(&[])
    }

    /// Dependency directories resolved against `module_dir`.
    pub fn dependency_dirs(&self, module_dir: &Path) -> Vec<PathBuf> {
        self.dependency_paths()
            .iter()
            .map(|p| module_dir.join(p))
            .collect()
    }

    /// Inline tool variables.
    pub fn vars(&self) -> BTreeMap<String, String> {
        self.terraform
            .as_ref()
            .and_then(|t| t.vars.clone())
            .unwrap_or_default()
    }

    /// Extra tool arguments.
    pub fn extra_args(&self) -> Vec<String> {
        self.terraform
            .as_ref()
            .and_then(|t| t.extra_args.clone())
            .unwrap_or_default()
    }

    /// Typed lock settings, or `None` if the module does not lock.
    pub fn lock_settings(&self, defaults: &LockDefaults) -> Result<Option<LockSettings>, String> {
        let Some(lock) = &self.lock else {
            return Ok(None);
        };

        let backend = LockBackend::parse(lock.backend.as_deref().unwrap_or("dynamodb"))?;
        let state_id = lock
            .state_file_id
            .as_deref()
            .ok_or_else(|| "lock.state_file_id is required".to_string())
            .and_then(|id| StateId::new(id).map_err(|e| e.to_string()))?;
        let table = TableName::new(lock.table_name.as_deref().unwrap_or(DEFAULT_LOCK_TABLE))
            .map_err(|e| e.to_string())?;

        Ok(Some(LockSettings {
            backend,
            state_id,
            table,
            region: lock.aws_region.clone(),
            max_retries: lock.max_lock_retries.unwrap_or(defaults.max_retries),
            retry_interval: lock
                .lock_retry_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_interval),
        }))
    }

    /// Remote state descriptor, or `None` if the module keeps local state.
    pub fn remote_state_descriptor(&self) -> Result<Option<RemoteStateDescriptor>, String> {
        let Some(remote) = &self.remote_state else {
            return Ok(None);
        };

        let backend = StoreBackend::parse(remote.backend.as_deref().unwrap_or("s3"))?;
        let mut settings: BTreeMap<String, String> = remote
            .config
            .iter()
            .map(|(k, v)| (k.clone(), render_value(v)))
            .collect();

        let bucket = settings
            .remove("bucket")
            .ok_or_else(|| "remote_state.config.bucket is required".to_string())
            .and_then(|b| BucketName::new(b).map_err(|e| e.to_string()))?;
        let key = settings
            .remove("key")
            .filter(|k| !k.is_empty())
            .ok_or_else(|| "remote_state.config.key is required".to_string())?;
        let region = match (settings.remove("region"), backend) {
            (Some(region), _) => region,
            (None, StoreBackend::Local) => LOCAL_REGION.to_string(),
            (None, StoreBackend::S3) => {
                return Err("remote_state.config.region is required for the s3 backend".into())
            }
        };
        let encrypt = parse_flag(settings.remove("encrypt"), "encrypt", true)?;
        let versioning = parse_flag(settings.remove("versioning"), "versioning", true)?;

        let lock_table = self
            .lock
            .as_ref()
            .map(|l| TableName::new(l.table_name.as_deref().unwrap_or(DEFAULT_LOCK_TABLE)))
            .transpose()
            .map_err(|e| e.to_string())?;

        Ok(Some(RemoteStateDescriptor {
            backend,
            bucket,
            region,
            key,
            lock_table,
            encrypt,
            versioning,
            extra: settings,
        }))
    }

    /// Validate a fully merged configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` naming `path` if a section is
    /// incomplete or the lock and state regions disagree.
    pub fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Validation {
            path: path.to_path_buf(),
            message,
        };

        let lock = self.lock_settings(&LockDefaults::default()).map_err(invalid)?;
        let remote = self.remote_state_descriptor().map_err(invalid)?;

        if let (Some(lock), Some(remote)) = (&lock, &remote) {
            if let Some(lock_region) = &lock.region {
                if lock_region != &remote.region {
                    return Err(invalid(format!(
                        "lock region '{}' differs from remote state region '{}'; \
                         only a single region is supported",
                        lock_region, remote.region
                    )));
                }
            }
        }

        for dep in self.dependency_paths() {
            if dep.trim().is_empty() {
                return Err(invalid("dependencies.paths cannot contain empty paths".into()));
            }
        }

        Ok(())
    }
}

impl LockConfig {
    fn merge_parent(self, parent: LockConfig) -> LockConfig {
        LockConfig {
            backend: self.backend.or(parent.backend),
            state_file_id: self.state_file_id.or(parent.state_file_id),
            table_name: self.table_name.or(parent.table_name),
            aws_region: self.aws_region.or(parent.aws_region),
            max_lock_retries: self.max_lock_retries.or(parent.max_lock_retries),
            lock_retry_interval_secs: self
                .lock_retry_interval_secs
                .or(parent.lock_retry_interval_secs),
        }
    }
}

impl RemoteStateConfig {
    fn merge_parent(self, parent: RemoteStateConfig) -> RemoteStateConfig {
        let mut config = parent.config;
        config.extend(self.config);
        RemoteStateConfig {
            backend: self.backend.or(parent.backend),
            config,
        }
    }
}

impl TerraformConfig {
    fn merge_parent(self, parent: TerraformConfig) -> TerraformConfig {
        let vars = match (self.vars, parent.vars) {
            (Some(child), Some(mut parent)) => {
                parent.extend(child);
                Some(parent)
            }
            (child, parent) => child.or(parent),
        };
        TerraformConfig {
            vars,
            extra_args: self.extra_args.or(parent.extra_args),
        }
    }
}

fn merge_option<T>(child: Option<T>, parent: Option<T>, merge: fn(T, T) -> T) -> Option<T> {
    match (child, parent) {
        (Some(child), Some(parent)) => Some(merge(child, parent)),
        (child, parent) => child.or(parent),
    }
}

/// Render a backend setting as the tool expects it on the command line.
fn render_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_flag(value: Option<String>, name: &str, default: bool) -> Result<bool, String> {
    match value.as_deref() {
        None => Ok(default),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(format!(
            "remote_state.config.{} must be true or false, got '{}'",
            name, other
        )),
    }
}
