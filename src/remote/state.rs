//! remote::state
//!
//! Idempotent bootstrap of remote state storage.
//!
//! # Architecture
//!
//! [`RemoteStateManager::ensure`] makes sure the bucket named by a
//! [`RemoteStateDescriptor`] exists with versioning and encryption enabled,
//! and that the lock table next to it exists. Every probe and mutation is
//! idempotent, so concurrent bootstraps from several machines converge:
//! a bucket or table created by someone else in between counts as success.
//!
//! The manager never runs the provisioning tool. It returns a
//! [`BackendConfig`] that the tool runner renders as `-backend-config`
//! arguments.
//!
//! # Invariants
//!
//! - Every store call goes through the manager's [`RetryPolicy`]
//! - Permanent failures surface at once as [`RemoteStateError`]
//! - Nothing is cached; each call re-probes the store

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::traits::{CreateOutcome, LockTable, ObjectStore, StoreError};
use crate::core::config::{RemoteStateDescriptor, StoreBackend};
use crate::core::retry::{Retry, RetryPolicy};
use crate::core::types::{BucketName, TableName};

/// Failure to bring a remote resource into the expected state.
#[derive(Debug, Error)]
#[error("failed to {action} {resource}: {source}")]
pub struct RemoteStateError {
    /// What was being done (e.g. "create bucket")
    pub action: &'static str,
    /// Which bucket or table
    pub resource: String,
    /// Final store error after retries
    #[source]
    pub source: StoreError,
}

/// Retry classification for store errors.
pub fn store_retry(err: &StoreError) -> Retry {
    if err.is_transient() {
        Retry::Transient
    } else {
        Retry::Permanent
    }
}

/// Ensure the lock table `name` exists in `table`.
///
/// Used directly for modules that lock but keep their state locally.
pub async fn ensure_lock_table(
    table: &dyn LockTable,
    name: &TableName,
    retry: &RetryPolicy,
) -> Result<CreateOutcome, RemoteStateError> {
    let fail = |action, source| RemoteStateError {
        action,
        resource: format!("lock table {}", name),
        source,
    };

    let exists = retry
        .run(|| table.table_exists(name), store_retry)
        .await
        .map_err(|e| fail("probe", e))?;
    if exists {
        debug!(table = %name, "lock table exists");
        return Ok(CreateOutcome::AlreadyExists);
    }

    info!(table = %name, "creating lock table");
    retry
        .run(|| table.create_table(name), store_retry)
        .await
        .map_err(|e| fail("create", e))
}

/// Backend configuration handed to the provisioning tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub backend: StoreBackend,
    pub bucket: BucketName,
    pub key: String,
    pub region: String,
    pub lock_table: Option<TableName>,
    pub encrypt: bool,
    /// Settings rendered as `-backend-config=name=value`, in key order
    pub settings: BTreeMap<String, String>,
}

impl BackendConfig {
    /// Tool arguments for `init`.
    ///
    /// # Example
    ///
    /// ```
    /// use std::collections::BTreeMap;
    /// use stackguard::core::config::StoreBackend;
    /// use stackguard::core::types::BucketName;
    /// use stackguard::remote::BackendConfig;
    ///
    /// let config = BackendConfig {
    ///     backend: StoreBackend::S3,
    ///     bucket: BucketName::new("my-state").unwrap(),
    ///     key: "app/terraform.tfstate".into(),
    ///     region: "us-west-2".into(),
    ///     lock_table: None,
    ///     encrypt: true,
    ///     settings: BTreeMap::from([
    ///         ("bucket".to_string(), "my-state".to_string()),
    ///         ("encrypt".to_string(), "true".to_string()),
    ///     ]),
    /// };
    /// assert_eq!(
    ///     config.to_args(),
    ///     vec!["-backend-config=bucket=my-state", "-backend-config=encrypt=true"]
    /// );
    /// ```
    pub fn to_args(&self) -> Vec<String> {
        self.settings
            .iter()
            .map(|(k, v)| format!("-backend-config={}={}", k, v))
            .collect()
    }
}

/// Ensures buckets and lock tables exist.
#[derive(Clone)]
pub struct RemoteStateManager {
    store: Arc<dyn ObjectStore>,
    table: Option<Arc<dyn LockTable>>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for RemoteStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStateManager")
            .field("store", &self.store.name())
            .field("table", &self.table.as_ref().map(|t| t.name()))
            .field("retry", &self.retry)
            .finish()
    }
}

impl RemoteStateManager {
    /// Create a manager over the given store.
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            table: None,
            retry,
        }
    }

    /// Also ensure the descriptor's lock table, in `table`.
    pub fn with_lock_table(mut self, table: Arc<dyn LockTable>) -> Self {
        self.table = Some(table);
        self
    }

    /// Ensure the bucket (and lock table, if any) for `descriptor` exist.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteStateError`] naming the step that failed once retries
    /// are exhausted or a permanent error is seen.
    pub async fn ensure(
        &self,
        descriptor: &RemoteStateDescriptor,
    ) -> Result<BackendConfig, RemoteStateError> {
        let bucket = &descriptor.bucket;
        let fail = |action, source| RemoteStateError {
            action,
            resource: format!("bucket {}", bucket),
            source,
        };

        let exists = self
            .retry
            .run(|| self.store.bucket_exists(bucket), store_retry)
            .await
            .map_err(|e| fail("probe", e))?;

        if exists {
            debug!(bucket = %bucket, "remote state bucket exists");
        } else {
            info!(bucket = %bucket, region = %descriptor.region, "creating remote state bucket");
            let outcome = self
                .retry
                .run(
                    || self.store.create_bucket(bucket, &descriptor.region),
                    store_retry,
                )
                .await
                .map_err(|e| fail("create", e))?;
            if outcome == CreateOutcome::AlreadyExists {
                debug!(bucket = %bucket, "bucket created concurrently by another caller");
            }
        }

        if descriptor.versioning {
            self.retry
                .run(|| self.store.enable_versioning(bucket), store_retry)
                .await
                .map_err(|e| fail("enable versioning on", e))?;
        }
        if descriptor.encrypt {
            self.retry
                .run(|| self.store.enable_encryption(bucket), store_retry)
                .await
                .map_err(|e| fail("enable encryption on", e))?;
        }

        if let (Some(name), Some(table)) = (&descriptor.lock_table, &self.table) {
            ensure_lock_table(table.as_ref(), name, &self.retry).await?;
        }

        Ok(self.backend_config(descriptor))
    }

    fn backend_config(&self, descriptor: &RemoteStateDescriptor) -> BackendConfig {
        let mut settings =
            self.store
                .backend_settings(&descriptor.bucket, &descriptor.key, &descriptor.region);
        if descriptor.backend == StoreBackend::S3 {
            settings.insert("encrypt".to_string(), descriptor.encrypt.to_string());
            for (k, v) in &descriptor.extra {
                settings.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }

        BackendConfig {
            backend: descriptor.backend,
            bucket: descriptor.bucket.clone(),
            key: descriptor.key.clone(),
            region: descriptor.region.clone(),
            lock_table: descriptor.lock_table.clone(),
            encrypt: descriptor.encrypt,
            settings,
        }
    }
}
