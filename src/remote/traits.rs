//! remote::traits
//!
//! Object store and lock table traits.
//!
//! # Design
//!
//! Both traits are async because every backend but the in-memory one does
//! I/O. Conditional operations report their outcome as a value
//! ([`CreateOutcome`], [`PutOutcome`], [`DeleteOutcome`]) rather than as an
//! error, so callers can treat "someone else got there first" as ordinary
//! control flow. Errors are reserved for failures, and each one says whether
//! it is worth retrying through [`StoreError::is_transient`].
//!
//! # Example
//!
//! ```
//! use stackguard::core::types::{HolderId, StateId, TableName};
//! use stackguard::remote::memory::MemoryBackend;
//! use stackguard::remote::{LockRecord, LockTable, PutOutcome};
//!
//! # tokio_test::block_on(async {
//! let backend = MemoryBackend::new();
//! let table = TableName::new("locks").unwrap();
//! backend.create_table(&table).await.unwrap();
//!
//! let record = LockRecord::new(StateId::new("app").unwrap(), HolderId::new("me").unwrap());
//! assert_eq!(backend.put_if_absent(&table, &record).await.unwrap(), PutOutcome::Written);
//! assert!(matches!(
//!     backend.put_if_absent(&table, &record).await.unwrap(),
//!     PutOutcome::AlreadyHeld(_)
//! ));
//! # });
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{BucketName, HolderId, StateId, TableName, UtcTimestamp};

/// Name of the lock table's primary key attribute.
pub const LOCK_TABLE_KEY: &str = "StateFileId";

/// Errors from object store and lock table operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource exists and belongs to someone else.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Credentials are missing or lack permission.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The service asked us to slow down.
    #[error("throttled: {0}")]
    Throttled(String),

    /// The resource exists but is not usable yet (e.g. table still creating).
    #[error("not ready: {0}")]
    NotReady(String),

    /// Network or connection error.
    #[error("network error: {0}")]
    Network(String),

    /// Local filesystem error.
    #[error("I/O error: {0}")]
    Io(String),

    /// A stored record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Any other service error.
    #[error("service error: {0}")]
    Service(String),

    /// The backend is not available in this build.
    #[error("unsupported backend: {0}")]
    Unsupported(String),
}

impl StoreError {
    /// Check if this error indicates a transient failure that might succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Throttled(_) | StoreError::NotReady(_) | StoreError::Network(_)
        )
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => StoreError::AccessDenied(err.to_string()),
            _ => StoreError::Io(err.to_string()),
        }
    }
}

/// Outcome of creating a bucket or table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// This call created the resource.
    Created,
    /// The resource already existed and is ours to use.
    AlreadyExists,
}

/// Outcome of a conditional lock write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// No record existed; ours is now stored.
    Written,
    /// A record already existed. Carries it when the backend could read it.
    AlreadyHeld(Option<LockRecord>),
}

/// Outcome of a conditional lock delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The record matched the holder and was removed.
    Deleted,
    /// No record existed.
    Missing,
    /// A record exists for another holder; it was left alone.
    HeldByOther(HolderId),
}

/// One version of one object, as listed for deletion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectVersion {
    /// Object key
    pub key: String,
    /// Version id (None for unversioned objects)
    pub version_id: Option<String>,
}

/// A lock record: proof that a holder owns the lock on a state id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// State the lock protects (the table's primary key)
    pub state_id: StateId,
    /// Who holds the lock
    pub holder: HolderId,
    /// When the lock was taken
    pub acquired_at: UtcTimestamp,
}

impl LockRecord {
    /// Create a record stamped with the current time.
    pub fn new(state_id: StateId, holder: HolderId) -> Self {
        Self {
            state_id,
            holder,
            acquired_at: UtcTimestamp::now(),
        }
    }
}

/// A versioned, encrypted object store holding persisted state.
///
/// # Errors
///
/// All methods return `StoreError`. Callers should retry only when
/// [`StoreError::is_transient`] says so.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Backend name (e.g., "s3", "local").
    fn name(&self) -> &'static str;

    /// Settings the provisioning tool needs to address `key` in `bucket`.
    ///
    /// Defaults to the S3 backend's `bucket`, `key` and `region`.
    fn backend_settings(
        &self,
        bucket: &BucketName,
        key: &str,
        region: &str,
    ) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("bucket".to_string(), bucket.to_string()),
            ("key".to_string(), key.to_string()),
            ("region".to_string(), region.to_string()),
        ])
    }

    /// Whether the bucket exists and is accessible.
    async fn bucket_exists(&self, bucket: &BucketName) -> Result<bool, StoreError>;

    /// Create the bucket in `region`.
    ///
    /// A bucket already owned by the caller is `AlreadyExists`. A bucket
    /// owned by someone else is `StoreError::Conflict`.
    async fn create_bucket(
        &self,
        bucket: &BucketName,
        region: &str,
    ) -> Result<CreateOutcome, StoreError>;

    /// Turn on object versioning. Idempotent.
    async fn enable_versioning(&self, bucket: &BucketName) -> Result<(), StoreError>;

    /// Turn on default server-side encryption. Idempotent.
    async fn enable_encryption(&self, bucket: &BucketName) -> Result<(), StoreError>;

    /// List every version of every object in the bucket.
    async fn list_object_versions(
        &self,
        bucket: &BucketName,
    ) -> Result<Vec<ObjectVersion>, StoreError>;

    /// Delete the given object versions.
    async fn delete_objects(
        &self,
        bucket: &BucketName,
        versions: &[ObjectVersion],
    ) -> Result<(), StoreError>;

    /// Delete an empty bucket.
    async fn delete_bucket(&self, bucket: &BucketName) -> Result<(), StoreError>;
}

/// A key-value table with conditional writes, used for locks.
///
/// Records are keyed by [`LOCK_TABLE_KEY`] (the state id).
#[async_trait]
pub trait LockTable: Send + Sync {
    /// Backend name (e.g., "dynamodb", "local").
    fn name(&self) -> &'static str;

    /// Whether the table exists and is ready for use.
    async fn table_exists(&self, table: &TableName) -> Result<bool, StoreError>;

    /// Create the table and wait until it is usable.
    async fn create_table(&self, table: &TableName) -> Result<CreateOutcome, StoreError>;

    /// Store `record` only if no record exists for its state id.
    async fn put_if_absent(
        &self,
        table: &TableName,
        record: &LockRecord,
    ) -> Result<PutOutcome, StoreError>;

    /// Read the record for `state_id`, if any.
    async fn get(
        &self,
        table: &TableName,
        state_id: &StateId,
    ) -> Result<Option<LockRecord>, StoreError>;

    /// Delete the record for `state_id` only if `holder` holds it.
    async fn delete_if_holder(
        &self,
        table: &TableName,
        state_id: &StateId,
        holder: &HolderId,
    ) -> Result<DeleteOutcome, StoreError>;

    /// Delete the whole table.
    async fn delete_table(&self, table: &TableName) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::Throttled("slow down".into()).is_transient());
        assert!(StoreError::NotReady("CREATING".into()).is_transient());
        assert!(StoreError::Network("reset".into()).is_transient());

        assert!(!StoreError::AccessDenied("nope".into()).is_transient());
        assert!(!StoreError::Conflict("owned elsewhere".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        assert!(!StoreError::Corrupt("x".into()).is_transient());
    }

    #[test]
    fn io_errors_map_by_kind() {
        let err: StoreError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, StoreError::AccessDenied(_)));

        let err: StoreError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn lock_record_serializes_rfc3339() {
        let record = LockRecord::new(StateId::new("app").unwrap(), HolderId::new("a@b").unwrap());
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"state_id\":\"app\""));
        assert!(json.contains("\"holder\":\"a@b\""));

        let back: LockRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn store_error_display() {
        assert_eq!(
            StoreError::AccessDenied("s3:CreateBucket".into()).to_string(),
            "access denied: s3:CreateBucket"
        );
    }
}
