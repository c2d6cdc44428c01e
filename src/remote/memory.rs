//! remote::memory
//!
//! In-process object store and lock table for deterministic testing.
//!
//! # Design
//!
//! [`MemoryBackend`] implements both [`ObjectStore`] and [`LockTable`] over
//! maps behind an `Arc<Mutex<...>>`, so clones share state and can stand in
//! for several processes talking to the same service. Failures can be
//! injected per operation, either forever or for a fixed number of calls,
//! and every call is recorded for later verification. A write can also be
//! applied and then acknowledged late, and a bucket can be created by an
//! unseen competitor between a caller's existence check and its create.
//!
//! # Example
//!
//! ```
//! use stackguard::core::types::TableName;
//! use stackguard::remote::memory::{MemoryBackend, Op};
//! use stackguard::remote::{LockTable, StoreError};
//!
//! # tokio_test::block_on(async {
//! let backend = MemoryBackend::new()
//!     .fail_times(Op::CreateTable, StoreError::Throttled("busy".into()), 1);
//! let table = TableName::new("locks").unwrap();
//!
//! assert!(backend.create_table(&table).await.is_err());
//! assert!(backend.create_table(&table).await.is_ok());
//! assert_eq!(backend.count(Op::CreateTable), 2);
//! # });
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::traits::{
    CreateOutcome, DeleteOutcome, LockRecord, LockTable, ObjectStore, ObjectVersion, PutOutcome,
    StoreError,
};
use crate::core::types::{BucketName, HolderId, StateId, TableName};

/// Store operations, for fault injection and call recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    BucketExists,
    CreateBucket,
    EnableVersioning,
    EnableEncryption,
    ListObjectVersions,
    DeleteObjects,
    DeleteBucket,
    TableExists,
    CreateTable,
    PutIfAbsent,
    Get,
    DeleteIfHolder,
    DeleteTable,
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryOperation {
    /// Which operation ran
    pub op: Op,
    /// Bucket, table, or `table/state_id` the call addressed
    pub target: String,
}

/// Observable state of one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketState {
    pub region: String,
    pub versioning: bool,
    pub encryption: bool,
    pub objects: Vec<ObjectVersion>,
}

#[derive(Debug, Clone)]
struct Fault {
    op: Op,
    error: StoreError,
    /// Calls left to fail; `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    buckets: BTreeMap<String, BucketState>,
    /// Buckets that exist but belong to another account.
    foreign_buckets: Vec<String>,
    /// Buckets another caller creates right before ours.
    racing_creators: Vec<String>,
    /// Sleep after applying these operations.
    ack_delays: Vec<(Op, Duration)>,
    tables: BTreeMap<String, BTreeMap<StateId, LockRecord>>,
    faults: Vec<Fault>,
    operations: Vec<MemoryOperation>,
    next_version: u64,
}

/// In-memory backend for tests.
///
/// Thread-safe via internal `Arc<Mutex<...>>` wrapping.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call to `op` with `error`.
    pub fn fail_on(self, op: Op, error: StoreError) -> Self {
        self.lock().faults.push(Fault {
            op,
            error,
            remaining: None,
        });
        self
    }

    /// Fail the next `times` calls to `op` with `error`.
    pub fn fail_times(self, op: Op, error: StoreError, times: u32) -> Self {
        if times > 0 {
            self.lock().faults.push(Fault {
                op,
                error,
                remaining: Some(times),
            });
        }
        self
    }

    /// Clear all injected failures.
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Mark a bucket name as taken by another account.
    pub fn with_foreign_bucket(self, bucket: &str) -> Self {
        self.lock().foreign_buckets.push(bucket.to_string());
        self
    }

    /// Have a competitor create `bucket` just before this backend's next
    /// `create_bucket` call, so that call reports `AlreadyExists`.
    pub fn with_racing_creator(self, bucket: &str) -> Self {
        self.lock().racing_creators.push(bucket.to_string());
        self
    }

    /// Apply `op` immediately but return only after `delay`.
    pub fn delay_ack(self, op: Op, delay: Duration) -> Self {
        self.lock().ack_delays.push((op, delay));
        self
    }

    /// All recorded calls, oldest first.
    pub fn operations(&self) -> Vec<MemoryOperation> {
        self.lock().operations.clone()
    }

    /// Number of recorded calls to `op`.
    pub fn count(&self, op: Op) -> usize {
        self.lock().operations.iter().filter(|o| o.op == op).count()
    }

    /// Clear recorded calls.
    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    /// Snapshot of a bucket (for test verification).
    pub fn bucket(&self, bucket: &str) -> Option<BucketState> {
        self.lock().buckets.get(bucket).cloned()
    }

    /// Whether a table exists (for test verification).
    pub fn has_table(&self, table: &str) -> bool {
        self.lock().tables.contains_key(table)
    }

    /// Current record for a state id (for test verification).
    pub fn record(&self, table: &str, state_id: &StateId) -> Option<LockRecord> {
        self.lock()
            .tables
            .get(table)
            .and_then(|t| t.get(state_id))
            .cloned()
    }

    /// Write a new version of an object, as the provisioning tool would.
    pub fn put_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.next_version += 1;
        let version = inner.next_version;
        let state = inner
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NotFound(format!("bucket {}", bucket)))?;
        let version_id = state.versioning.then(|| format!("v{}", version));
        if version_id.is_none() {
            state.objects.retain(|o| o.key != key);
        }
        state.objects.push(ObjectVersion {
            key: key.to_string(),
            version_id,
        });
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn settle(&self, op: Op) {
        let delay = self
            .lock()
            .ack_delays
            .iter()
            .find(|(o, _)| *o == op)
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn insert_record(&self, table: &TableName, record: &LockRecord) -> Result<PutOutcome, StoreError> {
        let mut inner = self.enter(Op::PutIfAbsent, format!("{}/{}", table, record.state_id))?;
        let rows = inner
            .tables
            .get_mut(table.as_str())
            .ok_or_else(|| missing_table(table))?;
        if let Some(existing) = rows.get(&record.state_id) {
            return Ok(PutOutcome::AlreadyHeld(Some(existing.clone())));
        }
        rows.insert(record.state_id.clone(), record.clone());
        Ok(PutOutcome::Written)
    }

    /// Record the call, then return the injected error if one applies.
    fn enter(&self, op: Op, target: impl Into<String>) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        let mut inner = self.lock();
        inner.operations.push(MemoryOperation {
            op,
            target: target.into(),
        });

        if let Some(index) = inner.faults.iter().position(|f| f.op == op) {
            let error = inner.faults[index].error.clone();
            match inner.faults[index].remaining {
                None => {}
                Some(n) if n <= 1 => {
                    inner.faults.remove(index);
                }
                Some(n) => inner.faults[index].remaining = Some(n - 1),
            }
            return Err(error);
        }
        Ok(inner)
    }
}

fn missing_table(table: &TableName) -> StoreError {
    StoreError::NotFound(format!("table {}", table))
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn bucket_exists(&self, bucket: &BucketName) -> Result<bool, StoreError> {
        let inner = self.enter(Op::BucketExists, bucket.as_str())?;
        if inner.foreign_buckets.iter().any(|b| b == bucket.as_str()) {
            return Err(StoreError::AccessDenied(format!(
                "bucket {} belongs to another account",
                bucket
            )));
        }
        Ok(inner.buckets.contains_key(bucket.as_str()))
    }

    async fn create_bucket(
        &self,
        bucket: &BucketName,
        region: &str,
    ) -> Result<CreateOutcome, StoreError> {
        let mut inner = self.enter(Op::CreateBucket, bucket.as_str())?;
        if inner.foreign_buckets.iter().any(|b| b == bucket.as_str()) {
            return Err(StoreError::Conflict(format!(
                "bucket {} already exists and is owned by another account",
                bucket
            )));
        }
        if let Some(index) = inner.racing_creators.iter().position(|b| b == bucket.as_str()) {
            inner.racing_creators.remove(index);
            inner.buckets.insert(
                bucket.as_str().to_string(),
                BucketState {
                    region: region.to_string(),
                    ..Default::default()
                },
            );
        }
        if inner.buckets.contains_key(bucket.as_str()) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.buckets.insert(
            bucket.as_str().to_string(),
            BucketState {
                region: region.to_string(),
                ..Default::default()
            },
        );
        Ok(CreateOutcome::Created)
    }

    async fn enable_versioning(&self, bucket: &BucketName) -> Result<(), StoreError> {
        let mut inner = self.enter(Op::EnableVersioning, bucket.as_str())?;
        let state = inner
            .buckets
            .get_mut(bucket.as_str())
            .ok_or_else(|| StoreError::NotFound(format!("bucket {}", bucket)))?;
        state.versioning = true;
        Ok(())
    }

    async fn enable_encryption(&self, bucket: &BucketName) -> Result<(), StoreError> {
        let mut inner = self.enter(Op::EnableEncryption, bucket.as_str())?;
        let state = inner
            .buckets
            .get_mut(bucket.as_str())
            .ok_or_else(|| StoreError::NotFound(format!("bucket {}", bucket)))?;
        state.encryption = true;
        Ok(())
    }

    async fn list_object_versions(
        &self,
        bucket: &BucketName,
    ) -> Result<Vec<ObjectVersion>, StoreError> {
        let inner = self.enter(Op::ListObjectVersions, bucket.as_str())?;
        inner
            .buckets
            .get(bucket.as_str())
            .map(|b| b.objects.clone())
            .ok_or_else(|| StoreError::NotFound(format!("bucket {}", bucket)))
    }

    async fn delete_objects(
        &self,
        bucket: &BucketName,
        versions: &[ObjectVersion],
    ) -> Result<(), StoreError> {
        let mut inner = self.enter(Op::DeleteObjects, bucket.as_str())?;
        let state = inner
            .buckets
            .get_mut(bucket.as_str())
            .ok_or_else(|| StoreError::NotFound(format!("bucket {}", bucket)))?;
        state.objects.retain(|o| !versions.contains(o));
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &BucketName) -> Result<(), StoreError> {
        let mut inner = self.enter(Op::DeleteBucket, bucket.as_str())?;
        match inner.buckets.get(bucket.as_str()) {
            None => Err(StoreError::NotFound(format!("bucket {}", bucket))),
            Some(state) if !state.objects.is_empty() => Err(StoreError::Conflict(format!(
                "bucket {} is not empty",
                bucket
            ))),
            Some(_) => {
                inner.buckets.remove(bucket.as_str());
                Ok(())
            }
        }
    }
}

#[async_trait]
impl LockTable for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn table_exists(&self, table: &TableName) -> Result<bool, StoreError> {
        let inner = self.enter(Op::TableExists, table.as_str())?;
        Ok(inner.tables.contains_key(table.as_str()))
    }

    async fn create_table(&self, table: &TableName) -> Result<CreateOutcome, StoreError> {
        let mut inner = self.enter(Op::CreateTable, table.as_str())?;
        if inner.tables.contains_key(table.as_str()) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.tables.insert(table.as_str().to_string(), BTreeMap::new());
        Ok(CreateOutcome::Created)
    }

    async fn put_if_absent(
        &self,
        table: &TableName,
        record: &LockRecord,
    ) -> Result<PutOutcome, StoreError> {
        let outcome = self.insert_record(table, record);
        self.settle(Op::PutIfAbsent).await;
        outcome
    }

    async fn get(
        &self,
        table: &TableName,
        state_id: &StateId,
    ) -> Result<Option<LockRecord>, StoreError> {
        let inner = self.enter(Op::Get, format!("{}/{}", table, state_id))?;
        let rows = inner
            .tables
            .get(table.as_str())
            .ok_or_else(|| missing_table(table))?;
        Ok(rows.get(state_id).cloned())
    }

    async fn delete_if_holder(
        &self,
        table: &TableName,
        state_id: &StateId,
        holder: &HolderId,
    ) -> Result<DeleteOutcome, StoreError> {
        let mut inner = self.enter(Op::DeleteIfHolder, format!("{}/{}", table, state_id))?;
        let rows = inner
            .tables
            .get_mut(table.as_str())
            .ok_or_else(|| missing_table(table))?;
        match rows.get(state_id) {
            None => Ok(DeleteOutcome::Missing),
            Some(existing) if &existing.holder != holder => {
                Ok(DeleteOutcome::HeldByOther(existing.holder.clone()))
            }
            Some(_) => {
                rows.remove(state_id);
                Ok(DeleteOutcome::Deleted)
            }
        }
    }

    async fn delete_table(&self, table: &TableName) -> Result<(), StoreError> {
        let mut inner = self.enter(Op::DeleteTable, table.as_str())?;
        inner
            .tables
            .remove(table.as_str())
            .map(|_| ())
            .ok_or_else(|| missing_table(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> BucketName {
        BucketName::new("state-bucket").unwrap()
    }

    fn table() -> TableName {
        TableName::new("locks").unwrap()
    }

    fn record(state: &str, holder: &str) -> LockRecord {
        LockRecord::new(StateId::new(state).unwrap(), HolderId::new(holder).unwrap())
    }

    #[tokio::test]
    async fn create_bucket_twice_reports_existing() {
        let backend = MemoryBackend::new();
        assert_eq!(
            backend.create_bucket(&bucket(), "us-west-2").await.unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            backend.create_bucket(&bucket(), "us-west-2").await.unwrap(),
            CreateOutcome::AlreadyExists
        );
        assert_eq!(backend.bucket("state-bucket").unwrap().region, "us-west-2");
    }

    #[tokio::test]
    async fn foreign_bucket_conflicts() {
        let backend = MemoryBackend::new().with_foreign_bucket("state-bucket");
        let err = backend.create_bucket(&bucket(), "us-west-2").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn put_if_absent_is_exclusive() {
        let backend = MemoryBackend::new();
        backend.create_table(&table()).await.unwrap();

        let first = backend.put_if_absent(&table(), &record("app", "alice")).await.unwrap();
        assert_eq!(first, PutOutcome::Written);

        let second = backend.put_if_absent(&table(), &record("app", "bob")).await.unwrap();
        match second {
            PutOutcome::AlreadyHeld(Some(existing)) => assert_eq!(existing.holder.as_str(), "alice"),
            other => panic!("expected AlreadyHeld, got {other:?}"),
        }

        let other_state = backend.put_if_absent(&table(), &record("db", "bob")).await.unwrap();
        assert_eq!(other_state, PutOutcome::Written);
    }

    #[tokio::test]
    async fn delete_if_holder_respects_owner() {
        let backend = MemoryBackend::new();
        backend.create_table(&table()).await.unwrap();
        backend.put_if_absent(&table(), &record("app", "alice")).await.unwrap();

        let state = StateId::new("app").unwrap();
        let bob = HolderId::new("bob").unwrap();
        let alice = HolderId::new("alice").unwrap();

        assert!(matches!(
            backend.delete_if_holder(&table(), &state, &bob).await.unwrap(),
            DeleteOutcome::HeldByOther(_)
        ));
        assert!(backend.record("locks", &state).is_some());

        assert_eq!(
            backend.delete_if_holder(&table(), &state, &alice).await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            backend.delete_if_holder(&table(), &state, &alice).await.unwrap(),
            DeleteOutcome::Missing
        );
    }

    #[tokio::test]
    async fn lock_ops_on_missing_table_fail() {
        let backend = MemoryBackend::new();
        let err = backend.put_if_absent(&table(), &record("app", "a")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn fault_injection_counts_down() {
        let backend = MemoryBackend::new().fail_times(
            Op::BucketExists,
            StoreError::Network("reset".into()),
            2,
        );
        assert!(backend.bucket_exists(&bucket()).await.is_err());
        assert!(backend.bucket_exists(&bucket()).await.is_err());
        assert!(!backend.bucket_exists(&bucket()).await.unwrap());
        assert_eq!(backend.count(Op::BucketExists), 3);
    }

    #[tokio::test]
    async fn permanent_fault_until_cleared() {
        let backend =
            MemoryBackend::new().fail_on(Op::CreateTable, StoreError::AccessDenied("no".into()));
        assert!(backend.create_table(&table()).await.is_err());
        assert!(backend.create_table(&table()).await.is_err());
        backend.clear_faults();
        assert!(backend.create_table(&table()).await.is_ok());
    }

    #[tokio::test]
    async fn versioned_objects_accumulate_until_deleted() {
        let backend = MemoryBackend::new();
        backend.create_bucket(&bucket(), "local").await.unwrap();
        backend.enable_versioning(&bucket()).await.unwrap();
        backend.put_object("state-bucket", "app/terraform.tfstate").unwrap();
        backend.put_object("state-bucket", "app/terraform.tfstate").unwrap();

        let versions = backend.list_object_versions(&bucket()).await.unwrap();
        assert_eq!(versions.len(), 2);

        let err = backend.delete_bucket(&bucket()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        backend.delete_objects(&bucket(), &versions).await.unwrap();
        backend.delete_bucket(&bucket()).await.unwrap();
        assert!(backend.bucket("state-bucket").is_none());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = MemoryBackend::new();
        let b = a.clone();
        a.create_table(&table()).await.unwrap();
        assert!(b.table_exists(&table()).await.unwrap());
    }

    #[tokio::test]
    async fn racing_creator_wins_the_create() {
        let backend = MemoryBackend::new().with_racing_creator("state-bucket");
        assert!(!backend.bucket_exists(&bucket()).await.unwrap());
        assert_eq!(
            backend.create_bucket(&bucket(), "us-west-2").await.unwrap(),
            CreateOutcome::AlreadyExists
        );
        assert!(backend.bucket("state-bucket").is_some());
    }

    #[tokio::test]
    async fn delayed_ack_writes_before_returning() {
        let backend = MemoryBackend::new().delay_ack(Op::PutIfAbsent, Duration::from_millis(200));
        backend.create_table(&table()).await.unwrap();

        let put = tokio::time::timeout(
            Duration::from_millis(20),
            backend.put_if_absent(&table(), &record("app", "alice")),
        )
        .await;

        assert!(put.is_err());
        assert!(backend
            .record("locks", &StateId::new("app").unwrap())
            .is_some());
    }
}
