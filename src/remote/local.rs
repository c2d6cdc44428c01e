//! remote::local
//!
//! Filesystem-backed object store and lock table.
//!
//! # Storage
//!
//! ```text
//! <root>/buckets/<bucket>/bucket.json        bucket settings
//! <root>/buckets/<bucket>/objects/<key>      state objects
//! <root>/tables/<table>/.lock                guards conditional deletes
//! <root>/tables/<table>/<sha256(id)>.json    one lock record per state id
//! ```
//!
//! # Invariants
//!
//! - A lock record file appears atomically with its full contents: it is
//!   written to a temporary file and hard-linked into place, which fails if
//!   the target already exists.
//! - Conditional deletes read, compare and remove under an exclusive `fs2`
//!   lock on the table's `.lock` file.
//! - A bucket is assembled in a hidden staging directory and renamed into
//!   place, so a visible bucket always has its `bucket.json`.
//! - Creating a bucket or table that already exists reports
//!   `CreateOutcome::AlreadyExists`.
//!
//! These hold across processes sharing the same root, which makes the local
//! backend a real lock service for a single machine or a shared filesystem.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::traits::{
    CreateOutcome, DeleteOutcome, LockRecord, LockTable, ObjectStore, ObjectVersion, PutOutcome,
    StoreError,
};
use crate::core::types::{BucketName, HolderId, StateId, TableName};

const BUCKET_META: &str = "bucket.json";
const OBJECTS_DIR: &str = "objects";
const TABLE_LOCK: &str = ".lock";

/// Persisted bucket settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct BucketMeta {
    region: String,
    versioning: bool,
    encryption: bool,
}

/// Filesystem backend rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `root`. Nothing is created until used.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a bucket.
    pub fn bucket_dir(&self, bucket: &BucketName) -> PathBuf {
        self.root.join("buckets").join(bucket.as_str())
    }

    /// Path of an object inside a bucket.
    pub fn object_path(&self, bucket: &BucketName, key: &str) -> PathBuf {
        self.bucket_dir(bucket).join(OBJECTS_DIR).join(key)
    }

    fn table_dir(&self, table: &TableName) -> PathBuf {
        self.root.join("tables").join(table.as_str())
    }

    fn record_path(&self, table: &TableName, state_id: &StateId) -> PathBuf {
        let digest = Sha256::digest(state_id.as_str().as_bytes());
        self.table_dir(table)
            .join(format!("{}.json", hex::encode(digest)))
    }

    fn read_meta(&self, bucket: &BucketName) -> Result<BucketMeta, StoreError> {
        let dir = self.bucket_dir(bucket);
        let path = dir.join(BUCKET_META);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            // Directory without settings: another creator is mid-way.
            Err(e) if e.kind() == ErrorKind::NotFound && dir.is_dir() => {
                return Err(StoreError::NotReady(format!("bucket {}", bucket)))
            }
            Err(e) => return Err(map_missing(e, || format!("bucket {}", bucket))),
        };
        serde_json::from_str(&contents)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))
    }

    async fn update_meta(
        &self,
        bucket: &BucketName,
        update: impl FnOnce(&mut BucketMeta),
    ) -> Result<(), StoreError> {
        let dir = self.bucket_dir(bucket);
        let _guard = DirLock::acquire(&dir)
            .await
            .map_err(|e| map_missing(e, || format!("bucket {}", bucket)))?;
        let mut meta = self.read_meta(bucket)?;
        update(&mut meta);
        write_atomic(&dir.join(BUCKET_META), &to_json(&meta)?)
    }

    fn require_table(&self, table: &TableName) -> Result<PathBuf, StoreError> {
        let dir = self.table_dir(table);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(StoreError::NotFound(format!("table {}", table)))
        }
    }

    fn read_record(path: &Path) -> Result<Option<LockRecord>, StoreError> {
        match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Exclusive `fs2` lock on a directory's `.lock` file, released on drop.
struct DirLock {
    file: File,
}

impl DirLock {
    /// Wait for the lock on a blocking thread.
    async fn acquire(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join(TABLE_LOCK);
        let file = tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            file.lock_exclusive()?;
            Ok::<_, std::io::Error>(file)
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn map_missing(err: std::io::Error, what: impl FnOnce() -> String) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound(what())
    } else {
        err.into()
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string_pretty(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// Write `contents` to a fresh temporary file next to `target`.
fn write_temp(target: &Path, contents: &str) -> Result<PathBuf, StoreError> {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = target.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    Ok(temp)
}

/// Replace `target` with `contents` atomically.
fn write_atomic(target: &Path, contents: &str) -> Result<(), StoreError> {
    let temp = write_temp(target, contents)?;
    fs::rename(&temp, target)?;
    Ok(())
}

/// Create `target` with `contents` only if it does not exist yet.
///
/// Returns `false` if it already existed.
fn create_exclusive(target: &Path, contents: &str) -> Result<bool, StoreError> {
    let temp = write_temp(target, contents)?;
    let linked = fs::hard_link(&temp, target);
    let _ = fs::remove_file(&temp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn create_dir_exclusive(dir: &Path) -> Result<bool, StoreError> {
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::create_dir(dir) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ObjectStore for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn backend_settings(
        &self,
        bucket: &BucketName,
        key: &str,
        _region: &str,
    ) -> BTreeMap<String, String> {
        BTreeMap::from([(
            "path".to_string(),
            self.object_path(bucket, key).to_string_lossy().into_owned(),
        )])
    }

    async fn bucket_exists(&self, bucket: &BucketName) -> Result<bool, StoreError> {
        Ok(self.bucket_dir(bucket).join(BUCKET_META).is_file())
    }

    async fn create_bucket(
        &self,
        bucket: &BucketName,
        region: &str,
    ) -> Result<CreateOutcome, StoreError> {
        let dir = self.bucket_dir(bucket);
        if dir.join(BUCKET_META).is_file() {
            return Ok(CreateOutcome::AlreadyExists);
        }

        // Build the bucket aside and rename it into place, so a visible
        // bucket always has its settings.
        let meta = BucketMeta {
            region: region.to_string(),
            ..Default::default()
        };
        let staging = self
            .root
            .join("buckets")
            .join(format!(".{}.{}.tmp", bucket, uuid::Uuid::new_v4()));
        fs::create_dir_all(staging.join(OBJECTS_DIR))?;
        write_atomic(&staging.join(BUCKET_META), &to_json(&meta)?)?;

        let renamed = fs::rename(&staging, &dir);
        if renamed.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        match renamed {
            Ok(()) => Ok(CreateOutcome::Created),
            // Lost the race: the target exists and is not empty.
            Err(_) if dir.is_dir() => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn enable_versioning(&self, bucket: &BucketName) -> Result<(), StoreError> {
        self.update_meta(bucket, |meta| meta.versioning = true).await
    }

    async fn enable_encryption(&self, bucket: &BucketName) -> Result<(), StoreError> {
        self.update_meta(bucket, |meta| meta.encryption = true).await
    }

    async fn list_object_versions(
        &self,
        bucket: &BucketName,
    ) -> Result<Vec<ObjectVersion>, StoreError> {
        let objects = self.bucket_dir(bucket).join(OBJECTS_DIR);
        if !objects.is_dir() {
            return Err(StoreError::NotFound(format!("bucket {}", bucket)));
        }

        let mut versions = Vec::new();
        for entry in WalkDir::new(&objects).sort_by_file_name() {
            let entry = entry.map_err(|e| StoreError::Io(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let key = entry
                .path()
                .strip_prefix(&objects)
                .map_err(|e| StoreError::Io(e.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            versions.push(ObjectVersion {
                key,
                version_id: None,
            });
        }
        Ok(versions)
    }

    async fn delete_objects(
        &self,
        bucket: &BucketName,
        versions: &[ObjectVersion],
    ) -> Result<(), StoreError> {
        for version in versions {
            match fs::remove_file(self.object_path(bucket, &version.key)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &BucketName) -> Result<(), StoreError> {
        if !self.list_object_versions(bucket).await?.is_empty() {
            return Err(StoreError::Conflict(format!("bucket {} is not empty", bucket)));
        }
        fs::remove_dir_all(self.bucket_dir(bucket))?;
        Ok(())
    }
}

#[async_trait]
impl LockTable for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn table_exists(&self, table: &TableName) -> Result<bool, StoreError> {
        Ok(self.table_dir(table).is_dir())
    }

    async fn create_table(&self, table: &TableName) -> Result<CreateOutcome, StoreError> {
        if create_dir_exclusive(&self.table_dir(table))? {
            Ok(CreateOutcome::Created)
        } else {
            Ok(CreateOutcome::AlreadyExists)
        }
    }

    async fn put_if_absent(
        &self,
        table: &TableName,
        record: &LockRecord,
    ) -> Result<PutOutcome, StoreError> {
        self.require_table(table)?;
        let path = self.record_path(table, &record.state_id);
        if create_exclusive(&path, &to_json(record)?)? {
            Ok(PutOutcome::Written)
        } else {
            Ok(PutOutcome::AlreadyHeld(Self::read_record(&path)?))
        }
    }

    async fn get(
        &self,
        table: &TableName,
        state_id: &StateId,
    ) -> Result<Option<LockRecord>, StoreError> {
        self.require_table(table)?;
        Self::read_record(&self.record_path(table, state_id))
    }

    async fn delete_if_holder(
        &self,
        table: &TableName,
        state_id: &StateId,
        holder: &HolderId,
    ) -> Result<DeleteOutcome, StoreError> {
        let dir = self.require_table(table)?;
        let _guard = DirLock::acquire(&dir).await?;

        let path = self.record_path(table, state_id);
        match Self::read_record(&path)? {
            None => Ok(DeleteOutcome::Missing),
            Some(existing) if &existing.holder != holder => {
                Ok(DeleteOutcome::HeldByOther(existing.holder))
            }
            Some(_) => {
                fs::remove_file(&path)?;
                Ok(DeleteOutcome::Deleted)
            }
        }
    }

    async fn delete_table(&self, table: &TableName) -> Result<(), StoreError> {
        let dir = self.require_table(table)?;
        fs::remove_dir_all(dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bucket() -> BucketName {
        BucketName::new("local-state").unwrap()
    }

    fn table() -> TableName {
        TableName::new("locks").unwrap()
    }

    fn record(state: &str, holder: &str) -> LockRecord {
        LockRecord::new(StateId::new(state).unwrap(), HolderId::new(holder).unwrap())
    }

    #[tokio::test]
    async fn bucket_lifecycle() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path());

        assert!(!backend.bucket_exists(&bucket()).await.unwrap());
        assert_eq!(
            backend.create_bucket(&bucket(), "local").await.unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            backend.create_bucket(&bucket(), "local").await.unwrap(),
            CreateOutcome::AlreadyExists
        );
        backend.enable_versioning(&bucket()).await.unwrap();
        backend.enable_encryption(&bucket()).await.unwrap();

        let meta = backend.read_meta(&bucket()).unwrap();
        assert!(meta.versioning);
        assert!(meta.encryption);
        assert_eq!(meta.region, "local");
    }

    #[tokio::test]
    async fn versioning_on_missing_bucket_is_not_found() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path());
        let err = backend.enable_versioning(&bucket()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn objects_listed_and_purged() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path());
        backend.create_bucket(&bucket(), "local").await.unwrap();

        let state = backend.object_path(&bucket(), "qa/my-app/terraform.tfstate");
        fs::create_dir_all(state.parent().unwrap()).unwrap();
        fs::write(&state, "{}").unwrap();

        let versions = backend.list_object_versions(&bucket()).await.unwrap();
        assert_eq!(
            versions,
            vec![ObjectVersion {
                key: "qa/my-app/terraform.tfstate".into(),
                version_id: None
            }]
        );

        assert!(backend.delete_bucket(&bucket()).await.is_err());
        backend.delete_objects(&bucket(), &versions).await.unwrap();
        backend.delete_bucket(&bucket()).await.unwrap();
        assert!(!backend.bucket_exists(&bucket()).await.unwrap());
    }

    #[tokio::test]
    async fn backend_settings_point_at_object_path() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path());
        let settings = backend.backend_settings(&bucket(), "app/terraform.tfstate", "local");
        assert_eq!(settings.len(), 1);
        assert!(settings["path"].ends_with("terraform.tfstate"));
        assert!(settings["path"].contains("local-state"));
    }

    #[tokio::test]
    async fn records_are_exclusive_across_instances() {
        let temp = TempDir::new().unwrap();
        let first = LocalBackend::new(temp.path());
        let second = LocalBackend::new(temp.path());
        first.create_table(&table()).await.unwrap();
        assert_eq!(
            second.create_table(&table()).await.unwrap(),
            CreateOutcome::AlreadyExists
        );

        assert_eq!(
            first.put_if_absent(&table(), &record("app", "alice")).await.unwrap(),
            PutOutcome::Written
        );
        match second.put_if_absent(&table(), &record("app", "bob")).await.unwrap() {
            PutOutcome::AlreadyHeld(Some(existing)) => assert_eq!(existing.holder.as_str(), "alice"),
            other => panic!("expected AlreadyHeld, got {other:?}"),
        }

        let state = StateId::new("app").unwrap();
        let stored = second.get(&table(), &state).await.unwrap().unwrap();
        assert_eq!(stored.holder.as_str(), "alice");
    }

    #[tokio::test]
    async fn delete_only_by_holder() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path());
        backend.create_table(&table()).await.unwrap();
        backend.put_if_absent(&table(), &record("app", "alice")).await.unwrap();

        let state = StateId::new("app").unwrap();
        assert_eq!(
            backend
                .delete_if_holder(&table(), &state, &HolderId::new("bob").unwrap())
                .await
                .unwrap(),
            DeleteOutcome::HeldByOther(HolderId::new("alice").unwrap())
        );
        assert_eq!(
            backend
                .delete_if_holder(&table(), &state, &HolderId::new("alice").unwrap())
                .await
                .unwrap(),
            DeleteOutcome::Deleted
        );
        assert!(backend.get(&table(), &state).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_record_reported() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path());
        backend.create_table(&table()).await.unwrap();
        let state = StateId::new("app").unwrap();
        fs::write(backend.record_path(&table(), &state), "not json").unwrap();

        let err = backend.get(&table(), &state).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[tokio::test]
    async fn missing_table_is_not_found() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path());
        let err = backend.get(&table(), &StateId::new("x").unwrap()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(backend.delete_table(&table()).await.is_err());
    }

    fn local_descriptor() -> crate::core::config::RemoteStateDescriptor {
        crate::core::config::RemoteStateDescriptor {
            backend: crate::core::config::StoreBackend::Local,
            bucket: bucket(),
            region: "local".into(),
            key: "app/terraform.tfstate".into(),
            lock_table: None,
            encrypt: true,
            versioning: true,
            extra: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn half_created_bucket_is_completed() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path());
        fs::create_dir_all(backend.bucket_dir(&bucket())).unwrap();

        let manager = crate::remote::RemoteStateManager::new(
            std::sync::Arc::new(backend.clone()),
            crate::core::retry::RetryPolicy::no_retry(),
        );
        manager.ensure(&local_descriptor()).await.unwrap();

        let meta = backend.read_meta(&bucket()).unwrap();
        assert!(meta.versioning && meta.encryption);
    }

    #[tokio::test]
    async fn bucket_without_settings_is_not_ready() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path());
        fs::create_dir_all(backend.bucket_dir(&bucket()).join(OBJECTS_DIR)).unwrap();

        assert!(!backend.bucket_exists(&bucket()).await.unwrap());
        assert_eq!(
            backend.create_bucket(&bucket(), "local").await.unwrap(),
            CreateOutcome::AlreadyExists
        );
        let err = backend.enable_versioning(&bucket()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotReady(_)));
        assert!(err.is_transient());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_bootstrap_all_succeed() {
        let temp = TempDir::new().unwrap();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let backend = LocalBackend::new(temp.path());
            tasks.push(tokio::spawn(async move {
                let manager = crate::remote::RemoteStateManager::new(
                    std::sync::Arc::new(backend),
                    crate::core::retry::RetryPolicy::new(
                        5,
                        std::time::Duration::from_millis(5),
                        crate::core::retry::Backoff::Fixed,
                    ),
                );
                manager.ensure(&local_descriptor()).await
            }));
        }

        let mut configs = Vec::new();
        for task in tasks {
            configs.push(task.await.unwrap().unwrap());
        }
        assert!(configs.windows(2).all(|w| w[0] == w[1]));

        let buckets: Vec<_> = fs::read_dir(temp.path().join("buckets"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(buckets, vec![std::ffi::OsString::from("local-state")]);
    }
}
