//! remote::cleanup
//!
//! Teardown of remote state storage.
//!
//! Deleting a versioned bucket means deleting every version of every object
//! first. These helpers are only reachable from the `cleanup` command; the
//! normal pipeline never removes remote resources.

use tracing::info;

use super::state::{store_retry, RemoteStateError};
use super::traits::{LockTable, ObjectStore};
use crate::core::retry::RetryPolicy;
use crate::core::types::{BucketName, TableName};

/// Delete every object version in `bucket`, then the bucket.
///
/// Returns the number of versions deleted, or `None` if the bucket did not
/// exist.
pub async fn purge_bucket(
    store: &dyn ObjectStore,
    bucket: &BucketName,
    retry: &RetryPolicy,
) -> Result<Option<usize>, RemoteStateError> {
    let fail = |action, source| RemoteStateError {
        action,
        resource: format!("bucket {}", bucket),
        source,
    };

    let exists = retry
        .run(|| store.bucket_exists(bucket), store_retry)
        .await
        .map_err(|e| fail("probe", e))?;
    if !exists {
        return Ok(None);
    }

    let versions = retry
        .run(|| store.list_object_versions(bucket), store_retry)
        .await
        .map_err(|e| fail("list versions in", e))?;
    if !versions.is_empty() {
        retry
            .run(|| store.delete_objects(bucket, &versions), store_retry)
            .await
            .map_err(|e| fail("delete objects in", e))?;
    }

    retry
        .run(|| store.delete_bucket(bucket), store_retry)
        .await
        .map_err(|e| fail("delete", e))?;

    info!(bucket = %bucket, versions = versions.len(), "deleted bucket");
    Ok(Some(versions.len()))
}

/// Delete the lock table.
///
/// Returns `false` if the table did not exist.
pub async fn drop_lock_table(
    table: &dyn LockTable,
    name: &TableName,
    retry: &RetryPolicy,
) -> Result<bool, RemoteStateError> {
    let fail = |action, source| RemoteStateError {
        action,
        resource: format!("lock table {}", name),
        source,
    };

    let exists = retry
        .run(|| table.table_exists(name), store_retry)
        .await
        .map_err(|e| fail("probe", e))?;
    if !exists {
        return Ok(false);
    }

    retry
        .run(|| table.delete_table(name), store_retry)
        .await
        .map_err(|e| fail("delete", e))?;

    info!(table = %name, "deleted lock table");
    Ok(true)
}
