//! remote::factory
//!
//! Backend selection and creation.
//!
//! # Design
//!
//! Pipelines ask a [`BackendProvider`] for an object store or lock table by
//! backend kind instead of naming implementations directly. The default
//! provider serves `local` from a root directory and `s3` / `dynamodb` from
//! the AWS SDK when the `aws` feature is enabled. Tests hand in a
//! [`MemoryBackend`], which serves every kind from the same shared maps.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::local::LocalBackend;
use super::memory::MemoryBackend;
use super::traits::{LockTable, ObjectStore, StoreError};
use crate::core::config::{LockBackend, StoreBackend};

/// Region used for DynamoDB when neither the lock nor the state names one.
pub const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Source of object stores and lock tables.
#[async_trait]
pub trait BackendProvider: Send + Sync {
    /// Object store for `kind` in `region`.
    async fn object_store(
        &self,
        kind: StoreBackend,
        region: &str,
    ) -> Result<Arc<dyn ObjectStore>, StoreError>;

    /// Lock table for `kind` in `region` (or the default region).
    async fn lock_table(
        &self,
        kind: LockBackend,
        region: Option<&str>,
    ) -> Result<Arc<dyn LockTable>, StoreError>;
}

/// Provider used by the CLI.
#[derive(Debug, Clone)]
pub struct DefaultBackends {
    local: LocalBackend,
}

impl DefaultBackends {
    /// Serve the local backend from `local_root`.
    pub fn new(local_root: impl Into<PathBuf>) -> Self {
        Self {
            local: LocalBackend::new(local_root),
        }
    }

    /// The local backend.
    pub fn local(&self) -> &LocalBackend {
        &self.local
    }
}

#[async_trait]
impl BackendProvider for DefaultBackends {
    async fn object_store(
        &self,
        kind: StoreBackend,
        region: &str,
    ) -> Result<Arc<dyn ObjectStore>, StoreError> {
        match kind {
            StoreBackend::Local => Ok(Arc::new(self.local.clone())),
            StoreBackend::S3 => aws_store(region).await,
        }
    }

    async fn lock_table(
        &self,
        kind: LockBackend,
        region: Option<&str>,
    ) -> Result<Arc<dyn LockTable>, StoreError> {
        match kind {
            LockBackend::Local => Ok(Arc::new(self.local.clone())),
            LockBackend::DynamoDb => aws_table(region.unwrap_or(DEFAULT_AWS_REGION)).await,
        }
    }
}

#[cfg(feature = "aws")]
async fn aws_store(region: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
    Ok(Arc::new(super::aws::AwsBackend::connect(region).await))
}

#[cfg(feature = "aws")]
async fn aws_table(region: &str) -> Result<Arc<dyn LockTable>, StoreError> {
    Ok(Arc::new(super::aws::AwsBackend::connect(region).await))
}

#[cfg(not(feature = "aws"))]
async fn aws_store(_region: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
    Err(StoreError::Unsupported(
        "the s3 backend requires building with the `aws` feature".into(),
    ))
}

#[cfg(not(feature = "aws"))]
async fn aws_table(_region: &str) -> Result<Arc<dyn LockTable>, StoreError> {
    Err(StoreError::Unsupported(
        "the dynamodb backend requires building with the `aws` feature".into(),
    ))
}

#[async_trait]
impl BackendProvider for MemoryBackend {
    async fn object_store(
        &self,
        _kind: StoreBackend,
        _region: &str,
    ) -> Result<Arc<dyn ObjectStore>, StoreError> {
        Ok(Arc::new(self.clone()))
    }

    async fn lock_table(
        &self,
        _kind: LockBackend,
        _region: Option<&str>,
    ) -> Result<Arc<dyn LockTable>, StoreError> {
        Ok(Arc::new(self.clone()))
    }
}
