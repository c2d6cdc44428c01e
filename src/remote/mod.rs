//! remote
//!
//! Remote state storage and lock tables.
//!
//! # Architecture
//!
//! The [`ObjectStore`] and [`LockTable`] traits define what stackguard needs
//! from a storage service. The pipeline asks a [`BackendProvider`] for
//! implementations by backend kind rather than naming them directly.
//!
//! # Modules
//!
//! - `traits`: Core traits, outcomes and `StoreError`
//! - [`state`]: Idempotent bucket and lock table bootstrap
//! - [`cleanup`]: Bucket purge and table deletion
//! - [`local`]: Filesystem backend (works across processes)
//! - [`memory`]: In-process backend for deterministic testing
//! - `aws`: S3 and DynamoDB (requires `aws` feature)
//! - `factory`: Backend selection

#[cfg(feature = "aws")]
pub mod aws;
pub mod cleanup;
mod factory;
pub mod local;
pub mod memory;
pub mod state;
mod traits;

pub use factory::{BackendProvider, DefaultBackends, DEFAULT_AWS_REGION};
pub use state::{BackendConfig, RemoteStateError, RemoteStateManager};
pub use traits::*;
