//! lock
//!
//! Distributed lock over a [`LockTable`].
//!
//! # Architecture
//!
//! The lock serializes mutating operations against one piece of state
//! across processes and machines. It is built on the table's conditional
//! writes: acquire is put-if-absent, release is delete-if-holder-matches.
//! Nothing is cached locally; every call hits the table.
//!
//! # Invariants
//!
//! - At most one record exists per state id
//! - A holder can only remove its own record
//! - Releasing a lock you do not hold is a successful no-op
//! - Locks never expire; an orphaned record needs an explicit release
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stackguard::core::retry::RetryPolicy;
//! use stackguard::core::types::{HolderId, StateId, TableName};
//! use stackguard::lock::{LockManager, ReleaseOutcome};
//! use stackguard::remote::memory::MemoryBackend;
//! use stackguard::remote::LockTable;
//!
//! # tokio_test::block_on(async {
//! let backend = MemoryBackend::new();
//! let table = TableName::new("locks").unwrap();
//! backend.create_table(&table).await.unwrap();
//!
//! let locks = LockManager::new(Arc::new(backend), table, RetryPolicy::no_retry());
//! let state = StateId::new("qa/my-app").unwrap();
//! let me = HolderId::new("me@laptop").unwrap();
//!
//! locks.acquire(&state, &me, 0, Duration::ZERO).await.unwrap();
//! assert!(locks.status(&state).await.unwrap().is_some());
//! assert_eq!(locks.release(&state, &me).await.unwrap(), ReleaseOutcome::Released);
//! # });
//! ```

mod guard;

pub use guard::LockGuard;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::retry::RetryPolicy;
use crate::core::types::{HolderId, StateId, TableName};
use crate::remote::state::store_retry;
use crate::remote::{DeleteOutcome, LockRecord, LockTable, PutOutcome, StoreError};

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder kept the lock for the whole retry budget.
    #[error("Unable to acquire lock for state {state_id}: held by {holder} since {acquired_at}")]
    Unavailable {
        state_id: StateId,
        holder: String,
        acquired_at: String,
    },

    /// The lock table could not be reached or refused the request.
    #[error("lock store error for state {state_id}: {source}")]
    Store {
        state_id: StateId,
        #[source]
        source: StoreError,
    },
}

impl LockError {
    /// Check if this error means the lock is held elsewhere.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, LockError::Unavailable { .. })
    }
}

/// Result of a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Our record was deleted.
    Released,
    /// We did not hold the lock. Carries the current holder, if any.
    NotHeld { current: Option<HolderId> },
}

/// Acquires and releases locks in one table.
#[derive(Clone)]
pub struct LockManager {
    table: Arc<dyn LockTable>,
    table_name: TableName,
    retry: RetryPolicy,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("backend", &self.table.name())
            .field("table", &self.table_name)
            .finish()
    }
}

impl LockManager {
    /// Create a manager for `table_name`. `retry` governs transient store
    /// errors, not contention.
    pub fn new(table: Arc<dyn LockTable>, table_name: TableName, retry: RetryPolicy) -> Self {
        Self {
            table,
            table_name,
            retry,
        }
    }

    /// Table this manager writes to.
    pub fn table_name(&self) -> &TableName {
        &self.table_name
    }

    /// Backend holding the table.
    pub fn table(&self) -> Arc<dyn LockTable> {
        Arc::clone(&self.table)
    }

    /// Acquire the lock on `state_id` for `holder`.
    ///
    /// If someone else holds it, try again up to `max_retries` more times,
    /// `retry_interval` apart.
    ///
    /// # Errors
    ///
    /// - [`LockError::Unavailable`] naming the current holder once the
    ///   budget is spent
    /// - [`LockError::Store`] on a permanent store failure, or a transient
    ///   one that outlasted the store retry policy
    pub async fn acquire(
        &self,
        state_id: &StateId,
        holder: &HolderId,
        max_retries: u32,
        retry_interval: Duration,
    ) -> Result<LockRecord, LockError> {
        let contention = RetryPolicy::for_lock_contention(max_retries, retry_interval);
        let mut attempt = 1;

        loop {
            let record = LockRecord::new(state_id.clone(), holder.clone());
            let outcome = self
                .retry
                .run(|| self.table.put_if_absent(&self.table_name, &record), store_retry)
                .await
                .map_err(|source| LockError::Store {
                    state_id: state_id.clone(),
                    source,
                })?;

            let existing = match outcome {
                PutOutcome::Written => {
                    info!(state = %state_id, holder = %holder, "acquired lock");
                    return Ok(record);
                }
                PutOutcome::AlreadyHeld(existing) => existing,
            };

            if attempt >= contention.max_attempts {
                let (holder, acquired_at) = match existing {
                    Some(r) => (r.holder.to_string(), r.acquired_at.to_string()),
                    None => ("an unknown holder".to_string(), "an unknown time".to_string()),
                };
                return Err(LockError::Unavailable {
                    state_id: state_id.clone(),
                    holder,
                    acquired_at,
                });
            }

            let delay = contention.delay_after(attempt);
            match &existing {
                Some(r) => info!(
                    state = %state_id,
                    holder = %r.holder,
                    since = %r.acquired_at,
                    attempt,
                    retry_in_secs = delay.as_secs_f64(),
                    "lock is held, retrying"
                ),
                None => info!(state = %state_id, attempt, "lock is held, retrying"),
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Acquire the lock and return a guard that releases it.
    ///
    /// Prefer [`LockGuard::release`] for an awaited release; dropping an
    /// unreleased guard schedules the release on the current runtime.
    pub async fn acquire_guard(
        &self,
        state_id: &StateId,
        holder: &HolderId,
        max_retries: u32,
        retry_interval: Duration,
    ) -> Result<LockGuard, LockError> {
        let record = self
            .acquire(state_id, holder, max_retries, retry_interval)
            .await?;
        Ok(LockGuard::new(self.clone(), record))
    }

    /// Release the lock on `state_id` if `holder` holds it.
    ///
    /// A record owned by someone else, no record, or no table at all is left
    /// alone and reported as [`ReleaseOutcome::NotHeld`].
    pub async fn release(
        &self,
        state_id: &StateId,
        holder: &HolderId,
    ) -> Result<ReleaseOutcome, LockError> {
        let outcome = match self
            .retry
            .run(
                || self.table.delete_if_holder(&self.table_name, state_id, holder),
                store_retry,
            )
            .await
        {
            Ok(outcome) => outcome,
            // No table, no lock.
            Err(StoreError::NotFound(_)) => DeleteOutcome::Missing,
            Err(source) => {
                return Err(LockError::Store {
                    state_id: state_id.clone(),
                    source,
                })
            }
        };

        match outcome {
            DeleteOutcome::Deleted => {
                info!(state = %state_id, holder = %holder, "released lock");
                Ok(ReleaseOutcome::Released)
            }
            DeleteOutcome::Missing => {
                debug!(state = %state_id, "no lock to release");
                Ok(ReleaseOutcome::NotHeld { current: None })
            }
            DeleteOutcome::HeldByOther(current) => {
                warn!(
                    state = %state_id,
                    holder = %holder,
                    current = %current,
                    "lock is held by another holder, not releasing"
                );
                Ok(ReleaseOutcome::NotHeld {
                    current: Some(current),
                })
            }
        }
    }

    /// Current lock record for `state_id`, if any. A missing table reads
    /// as unlocked.
    pub async fn status(&self, state_id: &StateId) -> Result<Option<LockRecord>, LockError> {
        match self
            .retry
            .run(|| self.table.get(&self.table_name, state_id), store_retry)
            .await
        {
            Ok(record) => Ok(record),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(source) => Err(LockError::Store {
                state_id: state_id.clone(),
                source,
            }),
        }
    }
}
