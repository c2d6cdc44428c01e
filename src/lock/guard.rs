//! lock::guard
//!
//! Scoped ownership of an acquired lock.
//!
//! # Invariants
//!
//! - An armed guard owns exactly one lock record
//! - [`LockGuard::release`] disarms the guard before touching the table
//! - Dropping an armed guard spawns the release on the current tokio
//!   runtime

use tracing::{debug, warn};

use super::{LockError, LockManager, ReleaseOutcome};
use crate::remote::LockRecord;

/// A held lock. Release it explicitly; drop is the fallback.
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    record: LockRecord,
    armed: bool,
}

impl LockGuard {
    pub(super) fn new(manager: LockManager, record: LockRecord) -> Self {
        Self {
            manager,
            record,
            armed: true,
        }
    }

    /// The record written on acquisition.
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Release the lock and wait for the table to confirm.
    pub async fn release(mut self) -> Result<ReleaseOutcome, LockError> {
        self.armed = false;
        self.manager
            .release(&self.record.state_id, &self.record.holder)
            .await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let manager = self.manager.clone();
        let state_id = self.record.state_id.clone();
        let holder = self.record.holder.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(state = %state_id, "releasing dropped lock in background");
                handle.spawn(async move {
                    if let Err(e) = manager.release(&state_id, &holder).await {
                        warn!(state = %state_id, error = %e, "failed to release dropped lock");
                    }
                });
            }
            Err(_) => {
                warn!(
                    state = %state_id,
                    holder = %holder,
                    "lock dropped outside a runtime and left held; run release-lock"
                );
            }
        }
    }
}
