//! Job store abstraction.
//!
//! Stores expose primitive conditional updates; the policy on top of them
//! (clock, retry schedule, worker identity) lives in [`super::lock::LockManager`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use escrowbox_core::{JobId, WorkerId};

use super::types::{Job, NewJob};
use crate::error::StoreError;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert an unlocked job. `run_after` defaults to `now`.
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobId, StoreError>;

    /// Lock up to `limit` eligible jobs for `worker`.
    ///
    /// Eligible: `run_after <= now`, unlocked, not terminal and
    /// `attempts < max_attempts`. Candidates are taken oldest-due first
    /// (`run_after`, then `created_at`) and locked with an update conditional
    /// on `locked_by IS NULL`; only rows this call won are returned, in
    /// candidate order.
    async fn claim_batch(
        &self,
        worker: &WorkerId,
        limit: usize,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<Job>, StoreError>;

    /// Unlock non-terminal rows locked before `cutoff`.
    async fn release_stale_locks(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Set `processed_at` and clear the lock, if `worker` still holds it.
    async fn complete(
        &self,
        id: JobId,
        worker: &WorkerId,
        attempts: u32,
        at: DateTime<Utc>,
    ) -> Result<OutcomeWrite, StoreError>;

    /// Unlock with a new `run_after`, if `worker` still holds the lock.
    async fn reschedule(
        &self,
        id: JobId,
        worker: &WorkerId,
        attempts: u32,
        run_after: DateTime<Utc>,
        error: &str,
    ) -> Result<OutcomeWrite, StoreError>;

    /// Set `failed_at` and clear the lock, if `worker` still holds it.
    async fn fail_permanently(
        &self,
        id: JobId,
        worker: &WorkerId,
        attempts: u32,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<OutcomeWrite, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    async fn stats(&self) -> Result<JobStats, StoreError>;

    /// Terminal jobs whose terminal timestamp is before `cutoff`, oldest first.
    async fn list_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Delete the given jobs if they are terminal. Returns the number removed.
    async fn delete_terminal(&self, ids: &[JobId]) -> Result<u64, StoreError>;
}

/// What an outcome write did.
///
/// Outcome writes are conditional on the writer still holding the lock, so a
/// worker whose lock was reaped cannot unlock or finish a job another worker
/// has since claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeWrite {
    Written,
    /// The row was terminal already; nothing changed.
    AlreadyTerminal,
    /// The row is unlocked or locked by another worker; nothing changed.
    LockLost,
}

/// Row counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub in_flight: u64,
    pub processed: u64,
    pub failed: u64,
}
