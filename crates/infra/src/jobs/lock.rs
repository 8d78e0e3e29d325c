//! Claim / release / outcome recording on top of a [`JobStore`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use escrowbox_core::{Clock, JobId, WorkerId};

use super::store::{JobStore, OutcomeWrite};
use super::types::{Job, RetryPolicy};
use crate::error::StoreError;

/// What `mark_failed` did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Unlocked and scheduled to run again.
    Retrying { run_after: DateTime<Utc> },
    /// Attempts exhausted; `failed_at` set.
    Failed,
    /// The row was terminal already; nothing changed.
    AlreadyTerminal,
    /// Another worker owns the job now, or nobody does; nothing changed.
    LockLost,
}

/// Owns the worker identity, the clock, the retry policy and the lock timeout.
pub struct LockManager {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    worker_id: WorkerId,
    policy: RetryPolicy,
    lock_timeout: Duration,
}

impl LockManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        worker_id: WorkerId,
        policy: RetryPolicy,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            worker_id,
            policy,
            lock_timeout,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self
            .store
            .claim_batch(
                &self.worker_id,
                limit,
                self.clock.now(),
                self.policy.max_attempts,
            )
            .await?;
        if !jobs.is_empty() {
            debug!(worker_id = %self.worker_id, claimed = jobs.len(), "claimed jobs");
        }
        Ok(jobs)
    }

    /// Unlock jobs whose lock is older than the lock timeout.
    pub async fn release_stale_locks(&self) -> Result<u64, StoreError> {
        // A timeout reaching past the calendar's start means nothing is stale yet.
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(to_chrono(self.lock_timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let released = self.store.release_stale_locks(cutoff).await?;
        if released > 0 {
            info!(worker_id = %self.worker_id, released, "released stale job locks");
        }
        Ok(released)
    }

    pub async fn mark_processed(
        &self,
        job_id: JobId,
        attempts: u32,
    ) -> Result<OutcomeWrite, StoreError> {
        let written = self
            .store
            .complete(job_id, &self.worker_id, attempts, self.clock.now())
            .await?;
        match written {
            OutcomeWrite::Written => {}
            OutcomeWrite::AlreadyTerminal => {
                debug!(job_id = %job_id, "job already terminal; completion ignored");
            }
            OutcomeWrite::LockLost => {
                warn!(job_id = %job_id, worker_id = %self.worker_id, "job lock lost; completion ignored");
            }
        }
        Ok(written)
    }

    /// Record a failed execution: retry with backoff, or fail for good once
    /// `attempts` reaches the policy maximum.
    pub async fn mark_failed(
        &self,
        job_id: JobId,
        attempts: u32,
        error: &str,
    ) -> Result<FailureDisposition, StoreError> {
        let now = self.clock.now();

        if !self.policy.should_retry(attempts) {
            let written = self
                .store
                .fail_permanently(job_id, &self.worker_id, attempts, now, error)
                .await?;
            if let Some(missed) = self.missed(job_id, written) {
                return Ok(missed);
            }
            warn!(job_id = %job_id, attempts, error, "job failed permanently");
            return Ok(FailureDisposition::Failed);
        }

        let run_after = now
            .checked_add_signed(to_chrono(self.policy.delay_for_attempt(attempts)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let written = self
            .store
            .reschedule(job_id, &self.worker_id, attempts, run_after, error)
            .await?;
        if let Some(missed) = self.missed(job_id, written) {
            return Ok(missed);
        }
        debug!(job_id = %job_id, attempts, %run_after, "job rescheduled");
        Ok(FailureDisposition::Retrying { run_after })
    }

    fn missed(&self, job_id: JobId, written: OutcomeWrite) -> Option<FailureDisposition> {
        match written {
            OutcomeWrite::Written => None,
            OutcomeWrite::AlreadyTerminal => Some(FailureDisposition::AlreadyTerminal),
            OutcomeWrite::LockLost => {
                warn!(job_id = %job_id, worker_id = %self.worker_id, "job lock lost; failure ignored");
                Some(FailureDisposition::LockLost)
            }
        }
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{ESCROW_FUND, NewJob};
    use crate::memory::InMemoryStore;
    use chrono::TimeZone;
    use escrowbox_core::ManualClock;

    fn setup() -> (Arc<InMemoryStore>, Arc<ManualClock>, LockManager) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let locks = LockManager::new(
            store.clone(),
            clock.clone(),
            WorkerId::new("worker-a"),
            RetryPolicy::default(),
            Duration::from_secs(60),
        );
        (store, clock, locks)
    }

    async fn enqueue(store: &InMemoryStore, clock: &ManualClock) -> JobId {
        store
            .enqueue(NewJob::new(ESCROW_FUND, serde_json::json!({})), clock.now())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn failure_reschedules_with_backoff_then_fails() {
        let (store, clock, locks) = setup();
        let id = enqueue(&store, &clock).await;

        let claimed = locks.claim_batch(20).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let disposition = locks.mark_failed(id, 1, "boom").await.unwrap();
        let expected = clock.now() + chrono::Duration::seconds(2);
        assert_eq!(
            disposition,
            FailureDisposition::Retrying {
                run_after: expected
            }
        );
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.locked_by.is_none());
        assert_eq!(job.last_error.as_deref(), Some("boom"));

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(locks.claim_batch(20).await.unwrap().len(), 1);
        assert_eq!(
            locks.mark_failed(id, 5, "boom").await.unwrap(),
            FailureDisposition::Failed
        );
        let job = store.get(id).await.unwrap().unwrap();
        assert!(job.failed_at.is_some());
        assert!(job.processed_at.is_none());

        assert_eq!(
            locks.mark_failed(id, 6, "late").await.unwrap(),
            FailureDisposition::AlreadyTerminal
        );
        assert_eq!(
            locks.mark_processed(id, 6).await.unwrap(),
            OutcomeWrite::AlreadyTerminal
        );
    }

    #[tokio::test]
    async fn reaped_worker_cannot_touch_the_new_owners_lock() {
        let (store, clock, stale) = setup();
        let id = enqueue(&store, &clock).await;
        assert_eq!(stale.claim_batch(20).await.unwrap().len(), 1);

        clock.advance(chrono::Duration::seconds(61));
        let owner = LockManager::new(
            store.clone(),
            clock.clone(),
            WorkerId::new("worker-b"),
            RetryPolicy::default(),
            Duration::from_secs(60),
        );
        assert_eq!(owner.release_stale_locks().await.unwrap(), 1);
        assert_eq!(owner.claim_batch(20).await.unwrap().len(), 1);

        assert_eq!(
            stale.mark_failed(id, 1, "late").await.unwrap(),
            FailureDisposition::LockLost
        );
        assert_eq!(
            stale.mark_failed(id, 5, "late").await.unwrap(),
            FailureDisposition::LockLost
        );
        assert_eq!(
            stale.mark_processed(id, 1).await.unwrap(),
            OutcomeWrite::LockLost
        );

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.locked_by, Some(WorkerId::new("worker-b")));
        assert!(job.last_error.is_none());
        let third = LockManager::new(
            store.clone(),
            clock.clone(),
            WorkerId::new("worker-c"),
            RetryPolicy::default(),
            Duration::from_secs(60),
        );
        assert!(third.claim_batch(20).await.unwrap().is_empty());

        assert_eq!(
            owner.mark_processed(id, 1).await.unwrap(),
            OutcomeWrite::Written
        );
    }

    #[tokio::test]
    async fn huge_durations_saturate_instead_of_overflowing() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(9_000_000_000_000_000),
            max_delay: Duration::from_millis(9_000_000_000_000_000),
            ..RetryPolicy::default()
        };
        let locks = LockManager::new(
            store.clone(),
            clock.clone(),
            WorkerId::new("worker-a"),
            policy,
            Duration::from_millis(9_000_000_000_000_000),
        );
        let id = enqueue(&store, &clock).await;
        assert_eq!(locks.claim_batch(20).await.unwrap().len(), 1);

        assert_eq!(locks.release_stale_locks().await.unwrap(), 0);
        assert_eq!(
            locks.mark_failed(id, 1, "boom").await.unwrap(),
            FailureDisposition::Retrying {
                run_after: DateTime::<Utc>::MAX_UTC
            }
        );
    }

    #[tokio::test]
    async fn stale_locks_are_released_after_timeout() {
        let (store, clock, locks) = setup();
        let id = enqueue(&store, &clock).await;
        assert_eq!(locks.claim_batch(20).await.unwrap().len(), 1);

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(locks.release_stale_locks().await.unwrap(), 0);

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(locks.release_stale_locks().await.unwrap(), 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert!(job.locked_by.is_none());
        assert_eq!(locks.claim_batch(20).await.unwrap().len(), 1);
    }
}
