//! In-memory store for tests and local runs.
//!
//! One mutex guards jobs and envelopes together, so every trait method is a
//! single critical section and `create_envelopes` is atomic.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use escrowbox_core::{EnvelopeId, JobId, WorkerId};
use escrowbox_envelope::{Envelope, EnvelopeStatus, Transition};

use crate::envelopes::{EnvelopeStore, TransitionOutcome};
use crate::error::StoreError;
use crate::jobs::{Job, JobState, JobStats, JobStore, NewJob, OutcomeWrite};

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    envelopes: HashMap<EnvelopeId, Envelope>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All jobs, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.tables().jobs.values().cloned().collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        jobs
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn terminal_at(job: &Job) -> Option<DateTime<Utc>> {
    job.processed_at.or(job.failed_at)
}

fn unlock(job: &mut Job) {
    job.locked_by = None;
    job.locked_at = None;
}

/// Why an outcome write by `worker` must not touch `job`, if it must not.
fn not_held(job: &Job, worker: &WorkerId) -> Option<OutcomeWrite> {
    if job.is_terminal() {
        Some(OutcomeWrite::AlreadyTerminal)
    } else if job.locked_by.as_ref() != Some(worker) {
        Some(OutcomeWrite::LockLost)
    } else {
        None
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobId, StoreError> {
        let job = job.into_job(now);
        let id = job.id;
        let mut tables = self.tables();
        if tables.jobs.contains_key(&id) {
            return Err(StoreError::Conflict(format!("job {id}")));
        }
        tables.jobs.insert(id, job);
        Ok(id)
    }

    async fn claim_batch(
        &self,
        worker: &WorkerId,
        limit: usize,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<Job>, StoreError> {
        let mut tables = self.tables();

        let mut candidates: Vec<(DateTime<Utc>, DateTime<Utc>, JobId)> = tables
            .jobs
            .values()
            .filter(|job| job.is_claimable(now, max_attempts))
            .map(|job| (job.run_after, job.created_at, job.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(job) = tables.jobs.get_mut(&id) {
                if job.locked_by.is_none() {
                    job.locked_by = Some(worker.clone());
                    job.locked_at = Some(now);
                    claimed.push(job.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn release_stale_locks(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        let mut released = 0;
        for job in tables.jobs.values_mut() {
            let stale = job.locked_at.is_some_and(|at| at < cutoff);
            if stale && !job.is_terminal() {
                unlock(job);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn complete(
        &self,
        id: JobId,
        worker: &WorkerId,
        attempts: u32,
        at: DateTime<Utc>,
    ) -> Result<OutcomeWrite, StoreError> {
        let mut tables = self.tables();
        let job = tables.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if let Some(missed) = not_held(job, worker) {
            return Ok(missed);
        }
        job.attempts = attempts;
        job.processed_at = Some(at);
        unlock(job);
        Ok(OutcomeWrite::Written)
    }

    async fn reschedule(
        &self,
        id: JobId,
        worker: &WorkerId,
        attempts: u32,
        run_after: DateTime<Utc>,
        error: &str,
    ) -> Result<OutcomeWrite, StoreError> {
        let mut tables = self.tables();
        let job = tables.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if let Some(missed) = not_held(job, worker) {
            return Ok(missed);
        }
        job.attempts = attempts;
        job.run_after = run_after;
        job.last_error = Some(error.to_string());
        unlock(job);
        Ok(OutcomeWrite::Written)
    }

    async fn fail_permanently(
        &self,
        id: JobId,
        worker: &WorkerId,
        attempts: u32,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<OutcomeWrite, StoreError> {
        let mut tables = self.tables();
        let job = tables.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if let Some(missed) = not_held(job, worker) {
            return Ok(missed);
        }
        job.attempts = attempts;
        job.failed_at = Some(at);
        job.last_error = Some(error.to_string());
        unlock(job);
        Ok(OutcomeWrite::Written)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.tables().jobs.get(&id).cloned())
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let tables = self.tables();
        let mut stats = JobStats::default();
        for job in tables.jobs.values() {
            match job.state() {
                JobState::Pending => stats.pending += 1,
                JobState::InFlight => stats.in_flight += 1,
                JobState::Processed => stats.processed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn list_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let tables = self.tables();
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|job| terminal_at(job).is_some_and(|at| at < cutoff))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (terminal_at(job), job.id));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn delete_terminal(&self, ids: &[JobId]) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        let mut deleted = 0;
        for id in ids {
            if tables.jobs.get(id).is_some_and(Job::is_terminal) {
                tables.jobs.remove(id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl EnvelopeStore for InMemoryStore {
    async fn get(&self, id: &EnvelopeId) -> Result<Option<Envelope>, StoreError> {
        Ok(self.tables().envelopes.get(id).cloned())
    }

    async fn apply(
        &self,
        id: &EnvelopeId,
        transition: &Transition,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut tables = self.tables();
        let stored = tables
            .envelopes
            .get_mut(id)
            .ok_or_else(|| StoreError::EnvelopeNotFound(id.clone()))?;
        if stored.status() != transition.from_status() {
            return Ok(TransitionOutcome::Rejected {
                current: stored.status(),
            });
        }
        let mut next = stored.clone();
        next.apply(transition)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        *stored = next.clone();
        Ok(TransitionOutcome::Applied(next))
    }

    async fn open_candidates(&self, contract_id: &str) -> Result<Vec<Envelope>, StoreError> {
        let tables = self.tables();
        let mut candidates: Vec<Envelope> = tables
            .envelopes
            .values()
            .filter(|env| match env.contract_id() {
                Some(bound) => bound == contract_id && !env.status().is_terminal(),
                None => env.status() == EnvelopeStatus::Pending,
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|env| env.created_at());
        Ok(candidates)
    }

    async fn create_envelopes(
        &self,
        envelopes: &[Envelope],
        jobs: Vec<NewJob>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let mut tables = self.tables();
        if let Some(dup) = envelopes
            .iter()
            .find(|env| tables.envelopes.contains_key(env.id()))
        {
            return Err(StoreError::Conflict(format!("envelope {}", dup.id())));
        }

        for env in envelopes {
            tables.envelopes.insert(env.id().clone(), env.clone());
        }
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            let job = job.into_job(now);
            ids.push(job.id);
            tables.jobs.insert(job.id, job);
        }
        Ok(ids)
    }
}
