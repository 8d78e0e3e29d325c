//! Outbox worker loop.
//!
//! A tick releases stale locks, claims a batch, runs every claimed job as its
//! own task and records each outcome. A failing or panicking handler only
//! affects its own job.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use super::lock::{FailureDisposition, LockManager};
use super::registry::{HandlerError, JobDispatcher};
use super::store::OutcomeWrite;
use super::types::Job;
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Cumulative counters since the worker was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub ticks: u64,
    pub tick_errors: u64,
    pub released_locks: u64,
    pub claimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed_permanently: u64,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub released: u64,
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    /// Outcomes that could not be written, or were dropped because the job's
    /// lock had passed to another worker.
    pub unrecorded: usize,
}

enum Execution {
    Succeeded,
    Retried,
    Failed,
    Unrecorded,
}

pub struct OutboxWorker {
    locks: Arc<LockManager>,
    dispatcher: Arc<dyn JobDispatcher>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl OutboxWorker {
    pub fn new(
        locks: LockManager,
        dispatcher: Arc<dyn JobDispatcher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            locks: Arc::new(locks),
            dispatcher,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        read_stats(&self.stats)
    }

    /// Run one poll cycle.
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let released = self.locks.release_stale_locks().await?;
        let jobs = self.locks.claim_batch(self.config.batch_size).await?;

        let mut report = TickReport {
            released,
            claimed: jobs.len(),
            ..TickReport::default()
        };

        let mut tasks = JoinSet::new();
        for job in jobs {
            tasks.spawn(execute(
                Arc::clone(&self.locks),
                Arc::clone(&self.dispatcher),
                job,
            ));
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Execution::Succeeded) => report.succeeded += 1,
                Ok(Execution::Retried) => report.retried += 1,
                Ok(Execution::Failed) => report.failed += 1,
                Ok(Execution::Unrecorded) => report.unrecorded += 1,
                Err(join_err) => {
                    error!(error = %join_err, "job task did not complete");
                    report.unrecorded += 1;
                }
            }
        }

        self.record(&report);
        Ok(report)
    }

    fn record(&self, report: &TickReport) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.ticks += 1;
        stats.released_locks += report.released;
        stats.claimed += report.claimed as u64;
        stats.succeeded += report.succeeded as u64;
        stats.retried += report.retried as u64;
        stats.failed_permanently += report.failed as u64;
    }

    /// Tick on a fixed interval until the returned handle is shut down.
    pub fn spawn(self) -> WorkerHandle {
        let shutdown = Arc::new(Notify::new());
        let stats = Arc::clone(&self.stats);
        let signal = Arc::clone(&shutdown);
        let join = tokio::spawn(async move { self.run(signal).await });

        WorkerHandle {
            shutdown,
            join,
            stats,
        }
    }

    async fn run(self, shutdown: Arc<Notify>) {
        let period = self.config.poll_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            worker_id = %self.locks.worker_id(),
            batch_size = self.config.batch_size,
            poll_interval_ms = period.as_millis() as u64,
            "outbox worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(worker_id = %self.locks.worker_id(), error = %err, "outbox tick failed");
                        self.stats
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .tick_errors += 1;
                    }
                }
            }
        }

        info!(worker_id = %self.locks.worker_id(), "outbox worker stopped");
    }
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop after the current tick, wait for the loop to exit and return the
    /// final counters.
    pub async fn shutdown(self) -> WorkerStats {
        self.shutdown.notify_one();
        if let Err(err) = self.join.await {
            error!(error = %err, "outbox worker task ended abnormally");
        }
        read_stats(&self.stats)
    }

    pub fn stats(&self) -> WorkerStats {
        read_stats(&self.stats)
    }
}

fn read_stats(stats: &Mutex<WorkerStats>) -> WorkerStats {
    stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

async fn execute(locks: Arc<LockManager>, dispatcher: Arc<dyn JobDispatcher>, job: Job) -> Execution {
    let job_id = job.id;
    let job_type = job.job_type.clone();
    let attempts = job.attempts + 1;

    // Inner task so a panic surfaces as a JoinError instead of unwinding here.
    let handler = tokio::spawn(async move { dispatcher.dispatch(&job).await });
    let result = match handler.await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            Err(HandlerError::Panicked(panic_message(join_err.into_panic())))
        }
        Err(join_err) => Err(HandlerError::Panicked(join_err.to_string())),
    };

    match result {
        Ok(()) => match locks.mark_processed(job_id, attempts).await {
            Ok(OutcomeWrite::Written | OutcomeWrite::AlreadyTerminal) => {
                info!(job_id = %job_id, job_type = %job_type, attempts, "job processed");
                Execution::Succeeded
            }
            Ok(OutcomeWrite::LockLost) => Execution::Unrecorded,
            Err(err) => {
                error!(job_id = %job_id, error = %err, "failed to record job success");
                Execution::Unrecorded
            }
        },
        Err(handler_err) => {
            let message = handler_err.to_string();
            warn!(job_id = %job_id, job_type = %job_type, attempts, error = %message, "job failed");
            match locks.mark_failed(job_id, attempts, &message).await {
                Ok(FailureDisposition::Retrying { .. }) => Execution::Retried,
                Ok(FailureDisposition::Failed) => Execution::Failed,
                Ok(FailureDisposition::AlreadyTerminal | FailureDisposition::LockLost) => {
                    Execution::Unrecorded
                }
                Err(err) => {
                    error!(job_id = %job_id, error = %err, "failed to record job failure");
                    Execution::Unrecorded
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
