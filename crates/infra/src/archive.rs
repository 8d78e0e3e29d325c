//! Outbox archiving: export old terminal jobs as JSON lines, then delete them.
//!
//! Run explicitly (operator command or scheduled task); the worker never
//! deletes jobs.

use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use escrowbox_core::{Clock, JobId};

use crate::error::StoreError;
use crate::jobs::JobStore;

pub const DEFAULT_RETENTION_DAYS: i64 = 30;
const DEFAULT_BATCH: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("archive write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub exported: usize,
    pub deleted: u64,
}

pub struct OutboxArchiver {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    retention: chrono::Duration,
    batch_size: usize,
}

impl OutboxArchiver {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retention: chrono::Duration::days(DEFAULT_RETENTION_DAYS),
            batch_size: DEFAULT_BATCH,
        }
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn cutoff(&self) -> DateTime<Utc> {
        self.clock.now() - self.retention
    }

    /// Write every terminal job older than the retention window to `out`, one
    /// JSON object per line, deleting each batch only after it is written.
    pub async fn archive_to<W: Write + Send>(&self, out: &mut W) -> Result<ArchiveReport, ArchiveError> {
        let cutoff = self.cutoff();
        let mut report = ArchiveReport::default();

        loop {
            let batch = self
                .store
                .list_terminal_before(cutoff, self.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            for job in &batch {
                serde_json::to_writer(&mut *out, job)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;

            let ids: Vec<JobId> = batch.iter().map(|job| job.id).collect();
            report.exported += batch.len();
            report.deleted += self.store.delete_terminal(&ids).await?;

            if batch.len() < self.batch_size {
                break;
            }
        }

        info!(
            exported = report.exported,
            deleted = report.deleted,
            %cutoff,
            "outbox archived"
        );
        Ok(report)
    }
}
