//! Storage error shared by every store adapter.

use escrowbox_core::{EnvelopeId, JobId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("envelope not found: {0}")]
    EnvelopeNotFound(EnvelopeId),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("stored row is invalid: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}
