//! Typed dispatch from a claimed job to its handler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::types::{Job, JobKind};
use crate::handlers::{EscrowFundError, EscrowFundHandler, Notifier, NotifyError};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),
    #[error("invalid {job_type} payload: {source}")]
    InvalidPayload {
        job_type: String,
        source: serde_json::Error,
    },
    #[error(transparent)]
    EscrowFund(#[from] EscrowFundError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Runs the handler for one job.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Dispatcher for the job kinds this system knows.
pub struct HandlerRegistry {
    escrow_fund: Arc<EscrowFundHandler>,
    notifier: Arc<dyn Notifier>,
}

impl HandlerRegistry {
    pub fn new(escrow_fund: Arc<EscrowFundHandler>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            escrow_fund,
            notifier,
        }
    }
}

#[async_trait]
impl JobDispatcher for HandlerRegistry {
    async fn dispatch(&self, job: &Job) -> Result<(), HandlerError> {
        let kind = JobKind::decode(&job.job_type, &job.payload)?;
        debug!(job_id = %job.id, job_type = kind.job_type(), "dispatching job");

        match kind {
            JobKind::EscrowFund(payload) => self.escrow_fund.handle(&payload).await?,
            JobKind::EmailSend(payload) => self.notifier.send_email(&payload).await?,
            JobKind::PushSend(payload) => self.notifier.send_push(&payload).await?,
        }
        Ok(())
    }
}
