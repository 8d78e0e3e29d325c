//! Envelope persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use escrowbox_core::{EnvelopeId, JobId};
use escrowbox_envelope::{Envelope, EnvelopeStatus, Transition};

use crate::error::StoreError;
use crate::jobs::NewJob;

/// Result of a compare-and-set transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied(Envelope),
    /// The stored status was not the transition's source status.
    Rejected { current: EnvelopeStatus },
}

#[async_trait]
pub trait EnvelopeStore: Send + Sync {
    async fn get(&self, id: &EnvelopeId) -> Result<Option<Envelope>, StoreError>;

    /// Apply `transition` only if the stored status equals its source status.
    ///
    /// Errors with [`StoreError::EnvelopeNotFound`] for unknown ids.
    async fn apply(
        &self,
        id: &EnvelopeId,
        transition: &Transition,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Envelopes an event for `contract_id` may refer to: non-terminal
    /// envelopes bound to that contract plus `PENDING` envelopes not bound yet.
    async fn open_candidates(&self, contract_id: &str) -> Result<Vec<Envelope>, StoreError>;

    /// Insert envelopes and the jobs serving them in one atomic write.
    async fn create_envelopes(
        &self,
        envelopes: &[Envelope],
        jobs: Vec<NewJob>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError>;
}
