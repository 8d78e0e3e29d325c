//! Applies authenticated ledger events to envelopes.
//!
//! Events identify an escrow by `sha256(envelope_id)`, so matching recomputes
//! that digest for each candidate envelope. Redundant and out-of-order events
//! are acknowledged without changes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use escrowbox_core::Digest32;
use escrowbox_envelope::{Envelope, EnvelopeStatus, Transition, escrow_id};

use crate::envelopes::{EnvelopeStore, TransitionOutcome};
use crate::error::StoreError;

/// Cancel reason recorded for `escrow_refunded`.
pub const REFUNDED_REASON: &str = "Escrow refunded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventType {
    EscrowCreated,
    EscrowClaimed,
    EscrowRefunded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEventData {
    /// Hex digest; compared case-insensitively.
    pub escrow_id: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
}

/// Webhook body, already authenticated by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEvent {
    pub contract_id: String,
    pub event_type: LedgerEventType,
    /// Unix seconds.
    pub ledger_timestamp: i64,
    pub ledger_sequence: u64,
    pub tx_hash: String,
    pub data: LedgerEventData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No envelope carries this escrow id, or the event came from another
    /// contract.
    Unmatched,
    Applied(EnvelopeStatus),
    /// Matched, but the event does not apply to the current status.
    Ignored { current: EnvelopeStatus },
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("ledger timestamp out of range: {0}")]
    InvalidTimestamp(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct WebhookReconciler {
    envelopes: Arc<dyn EnvelopeStore>,
    contract_id: String,
}

impl WebhookReconciler {
    /// Events are only applied when they come from `contract_id`, the escrow
    /// contract the funding handler submits to.
    pub fn new(envelopes: Arc<dyn EnvelopeStore>, contract_id: impl Into<String>) -> Self {
        Self {
            envelopes,
            contract_id: contract_id.into(),
        }
    }

    #[instrument(
        skip(self, event),
        fields(
            contract_id = %event.contract_id,
            event_type = ?event.event_type,
            tx_hash = %event.tx_hash,
            ledger_sequence = event.ledger_sequence
        ),
        err
    )]
    pub async fn reconcile(&self, event: &LedgerEvent) -> Result<ReconcileOutcome, ReconcileError> {
        if event.contract_id != self.contract_id {
            warn!(expected = %self.contract_id, "event from a foreign contract; ignoring");
            return Ok(ReconcileOutcome::Unmatched);
        }

        let Ok(target) = event.data.escrow_id.parse::<Digest32>() else {
            warn!(escrow_id = %event.data.escrow_id, "malformed escrow id; ignoring event");
            return Ok(ReconcileOutcome::Unmatched);
        };

        let candidates = self.envelopes.open_candidates(&event.contract_id).await?;
        let Some(envelope) = find_by_escrow_id(&candidates, &target) else {
            debug!(candidates = candidates.len(), "no envelope for escrow id");
            return Ok(ReconcileOutcome::Unmatched);
        };

        let at = DateTime::<Utc>::from_timestamp(event.ledger_timestamp, 0)
            .ok_or(ReconcileError::InvalidTimestamp(event.ledger_timestamp))?;
        let transition = match event.event_type {
            LedgerEventType::EscrowCreated => Transition::fund(event.contract_id.clone(), at),
            LedgerEventType::EscrowClaimed => Transition::open(event.data.address.clone(), at),
            LedgerEventType::EscrowRefunded => Transition::refund(REFUNDED_REASON, at),
        };

        if envelope.status() != transition.from_status() {
            debug!(
                envelope_id = %envelope.id(),
                current = %envelope.status(),
                "event does not apply to current status"
            );
            return Ok(ReconcileOutcome::Ignored {
                current: envelope.status(),
            });
        }

        match self.envelopes.apply(envelope.id(), &transition).await? {
            TransitionOutcome::Applied(updated) => {
                info!(
                    envelope_id = %updated.id(),
                    status = %updated.status(),
                    "envelope updated from ledger event"
                );
                Ok(ReconcileOutcome::Applied(updated.status()))
            }
            TransitionOutcome::Rejected { current } => Ok(ReconcileOutcome::Ignored { current }),
        }
    }
}

/// Linear scan; the candidate set is bounded by the envelopes still open on
/// one contract.
fn find_by_escrow_id<'a>(candidates: &'a [Envelope], target: &Digest32) -> Option<&'a Envelope> {
    candidates
        .iter()
        .find(|envelope| escrow_id(envelope.id()) == *target)
}
