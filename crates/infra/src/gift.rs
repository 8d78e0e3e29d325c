//! Gift issuing: envelopes plus the jobs that fund and announce them, written
//! in one atomic store call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;

use escrowbox_core::{Amount, Clock, DomainError, EnvelopeId, JobId};
use escrowbox_envelope::{GiftMode, GiftPlan, GiftRequest, PlannedEnvelope, Preimage, Recipient};

use crate::envelopes::EnvelopeStore;
use crate::error::StoreError;
use crate::jobs::{EmailSendPayload, EscrowFundPayload, JobKind, NewJob};
use crate::wallets::WalletDirectory;

/// Email template used for invites.
pub const INVITE_TEMPLATE: &str = "invite";

#[derive(Debug, thiserror::Error)]
pub enum GiftError {
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),
    #[error("failed to encode job payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One issued envelope and the secret that opens it.
#[derive(Debug, Clone)]
pub struct IssuedEnvelope {
    pub id: EnvelopeId,
    pub recipient: Recipient,
    pub preimage: Preimage,
}

#[derive(Debug, Clone)]
pub struct GiftReceipt {
    pub mode: GiftMode,
    pub envelopes: Vec<IssuedEnvelope>,
    pub total_amount: Amount,
    pub per_recipient: Amount,
    pub expiry_ts: DateTime<Utc>,
    pub job_ids: Vec<JobId>,
}

pub struct GiftService {
    envelopes: Arc<dyn EnvelopeStore>,
    wallets: Arc<dyn WalletDirectory>,
    clock: Arc<dyn Clock>,
}

impl GiftService {
    pub fn new(
        envelopes: Arc<dyn EnvelopeStore>,
        wallets: Arc<dyn WalletDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            envelopes,
            wallets,
            clock,
        }
    }

    pub async fn create(&self, request: &GiftRequest) -> Result<GiftReceipt, GiftError> {
        let sender = self
            .wallets
            .public_key(&request.sender_wallet_id)
            .await?
            .ok_or_else(|| GiftError::WalletNotFound(request.sender_wallet_id.clone()))?;

        let now = self.clock.now();
        let plan = GiftPlan::build(request, &sender, now)?;

        let mut jobs = Vec::new();
        for planned in &plan.envelopes {
            if let Recipient::Email(to) = &planned.recipient {
                jobs.push(NewJob::from_kind(&JobKind::EmailSend(invite(
                    to, planned, request,
                )))?);
            }
            jobs.push(NewJob::from_kind(&JobKind::EscrowFund(EscrowFundPayload {
                envelope_id: planned.envelope.id().clone(),
                sender_wallet_id: request.sender_wallet_id.clone(),
                recipient_hash: *planned.envelope.hash(),
                amount_atomic: planned.envelope.amount(),
                asset_code: request.asset_code.clone(),
                expiry_ts: request.expiry_ts.timestamp_millis(),
            }))?);
        }

        let envelopes: Vec<_> = plan.envelopes.iter().map(|p| p.envelope.clone()).collect();
        let job_ids = self.envelopes.create_envelopes(&envelopes, jobs, now).await?;

        info!(
            mode = ?plan.mode,
            envelopes = envelopes.len(),
            jobs = job_ids.len(),
            asset = %request.asset_code,
            "gift created"
        );

        Ok(GiftReceipt {
            mode: plan.mode,
            envelopes: plan
                .envelopes
                .into_iter()
                .map(|p| IssuedEnvelope {
                    id: p.envelope.id().clone(),
                    recipient: p.recipient,
                    preimage: p.preimage,
                })
                .collect(),
            total_amount: request.amount_atomic,
            per_recipient: plan.per_recipient,
            expiry_ts: request.expiry_ts,
            job_ids,
        })
    }
}

fn invite(to: &str, planned: &PlannedEnvelope, request: &GiftRequest) -> EmailSendPayload {
    EmailSendPayload {
        template: INVITE_TEMPLATE.to_string(),
        to: to.to_string(),
        data: json!({
            "envelopeId": planned.envelope.id(),
            "preimage": planned.preimage.to_hex(),
            "amount": planned.envelope.amount(),
            "assetCode": request.asset_code,
            "message": request.message,
            "expiryTs": request.expiry_ts.timestamp_millis(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{EMAIL_SEND, ESCROW_FUND};
    use crate::memory::InMemoryStore;
    use crate::wallets::StaticWallets;
    use chrono::{Duration, TimeZone};
    use escrowbox_core::ManualClock;
    use escrowbox_envelope::EnvelopeStatus;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn service(store: Arc<InMemoryStore>) -> GiftService {
        GiftService::new(
            store,
            Arc::new(StaticWallets::new().with("wallet-1", "GSENDER")),
            Arc::new(ManualClock::new(t0())),
        )
    }

    fn request(mode: GiftMode, recipients: &[&str]) -> GiftRequest {
        GiftRequest {
            mode,
            sender_wallet_id: "wallet-1".into(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            amount_atomic: Amount::new(1_000),
            asset_code: "USDC".into(),
            expiry_ts: t0() + Duration::days(2),
            message: Some("enjoy".into()),
        }
    }

    #[tokio::test]
    async fn multi_gift_writes_envelopes_and_jobs_together() {
        let store = Arc::new(InMemoryStore::new());
        let receipt = service(store.clone())
            .create(&request(GiftMode::Multi, &["GA", "friend@example.com"]))
            .await
            .unwrap();

        assert_eq!(receipt.envelopes.len(), 2);
        assert_eq!(receipt.per_recipient, Amount::new(500));
        assert_eq!(receipt.job_ids.len(), 3);

        for issued in &receipt.envelopes {
            let stored = EnvelopeStore::get(store.as_ref(), &issued.id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.status(), EnvelopeStatus::Pending);
            assert_eq!(stored.sender(), "GSENDER");
            assert!(issued.preimage.opens(stored.hash()));
        }

        let jobs = store.jobs();
        let fund_jobs: Vec<_> = jobs.iter().filter(|j| j.job_type == ESCROW_FUND).collect();
        let email_jobs: Vec<_> = jobs.iter().filter(|j| j.job_type == EMAIL_SEND).collect();
        assert_eq!(fund_jobs.len(), 2);
        assert_eq!(email_jobs.len(), 1);

        let invite = &email_jobs[0].payload;
        assert_eq!(invite["to"], "friend@example.com");
        assert_eq!(invite["template"], INVITE_TEMPLATE);
        assert_eq!(
            invite["data"]["preimage"],
            receipt.envelopes[1].preimage.to_hex()
        );
        assert_eq!(fund_jobs[0].payload["amountAtomic"], "500");
    }

    #[tokio::test]
    async fn unknown_sender_wallet_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let mut req = request(GiftMode::Single, &["GA"]);
        req.sender_wallet_id = "nope".into();

        let err = service(store.clone()).create(&req).await.unwrap_err();
        assert!(matches!(err, GiftError::WalletNotFound(_)));
        assert!(store.jobs().is_empty());
    }

    #[tokio::test]
    async fn invalid_request_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let err = service(store.clone())
            .create(&request(GiftMode::Single, &["GA", "GB"]))
            .await
            .unwrap_err();
        assert!(matches!(err, GiftError::Invalid(_)));
        assert!(store.jobs().is_empty());
    }
}
