//! Gift planning: turn a gift request into envelopes ready to persist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use escrowbox_core::{Amount, DomainError, DomainResult, EnvelopeId};

use crate::commitment::Preimage;
use crate::envelope::{Envelope, NewEnvelope};

pub const MAX_RECIPIENTS: usize = 100;
pub const MAX_MESSAGE_LEN: usize = 280;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GiftMode {
    /// One envelope for exactly one recipient.
    Single,
    /// One envelope per recipient, the amount split evenly.
    Multi,
}

/// Who an envelope is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// Not yet on the ledger; receives an invite with the preimage.
    Email(String),
    /// A ledger address.
    Address(String),
}

impl Recipient {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DomainError::validation("recipient cannot be empty"));
        }
        if raw.contains('@') {
            Ok(Self::Email(raw.to_string()))
        } else {
            Ok(Self::Address(raw.to_string()))
        }
    }

    pub fn address(&self) -> Option<&str> {
        match self {
            Recipient::Address(address) => Some(address),
            Recipient::Email(_) => None,
        }
    }

    pub fn email(&self) -> Option<&str> {
        match self {
            Recipient::Email(email) => Some(email),
            Recipient::Address(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiftRequest {
    pub mode: GiftMode,
    pub sender_wallet_id: String,
    pub recipients: Vec<String>,
    pub amount_atomic: Amount,
    pub asset_code: String,
    pub expiry_ts: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
}

/// An issued envelope together with its secret and parsed recipient.
#[derive(Debug, Clone)]
pub struct PlannedEnvelope {
    pub envelope: Envelope,
    pub preimage: Preimage,
    pub recipient: Recipient,
}

#[derive(Debug, Clone)]
pub struct GiftPlan {
    pub mode: GiftMode,
    pub per_recipient: Amount,
    pub envelopes: Vec<PlannedEnvelope>,
}

impl GiftPlan {
    /// Validate the request and issue one `PENDING` envelope per recipient.
    ///
    /// In MULTI mode each envelope gets `floor(total / n)`; the remainder is
    /// never escrowed.
    pub fn build(
        request: &GiftRequest,
        sender_address: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let count = request.recipients.len();
        if count == 0 || count > MAX_RECIPIENTS {
            return Err(DomainError::validation(format!(
                "recipients must contain 1..={MAX_RECIPIENTS} entries, got {count}"
            )));
        }
        match request.mode {
            GiftMode::Single if count != 1 => {
                return Err(DomainError::validation(
                    "SINGLE mode requires exactly one recipient",
                ));
            }
            GiftMode::Multi if count < 2 => {
                return Err(DomainError::validation(
                    "MULTI mode requires at least 2 recipients",
                ));
            }
            _ => {}
        }
        if let Some(message) = &request.message {
            if message.chars().count() > MAX_MESSAGE_LEN {
                return Err(DomainError::validation(format!(
                    "message longer than {MAX_MESSAGE_LEN} characters"
                )));
            }
        }

        let recipients = request
            .recipients
            .iter()
            .map(|raw| Recipient::parse(raw))
            .collect::<DomainResult<Vec<_>>>()?;

        // count <= MAX_RECIPIENTS, so the conversion cannot fail
        let parts = u32::try_from(count)
            .map_err(|_| DomainError::validation("too many recipients"))?;
        let (per_recipient, _remainder) = request
            .amount_atomic
            .split(parts)
            .ok_or_else(|| DomainError::validation("no recipients"))?;
        if per_recipient.is_zero() {
            return Err(DomainError::validation(format!(
                "amount {} is too small to split across {count} recipients",
                request.amount_atomic
            )));
        }

        let envelopes = recipients
            .into_iter()
            .map(|recipient| {
                let preimage = Preimage::generate();
                let envelope = Envelope::issue(
                    NewEnvelope {
                        id: EnvelopeId::generate(),
                        hash: preimage.commitment(),
                        amount: per_recipient,
                        asset: request.asset_code.clone(),
                        sender: sender_address.to_string(),
                        recipient: recipient.address().map(str::to_string),
                        expiry_ts: request.expiry_ts,
                        message: request.message.clone(),
                    },
                    now,
                )?;
                Ok(PlannedEnvelope {
                    envelope,
                    preimage,
                    recipient,
                })
            })
            .collect::<DomainResult<Vec<_>>>()?;

        Ok(Self {
            mode: request.mode,
            per_recipient,
            envelopes,
        })
    }

    pub fn envelope_ids(&self) -> Vec<EnvelopeId> {
        self.envelopes
            .iter()
            .map(|planned| planned.envelope.id().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeStatus;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn request(mode: GiftMode, recipients: &[&str], amount: u128) -> GiftRequest {
        GiftRequest {
            mode,
            sender_wallet_id: "wallet-1".to_string(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            amount_atomic: Amount::new(amount),
            asset_code: "USDC".to_string(),
            expiry_ts: now() + Duration::days(3),
            message: None,
        }
    }

    #[test]
    fn single_issues_one_pending_envelope() {
        let plan = GiftPlan::build(&request(GiftMode::Single, &["GABC"], 500), "GSENDER", now())
            .unwrap();
        assert_eq!(plan.envelopes.len(), 1);
        let planned = &plan.envelopes[0];
        assert_eq!(planned.envelope.status(), EnvelopeStatus::Pending);
        assert_eq!(planned.envelope.amount(), Amount::new(500));
        assert_eq!(planned.envelope.recipient(), Some("GABC"));
        assert_eq!(planned.envelope.sender(), "GSENDER");
        assert!(planned.preimage.opens(planned.envelope.hash()));
    }

    #[test]
    fn single_rejects_multiple_recipients() {
        let err = GiftPlan::build(
            &request(GiftMode::Single, &["GA", "GB"], 500),
            "GSENDER",
            now(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("exactly one recipient"));
    }

    #[test]
    fn multi_splits_evenly_and_drops_remainder() {
        let plan = GiftPlan::build(
            &request(GiftMode::Multi, &["GA", "friend@example.com", "GC"], 100),
            "GSENDER",
            now(),
        )
        .unwrap();
        assert_eq!(plan.per_recipient, Amount::new(33));
        assert_eq!(plan.envelopes.len(), 3);
        assert!(
            plan.envelopes
                .iter()
                .all(|p| p.envelope.amount() == Amount::new(33))
        );

        let email = &plan.envelopes[1];
        assert_eq!(email.recipient.email(), Some("friend@example.com"));
        assert_eq!(email.envelope.recipient(), None);

        let ids = plan.envelope_ids();
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn multi_requires_two_recipients_and_a_splittable_amount() {
        assert!(GiftPlan::build(&request(GiftMode::Multi, &["GA"], 100), "GS", now()).is_err());
        assert!(
            GiftPlan::build(&request(GiftMode::Multi, &["GA", "GB", "GC"], 2), "GS", now())
                .is_err()
        );
    }

    #[test]
    fn rejects_long_messages() {
        let mut req = request(GiftMode::Single, &["GA"], 10);
        req.message = Some("x".repeat(MAX_MESSAGE_LEN + 1));
        assert!(GiftPlan::build(&req, "GS", now()).is_err());
    }

    #[test]
    fn request_deserializes_from_camel_case() {
        let req: GiftRequest = serde_json::from_value(serde_json::json!({
            "mode": "MULTI",
            "senderWalletId": "w1",
            "recipients": ["GA", "GB"],
            "amountAtomic": "1000",
            "assetCode": "XLM",
            "expiryTs": "2024-06-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(req.mode, GiftMode::Multi);
        assert_eq!(req.amount_atomic, Amount::new(1000));
        assert!(req.message.is_none());
    }
}
