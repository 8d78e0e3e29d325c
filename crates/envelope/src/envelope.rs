//! Envelope entity and its status state machine.
//!
//! Status only moves forward:
//!
//! ```text
//! PENDING -> FUNDED -> OPENED
//!    |         |
//!    +---------+-----> CANCELED
//! ```
//!
//! Transitions are values ([`Transition`]) so that storage can apply them as a
//! compare-and-set on the expected source status.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use escrowbox_core::{Amount, Digest32, DomainError, DomainResult, EnvelopeId};

use crate::commitment::Preimage;

/// Cancel reason recorded when a funded envelope passes its expiry.
pub const EXPIRED_REASON: &str = "Escrow expired";

/// Lifecycle status of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeStatus {
    Pending,
    Funded,
    Opened,
    Canceled,
}

impl EnvelopeStatus {
    pub const ALL: [EnvelopeStatus; 4] = [
        EnvelopeStatus::Pending,
        EnvelopeStatus::Funded,
        EnvelopeStatus::Opened,
        EnvelopeStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeStatus::Pending => "PENDING",
            EnvelopeStatus::Funded => "FUNDED",
            EnvelopeStatus::Opened => "OPENED",
            EnvelopeStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvelopeStatus::Opened | EnvelopeStatus::Canceled)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: EnvelopeStatus) -> bool {
        use EnvelopeStatus::*;
        matches!(
            (self, next),
            (Pending, Funded) | (Pending, Canceled) | (Funded, Opened) | (Funded, Canceled)
        )
    }
}

impl core::fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown envelope status {s:?}")))
    }
}

/// A single forward step of the state machine, with the data it records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// `PENDING -> FUNDED`: the escrow exists on the ledger.
    Fund {
        contract_id: String,
        at: DateTime<Utc>,
    },
    /// `PENDING -> CANCELED`: funding failed definitively.
    CancelPending { reason: String, at: DateTime<Utc> },
    /// `FUNDED -> OPENED`: the recipient claimed the escrow.
    Open {
        claimed_by: Option<String>,
        at: DateTime<Utc>,
    },
    /// `FUNDED -> CANCELED`: refunded or expired.
    Refund { reason: String, at: DateTime<Utc> },
}

impl Transition {
    pub fn fund(contract_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::Fund {
            contract_id: contract_id.into(),
            at,
        }
    }

    pub fn cancel_pending(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::CancelPending {
            reason: reason.into(),
            at,
        }
    }

    pub fn open(claimed_by: Option<String>, at: DateTime<Utc>) -> Self {
        Self::Open { claimed_by, at }
    }

    pub fn refund(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::Refund {
            reason: reason.into(),
            at,
        }
    }

    /// Status the envelope must be in for this transition to apply.
    pub fn from_status(&self) -> EnvelopeStatus {
        match self {
            Transition::Fund { .. } | Transition::CancelPending { .. } => EnvelopeStatus::Pending,
            Transition::Open { .. } | Transition::Refund { .. } => EnvelopeStatus::Funded,
        }
    }

    /// Status the envelope ends up in.
    pub fn to_status(&self) -> EnvelopeStatus {
        match self {
            Transition::Fund { .. } => EnvelopeStatus::Funded,
            Transition::Open { .. } => EnvelopeStatus::Opened,
            Transition::CancelPending { .. } | Transition::Refund { .. } => {
                EnvelopeStatus::Canceled
            }
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Transition::Fund { at, .. }
            | Transition::CancelPending { at, .. }
            | Transition::Open { at, .. }
            | Transition::Refund { at, .. } => *at,
        }
    }
}

/// Input for issuing a new envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEnvelope {
    pub id: EnvelopeId,
    pub hash: Digest32,
    pub amount: Amount,
    pub asset: String,
    pub sender: String,
    pub recipient: Option<String>,
    pub expiry_ts: DateTime<Utc>,
    pub message: Option<String>,
}

/// Flat, fully public view of an envelope, used by storage adapters.
///
/// Converting back with [`Envelope::from_parts`] checks that the status agrees
/// with the lifecycle timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeParts {
    pub id: EnvelopeId,
    pub status: EnvelopeStatus,
    pub hash: Digest32,
    pub amount: Amount,
    pub asset: String,
    pub sender: String,
    pub recipient: Option<String>,
    pub expiry_ts: DateTime<Utc>,
    pub message: Option<String>,
    pub contract_id: Option<String>,
    pub funded_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Entity: an escrow envelope.
///
/// `amount`, `hash` and `sender` are fixed at issue time. Lifecycle fields are
/// written once, by the transition that causes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EnvelopeParts", into = "EnvelopeParts")]
pub struct Envelope {
    id: EnvelopeId,
    status: EnvelopeStatus,
    hash: Digest32,
    amount: Amount,
    asset: String,
    sender: String,
    recipient: Option<String>,
    expiry_ts: DateTime<Utc>,
    message: Option<String>,
    contract_id: Option<String>,
    funded_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    claimed_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl Envelope {
    /// Issue a fresh envelope in `PENDING`.
    pub fn issue(new: NewEnvelope, created_at: DateTime<Utc>) -> DomainResult<Self> {
        if new.amount.is_zero() {
            return Err(DomainError::validation("amount must be positive"));
        }
        if new.asset.trim().is_empty() {
            return Err(DomainError::validation("asset cannot be empty"));
        }
        if new.sender.trim().is_empty() {
            return Err(DomainError::validation("sender cannot be empty"));
        }
        if new.expiry_ts <= created_at {
            return Err(DomainError::validation("expiry must be in the future"));
        }

        Ok(Self {
            id: new.id,
            status: EnvelopeStatus::Pending,
            hash: new.hash,
            amount: new.amount,
            asset: new.asset,
            sender: new.sender,
            recipient: new.recipient,
            expiry_ts: new.expiry_ts,
            message: new.message,
            contract_id: None,
            funded_at: None,
            opened_at: None,
            canceled_at: None,
            cancel_reason: None,
            claimed_by: None,
            created_at,
        })
    }

    /// Rehydrate from storage.
    pub fn from_parts(parts: EnvelopeParts) -> DomainResult<Self> {
        let consistent = match parts.status {
            EnvelopeStatus::Pending => {
                parts.funded_at.is_none() && parts.opened_at.is_none() && parts.canceled_at.is_none()
            }
            EnvelopeStatus::Funded => {
                parts.funded_at.is_some() && parts.opened_at.is_none() && parts.canceled_at.is_none()
            }
            EnvelopeStatus::Opened => parts.opened_at.is_some() && parts.canceled_at.is_none(),
            EnvelopeStatus::Canceled => parts.canceled_at.is_some() && parts.opened_at.is_none(),
        };
        if !consistent {
            return Err(DomainError::invariant(format!(
                "envelope {} in {} has inconsistent lifecycle timestamps",
                parts.id, parts.status
            )));
        }

        Ok(Self {
            id: parts.id,
            status: parts.status,
            hash: parts.hash,
            amount: parts.amount,
            asset: parts.asset,
            sender: parts.sender,
            recipient: parts.recipient,
            expiry_ts: parts.expiry_ts,
            message: parts.message,
            contract_id: parts.contract_id,
            funded_at: parts.funded_at,
            opened_at: parts.opened_at,
            canceled_at: parts.canceled_at,
            cancel_reason: parts.cancel_reason,
            claimed_by: parts.claimed_by,
            created_at: parts.created_at,
        })
    }

    pub fn into_parts(self) -> EnvelopeParts {
        EnvelopeParts {
            id: self.id,
            status: self.status,
            hash: self.hash,
            amount: self.amount,
            asset: self.asset,
            sender: self.sender,
            recipient: self.recipient,
            expiry_ts: self.expiry_ts,
            message: self.message,
            contract_id: self.contract_id,
            funded_at: self.funded_at,
            opened_at: self.opened_at,
            canceled_at: self.canceled_at,
            cancel_reason: self.cancel_reason,
            claimed_by: self.claimed_by,
            created_at: self.created_at,
        }
    }

    /// Apply a transition, or reject it without touching any field.
    pub fn apply(&mut self, transition: &Transition) -> DomainResult<()> {
        if self.status != transition.from_status() {
            return Err(DomainError::invalid_transition(
                self.status.as_str(),
                transition.to_status().as_str(),
            ));
        }

        match transition {
            Transition::Fund { contract_id, at } => {
                self.contract_id = Some(contract_id.clone());
                self.funded_at = Some(*at);
            }
            Transition::CancelPending { reason, at } | Transition::Refund { reason, at } => {
                self.cancel_reason = Some(reason.clone());
                self.canceled_at = Some(*at);
            }
            Transition::Open { claimed_by, at } => {
                self.claimed_by = claimed_by.clone();
                self.opened_at = Some(*at);
            }
        }
        self.status = transition.to_status();
        Ok(())
    }

    /// Decide a direct claim: the revealed preimage must open `hash` before expiry.
    pub fn claim_with_preimage(
        &self,
        preimage: &Preimage,
        claimed_by: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        if self.status != EnvelopeStatus::Funded {
            return Err(DomainError::invalid_transition(
                self.status.as_str(),
                EnvelopeStatus::Opened.as_str(),
            ));
        }
        if now >= self.expiry_ts {
            return Err(DomainError::Expired);
        }
        if !preimage.opens(&self.hash) {
            return Err(DomainError::PreimageMismatch);
        }
        Ok(Transition::open(claimed_by, now))
    }

    /// Decide expiry of a funded envelope.
    pub fn expire(&self, now: DateTime<Utc>) -> DomainResult<Transition> {
        if self.status != EnvelopeStatus::Funded {
            return Err(DomainError::invalid_transition(
                self.status.as_str(),
                EnvelopeStatus::Canceled.as_str(),
            ));
        }
        if now < self.expiry_ts {
            return Err(DomainError::validation("envelope has not expired yet"));
        }
        Ok(Transition::refund(EXPIRED_REASON, now))
    }

    pub fn id(&self) -> &EnvelopeId {
        &self.id
    }

    pub fn status(&self) -> EnvelopeStatus {
        self.status
    }

    pub fn hash(&self) -> &Digest32 {
        &self.hash
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> Option<&str> {
        self.recipient.as_deref()
    }

    pub fn expiry_ts(&self) -> DateTime<Utc> {
        self.expiry_ts
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn contract_id(&self) -> Option<&str> {
        self.contract_id.as_deref()
    }

    pub fn funded_at(&self) -> Option<DateTime<Utc>> {
        self.funded_at
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    pub fn canceled_at(&self) -> Option<DateTime<Utc>> {
        self.canceled_at
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn claimed_by(&self) -> Option<&str> {
        self.claimed_by.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl TryFrom<EnvelopeParts> for Envelope {
    type Error = DomainError;

    fn try_from(value: EnvelopeParts) -> Result<Self, Self::Error> {
        Self::from_parts(value)
    }
}

impl From<Envelope> for EnvelopeParts {
    fn from(value: Envelope) -> Self {
        value.into_parts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn pending_with(preimage: &Preimage) -> Envelope {
        Envelope::issue(
            NewEnvelope {
                id: EnvelopeId::generate(),
                hash: preimage.commitment(),
                amount: Amount::new(1_000_000_000),
                asset: "USDC".to_string(),
                sender: "GSENDER".to_string(),
                recipient: Some("GRECIPIENT".to_string()),
                expiry_ts: t0() + Duration::days(7),
                message: Some("happy birthday".to_string()),
            },
            t0(),
        )
        .unwrap()
    }

    fn pending() -> Envelope {
        pending_with(&Preimage::generate())
    }

    #[test]
    fn issue_starts_pending_with_no_lifecycle_fields() {
        let env = pending();
        assert_eq!(env.status(), EnvelopeStatus::Pending);
        assert!(env.contract_id().is_none());
        assert!(env.funded_at().is_none());
        assert!(env.cancel_reason().is_none());
    }

    #[test]
    fn issue_rejects_zero_amount_and_past_expiry() {
        let base = NewEnvelope {
            id: EnvelopeId::generate(),
            hash: Preimage::generate().commitment(),
            amount: Amount::ZERO,
            asset: "XLM".to_string(),
            sender: "GSENDER".to_string(),
            recipient: None,
            expiry_ts: t0() + Duration::hours(1),
            message: None,
        };
        assert!(Envelope::issue(base.clone(), t0()).is_err());

        let expired = NewEnvelope {
            amount: Amount::new(1),
            expiry_ts: t0(),
            ..base
        };
        assert!(Envelope::issue(expired, t0()).is_err());
    }

    #[test]
    fn fund_then_open_records_fields_once() {
        let mut env = pending();
        env.apply(&Transition::fund("CCONTRACT", t0())).unwrap();
        assert_eq!(env.status(), EnvelopeStatus::Funded);
        assert_eq!(env.contract_id(), Some("CCONTRACT"));
        assert_eq!(env.funded_at(), Some(t0()));

        let later = t0() + Duration::hours(1);
        env.apply(&Transition::open(Some("GCLAIMER".into()), later))
            .unwrap();
        assert_eq!(env.status(), EnvelopeStatus::Opened);
        assert_eq!(env.opened_at(), Some(later));
        assert_eq!(env.claimed_by(), Some("GCLAIMER"));
    }

    #[test]
    fn rejected_transition_leaves_state_untouched() {
        let mut env = pending();
        let before = env.clone();
        let err = env
            .apply(&Transition::open(Some("GX".into()), t0()))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::invalid_transition("PENDING", "OPENED")
        );
        assert_eq!(env, before);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        let mut canceled = pending();
        canceled
            .apply(&Transition::cancel_pending("Escrow creation failed: boom", t0()))
            .unwrap();
        assert_eq!(canceled.status(), EnvelopeStatus::Canceled);
        assert!(canceled.apply(&Transition::fund("C", t0())).is_err());
        assert!(canceled.apply(&Transition::refund("again", t0())).is_err());
        assert_eq!(
            canceled.cancel_reason(),
            Some("Escrow creation failed: boom")
        );
    }

    #[test]
    fn claim_with_preimage_checks_hash_status_and_expiry() {
        let preimage = Preimage::generate();
        let mut env = pending_with(&preimage);

        assert!(env.claim_with_preimage(&preimage, None, t0()).is_err());

        env.apply(&Transition::fund("C", t0())).unwrap();
        assert_eq!(
            env.claim_with_preimage(&Preimage::generate(), None, t0()),
            Err(DomainError::PreimageMismatch)
        );
        assert_eq!(
            env.claim_with_preimage(&preimage, None, env.expiry_ts()),
            Err(DomainError::Expired)
        );

        let transition = env
            .claim_with_preimage(&preimage, Some("GCLAIMER".into()), t0())
            .unwrap();
        env.apply(&transition).unwrap();
        assert_eq!(env.status(), EnvelopeStatus::Opened);
    }

    #[test]
    fn expire_only_after_expiry() {
        let mut env = pending();
        env.apply(&Transition::fund("C", t0())).unwrap();

        assert!(env.expire(t0()).is_err());
        let transition = env.expire(env.expiry_ts()).unwrap();
        env.apply(&transition).unwrap();
        assert_eq!(env.status(), EnvelopeStatus::Canceled);
        assert_eq!(env.cancel_reason(), Some(EXPIRED_REASON));
    }

    #[test]
    fn parts_round_trip_and_consistency_check() {
        let mut env = pending();
        env.apply(&Transition::fund("C", t0())).unwrap();
        let parts = env.clone().into_parts();
        assert_eq!(Envelope::from_parts(parts.clone()).unwrap(), env);

        let broken = EnvelopeParts {
            funded_at: None,
            ..parts
        };
        assert!(matches!(
            Envelope::from_parts(broken),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn serde_uses_screaming_status_and_string_amount() {
        let env = pending();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["amount"], "1000000000");
        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn status_parses_from_storage_text() {
        for status in EnvelopeStatus::ALL {
            assert_eq!(status.as_str().parse::<EnvelopeStatus>().unwrap(), status);
        }
        assert!("EXPIRED".parse::<EnvelopeStatus>().is_err());
    }

    fn rank(status: EnvelopeStatus) -> u8 {
        match status {
            EnvelopeStatus::Pending => 0,
            EnvelopeStatus::Funded => 1,
            EnvelopeStatus::Opened | EnvelopeStatus::Canceled => 2,
        }
    }

    fn any_transition() -> impl Strategy<Value = Transition> {
        prop_oneof![
            Just(Transition::fund("C", t0())),
            Just(Transition::cancel_pending("failed", t0())),
            Just(Transition::open(None, t0())),
            Just(Transition::refund("refunded", t0())),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of transitions is attempted, status only
        /// moves forward and a terminal envelope never changes again.
        #[test]
        fn status_is_forward_only(steps in prop::collection::vec(any_transition(), 0..12)) {
            let mut env = pending();
            for step in steps {
                let before = env.clone();
                match env.apply(&step) {
                    Ok(()) => {
                        prop_assert!(before.status().can_transition_to(env.status()));
                        prop_assert!(rank(env.status()) > rank(before.status()));
                    }
                    Err(_) => prop_assert_eq!(&env, &before),
                }
                if before.status() != EnvelopeStatus::Pending {
                    prop_assert_ne!(env.status(), EnvelopeStatus::Pending);
                }
                if before.status().is_terminal() {
                    prop_assert_eq!(&env, &before);
                }
            }
        }
    }
}
