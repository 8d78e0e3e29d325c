//! Envelope domain module.
//!
//! Business rules for escrow envelopes: the status state machine, preimage
//! commitments and gift planning. Pure, deterministic logic (no IO, no
//! storage, no ledger access).

pub mod commitment;
pub mod envelope;
pub mod gift;

pub use commitment::{Preimage, escrow_id};
pub use envelope::{Envelope, EnvelopeParts, EnvelopeStatus, NewEnvelope, Transition};
pub use gift::{GiftMode, GiftPlan, GiftRequest, PlannedEnvelope, Recipient};
