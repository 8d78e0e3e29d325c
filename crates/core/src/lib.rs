//! `escrowbox-core`: shared building blocks.
//!
//! Identifiers, amounts, the domain error model, the clock abstraction and
//! SHA-256 digests. No infrastructure concerns live here.

pub mod amount;
pub mod clock;
pub mod digest;
pub mod error;
pub mod id;

pub use amount::Amount;
pub use clock::{Clock, ManualClock, SystemClock};
pub use digest::Digest32;
pub use error::{DomainError, DomainResult};
pub use id::{EnvelopeId, JobId, WorkerId};
