//! Hash commitments binding an envelope to its secret and to its escrow.

use core::str::FromStr;

use escrowbox_core::{Digest32, DomainError, EnvelopeId};

/// Length of a preimage in bytes.
pub const PREIMAGE_LEN: usize = 32;

/// Secret whose SHA-256 is published as the envelope hash.
///
/// Revealing it proves authorization to claim. `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Preimage([u8; PREIMAGE_LEN]);

impl Preimage {
    /// Draw a fresh preimage from the thread RNG.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; PREIMAGE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PREIMAGE_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The public commitment: SHA-256 over the raw preimage bytes.
    pub fn commitment(&self) -> Digest32 {
        Digest32::of(self.0)
    }

    /// Whether this preimage opens `hash`.
    pub fn opens(&self, hash: &Digest32) -> bool {
        self.commitment() == *hash
    }
}

impl core::fmt::Debug for Preimage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Preimage(..)")
    }
}

impl FromStr for Preimage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; PREIMAGE_LEN];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| DomainError::validation(format!("preimage must be 64 hex chars: {e}")))?;
        Ok(Self(out))
    }
}

/// On-ledger escrow identifier for an envelope: SHA-256 of the id string.
///
/// Webhook events carry this value; matching recomputes it per envelope.
pub fn escrow_id(envelope_id: &EnvelopeId) -> Digest32 {
    Digest32::of(envelope_id.as_str().as_bytes())
}
