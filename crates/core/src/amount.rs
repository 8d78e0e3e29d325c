//! Token amounts in atomic units.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Non-negative amount in the asset's smallest unit.
///
/// Serialized as a decimal string so values above 2^53 survive JSON clients.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn new(atomic: u128) -> Self {
        Self(atomic)
    }

    pub fn atomic(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Even split into `parts` shares; the remainder stays with the caller.
    pub fn split(&self, parts: u32) -> Option<(Amount, Amount)> {
        if parts == 0 {
            return None;
        }
        let parts = u128::from(parts);
        Some((Amount(self.0 / parts), Amount(self.0 % parts)))
    }
}

impl core::fmt::Display for Amount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Amount {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::validation(format!(
                "amount must be a non-negative integer, got {s:?}"
            )));
        }
        s.parse::<u128>()
            .map(Self)
            .map_err(|e| DomainError::validation(format!("amount out of range: {e}")))
    }
}

impl TryFrom<String> for Amount {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Amount> for String {
    fn from(value: Amount) -> Self {
        value.0.to_string()
    }
}

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Self(value)
    }
}
