//! Asset code to token contract mapping.

use std::collections::BTreeMap;

/// Testnet token contracts used when nothing else is configured.
pub const TESTNET_XLM: &str = "CDLZFC3SYJYDZT7K67VZ75HPJVIEUVNIXF47ZG2FB2RMQQVU2HHGCYSC";
pub const TESTNET_USDC: &str = "CCW67TSZV3SSS2HXMBQ5JFGCKJNXKZM7UQUWUZPUTHXSTZLEO7SJMI75";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetRegistry {
    contracts: BTreeMap<String, String>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn testnet() -> Self {
        Self::new()
            .with("XLM", TESTNET_XLM)
            .with("USDC", TESTNET_USDC)
    }

    pub fn with(mut self, code: impl Into<String>, contract: impl Into<String>) -> Self {
        self.contracts.insert(code.into(), contract.into());
        self
    }

    /// Token contract for an asset code. Codes are matched exactly.
    pub fn contract_for(&self, code: &str) -> Option<&str> {
        self.contracts.get(code).map(String::as_str)
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.contracts.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}
