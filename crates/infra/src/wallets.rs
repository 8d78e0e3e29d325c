//! Wallet lookup: wallet id to public ledger address.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;

#[async_trait]
pub trait WalletDirectory: Send + Sync {
    async fn public_key(&self, wallet_id: &str) -> Result<Option<String>, StoreError>;
}

/// Fixed wallet table, for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct StaticWallets {
    keys: HashMap<String, String>,
}

impl StaticWallets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, wallet_id: impl Into<String>, public_key: impl Into<String>) -> Self {
        self.keys.insert(wallet_id.into(), public_key.into());
        self
    }
}

#[async_trait]
impl WalletDirectory for StaticWallets {
    async fn public_key(&self, wallet_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.keys.get(wallet_id).cloned())
    }
}
