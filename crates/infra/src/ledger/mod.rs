//! Ledger gateway: build, sign, submit and confirm escrow transactions.
//!
//! The ledger is an opaque capability. [`RpcLedgerClient`] talks JSON-RPC to a
//! gateway service; [`SimulatedLedger`] is a scriptable in-process stand-in.

pub mod assets;
pub mod rpc;
pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use escrowbox_core::{Amount, Digest32};

pub use assets::AssetRegistry;
pub use rpc::RpcLedgerClient;
pub use simulated::SimulatedLedger;

/// Arguments of the escrow contract's `create_escrow` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEscrowCall {
    /// Escrow contract to invoke.
    pub contract_id: String,
    /// SHA-256 of the envelope id.
    pub escrow_id: Digest32,
    /// Funding source address.
    pub sender: String,
    pub recipient_hash: Digest32,
    /// Token contract of the asset.
    pub token: String,
    pub amount: Amount,
    /// Unix seconds.
    pub expiry: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub xdr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub xdr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl core::fmt::Display for TxHash {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Confirmation status of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    Success,
    Failed { reason: Option<String> },
    /// Not (yet) visible on the ledger.
    NotFound,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger transport error: {0}")]
    Transport(String),
    #[error("ledger rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("ledger rejected submission: {0}")]
    Rejected(String),
    #[error("invalid ledger response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn build_transaction(
        &self,
        call: &CreateEscrowCall,
    ) -> Result<UnsignedTransaction, LedgerError>;

    async fn sign(
        &self,
        unsigned: &UnsignedTransaction,
        signer: &str,
    ) -> Result<SignedTransaction, LedgerError>;

    async fn submit(&self, signed: &SignedTransaction) -> Result<TxHash, LedgerError>;

    async fn transaction_status(&self, hash: &TxHash) -> Result<TransactionStatus, LedgerError>;
}
