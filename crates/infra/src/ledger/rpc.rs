//! JSON-RPC 2.0 client for the ledger gateway.
//!
//! Methods: `buildCreateEscrow`, `signTransaction`, `sendTransaction`,
//! `getTransaction`. Every HTTP or decoding failure maps to a [`LedgerError`];
//! none of them is treated as a definitive ledger outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{
    CreateEscrowCall, LedgerClient, LedgerError, SignedTransaction, TransactionStatus, TxHash,
    UnsignedTransaction,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct RpcRequest<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct SignParams<'a> {
    xdr: &'a str,
    signer: &'a str,
}

#[derive(Debug, Serialize)]
struct XdrParams<'a> {
    xdr: &'a str,
}

#[derive(Debug, Serialize)]
struct HashParams<'a> {
    hash: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResult {
    hash: String,
    status: String,
    #[serde(default, rename = "errorResult")]
    error_result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetTransactionResult {
    status: String,
    #[serde(default, rename = "resultXdr")]
    result_xdr: Option<String>,
}

#[derive(Debug)]
pub struct RpcLedgerClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcLedgerClient {
    pub fn new(url: impl Into<String>) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        Ok(Self::with_client(http, url))
    }

    pub fn with_client(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call<P, R>(&self, method: &str, params: P) -> Result<R, LedgerError>
    where
        P: Serialize + Send,
        R: DeserializeOwned + Send,
    {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!(method, id = request.id, "ledger rpc call");

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(format!("{method}: {e}")))?
            .error_for_status()
            .map_err(|e| LedgerError::Transport(format!("{method}: {e}")))?;

        let body: RpcResponse<R> = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(format!("{method}: {e}")))?;
        unwrap_response(method, body)
    }
}

fn unwrap_response<R>(method: &str, body: RpcResponse<R>) -> Result<R, LedgerError> {
    if let Some(error) = body.error {
        return Err(LedgerError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    body.result
        .ok_or_else(|| LedgerError::InvalidResponse(format!("{method}: missing result")))
}

fn parse_send(result: SendResult) -> Result<TxHash, LedgerError> {
    match result.status.as_str() {
        "PENDING" | "DUPLICATE" => Ok(TxHash(result.hash)),
        "ERROR" | "TRY_AGAIN_LATER" => Err(LedgerError::Rejected(format!(
            "{} ({})",
            result.status,
            result.error_result.unwrap_or_else(|| "no detail".to_string())
        ))),
        other => Err(LedgerError::InvalidResponse(format!(
            "sendTransaction: unexpected status {other:?}"
        ))),
    }
}

fn parse_status(result: GetTransactionResult) -> Result<TransactionStatus, LedgerError> {
    match result.status.as_str() {
        "SUCCESS" => Ok(TransactionStatus::Success),
        "FAILED" => Ok(TransactionStatus::Failed {
            reason: result.result_xdr,
        }),
        "NOT_FOUND" => Ok(TransactionStatus::NotFound),
        other => Err(LedgerError::InvalidResponse(format!(
            "getTransaction: unexpected status {other:?}"
        ))),
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    #[instrument(skip(self, call), fields(contract_id = %call.contract_id), err)]
    async fn build_transaction(
        &self,
        call: &CreateEscrowCall,
    ) -> Result<UnsignedTransaction, LedgerError> {
        self.call("buildCreateEscrow", call).await
    }

    #[instrument(skip(self, unsigned), err)]
    async fn sign(
        &self,
        unsigned: &UnsignedTransaction,
        signer: &str,
    ) -> Result<SignedTransaction, LedgerError> {
        self.call(
            "signTransaction",
            SignParams {
                xdr: &unsigned.xdr,
                signer,
            },
        )
        .await
    }

    #[instrument(skip(self, signed), err)]
    async fn submit(&self, signed: &SignedTransaction) -> Result<TxHash, LedgerError> {
        let result: SendResult = self
            .call("sendTransaction", XdrParams { xdr: &signed.xdr })
            .await?;
        parse_send(result)
    }

    #[instrument(skip(self), fields(tx_hash = %hash), err)]
    async fn transaction_status(&self, hash: &TxHash) -> Result<TransactionStatus, LedgerError> {
        let result: GetTransactionResult = self
            .call("getTransaction", HashParams { hash: &hash.0 })
            .await?;
        parse_status(result)
    }
}
