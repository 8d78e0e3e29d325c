//! In-process ledger with scriptable confirmation outcomes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use escrowbox_core::Digest32;

use super::{
    CreateEscrowCall, LedgerClient, LedgerError, SignedTransaction, TransactionStatus, TxHash,
    UnsignedTransaction,
};

#[derive(Debug, Default)]
struct SimState {
    builds: u64,
    /// Built or signed XDR -> the call it encodes.
    calls: HashMap<String, CreateEscrowCall>,
    submitted: Vec<CreateEscrowCall>,
    statuses: HashMap<TxHash, VecDeque<TransactionStatus>>,
    scripts: VecDeque<Vec<TransactionStatus>>,
    failing_submits: u32,
    status_checks: usize,
}

/// Ledger stand-in for tests and local runs.
///
/// Each submission confirms with `SUCCESS` unless a status script was queued
/// with [`SimulatedLedger::script_next`].
#[derive(Debug, Default)]
pub struct SimulatedLedger {
    state: Mutex<SimState>,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses returned by successive polls of the next submission. The last
    /// entry repeats once the script is exhausted.
    pub fn script_next(&self, statuses: Vec<TransactionStatus>) {
        self.state().scripts.push_back(statuses);
    }

    /// Make the next `count` submissions fail with a transport error.
    pub fn fail_next_submits(&self, count: u32) {
        self.state().failing_submits = count;
    }

    /// Calls that reached `submit`, in order.
    pub fn submitted(&self) -> Vec<CreateEscrowCall> {
        self.state().submitted.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state().submitted.len()
    }

    /// Calls to `transaction_status`, across all transactions.
    pub fn status_check_count(&self) -> usize {
        self.state().status_checks
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    async fn build_transaction(
        &self,
        call: &CreateEscrowCall,
    ) -> Result<UnsignedTransaction, LedgerError> {
        let mut state = self.state();
        state.builds += 1;
        let xdr = format!("sim-tx-{}", state.builds);
        state.calls.insert(xdr.clone(), call.clone());
        Ok(UnsignedTransaction { xdr })
    }

    async fn sign(
        &self,
        unsigned: &UnsignedTransaction,
        signer: &str,
    ) -> Result<SignedTransaction, LedgerError> {
        let mut state = self.state();
        let call = state
            .calls
            .get(&unsigned.xdr)
            .cloned()
            .ok_or_else(|| LedgerError::InvalidResponse(format!("unknown xdr {}", unsigned.xdr)))?;
        let xdr = format!("{}+{signer}", unsigned.xdr);
        state.calls.insert(xdr.clone(), call);
        Ok(SignedTransaction { xdr })
    }

    async fn submit(&self, signed: &SignedTransaction) -> Result<TxHash, LedgerError> {
        let mut state = self.state();
        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            return Err(LedgerError::Transport("simulated outage".to_string()));
        }
        let call = state
            .calls
            .get(&signed.xdr)
            .cloned()
            .ok_or_else(|| LedgerError::InvalidResponse(format!("unknown xdr {}", signed.xdr)))?;

        let hash = TxHash(Digest32::of(signed.xdr.as_bytes()).to_hex());
        let script = state
            .scripts
            .pop_front()
            .unwrap_or_else(|| vec![TransactionStatus::Success]);
        state.statuses.insert(hash.clone(), script.into());
        state.submitted.push(call);
        Ok(hash)
    }

    async fn transaction_status(&self, hash: &TxHash) -> Result<TransactionStatus, LedgerError> {
        let mut state = self.state();
        state.status_checks += 1;
        let Some(queue) = state.statuses.get_mut(hash) else {
            return Ok(TransactionStatus::NotFound);
        };
        let status = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(status.unwrap_or(TransactionStatus::NotFound))
    }
}
