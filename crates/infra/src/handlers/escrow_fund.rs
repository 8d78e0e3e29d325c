//! `ESCROW_FUND`: create the on-ledger escrow for a `PENDING` envelope.
//!
//! Steps: load the envelope (retry guard), resolve sender and token, build,
//! sign and submit `create_escrow`, poll for confirmation, then move the
//! envelope to `FUNDED`. Definitive failures cancel the envelope; transient
//! ones leave it `PENDING` for the next attempt.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use escrowbox_core::{Clock, EnvelopeId};
use escrowbox_envelope::{EnvelopeStatus, Transition, escrow_id};

use crate::envelopes::{EnvelopeStore, TransitionOutcome};
use crate::error::StoreError;
use crate::jobs::EscrowFundPayload;
use crate::ledger::{
    AssetRegistry, CreateEscrowCall, LedgerClient, LedgerError, TransactionStatus, TxHash,
};
use crate::wallets::WalletDirectory;

/// Prefix of the cancel reason written on definitive failure.
pub const CANCEL_REASON_PREFIX: &str = "Escrow creation failed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowFundSettings {
    /// Escrow contract the envelope is bound to once funded.
    pub contract_id: String,
    /// Identity that signs funding transactions.
    pub funding_account: String,
    pub poll_interval: Duration,
    /// Status re-checks after the initial one, so a timeout costs
    /// `max_polls + 1` status calls.
    pub max_polls: u32,
}

impl EscrowFundSettings {
    pub fn new(contract_id: impl Into<String>, funding_account: impl Into<String>) -> Self {
        Self {
            contract_id: contract_id.into(),
            funding_account: funding_account.into(),
            poll_interval: Duration::from_secs(2),
            max_polls: 20,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EscrowFundError {
    #[error("Envelope not found: {0}")]
    EnvelopeNotFound(EnvelopeId),
    #[error("envelope {id} is already closed ({status})")]
    EnvelopeClosed {
        id: EnvelopeId,
        status: EnvelopeStatus,
    },
    #[error("Unsupported asset: {0}")]
    UnsupportedAsset(String),
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),
    #[error("Transaction failed: {hash}")]
    TransactionFailed { hash: TxHash, reason: Option<String> },
    #[error("transaction {hash} not confirmed after {polls} polls")]
    ConfirmationTimeout { hash: TxHash, polls: u32 },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EscrowFundError {
    /// Failures that retrying cannot fix. They cancel the envelope when there
    /// is one; the job still goes through the retry path.
    pub fn is_definitive(&self) -> bool {
        matches!(
            self,
            EscrowFundError::EnvelopeNotFound(_)
                | EscrowFundError::UnsupportedAsset(_)
                | EscrowFundError::WalletNotFound(_)
                | EscrowFundError::TransactionFailed { .. }
        )
    }
}

pub struct EscrowFundHandler {
    envelopes: Arc<dyn EnvelopeStore>,
    wallets: Arc<dyn WalletDirectory>,
    ledger: Arc<dyn LedgerClient>,
    assets: AssetRegistry,
    clock: Arc<dyn Clock>,
    settings: EscrowFundSettings,
}

impl EscrowFundHandler {
    pub fn new(
        envelopes: Arc<dyn EnvelopeStore>,
        wallets: Arc<dyn WalletDirectory>,
        ledger: Arc<dyn LedgerClient>,
        assets: AssetRegistry,
        clock: Arc<dyn Clock>,
        settings: EscrowFundSettings,
    ) -> Self {
        Self {
            envelopes,
            wallets,
            ledger,
            assets,
            clock,
            settings,
        }
    }

    #[instrument(skip_all, fields(envelope_id = %payload.envelope_id))]
    pub async fn handle(&self, payload: &EscrowFundPayload) -> Result<(), EscrowFundError> {
        let envelope = self
            .envelopes
            .get(&payload.envelope_id)
            .await?
            .ok_or_else(|| EscrowFundError::EnvelopeNotFound(payload.envelope_id.clone()))?;

        match envelope.status() {
            EnvelopeStatus::Pending => {}
            EnvelopeStatus::Funded => {
                info!("envelope already funded; skipping ledger submission");
                return Ok(());
            }
            status @ (EnvelopeStatus::Opened | EnvelopeStatus::Canceled) => {
                return Err(EscrowFundError::EnvelopeClosed {
                    id: payload.envelope_id.clone(),
                    status,
                });
            }
        }

        match self.create_escrow(payload).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_definitive() => {
                self.cancel(&payload.envelope_id, &err).await;
                Err(err)
            }
            Err(err) => {
                warn!(error = %err, "escrow funding failed; envelope left pending");
                Err(err)
            }
        }
    }

    async fn create_escrow(&self, payload: &EscrowFundPayload) -> Result<(), EscrowFundError> {
        let token = self
            .assets
            .contract_for(&payload.asset_code)
            .ok_or_else(|| EscrowFundError::UnsupportedAsset(payload.asset_code.clone()))?;
        let sender = self
            .wallets
            .public_key(&payload.sender_wallet_id)
            .await?
            .ok_or_else(|| EscrowFundError::WalletNotFound(payload.sender_wallet_id.clone()))?;

        let call = CreateEscrowCall {
            contract_id: self.settings.contract_id.clone(),
            escrow_id: escrow_id(&payload.envelope_id),
            sender,
            recipient_hash: payload.recipient_hash,
            token: token.to_string(),
            amount: payload.amount_atomic,
            expiry: payload.expiry_ts.div_euclid(1000),
        };

        let unsigned = self.ledger.build_transaction(&call).await?;
        let signed = self
            .ledger
            .sign(&unsigned, &self.settings.funding_account)
            .await?;
        let hash = self.ledger.submit(&signed).await?;
        info!(tx_hash = %hash, "escrow transaction submitted");

        self.await_confirmation(&hash).await?;

        let transition = Transition::fund(self.settings.contract_id.clone(), self.clock.now());
        match self.envelopes.apply(&payload.envelope_id, &transition).await? {
            TransitionOutcome::Applied(_) => {
                info!(tx_hash = %hash, contract_id = %self.settings.contract_id, "envelope funded");
            }
            TransitionOutcome::Rejected {
                current: EnvelopeStatus::Funded,
            } => {
                info!(tx_hash = %hash, "envelope already funded by ledger event");
            }
            TransitionOutcome::Rejected { current } => {
                warn!(tx_hash = %hash, %current, "envelope moved on while funding; left as is");
            }
        }
        Ok(())
    }

    /// One status check right after submission, then up to `max_polls`
    /// re-checks spaced by `poll_interval`.
    async fn await_confirmation(&self, hash: &TxHash) -> Result<(), EscrowFundError> {
        let retries = self.settings.max_polls;
        let mut checks = 0;
        loop {
            checks += 1;
            match self.ledger.transaction_status(hash).await? {
                TransactionStatus::Success => return Ok(()),
                TransactionStatus::Failed { reason } => {
                    return Err(EscrowFundError::TransactionFailed {
                        hash: hash.clone(),
                        reason,
                    });
                }
                TransactionStatus::NotFound => {
                    debug!(tx_hash = %hash, checks, "transaction not yet visible");
                    if checks > retries {
                        break;
                    }
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }
        Err(EscrowFundError::ConfirmationTimeout {
            hash: hash.clone(),
            polls: checks,
        })
    }

    async fn cancel(&self, id: &EnvelopeId, cause: &EscrowFundError) {
        if matches!(cause, EscrowFundError::EnvelopeNotFound(_)) {
            return;
        }
        let reason = format!("{CANCEL_REASON_PREFIX}: {cause}");
        let transition = Transition::cancel_pending(reason, self.clock.now());
        match self.envelopes.apply(id, &transition).await {
            Ok(TransitionOutcome::Applied(_)) => {
                warn!(error = %cause, "envelope canceled after definitive funding failure");
            }
            Ok(TransitionOutcome::Rejected { current }) => {
                debug!(%current, "envelope not pending; cancel skipped");
            }
            Err(store_err) => {
                error!(error = %store_err, "failed to cancel envelope");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{SignedTransaction, SimulatedLedger, UnsignedTransaction};
    use crate::memory::InMemoryStore;
    use crate::wallets::StaticWallets;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use escrowbox_core::{Amount, ManualClock};
    use escrowbox_envelope::{Envelope, NewEnvelope, Preimage};

    const CONTRACT: &str = "CESCROWCONTRACT";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        ledger: Arc<SimulatedLedger>,
        handler: EscrowFundHandler,
    }

    fn fixture_with(
        ledger: Arc<dyn LedgerClient>,
        sim: Arc<SimulatedLedger>,
        store: Arc<InMemoryStore>,
    ) -> Fixture {
        let mut settings = EscrowFundSettings::new(CONTRACT, "GFUNDER");
        settings.poll_interval = Duration::from_millis(10);
        settings.max_polls = 3;
        let handler = EscrowFundHandler::new(
            store.clone(),
            Arc::new(StaticWallets::new().with("wallet-1", "GSENDERADDRESS")),
            ledger,
            AssetRegistry::testnet(),
            Arc::new(ManualClock::new(t0())),
            settings,
        );
        Fixture {
            store,
            ledger: sim,
            handler,
        }
    }

    fn fixture() -> Fixture {
        let sim = Arc::new(SimulatedLedger::new());
        fixture_with(sim.clone(), sim, Arc::new(InMemoryStore::new()))
    }

    async fn seed(store: &InMemoryStore, asset: &str) -> EscrowFundPayload {
        let preimage = Preimage::generate();
        let envelope = Envelope::issue(
            NewEnvelope {
                id: EnvelopeId::generate(),
                hash: preimage.commitment(),
                amount: Amount::new(100_000_000),
                asset: asset.into(),
                sender: "GSENDERADDRESS".into(),
                recipient: Some("GRECIPIENT".into()),
                expiry_ts: t0() + ChronoDuration::days(7),
                message: None,
            },
            t0(),
        )
        .unwrap();
        store
            .create_envelopes(std::slice::from_ref(&envelope), vec![], t0())
            .await
            .unwrap();
        EscrowFundPayload {
            envelope_id: envelope.id().clone(),
            sender_wallet_id: "wallet-1".into(),
            recipient_hash: *envelope.hash(),
            amount_atomic: envelope.amount(),
            asset_code: asset.into(),
            expiry_ts: envelope.expiry_ts().timestamp_millis(),
        }
    }

    async fn status(store: &InMemoryStore, id: &EnvelopeId) -> Envelope {
        EnvelopeStore::get(store, id).await.unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn funds_pending_envelope_on_success() {
        let fx = fixture();
        let payload = seed(&fx.store, "USDC").await;

        fx.handler.handle(&payload).await.unwrap();

        let envelope = status(&fx.store, &payload.envelope_id).await;
        assert_eq!(envelope.status(), EnvelopeStatus::Funded);
        assert_eq!(envelope.contract_id(), Some(CONTRACT));
        assert_eq!(envelope.funded_at(), Some(t0()));

        let calls = fx.ledger.submitted();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].escrow_id, escrow_id(&payload.envelope_id));
        assert_eq!(calls[0].token, crate::ledger::assets::TESTNET_USDC);
        assert_eq!(calls[0].sender, "GSENDERADDRESS");
        assert_eq!(calls[0].expiry, payload.expiry_ts / 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_guard_skips_ledger_for_funded_and_closed_envelopes() {
        let fx = fixture();
        let funded = seed(&fx.store, "XLM").await;
        fx.store
            .apply(&funded.envelope_id, &Transition::fund(CONTRACT, t0()))
            .await
            .unwrap();
        fx.handler.handle(&funded).await.unwrap();

        let canceled = seed(&fx.store, "XLM").await;
        fx.store
            .apply(
                &canceled.envelope_id,
                &Transition::cancel_pending("earlier failure", t0()),
            )
            .await
            .unwrap();
        let err = fx.handler.handle(&canceled).await.unwrap_err();
        assert!(matches!(err, EscrowFundError::EnvelopeClosed { .. }));
        assert!(!err.is_definitive());

        assert_eq!(fx.ledger.submission_count(), 0);
        assert_eq!(
            status(&fx.store, &canceled.envelope_id).await.cancel_reason(),
            Some("earlier failure")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_asset_cancels_envelope() {
        let fx = fixture();
        let payload = seed(&fx.store, "DOGE").await;

        let err = fx.handler.handle(&payload).await.unwrap_err();
        assert!(err.is_definitive());

        let envelope = status(&fx.store, &payload.envelope_id).await;
        assert_eq!(envelope.status(), EnvelopeStatus::Canceled);
        assert_eq!(
            envelope.cancel_reason(),
            Some("Escrow creation failed: Unsupported asset: DOGE")
        );
        assert_eq!(fx.ledger.submission_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_wallet_cancels_envelope() {
        let fx = fixture();
        let mut payload = seed(&fx.store, "XLM").await;
        payload.sender_wallet_id = "missing".into();

        let err = fx.handler.handle(&payload).await.unwrap_err();
        assert!(matches!(err, EscrowFundError::WalletNotFound(_)));
        assert_eq!(
            status(&fx.store, &payload.envelope_id).await.status(),
            EnvelopeStatus::Canceled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_transaction_cancels_envelope() {
        let fx = fixture();
        fx.ledger.script_next(vec![
            TransactionStatus::NotFound,
            TransactionStatus::Failed {
                reason: Some("txFAILED".into()),
            },
        ]);
        let payload = seed(&fx.store, "XLM").await;

        let err = fx.handler.handle(&payload).await.unwrap_err();
        assert!(matches!(err, EscrowFundError::TransactionFailed { .. }));
        let envelope = status(&fx.store, &payload.envelope_id).await;
        assert_eq!(envelope.status(), EnvelopeStatus::Canceled);
        assert!(
            envelope
                .cancel_reason()
                .unwrap()
                .starts_with("Escrow creation failed: Transaction failed")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_seen_on_the_last_recheck_funds() {
        let fx = fixture();
        fx.ledger.script_next(vec![
            TransactionStatus::NotFound,
            TransactionStatus::NotFound,
            TransactionStatus::NotFound,
            TransactionStatus::Success,
        ]);
        let payload = seed(&fx.store, "XLM").await;

        fx.handler.handle(&payload).await.unwrap();
        assert_eq!(fx.ledger.status_check_count(), 4);
        assert_eq!(
            status(&fx.store, &payload.envelope_id).await.status(),
            EnvelopeStatus::Funded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_leave_envelope_pending() {
        let fx = fixture();
        fx.ledger.script_next(vec![TransactionStatus::NotFound]);
        let payload = seed(&fx.store, "XLM").await;

        let err = fx.handler.handle(&payload).await.unwrap_err();
        assert!(matches!(
            err,
            EscrowFundError::ConfirmationTimeout { polls: 4, .. }
        ));
        assert_eq!(fx.ledger.status_check_count(), 4);
        assert!(!err.is_definitive());
        assert_eq!(
            status(&fx.store, &payload.envelope_id).await.status(),
            EnvelopeStatus::Pending
        );

        fx.ledger.fail_next_submits(1);
        let err = fx.handler.handle(&payload).await.unwrap_err();
        assert!(matches!(
            err,
            EscrowFundError::Ledger(LedgerError::Transport(_))
        ));
        assert_eq!(
            status(&fx.store, &payload.envelope_id).await.status(),
            EnvelopeStatus::Pending
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_envelope_is_definitive_without_ledger_calls() {
        let fx = fixture();
        let mut payload = seed(&fx.store, "XLM").await;
        payload.envelope_id = EnvelopeId::generate();

        let err = fx.handler.handle(&payload).await.unwrap_err();
        assert!(matches!(err, EscrowFundError::EnvelopeNotFound(_)));
        assert!(err.is_definitive());
        assert_eq!(fx.ledger.submission_count(), 0);
    }

    /// Ledger whose confirmation races with a webhook that funds the envelope first.
    struct RacingLedger {
        inner: Arc<SimulatedLedger>,
        store: Arc<InMemoryStore>,
        envelope_id: std::sync::Mutex<Option<EnvelopeId>>,
    }

    #[async_trait]
    impl LedgerClient for RacingLedger {
        async fn build_transaction(
            &self,
            call: &CreateEscrowCall,
        ) -> Result<UnsignedTransaction, LedgerError> {
            self.inner.build_transaction(call).await
        }

        async fn sign(
            &self,
            unsigned: &UnsignedTransaction,
            signer: &str,
        ) -> Result<SignedTransaction, LedgerError> {
            self.inner.sign(unsigned, signer).await
        }

        async fn submit(&self, signed: &SignedTransaction) -> Result<TxHash, LedgerError> {
            self.inner.submit(signed).await
        }

        async fn transaction_status(&self, hash: &TxHash) -> Result<TransactionStatus, LedgerError> {
            let id = self.envelope_id.lock().unwrap().take();
            if let Some(id) = id {
                self.store
                    .apply(&id, &Transition::fund("CFROMWEBHOOK", t0()))
                    .await
                    .unwrap();
            }
            self.inner.transaction_status(hash).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn webhook_funding_first_counts_as_success() {
        let store = Arc::new(InMemoryStore::new());
        let sim = Arc::new(SimulatedLedger::new());
        let racing = Arc::new(RacingLedger {
            inner: sim.clone(),
            store: store.clone(),
            envelope_id: std::sync::Mutex::new(None),
        });
        let fx = fixture_with(racing.clone(), sim, store);
        let payload = seed(&fx.store, "XLM").await;
        *racing.envelope_id.lock().unwrap() = Some(payload.envelope_id.clone());

        fx.handler.handle(&payload).await.unwrap();

        let envelope = status(&fx.store, &payload.envelope_id).await;
        assert_eq!(envelope.status(), EnvelopeStatus::Funded);
        assert_eq!(envelope.contract_id(), Some("CFROMWEBHOOK"));
    }
}
