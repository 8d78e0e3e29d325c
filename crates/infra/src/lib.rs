//! Infrastructure layer: outbox storage and worker, handlers, ledger access,
//! webhook reconciliation and the Postgres adapter.

pub mod archive;
pub mod config;
pub mod envelopes;
pub mod error;
pub mod gift;
pub mod handlers;
pub mod jobs;
pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod reconciler;
pub mod wallets;

pub use archive::{ArchiveError, ArchiveReport, OutboxArchiver};
pub use config::{ConfigError, LedgerSettings, WorkerSettings};
pub use envelopes::{EnvelopeStore, TransitionOutcome};
pub use error::StoreError;
pub use gift::{GiftError, GiftReceipt, GiftService, IssuedEnvelope};
pub use memory::InMemoryStore;
pub use postgres::PgStore;
pub use reconciler::{LedgerEvent, ReconcileError, ReconcileOutcome, WebhookReconciler};
pub use wallets::{StaticWallets, WalletDirectory};
