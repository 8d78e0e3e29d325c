//! Outbox worker process: polls the Postgres outbox and runs job handlers
//! until interrupted.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use escrowbox_core::SystemClock;
use escrowbox_infra::handlers::{EscrowFundHandler, TracingNotifier};
use escrowbox_infra::jobs::{HandlerRegistry, LockManager, OutboxWorker};
use escrowbox_infra::ledger::RpcLedgerClient;
use escrowbox_infra::{LedgerSettings, PgStore, WorkerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    escrowbox_observability::init();

    let settings = WorkerSettings::from_env().context("invalid worker settings")?;
    let ledger_settings = LedgerSettings::from_env().context("invalid ledger settings")?;

    let pool = PgPoolOptions::new()
        .max_connections(u32::try_from(settings.worker.batch_size + 2).unwrap_or(u32::MAX))
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PgStore::new(pool));
    store.migrate().await.context("failed to apply schema")?;

    let clock = Arc::new(SystemClock);
    let ledger = Arc::new(
        RpcLedgerClient::new(&ledger_settings.rpc_url).context("failed to build ledger client")?,
    );
    let escrow_fund = Arc::new(EscrowFundHandler::new(
        store.clone(),
        store.clone(),
        ledger,
        ledger_settings.assets.clone(),
        clock.clone(),
        ledger_settings.escrow_fund(),
    ));
    let registry = Arc::new(HandlerRegistry::new(escrow_fund, Arc::new(TracingNotifier)));

    let locks = LockManager::new(
        store,
        clock,
        settings.worker_id.clone(),
        settings.retry.clone(),
        settings.lock_timeout,
    );

    tracing::info!(
        worker_id = %settings.worker_id,
        contract_id = %ledger_settings.contract_id,
        assets = ?ledger_settings.assets.codes().collect::<Vec<_>>(),
        "starting outbox worker"
    );
    let handle = OutboxWorker::new(locks, registry, settings.worker.clone()).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested; finishing current tick");

    let stats = handle.shutdown().await;
    tracing::info!(
        ticks = stats.ticks,
        succeeded = stats.succeeded,
        retried = stats.retried,
        failed = stats.failed_permanently,
        "outbox worker exited"
    );
    Ok(())
}
