//! Wallet daemon
//!
//! Runs a single wallet against a local in-process issuer: opens storage,
//! restores the sync queue, and runs the maintenance loop until Ctrl-C.
//! Useful for demos and for exercising the wallet under a process
//! lifecycle; a production deployment replaces the local issuer with a
//! client for the real backend.

use anyhow::Context;
use rust_decimal::Decimal;
use std::sync::Arc;
use wallet_core::{Config, LocalIssuer, MemoryKeyStore, Wallet, WalletId};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wallet_core=debug".into()),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        wallet = config.wallet_id.as_str(),
        data_dir = %config.data_dir.display(),
        "Starting wallet daemon"
    );

    let issuer = Arc::new(LocalIssuer::new(
        config.issuer_id.clone(),
        config.purchase.token_validity_days,
    ));
    // Demo funding so purchases have something to draw on
    issuer.credit(
        &WalletId::new(config.wallet_id.clone()),
        Decimal::new(1_000_00, 2),
    );

    let key_store = MemoryKeyStore::new();
    let issuer_key = issuer.public_key();
    let wallet = Arc::new(
        Wallet::open(config, &key_store, issuer.clone(), issuer_key)
            .context("Failed to open wallet")?,
    );

    let stats = wallet.stats().await.context("Failed to read wallet state")?;
    tracing::info!(
        balance = %stats.offline_balance,
        unspent = stats.unspent_tokens,
        queued = stats.queue_depth,
        "Wallet ready"
    );

    let maintenance = {
        let wallet = wallet.clone();
        tokio::spawn(async move { wallet.run_maintenance().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    wallet.shutdown().await;
    maintenance.abort();
    Ok(())
}
