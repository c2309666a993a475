//! Prometheus metrics for the wallet

use crate::actor::WalletStats;
use crate::error::{Error, Result};
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};
use rust_decimal::prelude::ToPrimitive;

/// Metrics collector for the wallet
pub struct Metrics {
    /// Prometheus registry
    pub registry: Registry,

    /// Spendable offline balance
    pub offline_balance: Gauge,

    /// Blockchain-side balance at last sync
    pub blockchain_balance: Gauge,

    /// Unspent tokens held
    pub tokens_unspent: IntGauge,

    /// Spent tokens retained for audit
    pub tokens_spent: IntGauge,

    /// Jobs waiting in the sync queue. Growth under sustained offline use
    /// is the signal to watch in place of a hard queue bound.
    pub queue_depth: IntGauge,

    /// Completed transactions
    pub transactions_completed: IntCounter,

    /// Failed transactions
    pub transactions_failed: IntCounter,

    /// Cancelled transactions
    pub transactions_cancelled: IntCounter,

    /// Inbound payments accepted
    pub payments_received: IntCounter,

    /// Rejected double spends, bad signatures, and replays
    pub security_events: IntCounter,
}

impl Metrics {
    /// Create and register all metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let offline_balance = Gauge::new(
            "wallet_offline_balance",
            "Sum of valid unspent offline tokens",
        )
        .map_err(|e| Error::Config(format!("Failed to create metric: {}", e)))?;

        let blockchain_balance = Gauge::new(
            "wallet_blockchain_balance",
            "Blockchain-side balance at last sync",
        )
        .map_err(|e| Error::Config(format!("Failed to create metric: {}", e)))?;

        let tokens_unspent = IntGauge::new("wallet_tokens_unspent", "Unspent tokens held")
            .map_err(|e| Error::Config(format!("Failed to create metric: {}", e)))?;

        let tokens_spent = IntGauge::new("wallet_tokens_spent", "Spent tokens retained")
            .map_err(|e| Error::Config(format!("Failed to create metric: {}", e)))?;

        let queue_depth = IntGauge::new("wallet_sync_queue_depth", "Jobs in the sync queue")
            .map_err(|e| Error::Config(format!("Failed to create metric: {}", e)))?;

        let transactions_completed = IntCounter::new(
            "wallet_transactions_completed_total",
            "Transactions finalized as completed",
        )
        .map_err(|e| Error::Config(format!("Failed to create metric: {}", e)))?;

        let transactions_failed = IntCounter::new(
            "wallet_transactions_failed_total",
            "Transactions marked failed",
        )
        .map_err(|e| Error::Config(format!("Failed to create metric: {}", e)))?;

        let transactions_cancelled = IntCounter::new(
            "wallet_transactions_cancelled_total",
            "Transactions cancelled by the user",
        )
        .map_err(|e| Error::Config(format!("Failed to create metric: {}", e)))?;

        let payments_received = IntCounter::new(
            "wallet_payments_received_total",
            "Inbound payments accepted",
        )
        .map_err(|e| Error::Config(format!("Failed to create metric: {}", e)))?;

        let security_events = IntCounter::new(
            "wallet_security_events_total",
            "Rejected double spends, bad signatures, and replays",
        )
        .map_err(|e| Error::Config(format!("Failed to create metric: {}", e)))?;

        for collector in [
            Box::new(offline_balance.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(blockchain_balance.clone()),
            Box::new(tokens_unspent.clone()),
            Box::new(tokens_spent.clone()),
            Box::new(queue_depth.clone()),
            Box::new(transactions_completed.clone()),
            Box::new(transactions_failed.clone()),
            Box::new(transactions_cancelled.clone()),
            Box::new(payments_received.clone()),
            Box::new(security_events.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| Error::Config(format!("Failed to register metric: {}", e)))?;
        }

        Ok(Self {
            registry,
            offline_balance,
            blockchain_balance,
            tokens_unspent,
            tokens_spent,
            queue_depth,
            transactions_completed,
            transactions_failed,
            transactions_cancelled,
            payments_received,
            security_events,
        })
    }

    /// Refresh the gauges from a wallet snapshot
    pub fn observe_stats(&self, stats: &WalletStats) {
        self.offline_balance
            .set(stats.offline_balance.to_f64().unwrap_or(0.0));
        self.blockchain_balance
            .set(stats.blockchain_balance.to_f64().unwrap_or(0.0));
        self.tokens_unspent.set(stats.unspent_tokens as i64);
        self.tokens_spent.set(stats.spent_tokens as i64);
        self.queue_depth.set(stats.queue_depth as i64);
    }

    /// Render the registry in Prometheus text format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Config(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Config(format!("Metrics are not valid UTF-8: {}", e)))
    }
}
