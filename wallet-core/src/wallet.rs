//! Wallet façade
//!
//! Ties the actor, the issuer client, and the transport together. All state
//! changes go through the actor; this layer runs the network calls that
//! must not block it. The pattern for every network-touching operation is
//! snapshot, await, apply: read what the call needs through the actor, do
//! the call, then apply the result through another actor message that
//! re-validates before committing.

use crate::{
    actor::{spawn_wallet_actor, WalletHandle, WalletStats},
    config::Config,
    crypto::{load_or_create_keypair, KeyStore},
    engine::TransactionEngine,
    error::{Error, Result},
    issuer::IssuerClient,
    ledger::TokenLedger,
    metrics::Metrics,
    queue::SyncQueue,
    storage::Storage,
    types::{SyncJob, Transaction, TransferPayload, WalletId, WalletState},
};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Delivery channel for payment payloads between devices (BLE, NFC, QR).
///
/// A returned `Ok` means the receiving device acknowledged the payload.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Deliver an encoded payload to the receiver
    async fn send(&self, receiver: &WalletId, payload: &[u8]) -> Result<()>;
}

/// Outcome of a purchase attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseOutcome {
    /// Tokens were bought and recorded
    Purchased,
    /// The wallet is offline; the purchase was queued
    Queued,
}

/// Outcome of a redemption attempt
#[derive(Debug, Clone)]
pub enum RedeemOutcome {
    /// Tokens were redeemed and the balance moved on-chain
    Redeemed(Transaction),
    /// The issuer was unreachable; the redemption was queued
    Queued,
}

/// An offline-first wallet
pub struct Wallet {
    handle: WalletHandle,
    issuer: Arc<dyn IssuerClient>,
    metrics: Arc<Metrics>,
    config: Config,
    wallet_id: WalletId,
    online: AtomicBool,
    actor_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Wallet {
    /// Open (or initialize) the wallet at the configured data directory.
    ///
    /// Loads the signing key from the key store (generating one on first
    /// use), repairs any interrupted finalization left by a crash, restores
    /// the sync queue, and starts the actor.
    pub fn open(
        config: Config,
        key_store: &dyn KeyStore,
        issuer: Arc<dyn IssuerClient>,
        issuer_public_key: [u8; 32],
    ) -> Result<Self> {
        let wallet_id = WalletId::new(config.wallet_id.clone());
        if wallet_id.is_empty() {
            return Err(Error::Config("wallet_id must not be empty".to_string()));
        }

        let keypair = load_or_create_keypair(key_store, wallet_id.as_str())?;
        let storage = Arc::new(Storage::open(&config)?);

        if storage.get_wallet_state()?.is_none() {
            storage.put_wallet_state(&WalletState::new(
                wallet_id.clone(),
                keypair.public_key(),
            ))?;
            tracing::info!(wallet = wallet_id.as_str(), "Initialized wallet state");
        }

        let repaired = storage.reconcile()?;
        if repaired > 0 {
            tracing::warn!(repaired, "Repaired interrupted finalizations");
        }

        let ledger = TokenLedger::new(
            storage.clone(),
            keypair,
            wallet_id.clone(),
            config.issuer_id.clone(),
            issuer_public_key,
        );
        let engine = TransactionEngine::new(storage.clone(), config.engine.clone());
        let queue = SyncQueue::load(storage)?;

        let (handle, actor_task) = spawn_wallet_actor(ledger, engine, queue, &config);
        let metrics = Arc::new(Metrics::new()?);

        Ok(Self {
            handle,
            issuer,
            metrics,
            config,
            wallet_id,
            online: AtomicBool::new(true),
            actor_task: parking_lot::Mutex::new(Some(actor_task)),
        })
    }

    /// This wallet's identity
    pub fn wallet_id(&self) -> &WalletId {
        &self.wallet_id
    }

    /// Actor handle for direct operation access
    pub fn handle(&self) -> &WalletHandle {
        &self.handle
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Toggle connectivity. Queue processing is a no-op while offline.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Current connectivity flag
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Current spendable balance
    pub async fn balance(&self) -> Result<Decimal> {
        self.handle.available_balance().await
    }

    /// All stored transactions
    pub async fn transactions(&self) -> Result<Vec<Transaction>> {
        self.handle.list_transactions().await
    }

    /// Wallet summary, also refreshing the metric gauges
    pub async fn stats(&self) -> Result<WalletStats> {
        let stats = self.handle.stats().await?;
        self.metrics.observe_stats(&stats);
        Ok(stats)
    }

    /// Pay a peer over the transport.
    ///
    /// The transfer is initiated and signed, the payload is delivered, and
    /// only on acknowledgement is the transaction completed and its tokens
    /// spent. A delivery failure marks the transaction failed; the funds
    /// stay in the wallet and `retry` can attempt delivery again.
    pub async fn send(
        &self,
        receiver: WalletId,
        amount: Decimal,
        transport: &dyn Transport,
    ) -> Result<Transaction> {
        let (tx, tokens) = self.handle.initiate_transfer(receiver.clone(), amount).await?;
        let state = self.handle.state().await?;
        let payload = TransferPayload {
            transaction: tx.clone(),
            tokens,
            sender_public_key: state.public_key,
        }
        .encode()?;

        match transport.send(&receiver, &payload).await {
            Ok(()) => {
                let done = self.handle.complete_transaction(tx.id).await.map_err(|e| {
                    if e.is_integrity() {
                        self.metrics.security_events.inc();
                    }
                    e
                })?;
                self.metrics.transactions_completed.inc();
                self.handle
                    .enqueue(SyncJob::TransactionSubmission {
                        transaction: done.clone(),
                    })
                    .await?;
                Ok(done)
            }
            Err(e) => {
                self.handle.fail_transaction(tx.id, e.to_string()).await?;
                self.metrics.transactions_failed.inc();
                Err(e)
            }
        }
    }

    /// Retry delivery of a failed transfer
    pub async fn retry(
        &self,
        tx_id: Uuid,
        transport: &dyn Transport,
    ) -> Result<Transaction> {
        let tx = self.handle.retry_transaction(tx_id).await?;
        let payload = match self.handle.transfer_payload_for(tx.id).await {
            Ok(payload) => payload,
            Err(e) => {
                // The funding changed underneath the retry; put the
                // transaction back into Failed rather than leave it pending.
                self.handle.fail_transaction(tx.id, e.to_string()).await?;
                self.metrics.transactions_failed.inc();
                if e.is_integrity() {
                    self.metrics.security_events.inc();
                }
                return Err(e);
            }
        };
        let receiver = payload.transaction.receiver.clone();
        let encoded = payload.encode()?;

        match transport.send(&receiver, &encoded).await {
            Ok(()) => {
                let done = self.handle.complete_transaction(tx.id).await?;
                self.metrics.transactions_completed.inc();
                self.handle
                    .enqueue(SyncJob::TransactionSubmission {
                        transaction: done.clone(),
                    })
                    .await?;
                Ok(done)
            }
            Err(e) => {
                self.handle.fail_transaction(tx.id, e.to_string()).await?;
                self.metrics.transactions_failed.inc();
                Err(e)
            }
        }
    }

    /// Cancel a pending transfer
    pub async fn cancel(&self, tx_id: Uuid) -> Result<Transaction> {
        let tx = self.handle.cancel_transaction(tx_id).await?;
        self.metrics.transactions_cancelled.inc();
        Ok(tx)
    }

    /// Accept an inbound payment payload received over the transport
    pub async fn receive(&self, payload_bytes: &[u8]) -> Result<Transaction> {
        let payload = TransferPayload::decode(payload_bytes)?;
        match self.handle.receive_transfer(payload).await {
            Ok(tx) => {
                self.metrics.payments_received.inc();
                Ok(tx)
            }
            Err(e) => {
                if e.is_integrity() {
                    self.metrics.security_events.inc();
                    tracing::warn!(error = %e, "Rejected inbound payment");
                }
                Err(e)
            }
        }
    }

    /// Buy tokens from the issuer, or queue the purchase while offline.
    ///
    /// Amount must be within the configured purchase bounds.
    pub async fn purchase(&self, amount: Decimal) -> Result<PurchaseOutcome> {
        if amount < self.config.purchase.min_amount || amount > self.config.purchase.max_amount {
            return Err(Error::InvalidAmount(format!(
                "Purchase amount {} outside bounds [{}, {}]",
                amount, self.config.purchase.min_amount, self.config.purchase.max_amount
            )));
        }

        if !self.is_online() {
            self.handle
                .enqueue(SyncJob::TokenPurchase { amount })
                .await?;
            tracing::info!(%amount, "Offline, queued token purchase");
            return Ok(PurchaseOutcome::Queued);
        }

        match self.issuer.purchase(amount, &self.wallet_id).await {
            Ok(tokens) => {
                self.handle.accept_purchased_tokens(tokens).await?;
                self.handle.mark_synced().await?;
                Ok(PurchaseOutcome::Purchased)
            }
            Err(e) if e.is_transient() => {
                self.handle
                    .enqueue(SyncJob::TokenPurchase { amount })
                    .await?;
                tracing::info!(%amount, error = %e, "Issuer unreachable, queued token purchase");
                Ok(PurchaseOutcome::Queued)
            }
            Err(e) => Err(e),
        }
    }

    /// Redeem all valid tokens back to blockchain balance, or queue the
    /// redemption while the issuer is unreachable.
    ///
    /// An empty redemption set is an error either way; a queued job for
    /// nothing would sit at the head of the queue forever.
    pub async fn redeem(&self) -> Result<RedeemOutcome> {
        let tokens = self.handle.redeemable_tokens().await?;

        if !self.is_online() {
            self.handle.enqueue(SyncJob::TokenRedemption).await?;
            tracing::info!(count = tokens.len(), "Offline, queued token redemption");
            return Ok(RedeemOutcome::Queued);
        }

        match self.issuer.redeem(tokens, &self.wallet_id).await {
            Ok(receipt) => {
                let tx = self.handle.finalize_redemption(receipt).await?;
                self.handle.mark_synced().await?;
                Ok(RedeemOutcome::Redeemed(tx))
            }
            Err(e) if e.is_transient() => {
                self.handle.enqueue(SyncJob::TokenRedemption).await?;
                tracing::info!(error = %e, "Issuer unreachable, queued token redemption");
                Ok(RedeemOutcome::Queued)
            }
            Err(e) => Err(e),
        }
    }

    /// Drain the sync queue in order, stopping at the first transient
    /// failure so the failed job stays at the head for the next pass.
    /// Returns the number of jobs processed.
    pub async fn process_sync_queue(&self) -> Result<usize> {
        if !self.is_online() {
            return Ok(0);
        }

        let mut processed = 0;
        while let Some(job) = self.handle.queue_peek().await? {
            match self.run_job(&job).await {
                Ok(()) => {
                    self.handle.queue_pop().await?;
                    processed += 1;
                }
                Err(e) if e.is_transient() => {
                    tracing::info!(error = %e, "Sync interrupted, leaving job queued");
                    break;
                }
                Err(e) => {
                    // Permanent failure: drop the job or it blocks the queue
                    tracing::warn!(job = ?job, error = %e, "Dropping failed sync job");
                    self.handle.queue_pop().await?;
                }
            }
        }

        if processed > 0 {
            self.handle.mark_synced().await?;
        }
        Ok(processed)
    }

    async fn run_job(&self, job: &SyncJob) -> Result<()> {
        match job {
            SyncJob::TokenPurchase { amount } => {
                let tokens = self.issuer.purchase(*amount, &self.wallet_id).await?;
                self.handle.accept_purchased_tokens(tokens).await?;
                Ok(())
            }
            SyncJob::TransactionSubmission { transaction } => {
                self.issuer.submit(transaction).await
            }
            SyncJob::BalanceUpdate { wallet_id } => {
                let balance = self.issuer.balance(wallet_id).await?;
                self.handle.set_blockchain_balance(balance).await
            }
            SyncJob::TransactionSync => self.handle.mark_synced().await,
            SyncJob::TokenRedemption => {
                let tokens = match self.handle.redeemable_tokens().await {
                    Ok(tokens) => tokens,
                    // Everything was spent or expired since queuing; the
                    // job has nothing left to do.
                    Err(Error::NoValidTokens) => return Ok(()),
                    Err(e) => return Err(e),
                };
                let receipt = self.issuer.redeem(tokens, &self.wallet_id).await?;
                self.handle.finalize_redemption(receipt).await?;
                Ok(())
            }
        }
    }

    /// Periodic maintenance: sweep expired tokens, top up the balance when
    /// auto-recharge is enabled, and drain the sync queue. Runs until the
    /// actor shuts down.
    pub async fn run_maintenance(&self) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.sweep.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            // The sweep rides a non-blocking tick so a busy actor delays
            // it rather than this loop.
            self.handle.tick();
            if let Err(e) = self.maintenance_pass().await {
                if matches!(e, Error::Concurrency(_)) {
                    break;
                }
                tracing::warn!(error = %e, "Maintenance pass failed");
            }
        }
    }

    /// One maintenance pass: auto-recharge and queue drain; exposed for
    /// deterministic tests. The expiry sweep runs separately via
    /// [`WalletHandle::tick`].
    pub async fn maintenance_pass(&self) -> Result<()> {
        let state = self.handle.state().await?;
        if state.auto_recharge_enabled {
            let balance = self.handle.available_balance().await?;
            let queue_idle = self.handle.queue_peek().await?.is_none();
            // Only top up with an idle queue, so one low-balance period
            // cannot stack recharge jobs.
            if balance < state.auto_recharge_threshold && queue_idle {
                self.handle
                    .enqueue(SyncJob::TokenPurchase {
                        amount: state.auto_recharge_amount,
                    })
                    .await?;
                tracing::info!(
                    %balance,
                    threshold = %state.auto_recharge_threshold,
                    "Balance low, queued auto-recharge"
                );
            }
        }

        self.process_sync_queue().await?;
        let stats = self.handle.stats().await?;
        self.metrics.observe_stats(&stats);
        Ok(())
    }

    /// Stop the actor and wait for it to release storage
    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
        let task = self.actor_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// In-process transport wiring wallets directly together, for tests and
/// demos. Payloads are delivered by invoking the receiving wallet's
/// `receive` inline.
pub struct LocalTransport {
    peers: parking_lot::RwLock<std::collections::HashMap<String, Arc<Wallet>>>,
    unreachable: AtomicBool,
}

impl LocalTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self {
            peers: parking_lot::RwLock::new(std::collections::HashMap::new()),
            unreachable: AtomicBool::new(false),
        }
    }

    /// Register a reachable peer wallet
    pub fn register(&self, wallet: Arc<Wallet>) {
        self.peers
            .write()
            .insert(wallet.wallet_id().as_str().to_string(), wallet);
    }

    /// Simulate delivery failure
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn send(&self, receiver: &WalletId, payload: &[u8]) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::ProcessingFailed(format!(
                "Peer {} unreachable",
                receiver
            )));
        }

        let peer = self
            .peers
            .read()
            .get(receiver.as_str())
            .cloned()
            .ok_or_else(|| {
                Error::InvalidRecipient(format!("No registered peer {}", receiver))
            })?;

        peer.receive(payload).await?;
        Ok(())
    }
}
