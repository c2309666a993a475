//! Wallet actor: single-owner serialization of all wallet state
//!
//! The ledger, transaction engine, and sync queue live inside one task that
//! processes messages in arrival order, so no two operations ever interleave
//! on wallet state. Callers hold a cheap cloneable [`WalletHandle`]. Network
//! calls never run inside the actor; the façade snapshots what it needs,
//! awaits the network, and applies the result through another message.

use crate::{
    config::Config,
    engine::TransactionEngine,
    error::{Error, Result},
    ledger::TokenLedger,
    queue::SyncQueue,
    storage::WalletBatch,
    types::{
        OfflineToken, RedemptionReceipt, SyncJob, Transaction, TransactionStatus, TransactionType,
        TransferPayload, WalletId, WalletState,
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Mailbox capacity. Senders back-pressure when the actor falls behind.
const MAILBOX_SIZE: usize = 1000;

/// Point-in-time wallet summary for status surfaces
#[derive(Debug, Clone)]
pub struct WalletStats {
    /// Sum of valid unspent tokens
    pub offline_balance: Decimal,
    /// Blockchain-side balance at last sync
    pub blockchain_balance: Decimal,
    /// Unspent tokens held
    pub unspent_tokens: u64,
    /// Spent tokens retained for audit
    pub spent_tokens: u64,
    /// Jobs waiting in the sync queue
    pub queue_depth: usize,
    /// Last successful sync with the issuer
    pub last_sync: Option<chrono::DateTime<Utc>>,
}

/// Messages processed by the wallet actor
enum WalletMessage {
    AvailableBalance {
        respond_to: oneshot::Sender<Result<Decimal>>,
    },
    InitiateTransfer {
        receiver: WalletId,
        amount: Decimal,
        respond_to: oneshot::Sender<Result<(Transaction, Vec<OfflineToken>)>>,
    },
    CompleteTransaction {
        tx_id: Uuid,
        respond_to: oneshot::Sender<Result<Transaction>>,
    },
    FailTransaction {
        tx_id: Uuid,
        error: String,
        respond_to: oneshot::Sender<Result<Transaction>>,
    },
    RetryTransaction {
        tx_id: Uuid,
        respond_to: oneshot::Sender<Result<Transaction>>,
    },
    CancelTransaction {
        tx_id: Uuid,
        respond_to: oneshot::Sender<Result<Transaction>>,
    },
    ReceiveTransfer {
        payload: TransferPayload,
        respond_to: oneshot::Sender<Result<Transaction>>,
    },
    TransferPayloadFor {
        tx_id: Uuid,
        respond_to: oneshot::Sender<Result<TransferPayload>>,
    },
    AcceptPurchasedTokens {
        tokens: Vec<OfflineToken>,
        respond_to: oneshot::Sender<Result<Decimal>>,
    },
    RedeemableTokens {
        respond_to: oneshot::Sender<Result<Vec<OfflineToken>>>,
    },
    FinalizeRedemption {
        receipt: RedemptionReceipt,
        respond_to: oneshot::Sender<Result<Transaction>>,
    },
    SweepExpired {
        respond_to: oneshot::Sender<Result<Vec<Uuid>>>,
    },
    Enqueue {
        job: SyncJob,
        respond_to: oneshot::Sender<Result<()>>,
    },
    QueuePeek {
        respond_to: oneshot::Sender<Option<SyncJob>>,
    },
    QueuePop {
        respond_to: oneshot::Sender<Result<Option<SyncJob>>>,
    },
    GetTransaction {
        tx_id: Uuid,
        respond_to: oneshot::Sender<Result<Transaction>>,
    },
    ListTransactions {
        respond_to: oneshot::Sender<Result<Vec<Transaction>>>,
    },
    State {
        respond_to: oneshot::Sender<Result<WalletState>>,
    },
    SetBlockchainBalance {
        balance: Decimal,
        respond_to: oneshot::Sender<Result<()>>,
    },
    MarkSynced {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Stats {
        respond_to: oneshot::Sender<Result<WalletStats>>,
    },
    /// Fire-and-forget maintenance tick; dropped when the mailbox is full
    Tick,
    Shutdown,
}

/// The actor task owning all mutable wallet state
struct WalletActor {
    ledger: TokenLedger,
    engine: TransactionEngine,
    queue: SyncQueue,
    issuer_id: String,
    receiver: mpsc::Receiver<WalletMessage>,
}

impl WalletActor {
    async fn run(mut self) {
        tracing::info!(wallet = self.ledger.wallet_id().as_str(), "Wallet actor started");

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                WalletMessage::AvailableBalance { respond_to } => {
                    let _ = respond_to.send(self.ledger.available_balance());
                }
                WalletMessage::InitiateTransfer {
                    receiver,
                    amount,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.initiate_transfer(receiver, amount));
                }
                WalletMessage::CompleteTransaction { tx_id, respond_to } => {
                    let _ = respond_to.send(self.engine.update_state(
                        &mut self.ledger,
                        tx_id,
                        TransactionStatus::Completed,
                    ));
                }
                WalletMessage::FailTransaction {
                    tx_id,
                    error,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.engine.handle_failed(tx_id, &error));
                }
                WalletMessage::RetryTransaction { tx_id, respond_to } => {
                    let _ = respond_to.send(self.engine.retry_failed(tx_id));
                }
                WalletMessage::CancelTransaction { tx_id, respond_to } => {
                    let _ = respond_to.send(self.cancel_transaction(tx_id));
                }
                WalletMessage::ReceiveTransfer {
                    payload,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.receive_transfer(payload));
                }
                WalletMessage::TransferPayloadFor { tx_id, respond_to } => {
                    let _ = respond_to.send(self.transfer_payload_for(tx_id));
                }
                WalletMessage::AcceptPurchasedTokens { tokens, respond_to } => {
                    let _ = respond_to.send(self.accept_purchased(tokens));
                }
                WalletMessage::RedeemableTokens { respond_to } => {
                    let _ = respond_to.send(self.ledger.redeemable_tokens());
                }
                WalletMessage::FinalizeRedemption {
                    receipt,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.finalize_redemption(receipt));
                }
                WalletMessage::SweepExpired { respond_to } => {
                    let _ = respond_to.send(self.ledger.sweep_expired());
                }
                WalletMessage::Enqueue { job, respond_to } => {
                    let _ = respond_to.send(self.queue.enqueue(job));
                }
                WalletMessage::QueuePeek { respond_to } => {
                    let _ = respond_to.send(self.queue.peek().cloned());
                }
                WalletMessage::QueuePop { respond_to } => {
                    let _ = respond_to.send(self.queue.pop());
                }
                WalletMessage::GetTransaction { tx_id, respond_to } => {
                    let _ = respond_to.send(self.ledger.storage().get_transaction(tx_id));
                }
                WalletMessage::ListTransactions { respond_to } => {
                    let _ = respond_to.send(self.ledger.storage().list_transactions());
                }
                WalletMessage::State { respond_to } => {
                    let _ = respond_to.send(self.wallet_state());
                }
                WalletMessage::SetBlockchainBalance {
                    balance,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.set_blockchain_balance(balance));
                }
                WalletMessage::MarkSynced { respond_to } => {
                    let _ = respond_to.send(self.mark_synced());
                }
                WalletMessage::Stats { respond_to } => {
                    let _ = respond_to.send(self.stats());
                }
                WalletMessage::Tick => {
                    if let Err(e) = self.ledger.sweep_expired() {
                        tracing::warn!(error = %e, "Maintenance sweep failed");
                    }
                }
                WalletMessage::Shutdown => {
                    tracing::info!("Wallet actor shutting down");
                    break;
                }
            }
        }
    }

    fn initiate_transfer(
        &mut self,
        receiver: WalletId,
        amount: Decimal,
    ) -> Result<(Transaction, Vec<OfflineToken>)> {
        let tx = self.engine.initiate(
            &mut self.ledger,
            receiver,
            amount,
            TransactionType::OfflineTransfer,
        )?;
        let tx = self.engine.sign(tx, self.ledger.keypair())?;

        // The guard must run before the payload can leave the wallet; once
        // a peer holds the tokens a completion failure cannot take them
        // back.
        if self.engine.check_double_spending(&tx)? {
            self.engine
                .handle_failed(tx.id, "Duplicate of a recent transfer")?;
            return Err(Error::DoubleSpending(format!(
                "Transfer to {} for {} duplicates a recent transaction",
                tx.receiver, tx.amount
            )));
        }

        let mut funding = Vec::with_capacity(tx.token_ids.len());
        for token_id in &tx.token_ids {
            funding.push(self.ledger.storage().get_token(*token_id)?);
        }
        Ok((tx, funding))
    }

    /// Rebuild the wire payload for a pending transaction, for retries.
    ///
    /// Fails if any funding token was spent in the meantime; the caller
    /// should fail the transaction rather than resend.
    fn transfer_payload_for(&mut self, tx_id: Uuid) -> Result<TransferPayload> {
        let tx = self.ledger.storage().get_transaction(tx_id)?;
        if tx.status != TransactionStatus::Pending {
            return Err(Error::InvalidTransaction(format!(
                "Cannot build payload for transaction {} in state {:?}",
                tx_id, tx.status
            )));
        }
        if self.engine.check_double_spending(&tx)? {
            return Err(Error::DoubleSpending(format!(
                "Transfer to {} for {} duplicates a recent transaction",
                tx.receiver, tx.amount
            )));
        }

        let mut tokens = Vec::with_capacity(tx.token_ids.len());
        for token_id in &tx.token_ids {
            let token = self.ledger.storage().get_token(*token_id)?;
            if token.is_spent {
                return Err(Error::DoubleSpending(format!(
                    "Funding token {} was spent since initiation",
                    token_id
                )));
            }
            tokens.push(token);
        }

        Ok(TransferPayload {
            transaction: tx,
            tokens,
            sender_public_key: self.ledger.keypair().public_key(),
        })
    }

    fn cancel_transaction(&mut self, tx_id: Uuid) -> Result<Transaction> {
        let tx = self.engine.cancel(tx_id)?;
        self.queue.remove_submission(tx_id)?;
        Ok(tx)
    }

    /// Validate and record an inbound payment.
    ///
    /// The sender's key arrives in the payload and is pinned into the trust
    /// registry so their division children verify. The transaction record is
    /// counter-signed and stored completed; the named tokens are received
    /// funds, not a spend on our side.
    fn receive_transfer(&mut self, payload: TransferPayload) -> Result<Transaction> {
        let mut tx = payload.transaction;

        if tx.receiver != *self.ledger.wallet_id() {
            return Err(Error::InvalidRecipient(format!(
                "Payment addressed to {}, not this wallet",
                tx.receiver
            )));
        }
        if tx.amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "Amount must be positive, got {}",
                tx.amount
            )));
        }
        if !tx.verify_sender_signature(&payload.sender_public_key) {
            return Err(Error::InvalidSignature(format!(
                "Sender signature does not verify for transaction {}",
                tx.id
            )));
        }

        let named: HashSet<Uuid> = tx.token_ids.iter().copied().collect();
        let carried: HashSet<Uuid> = payload.tokens.iter().map(|t| t.id).collect();
        if named != carried {
            return Err(Error::InvalidTransaction(
                "Carried tokens do not match the transaction's token list".to_string(),
            ));
        }
        let total: Decimal = payload.tokens.iter().map(|t| t.amount).sum();
        if total != tx.amount {
            return Err(Error::InvalidTransaction(format!(
                "Token sum {} does not match transaction amount {}",
                total, tx.amount
            )));
        }

        self.ledger
            .register_peer_key(tx.sender.as_str(), payload.sender_public_key);
        self.ledger.accept_trusted_tokens(payload.tokens)?;

        tx.receiver_signature = Some(self.ledger.keypair().sign(&tx.canonical_bytes()));
        tx.status = TransactionStatus::Completed;
        self.ledger.storage().put_transaction(&tx)?;

        tracing::info!(
            tx_id = %tx.id,
            sender = tx.sender.as_str(),
            amount = %tx.amount,
            "Payment received"
        );
        Ok(tx)
    }

    /// Record issuer-purchased tokens and a completed purchase transaction
    fn accept_purchased(&mut self, tokens: Vec<OfflineToken>) -> Result<Decimal> {
        let issuer_key = *self
            .ledger
            .verifying_key(&self.issuer_id)
            .ok_or_else(|| Error::InvalidKey(format!("No key for issuer {}", self.issuer_id)))?;

        // Tokens that fail validation here came straight from the issuer,
        // so the caller sees a purchase failure, not a bad-token report.
        let accepted = self
            .ledger
            .accept_tokens(tokens, &issuer_key)
            .map_err(|e| match e {
                Error::InvalidToken(msg) | Error::InvalidSignature(msg) => {
                    Error::PurchaseFailed(format!("Issuer returned unverifiable tokens: {}", msg))
                }
                other => other,
            })?;
        let total: Decimal = accepted.iter().map(|t| t.amount).sum();

        let tx = Transaction {
            id: Uuid::now_v7(),
            tx_type: TransactionType::TokenPurchase,
            sender: WalletId::new(self.issuer_id.clone()),
            receiver: self.ledger.wallet_id().clone(),
            amount: total,
            timestamp: Utc::now(),
            status: TransactionStatus::Completed,
            token_ids: accepted.iter().map(|t| t.id).collect(),
            sender_signature: None,
            receiver_signature: None,
            metadata: Default::default(),
        };
        self.ledger.storage().put_transaction(&tx)?;

        Ok(total)
    }

    /// Mark redeemed tokens spent and record the redemption, atomically.
    ///
    /// The receipt was obtained outside the actor; anything may have spent
    /// the snapshotted tokens during the network await. Re-validate every
    /// token before committing so the same value cannot reach both a peer
    /// and the issuer.
    fn finalize_redemption(&mut self, receipt: RedemptionReceipt) -> Result<Transaction> {
        let now = Utc::now();
        let mut put_tokens = Vec::with_capacity(receipt.token_ids.len());
        for token_id in &receipt.token_ids {
            let mut token = self.ledger.storage().get_token(*token_id)?;
            if token.is_spent {
                return Err(Error::DoubleSpending(format!(
                    "Token {} was spent while the redemption was in flight",
                    token_id
                )));
            }
            token.is_spent = true;
            token.spent_at = Some(now);
            put_tokens.push(token);
        }

        let mut tx = Transaction {
            id: Uuid::now_v7(),
            tx_type: TransactionType::TokenRedemption,
            sender: self.ledger.wallet_id().clone(),
            receiver: WalletId::new(self.issuer_id.clone()),
            amount: receipt.total_amount,
            timestamp: now,
            status: TransactionStatus::Completed,
            token_ids: receipt.token_ids.clone(),
            sender_signature: None,
            receiver_signature: None,
            metadata: Default::default(),
        };
        tx.metadata
            .insert("receipt_id".to_string(), receipt.receipt_id.to_string());

        let mut batch = WalletBatch {
            put_tokens,
            put_transactions: vec![tx.clone()],
            ..Default::default()
        };
        if let Some(mut state) = self.ledger.storage().get_wallet_state()? {
            state.offline_balance = self.ledger.available_balance()? - receipt.total_amount;
            state.blockchain_balance += receipt.total_amount;
            batch.wallet_state = Some(state);
        }
        self.ledger.storage().apply_batch(batch)?;
        self.ledger.invalidate_cache();

        tracing::info!(
            receipt = %receipt.receipt_id,
            amount = %receipt.total_amount,
            "Redemption finalized"
        );
        Ok(tx)
    }

    fn wallet_state(&self) -> Result<WalletState> {
        self.ledger
            .storage()
            .get_wallet_state()?
            .ok_or(Error::WalletNotInitialized)
    }

    fn set_blockchain_balance(&mut self, balance: Decimal) -> Result<()> {
        let mut state = self.wallet_state()?;
        state.blockchain_balance = balance;
        state.last_sync = Some(Utc::now());
        self.ledger.storage().put_wallet_state(&state)
    }

    fn mark_synced(&mut self) -> Result<()> {
        let mut state = self.wallet_state()?;
        state.last_sync = Some(Utc::now());
        self.ledger.storage().put_wallet_state(&state)
    }

    fn stats(&mut self) -> Result<WalletStats> {
        let state = self.wallet_state()?;
        let (unspent, spent) = self.ledger.storage().token_counts()?;
        Ok(WalletStats {
            offline_balance: self.ledger.available_balance()?,
            blockchain_balance: state.blockchain_balance,
            unspent_tokens: unspent,
            spent_tokens: spent,
            queue_depth: self.queue.depth(),
            last_sync: state.last_sync,
        })
    }
}

/// Cloneable handle to the wallet actor
#[derive(Clone)]
pub struct WalletHandle {
    sender: mpsc::Sender<WalletMessage>,
}

impl WalletHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WalletMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        rx.await
            .map_err(|_| Error::Concurrency("Actor dropped response".to_string()))
    }

    /// Current spendable balance
    pub async fn available_balance(&self) -> Result<Decimal> {
        self.request(|respond_to| WalletMessage::AvailableBalance { respond_to })
            .await?
    }

    /// Initiate and sign an outbound transfer, returning the signed
    /// transaction and its funding tokens
    pub async fn initiate_transfer(
        &self,
        receiver: WalletId,
        amount: Decimal,
    ) -> Result<(Transaction, Vec<OfflineToken>)> {
        self.request(|respond_to| WalletMessage::InitiateTransfer {
            receiver,
            amount,
            respond_to,
        })
        .await?
    }

    /// Finalize a pending transaction as completed
    pub async fn complete_transaction(&self, tx_id: Uuid) -> Result<Transaction> {
        self.request(|respond_to| WalletMessage::CompleteTransaction { tx_id, respond_to })
            .await?
    }

    /// Mark a pending transaction failed, recording the error
    pub async fn fail_transaction(&self, tx_id: Uuid, error: String) -> Result<Transaction> {
        self.request(|respond_to| WalletMessage::FailTransaction {
            tx_id,
            error,
            respond_to,
        })
        .await?
    }

    /// Reset a failed transaction for another attempt
    pub async fn retry_transaction(&self, tx_id: Uuid) -> Result<Transaction> {
        self.request(|respond_to| WalletMessage::RetryTransaction { tx_id, respond_to })
            .await?
    }

    /// Cancel a pending transaction and drop any queued submission of it
    pub async fn cancel_transaction(&self, tx_id: Uuid) -> Result<Transaction> {
        self.request(|respond_to| WalletMessage::CancelTransaction { tx_id, respond_to })
            .await?
    }

    /// Validate and record an inbound payment payload
    pub async fn receive_transfer(&self, payload: TransferPayload) -> Result<Transaction> {
        self.request(|respond_to| WalletMessage::ReceiveTransfer {
            payload,
            respond_to,
        })
        .await?
    }

    /// Rebuild the wire payload for a pending transaction
    pub async fn transfer_payload_for(&self, tx_id: Uuid) -> Result<TransferPayload> {
        self.request(|respond_to| WalletMessage::TransferPayloadFor { tx_id, respond_to })
            .await?
    }

    /// Record tokens purchased from the issuer; returns the amount added
    pub async fn accept_purchased_tokens(&self, tokens: Vec<OfflineToken>) -> Result<Decimal> {
        self.request(|respond_to| WalletMessage::AcceptPurchasedTokens { tokens, respond_to })
            .await?
    }

    /// Tokens eligible for redemption
    pub async fn redeemable_tokens(&self) -> Result<Vec<OfflineToken>> {
        self.request(|respond_to| WalletMessage::RedeemableTokens { respond_to })
            .await?
    }

    /// Apply a successful redemption receipt
    pub async fn finalize_redemption(&self, receipt: RedemptionReceipt) -> Result<Transaction> {
        self.request(|respond_to| WalletMessage::FinalizeRedemption {
            receipt,
            respond_to,
        })
        .await?
    }

    /// Remove expired tokens, returning the removed IDs
    pub async fn sweep_expired(&self) -> Result<Vec<Uuid>> {
        self.request(|respond_to| WalletMessage::SweepExpired { respond_to })
            .await?
    }

    /// Append a job to the sync queue
    pub async fn enqueue(&self, job: SyncJob) -> Result<()> {
        self.request(|respond_to| WalletMessage::Enqueue { job, respond_to })
            .await?
    }

    /// Head of the sync queue without removal
    pub async fn queue_peek(&self) -> Result<Option<SyncJob>> {
        self.request(|respond_to| WalletMessage::QueuePeek { respond_to })
            .await
    }

    /// Remove and return the head of the sync queue
    pub async fn queue_pop(&self) -> Result<Option<SyncJob>> {
        self.request(|respond_to| WalletMessage::QueuePop { respond_to })
            .await?
    }

    /// Look up a transaction by ID
    pub async fn get_transaction(&self, tx_id: Uuid) -> Result<Transaction> {
        self.request(|respond_to| WalletMessage::GetTransaction { tx_id, respond_to })
            .await?
    }

    /// All stored transactions
    pub async fn list_transactions(&self) -> Result<Vec<Transaction>> {
        self.request(|respond_to| WalletMessage::ListTransactions { respond_to })
            .await?
    }

    /// Current wallet state
    pub async fn state(&self) -> Result<WalletState> {
        self.request(|respond_to| WalletMessage::State { respond_to })
            .await?
    }

    /// Record the blockchain balance reported by the issuer
    pub async fn set_blockchain_balance(&self, balance: Decimal) -> Result<()> {
        self.request(|respond_to| WalletMessage::SetBlockchainBalance {
            balance,
            respond_to,
        })
        .await?
    }

    /// Record a successful sync
    pub async fn mark_synced(&self) -> Result<()> {
        self.request(|respond_to| WalletMessage::MarkSynced { respond_to })
            .await?
    }

    /// Wallet summary for status surfaces
    pub async fn stats(&self) -> Result<WalletStats> {
        self.request(|respond_to| WalletMessage::Stats { respond_to })
            .await?
    }

    /// Non-blocking maintenance tick; skipped when the actor is busy
    pub fn tick(&self) {
        if self.sender.try_send(WalletMessage::Tick).is_err() {
            tracing::debug!("Actor busy, skipping maintenance tick");
        }
    }

    /// Stop the actor after in-flight messages drain
    pub async fn shutdown(&self) {
        let _ = self.sender.send(WalletMessage::Shutdown).await;
    }
}

/// Spawn the wallet actor, returning its handle and join handle
pub fn spawn_wallet_actor(
    ledger: TokenLedger,
    engine: TransactionEngine,
    queue: SyncQueue,
    config: &Config,
) -> (WalletHandle, tokio::task::JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(MAILBOX_SIZE);
    let actor = WalletActor {
        ledger,
        engine,
        queue,
        issuer_id: config.issuer_id.clone(),
        receiver,
    };
    let join = tokio::spawn(actor.run());
    (WalletHandle { sender }, join)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::storage::Storage;
    use crate::Config;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn dec(value: i64) -> Decimal {
        Decimal::new(value * 100, 2)
    }

    struct Harness {
        handle: WalletHandle,
        issuer: KeyPair,
        storage: Arc<Storage>,
        _temp: TempDir,
    }

    fn spawn_harness() -> Harness {
        spawn_harness_as("wallet-a", KeyPair::generate())
    }

    fn spawn_harness_as(id: &str, issuer: KeyPair) -> Harness {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        config.wallet_id = id.to_string();

        let storage = Arc::new(Storage::open(&config).unwrap());
        let wallet_keys = KeyPair::generate();
        let wallet_id = WalletId::new(id);

        storage
            .put_wallet_state(&WalletState::new(wallet_id.clone(), wallet_keys.public_key()))
            .unwrap();

        let ledger = TokenLedger::new(
            storage.clone(),
            wallet_keys.clone(),
            wallet_id,
            config.issuer_id.clone(),
            issuer.public_key(),
        );
        let engine = TransactionEngine::new(storage.clone(), config.engine.clone());
        let queue = SyncQueue::load(storage.clone()).unwrap();

        let (handle, _join) = spawn_wallet_actor(ledger, engine, queue, &config);
        Harness {
            handle,
            issuer,
            storage,
            _temp: temp,
        }
    }

    fn issue_tokens(harness: &Harness, amounts: &[i64]) -> Vec<OfflineToken> {
        use crate::types::Signature;
        amounts
            .iter()
            .map(|&a| {
                let mut token = OfflineToken {
                    id: Uuid::now_v7(),
                    amount: dec(a),
                    issuer: "issuer".to_string(),
                    issued_at: Utc::now(),
                    expires_at: Utc::now() + chrono::Duration::days(30),
                    is_spent: false,
                    spent_at: None,
                    divisions: vec![],
                    signature: Signature::from_bytes([0u8; 64]),
                };
                token.signature = harness.issuer.sign(&token.canonical_bytes());
                token
            })
            .collect()
    }

    #[tokio::test]
    async fn test_actor_serializes_transfer_lifecycle() {
        let harness = spawn_harness();
        let tokens = issue_tokens(&harness, &[100]);
        harness
            .handle
            .accept_purchased_tokens(tokens)
            .await
            .unwrap();

        assert_eq!(harness.handle.available_balance().await.unwrap(), dec(100));

        let (tx, funding) = harness
            .handle
            .initiate_transfer(WalletId::new("wallet-b"), dec(30))
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert!(tx.sender_signature.is_some());
        let funded: Decimal = funding.iter().map(|t| t.amount).sum();
        assert_eq!(funded, dec(30));

        let done = harness.handle.complete_transaction(tx.id).await.unwrap();
        assert_eq!(done.status, TransactionStatus::Completed);
        assert_eq!(harness.handle.available_balance().await.unwrap(), dec(70));
    }

    #[tokio::test]
    async fn test_receive_transfer_accepts_valid_payload() {
        let issuer = KeyPair::generate();
        let sender = spawn_harness_as("wallet-a", issuer.clone());
        let receiver = spawn_harness_as("wallet-b", issuer);

        let tokens = issue_tokens(&sender, &[50]);
        sender.handle.accept_purchased_tokens(tokens).await.unwrap();

        let (tx, funding) = sender
            .handle
            .initiate_transfer(WalletId::new("wallet-b"), dec(20))
            .await
            .unwrap();
        let sender_key = sender.handle.state().await.unwrap().public_key;
        let payload = TransferPayload {
            transaction: tx.clone(),
            tokens: funding,
            sender_public_key: sender_key,
        };

        let recorded = receiver.handle.receive_transfer(payload).await.unwrap();
        assert_eq!(recorded.status, TransactionStatus::Completed);
        assert!(recorded.receiver_signature.is_some());
        assert_eq!(receiver.handle.available_balance().await.unwrap(), dec(20));

        // Sender finalizes independently and loses exactly the payment
        sender.handle.complete_transaction(tx.id).await.unwrap();
        assert_eq!(sender.handle.available_balance().await.unwrap(), dec(30));
    }

    #[tokio::test]
    async fn test_receive_transfer_rejects_replay() {
        let issuer = KeyPair::generate();
        let sender = spawn_harness_as("wallet-a", issuer.clone());
        let receiver = spawn_harness_as("wallet-b", issuer);

        let tokens = issue_tokens(&sender, &[50]);
        sender.handle.accept_purchased_tokens(tokens).await.unwrap();

        let (tx, funding) = sender
            .handle
            .initiate_transfer(WalletId::new("wallet-b"), dec(20))
            .await
            .unwrap();
        let sender_key = sender.handle.state().await.unwrap().public_key;
        let payload = TransferPayload {
            transaction: tx,
            tokens: funding,
            sender_public_key: sender_key,
        };

        receiver
            .handle
            .receive_transfer(payload.clone())
            .await
            .unwrap();
        let err = receiver.handle.receive_transfer(payload).await.unwrap_err();
        assert!(matches!(err, Error::DoubleSpending(_)));
        assert_eq!(receiver.handle.available_balance().await.unwrap(), dec(20));
    }

    #[tokio::test]
    async fn test_receive_transfer_rejects_tampered_amount() {
        let issuer = KeyPair::generate();
        let sender = spawn_harness_as("wallet-a", issuer.clone());
        let receiver = spawn_harness_as("wallet-b", issuer);

        let tokens = issue_tokens(&sender, &[50]);
        sender.handle.accept_purchased_tokens(tokens).await.unwrap();

        let (mut tx, funding) = sender
            .handle
            .initiate_transfer(WalletId::new("wallet-b"), dec(20))
            .await
            .unwrap();
        tx.amount = dec(40);
        let sender_key = sender.handle.state().await.unwrap().public_key;
        let payload = TransferPayload {
            transaction: tx,
            tokens: funding,
            sender_public_key: sender_key,
        };

        let err = receiver.handle.receive_transfer(payload).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSignature(_)));
        assert_eq!(receiver.handle.available_balance().await.unwrap(), dec(0));
    }

    #[tokio::test]
    async fn test_cancel_removes_queued_submission() {
        let harness = spawn_harness();
        let tokens = issue_tokens(&harness, &[100]);
        harness
            .handle
            .accept_purchased_tokens(tokens)
            .await
            .unwrap();

        let (tx, _funding) = harness
            .handle
            .initiate_transfer(WalletId::new("wallet-b"), dec(10))
            .await
            .unwrap();
        harness
            .handle
            .enqueue(SyncJob::TransactionSubmission {
                transaction: tx.clone(),
            })
            .await
            .unwrap();
        assert!(harness.handle.queue_peek().await.unwrap().is_some());

        let cancelled = harness.handle.cancel_transaction(tx.id).await.unwrap();
        assert_eq!(cancelled.status, TransactionStatus::Cancelled);
        assert!(harness.handle.queue_peek().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finalize_redemption_spends_and_credits() {
        let harness = spawn_harness();
        let tokens = issue_tokens(&harness, &[40, 10]);
        harness
            .handle
            .accept_purchased_tokens(tokens)
            .await
            .unwrap();

        let redeemable = harness.handle.redeemable_tokens().await.unwrap();
        assert_eq!(redeemable.len(), 2);

        let receipt = RedemptionReceipt {
            receipt_id: Uuid::now_v7(),
            total_amount: dec(50),
            token_ids: redeemable.iter().map(|t| t.id).collect(),
            redeemed_at: Utc::now(),
        };
        let tx = harness.handle.finalize_redemption(receipt).await.unwrap();
        assert_eq!(tx.tx_type, TransactionType::TokenRedemption);

        assert_eq!(harness.handle.available_balance().await.unwrap(), dec(0));
        let state = harness.handle.state().await.unwrap();
        assert_eq!(state.blockchain_balance, dec(50));
    }

    #[tokio::test]
    async fn test_finalize_redemption_rejects_tokens_spent_in_flight() {
        let harness = spawn_harness();
        let tokens = issue_tokens(&harness, &[100]);
        harness
            .handle
            .accept_purchased_tokens(tokens)
            .await
            .unwrap();

        // A transfer completes while the redemption receipt is in flight,
        // spending part of the set the receipt names
        let (tx, funding) = harness
            .handle
            .initiate_transfer(WalletId::new("wallet-b"), dec(30))
            .await
            .unwrap();
        harness.handle.complete_transaction(tx.id).await.unwrap();

        let receipt = RedemptionReceipt {
            receipt_id: Uuid::now_v7(),
            total_amount: dec(30),
            token_ids: funding.iter().map(|t| t.id).collect(),
            redeemed_at: Utc::now(),
        };
        let err = harness
            .handle
            .finalize_redemption(receipt)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DoubleSpending(_)));

        // Nothing was credited and the remaining change is still spendable
        assert_eq!(harness.handle.available_balance().await.unwrap(), dec(70));
        let state = harness.handle.state().await.unwrap();
        assert_eq!(state.blockchain_balance, dec(0));
    }

    #[tokio::test]
    async fn test_accept_purchased_reports_bad_tokens_as_purchase_failure() {
        use crate::types::Signature;
        let harness = spawn_harness();

        let rogue = KeyPair::generate();
        let mut token = OfflineToken {
            id: Uuid::now_v7(),
            amount: dec(25),
            issuer: "issuer".to_string(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(30),
            is_spent: false,
            spent_at: None,
            divisions: vec![],
            signature: Signature::from_bytes([0u8; 64]),
        };
        token.signature = rogue.sign(&token.canonical_bytes());

        let err = harness
            .handle
            .accept_purchased_tokens(vec![token])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PurchaseFailed(_)));
        assert_eq!(harness.handle.available_balance().await.unwrap(), dec(0));
    }

    #[tokio::test]
    async fn test_duplicate_transfer_rejected_at_initiation() {
        let harness = spawn_harness();
        let tokens = issue_tokens(&harness, &[100]);
        harness
            .handle
            .accept_purchased_tokens(tokens)
            .await
            .unwrap();

        let (first, _funding) = harness
            .handle
            .initiate_transfer(WalletId::new("wallet-b"), dec(20))
            .await
            .unwrap();

        // Same receiver and amount while the first is still pending: the
        // duplicate must fail before any payload exists to deliver
        let err = harness
            .handle
            .initiate_transfer(WalletId::new("wallet-b"), dec(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DoubleSpending(_)));

        let txs = harness.handle.list_transactions().await.unwrap();
        let failed = txs
            .iter()
            .filter(|t| t.status == TransactionStatus::Failed)
            .count();
        assert_eq!(failed, 1);

        // The original is unaffected and still completes
        harness.handle.complete_transaction(first.id).await.unwrap();
        assert_eq!(harness.handle.available_balance().await.unwrap(), dec(80));
    }

    #[tokio::test]
    async fn test_tick_sweeps_expired_tokens() {
        use crate::types::Signature;
        let harness = spawn_harness();

        let mut token = OfflineToken {
            id: Uuid::now_v7(),
            amount: dec(5),
            issuer: "issuer".to_string(),
            issued_at: Utc::now() - chrono::Duration::days(60),
            expires_at: Utc::now() - chrono::Duration::days(30),
            is_spent: false,
            spent_at: None,
            divisions: vec![],
            signature: Signature::from_bytes([0u8; 64]),
        };
        token.signature = harness.issuer.sign(&token.canonical_bytes());
        harness.storage.put_token(&token).unwrap();

        harness.handle.tick();
        // The mailbox is FIFO, so the tick has run once this resolves
        assert_eq!(harness.handle.available_balance().await.unwrap(), dec(0));
        assert!(!harness.storage.has_token(token.id).unwrap());
        assert!(harness.handle.sweep_expired().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_mailbox() {
        let harness = spawn_harness();
        harness.handle.shutdown().await;

        // Give the actor a moment to drain
        tokio::task::yield_now().await;
        let err = harness.handle.available_balance().await.unwrap_err();
        assert!(matches!(err, Error::Concurrency(_)));
    }
}
