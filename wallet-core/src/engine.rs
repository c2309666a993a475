//! Transaction engine: lifecycle of value-transfer records
//!
//! State machine: `Pending -> {Completed, Failed, Cancelled}`. Signing is a
//! step inside `Pending`, not a persisted status. The engine keeps two facts
//! consistent that must never diverge: a transaction reaching `Completed`
//! and its funding tokens being marked spent — both land in one atomic
//! storage batch or neither does.

use crate::{
    config::EngineConfig,
    crypto::KeyPair,
    error::{Error, Result},
    ledger::{select_funding, TokenLedger},
    storage::{Storage, WalletBatch},
    types::{Transaction, TransactionStatus, TransactionType, WalletId},
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// The wallet's transaction engine
pub struct TransactionEngine {
    storage: Arc<Storage>,
    config: EngineConfig,
}

impl TransactionEngine {
    /// Create an engine over the given storage
    pub fn new(storage: Arc<Storage>, config: EngineConfig) -> Self {
        Self { storage, config }
    }

    /// Create a pending transaction funded by the ledger.
    ///
    /// Sweeps expired tokens first, selects funding (dividing a token for
    /// the remainder when needed), and persists the transaction before
    /// returning so a crash after this point leaves a retryable or
    /// cancellable record rather than silently losing the transfer.
    pub fn initiate(
        &self,
        ledger: &mut TokenLedger,
        receiver: WalletId,
        amount: Decimal,
        tx_type: TransactionType,
    ) -> Result<Transaction> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "Amount must be positive, got {}",
                amount
            )));
        }

        let sender = ledger.wallet_id().clone();
        if receiver.is_empty() {
            return Err(Error::InvalidRecipient("Recipient is empty".to_string()));
        }
        if receiver == sender {
            return Err(Error::InvalidRecipient(
                "Recipient equals sender".to_string(),
            ));
        }

        // Opportunistic cleanup before any spend attempt
        ledger.sweep_expired()?;

        let available = ledger.available_balance()?;
        if available < amount {
            return Err(Error::InsufficientBalance {
                available,
                requested: amount,
            });
        }

        let candidates = ledger.spendable_tokens()?;
        let plan = select_funding(&candidates, amount, self.config.selection_strategy)?;

        let mut token_ids = Vec::with_capacity(plan.whole_tokens.len() + 1);
        for token_id in plan.whole_tokens {
            let token = self.storage.get_token(token_id)?;
            if ledger.is_peer_verifiable(&token) {
                token_ids.push(token_id);
            } else {
                // Receivers verify against the issuer's key and the
                // sender's; funding signed by a third wallet is re-minted
                // as this wallet's own child first.
                let division = ledger.divide(token_id, token.amount)?;
                token_ids.push(division.payment.id);
            }
        }
        if let Some((token_id, divide_amount)) = plan.divide {
            let division = ledger.divide(token_id, divide_amount)?;
            token_ids.push(division.payment.id);
        }

        let tx = Transaction {
            id: Uuid::now_v7(),
            tx_type,
            sender,
            receiver,
            amount,
            timestamp: Utc::now(),
            status: TransactionStatus::Pending,
            token_ids,
            sender_signature: None,
            receiver_signature: None,
            metadata: HashMap::new(),
        };

        self.storage.put_transaction(&tx)?;

        tracing::debug!(tx_id = %tx.id, amount = %tx.amount, "Transaction initiated");
        Ok(tx)
    }

    /// Sign a transaction with the sender's key and persist the signature
    pub fn sign(&self, mut tx: Transaction, keypair: &KeyPair) -> Result<Transaction> {
        tx.sender_signature = Some(keypair.sign(&tx.canonical_bytes()));
        self.storage.put_transaction(&tx)?;
        Ok(tx)
    }

    /// Re-validate a transaction, raising the specific error kind so
    /// callers can distinguish user error from fraud.
    pub fn verify(&self, ledger: &TokenLedger, tx: &Transaction) -> Result<()> {
        if tx.amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "Amount must be positive, got {}",
                tx.amount
            )));
        }

        if tx.sender.is_empty() || tx.receiver.is_empty() || tx.sender == tx.receiver {
            return Err(Error::InvalidTransaction(
                "Sender and receiver must be distinct, non-empty identities".to_string(),
            ));
        }

        let consumes_tokens = matches!(
            tx.tx_type,
            TransactionType::OfflineTransfer
                | TransactionType::OnlineTransfer
                | TransactionType::TokenRedemption
        );
        if consumes_tokens && tx.token_ids.is_empty() {
            return Err(Error::InvalidTransaction(
                "Transfer references no funding tokens".to_string(),
            ));
        }

        for token_id in &tx.token_ids {
            if !self.storage.has_token(*token_id)? {
                return Err(Error::TokenNotOwned(token_id.to_string()));
            }
            let token = self.storage.get_token(*token_id)?;
            if token.is_spent {
                return Err(Error::DoubleSpending(format!(
                    "Token {} is already spent",
                    token_id
                )));
            }
        }

        let sender_key = ledger
            .verifying_key(tx.sender.as_str())
            .ok_or_else(|| Error::InvalidSignature(format!("Unknown sender {}", tx.sender)))?;
        if !tx.verify_sender_signature(sender_key) {
            return Err(Error::InvalidSignature(format!(
                "Sender signature does not verify for transaction {}",
                tx.id
            )));
        }

        Ok(())
    }

    /// Double-spend check: true if any referenced token is already spent,
    /// or a duplicate submission with the same (sender, receiver, amount)
    /// exists in a pending or completed state within the guard window.
    ///
    /// Must run before tokens are marked spent and before finalization.
    pub fn check_double_spending(&self, tx: &Transaction) -> Result<bool> {
        for token_id in &tx.token_ids {
            if self.storage.has_token(*token_id)? && self.storage.get_token(*token_id)?.is_spent {
                return Ok(true);
            }
        }

        let window = Duration::seconds(self.config.duplicate_window_secs);
        for other in self.storage.list_transactions()? {
            if other.id == tx.id {
                continue;
            }
            if !matches!(
                other.status,
                TransactionStatus::Pending | TransactionStatus::Completed
            ) {
                continue;
            }
            if other.sender == tx.sender
                && other.receiver == tx.receiver
                && other.amount == tx.amount
                && (tx.timestamp - other.timestamp).abs() <= window
            {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Apply a state transition, enforcing the transition table.
    ///
    /// Transitioning to `Completed` on a sender-side transaction atomically
    /// marks every funding token spent; if that commit fails nothing is
    /// written and the error surfaces as `ProcessingFailed`. Received
    /// transactions (purchases, inbound transfers) record completion
    /// without consuming the named tokens — those are incoming funds.
    pub fn update_state(
        &self,
        ledger: &mut TokenLedger,
        tx_id: Uuid,
        new_status: TransactionStatus,
    ) -> Result<Transaction> {
        let mut tx = self.storage.get_transaction(tx_id)?;

        if !tx.status.can_transition_to(new_status) {
            return Err(Error::InvalidTransaction(format!(
                "Illegal transition {:?} -> {:?} for transaction {}",
                tx.status, new_status, tx_id
            )));
        }

        if new_status != TransactionStatus::Completed {
            tx.status = new_status;
            self.storage.put_transaction(&tx)?;
            return Ok(tx);
        }

        if self.check_double_spending(&tx)? {
            tracing::warn!(tx_id = %tx.id, "Double spending detected during finalization");
            return Err(Error::DoubleSpending(format!(
                "Transaction {} references spent tokens or duplicates a recent submission",
                tx.id
            )));
        }

        tx.status = TransactionStatus::Completed;

        if tx.sender != *ledger.wallet_id() {
            self.storage.put_transaction(&tx)?;
            return Ok(tx);
        }

        // Sender side: spend the funding tokens and the transaction record
        // in one atomic batch, with the wallet balance derived from the
        // same view.
        let now = Utc::now();
        let mut spent_sum = Decimal::ZERO;
        let mut put_tokens = Vec::with_capacity(tx.token_ids.len());
        for token_id in &tx.token_ids {
            let mut token = self.storage.get_token(*token_id).map_err(|_| {
                Error::ProcessingFailed(format!(
                    "Funding token {} missing during finalization",
                    token_id
                ))
            })?;
            spent_sum += token.amount;
            token.is_spent = true;
            token.spent_at = Some(now);
            put_tokens.push(token);
        }

        let mut batch = WalletBatch {
            put_tokens,
            put_transactions: vec![tx.clone()],
            ..Default::default()
        };
        if let Some(mut state) = self.storage.get_wallet_state()? {
            state.offline_balance = ledger.available_balance()? - spent_sum;
            batch.wallet_state = Some(state);
        }

        self.storage
            .apply_batch(batch)
            .map_err(|e| Error::ProcessingFailed(format!("Finalization commit failed: {}", e)))?;
        ledger.invalidate_cache();

        tracing::info!(
            tx_id = %tx.id,
            amount = %tx.amount,
            tokens = tx.token_ids.len(),
            "Transaction completed"
        );
        Ok(tx)
    }

    /// Move a pending transaction to `Failed`, recording the error for
    /// diagnostics. Tokens are not marked spent and remain usable for a
    /// retry.
    pub fn handle_failed(&self, tx_id: Uuid, error_message: &str) -> Result<Transaction> {
        let mut tx = self.storage.get_transaction(tx_id)?;

        if !tx.status.can_transition_to(TransactionStatus::Failed) {
            return Err(Error::InvalidTransaction(format!(
                "Cannot fail transaction {} in state {:?}",
                tx_id, tx.status
            )));
        }

        tx.status = TransactionStatus::Failed;
        tx.metadata
            .insert("error".to_string(), error_message.to_string());
        self.storage.put_transaction(&tx)?;

        tracing::warn!(tx_id = %tx.id, error = error_message, "Transaction failed");
        Ok(tx)
    }

    /// Reset a failed transaction to `Pending` for another attempt.
    ///
    /// The only path out of a terminal state, deliberately not part of the
    /// general transition table. Clears the recorded error; the caller
    /// re-enters the normal flow from `sign`.
    pub fn retry_failed(&self, tx_id: Uuid) -> Result<Transaction> {
        let mut tx = self.storage.get_transaction(tx_id)?;

        if tx.status != TransactionStatus::Failed {
            return Err(Error::InvalidTransaction(format!(
                "Only failed transactions can be retried, {} is {:?}",
                tx_id, tx.status
            )));
        }

        tx.status = TransactionStatus::Pending;
        tx.metadata.remove("error");
        self.storage.put_transaction(&tx)?;

        tracing::info!(tx_id = %tx.id, "Transaction queued for retry");
        Ok(tx)
    }

    /// Cancel a pending transaction (user abort). Tokens remain unspent.
    pub fn cancel(&self, tx_id: Uuid) -> Result<Transaction> {
        let mut tx = self.storage.get_transaction(tx_id)?;

        if !tx.status.can_transition_to(TransactionStatus::Cancelled) {
            return Err(Error::InvalidTransaction(format!(
                "Cannot cancel transaction {} in state {:?}",
                tx_id, tx.status
            )));
        }

        tx.status = TransactionStatus::Cancelled;
        self.storage.put_transaction(&tx)?;

        tracing::info!(tx_id = %tx.id, "Transaction cancelled");
        Ok(tx)
    }
}
