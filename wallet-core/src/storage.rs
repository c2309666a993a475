//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `tokens` - Offline token set (key: token_id)
//! - `transactions` - Transaction log (key: transaction_id)
//! - `wallet` - Wallet state singleton (key: "state")
//! - `queue` - Sync queue, one key rewritten wholesale per mutation
//!
//! Token set, transaction log, wallet state, and sync queue are each
//! independently recoverable; any mutation that affects balance commits the
//! token set, transaction log, and wallet state in a single `WriteBatch` so
//! the balance never drifts from the token set it is computed from.

use crate::{
    error::{Error, Result},
    types::{OfflineToken, SyncJob, Transaction, TransactionStatus, WalletState},
    Config,
};
use chrono::Utc;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_TOKENS: &str = "tokens";
const CF_TRANSACTIONS: &str = "transactions";
const CF_WALLET: &str = "wallet";
const CF_QUEUE: &str = "queue";

/// Wallet state key within the wallet column family
const WALLET_STATE_KEY: &[u8] = b"state";

/// Sync queue key within the queue column family
const QUEUE_KEY: &[u8] = b"sync_queue";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
}

/// A set of mutations committed atomically.
///
/// Everything in one batch lands together or not at all; this is the
/// mechanism behind "one logical transaction" for spends, purchases,
/// redemptions, and the expiry sweep.
#[derive(Debug, Default)]
pub struct WalletBatch {
    /// Tokens to insert or overwrite
    pub put_tokens: Vec<OfflineToken>,

    /// Tokens to remove (expiry sweep)
    pub delete_tokens: Vec<Uuid>,

    /// Transactions to insert or overwrite
    pub put_transactions: Vec<Transaction>,

    /// Updated wallet state, if the mutation affects it
    pub wallet_state: Option<WalletState>,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_TOKENS, Options::default()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Options::default()),
            ColumnFamilyDescriptor::new(CF_WALLET, Options::default()),
            ColumnFamilyDescriptor::new(CF_QUEUE, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!("Opened wallet store at {:?}", path);

        Ok(Self { db: Arc::new(db) })
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Token operations

    /// Insert or overwrite a token
    pub fn put_token(&self, token: &OfflineToken) -> Result<()> {
        let cf = self.cf_handle(CF_TOKENS)?;
        let value = bincode::serialize(token)?;
        self.db.put_cf(cf, token.id.as_bytes(), &value)?;
        Ok(())
    }

    /// Get token by ID
    pub fn get_token(&self, token_id: Uuid) -> Result<OfflineToken> {
        let cf = self.cf_handle(CF_TOKENS)?;
        let value = self
            .db
            .get_cf(cf, token_id.as_bytes())?
            .ok_or_else(|| Error::TokenNotFound(token_id.to_string()))?;

        Ok(bincode::deserialize(&value)?)
    }

    /// Whether a token exists in the ledger
    pub fn has_token(&self, token_id: Uuid) -> Result<bool> {
        let cf = self.cf_handle(CF_TOKENS)?;
        Ok(self.db.get_cf(cf, token_id.as_bytes())?.is_some())
    }

    /// List all tokens
    pub fn list_tokens(&self) -> Result<Vec<OfflineToken>> {
        let cf = self.cf_handle(CF_TOKENS)?;
        let iter = self.db.iterator_cf(cf, IteratorMode::Start);

        let mut tokens = Vec::new();
        for item in iter {
            let (_, value) = item?;
            tokens.push(bincode::deserialize(&value)?);
        }

        Ok(tokens)
    }

    // Transaction operations

    /// Insert or overwrite a transaction
    pub fn put_transaction(&self, tx: &Transaction) -> Result<()> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let value = bincode::serialize(tx)?;
        self.db.put_cf(cf, tx.id.as_bytes(), &value)?;
        Ok(())
    }

    /// Get transaction by ID
    pub fn get_transaction(&self, tx_id: Uuid) -> Result<Transaction> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let value = self
            .db
            .get_cf(cf, tx_id.as_bytes())?
            .ok_or_else(|| Error::TransactionNotFound(tx_id.to_string()))?;

        Ok(bincode::deserialize(&value)?)
    }

    /// List all transactions
    pub fn list_transactions(&self) -> Result<Vec<Transaction>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let iter = self.db.iterator_cf(cf, IteratorMode::Start);

        let mut txs = Vec::new();
        for item in iter {
            let (_, value) = item?;
            txs.push(bincode::deserialize(&value)?);
        }

        Ok(txs)
    }

    // Wallet state operations

    /// Persist the wallet state
    pub fn put_wallet_state(&self, state: &WalletState) -> Result<()> {
        let cf = self.cf_handle(CF_WALLET)?;
        let value = bincode::serialize(state)?;
        self.db.put_cf(cf, WALLET_STATE_KEY, &value)?;
        Ok(())
    }

    /// Load the wallet state; `None` on a fresh store
    pub fn get_wallet_state(&self) -> Result<Option<WalletState>> {
        let cf = self.cf_handle(CF_WALLET)?;
        match self.db.get_cf(cf, WALLET_STATE_KEY)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // Sync queue operations

    /// Persist the entire queue.
    ///
    /// The on-disk representation is rewritten fully on each mutation, not
    /// incrementally mutated, so a crash can never leave a half-written
    /// queue behind.
    pub fn store_queue(&self, jobs: &[SyncJob]) -> Result<()> {
        let cf = self.cf_handle(CF_QUEUE)?;
        let value = bincode::serialize(jobs)?;
        self.db.put_cf(cf, QUEUE_KEY, &value)?;
        Ok(())
    }

    /// Load the persisted queue; empty on a fresh store
    pub fn load_queue(&self) -> Result<Vec<SyncJob>> {
        let cf = self.cf_handle(CF_QUEUE)?;
        match self.db.get_cf(cf, QUEUE_KEY)? {
            Some(value) => Ok(bincode::deserialize(&value)?),
            None => Ok(Vec::new()),
        }
    }

    // Atomic multi-key commits

    /// Apply a set of mutations in one atomic write
    pub fn apply_batch(&self, changes: WalletBatch) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_tokens = self.cf_handle(CF_TOKENS)?;
        for token in &changes.put_tokens {
            batch.put_cf(cf_tokens, token.id.as_bytes(), bincode::serialize(token)?);
        }
        for token_id in &changes.delete_tokens {
            batch.delete_cf(cf_tokens, token_id.as_bytes());
        }

        let cf_txs = self.cf_handle(CF_TRANSACTIONS)?;
        for tx in &changes.put_transactions {
            batch.put_cf(cf_txs, tx.id.as_bytes(), bincode::serialize(tx)?);
        }

        if let Some(state) = &changes.wallet_state {
            let cf_wallet = self.cf_handle(CF_WALLET)?;
            batch.put_cf(cf_wallet, WALLET_STATE_KEY, bincode::serialize(state)?);
        }

        self.db.write(batch)?;
        Ok(())
    }

    // Statistics

    /// Count unspent and spent tokens
    pub fn token_counts(&self) -> Result<(u64, u64)> {
        let mut unspent = 0u64;
        let mut spent = 0u64;

        for token in self.list_tokens()? {
            if token.is_spent {
                spent += 1;
            } else {
                unspent += 1;
            }
        }

        Ok((unspent, spent))
    }

    /// Startup reconciliation: repair spent-flags against the transaction
    /// log, which is authoritative.
    ///
    /// A crash between finalizing a transaction and any later read must not
    /// leave a token referenced by a `Completed` transaction looking
    /// unspent. Only sender-side transactions consume tokens; tokens named
    /// by a completed purchase or inbound transfer are received funds and
    /// stay unspent. Returns the number of repaired tokens.
    pub fn reconcile(&self) -> Result<usize> {
        let state = match self.get_wallet_state()? {
            Some(state) => state,
            None => return Ok(0), // fresh store, nothing to repair
        };

        let mut repaired = 0usize;
        let mut batch = WalletBatch::default();

        for tx in self.list_transactions()? {
            if tx.status != TransactionStatus::Completed || tx.sender != state.wallet_id {
                continue;
            }

            for token_id in &tx.token_ids {
                // Tokens held by the counterparty are legitimately absent.
                if !self.has_token(*token_id)? {
                    continue;
                }

                let mut token = self.get_token(*token_id)?;
                if !token.is_spent {
                    tracing::warn!(
                        token_id = %token_id,
                        tx_id = %tx.id,
                        "Reconciliation: marking token spent per completed transaction"
                    );
                    token.is_spent = true;
                    token.spent_at = Some(tx.timestamp);
                    batch.put_tokens.push(token);
                    repaired += 1;
                }
            }
        }

        if repaired > 0 {
            // Balance is derived from the token set; recompute it from the
            // repaired view before committing.
            if let Some(mut state) = self.get_wallet_state()? {
                let now = Utc::now();
                let repaired_ids: std::collections::HashSet<Uuid> =
                    batch.put_tokens.iter().map(|t| t.id).collect();

                state.offline_balance = self
                    .list_tokens()?
                    .into_iter()
                    .filter(|t| !t.is_spent && !t.is_expired(now) && !repaired_ids.contains(&t.id))
                    .map(|t| t.amount)
                    .sum();
                batch.wallet_state = Some(state);
            }

            self.apply_batch(batch)?;
        }

        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Signature, TransactionType, WalletId};
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn test_token(amount: Decimal) -> OfflineToken {
        OfflineToken {
            id: Uuid::now_v7(),
            amount,
            issuer: "issuer".to_string(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(30),
            is_spent: false,
            spent_at: None,
            divisions: vec![],
            signature: Signature::from_bytes([0u8; 64]),
        }
    }

    fn test_transaction(token_ids: Vec<Uuid>, status: TransactionStatus) -> Transaction {
        Transaction {
            id: Uuid::now_v7(),
            tx_type: TransactionType::OfflineTransfer,
            sender: WalletId::new("wallet-a"),
            receiver: WalletId::new("wallet-b"),
            amount: Decimal::new(1000, 2),
            timestamp: Utc::now(),
            status,
            token_ids,
            sender_signature: None,
            receiver_signature: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_token_roundtrip() {
        let (storage, _temp) = test_storage();

        let token = test_token(Decimal::new(5000, 2));
        storage.put_token(&token).unwrap();

        let retrieved = storage.get_token(token.id).unwrap();
        assert_eq!(retrieved.id, token.id);
        assert_eq!(retrieved.amount, token.amount);

        assert!(matches!(
            storage.get_token(Uuid::now_v7()),
            Err(Error::TokenNotFound(_))
        ));
    }

    #[test]
    fn test_transaction_roundtrip() {
        let (storage, _temp) = test_storage();

        let tx = test_transaction(vec![Uuid::now_v7()], TransactionStatus::Pending);
        storage.put_transaction(&tx).unwrap();

        let retrieved = storage.get_transaction(tx.id).unwrap();
        assert_eq!(retrieved.id, tx.id);
        assert_eq!(retrieved.status, TransactionStatus::Pending);
    }

    #[test]
    fn test_queue_wholesale_rewrite() {
        let (storage, _temp) = test_storage();

        assert!(storage.load_queue().unwrap().is_empty());

        let jobs = vec![
            SyncJob::TokenPurchase {
                amount: Decimal::new(10000, 2),
            },
            SyncJob::BalanceUpdate {
                wallet_id: WalletId::new("wallet-a"),
            },
        ];
        storage.store_queue(&jobs).unwrap();
        assert_eq!(storage.load_queue().unwrap().len(), 2);

        storage.store_queue(&jobs[1..]).unwrap();
        let remaining = storage.load_queue().unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(matches!(remaining[0], SyncJob::BalanceUpdate { .. }));
    }

    #[test]
    fn test_apply_batch_atomic() {
        let (storage, _temp) = test_storage();

        let mut token = test_token(Decimal::new(3000, 2));
        let expired = test_token(Decimal::new(1000, 2));
        storage.put_token(&token).unwrap();
        storage.put_token(&expired).unwrap();

        token.is_spent = true;
        token.spent_at = Some(Utc::now());
        let tx = test_transaction(vec![token.id], TransactionStatus::Completed);

        storage
            .apply_batch(WalletBatch {
                put_tokens: vec![token.clone()],
                delete_tokens: vec![expired.id],
                put_transactions: vec![tx.clone()],
                wallet_state: None,
            })
            .unwrap();

        assert!(storage.get_token(token.id).unwrap().is_spent);
        assert!(!storage.has_token(expired.id).unwrap());
        assert_eq!(
            storage.get_transaction(tx.id).unwrap().status,
            TransactionStatus::Completed
        );
    }

    #[test]
    fn test_token_counts() {
        let (storage, _temp) = test_storage();

        let mut spent = test_token(Decimal::new(100, 2));
        spent.is_spent = true;
        storage.put_token(&spent).unwrap();
        storage.put_token(&test_token(Decimal::new(200, 2))).unwrap();
        storage.put_token(&test_token(Decimal::new(300, 2))).unwrap();

        assert_eq!(storage.token_counts().unwrap(), (2, 1));
    }

    #[test]
    fn test_reconcile_repairs_unspent_completed_tokens() {
        let (storage, _temp) = test_storage();

        storage
            .put_wallet_state(&crate::types::WalletState::new(
                WalletId::new("wallet-a"),
                [0u8; 32],
            ))
            .unwrap();

        let token = test_token(Decimal::new(4000, 2));
        storage.put_token(&token).unwrap();

        // Completed transaction referencing the token, but the spent flag
        // never landed (simulated crash between writes).
        let tx = test_transaction(vec![token.id], TransactionStatus::Completed);
        storage.put_transaction(&tx).unwrap();

        let repaired = storage.reconcile().unwrap();
        assert_eq!(repaired, 1);
        assert!(storage.get_token(token.id).unwrap().is_spent);

        // Second pass finds nothing to repair.
        assert_eq!(storage.reconcile().unwrap(), 0);
    }

    #[test]
    fn test_reconcile_leaves_received_tokens_unspent() {
        let (storage, _temp) = test_storage();

        storage
            .put_wallet_state(&crate::types::WalletState::new(
                WalletId::new("wallet-b"),
                [0u8; 32],
            ))
            .unwrap();

        // We are the receiver here; the referenced tokens are incoming
        // funds, not consumed funding.
        let token = test_token(Decimal::new(4000, 2));
        storage.put_token(&token).unwrap();
        let tx = test_transaction(vec![token.id], TransactionStatus::Completed);
        storage.put_transaction(&tx).unwrap();

        assert_eq!(storage.reconcile().unwrap(), 0);
        assert!(!storage.get_token(token.id).unwrap().is_spent);
    }
}
