//! Durable FIFO queue of deferred network work
//!
//! Jobs accumulate while the wallet is offline and drain in order once
//! connectivity returns. The whole queue is persisted as one value on every
//! mutation; at wallet scale (tens of jobs) a wholesale rewrite is cheaper
//! and simpler than per-entry keys, and it makes the on-disk order the
//! in-memory order by construction.

use crate::{
    error::Result,
    storage::Storage,
    types::SyncJob,
};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

/// FIFO queue of pending sync jobs, mirrored to storage
pub struct SyncQueue {
    storage: Arc<Storage>,
    jobs: VecDeque<SyncJob>,
}

impl SyncQueue {
    /// Load the persisted queue from storage
    pub fn load(storage: Arc<Storage>) -> Result<Self> {
        let jobs = VecDeque::from(storage.load_queue()?);
        if !jobs.is_empty() {
            tracing::info!(depth = jobs.len(), "Restored sync queue");
        }
        Ok(Self { storage, jobs })
    }

    /// Append a job and persist
    pub fn enqueue(&mut self, job: SyncJob) -> Result<()> {
        tracing::debug!(job = ?job, "Enqueueing sync job");
        self.jobs.push_back(job);
        self.persist()
    }

    /// The job at the head, without removing it.
    ///
    /// Processing peeks, executes, and only pops on success so a crash
    /// mid-job leaves the job queued for the next pass.
    pub fn peek(&self) -> Option<&SyncJob> {
        self.jobs.front()
    }

    /// Remove the head job and persist
    pub fn pop(&mut self) -> Result<Option<SyncJob>> {
        let job = self.jobs.pop_front();
        if job.is_some() {
            self.persist()?;
        }
        Ok(job)
    }

    /// Drop any queued submission of the given transaction.
    ///
    /// Used when a transaction is cancelled before its submission job runs.
    pub fn remove_submission(&mut self, tx_id: Uuid) -> Result<bool> {
        let before = self.jobs.len();
        self.jobs.retain(|job| {
            !matches!(job, SyncJob::TransactionSubmission { transaction } if transaction.id == tx_id)
        });
        let removed = self.jobs.len() != before;
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Number of queued jobs
    pub fn depth(&self) -> usize {
        self.jobs.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn persist(&self) -> Result<()> {
        self.storage
            .store_queue(self.jobs.iter().cloned().collect::<Vec<_>>().as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Transaction, TransactionStatus, TransactionType, WalletId};
    use crate::Config;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn open_storage(temp: &TempDir) -> Arc<Storage> {
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        Arc::new(Storage::open(&config).unwrap())
    }

    fn submission(tx_id: Uuid) -> SyncJob {
        SyncJob::TransactionSubmission {
            transaction: Transaction {
                id: tx_id,
                tx_type: TransactionType::OfflineTransfer,
                sender: WalletId::new("wallet-a"),
                receiver: WalletId::new("wallet-b"),
                amount: Decimal::new(10_00, 2),
                timestamp: Utc::now(),
                status: TransactionStatus::Pending,
                token_ids: vec![],
                sender_signature: None,
                receiver_signature: None,
                metadata: HashMap::new(),
            },
        }
    }

    #[test]
    fn test_fifo_order() {
        let temp = TempDir::new().unwrap();
        let mut queue = SyncQueue::load(open_storage(&temp)).unwrap();

        queue
            .enqueue(SyncJob::TokenPurchase {
                amount: Decimal::new(50_00, 2),
            })
            .unwrap();
        queue
            .enqueue(SyncJob::BalanceUpdate {
                wallet_id: WalletId::new("wallet-a"),
            })
            .unwrap();
        queue.enqueue(SyncJob::TransactionSync).unwrap();

        assert_eq!(queue.depth(), 3);
        assert!(matches!(
            queue.pop().unwrap(),
            Some(SyncJob::TokenPurchase { .. })
        ));
        assert!(matches!(
            queue.pop().unwrap(),
            Some(SyncJob::BalanceUpdate { .. })
        ));
        assert!(matches!(queue.pop().unwrap(), Some(SyncJob::TransactionSync)));
        assert!(queue.pop().unwrap().is_none());
    }

    #[test]
    fn test_peek_does_not_remove() {
        let temp = TempDir::new().unwrap();
        let mut queue = SyncQueue::load(open_storage(&temp)).unwrap();

        queue.enqueue(SyncJob::TransactionSync).unwrap();
        assert!(queue.peek().is_some());
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn test_queue_survives_reopen_in_order() {
        let temp = TempDir::new().unwrap();

        {
            let mut queue = SyncQueue::load(open_storage(&temp)).unwrap();
            queue
                .enqueue(SyncJob::TokenPurchase {
                    amount: Decimal::new(25_00, 2),
                })
                .unwrap();
            queue.enqueue(SyncJob::TransactionSync).unwrap();
        }

        let mut queue = SyncQueue::load(open_storage(&temp)).unwrap();
        assert_eq!(queue.depth(), 2);
        assert!(matches!(
            queue.pop().unwrap(),
            Some(SyncJob::TokenPurchase { amount }) if amount == Decimal::new(25_00, 2)
        ));
        assert!(matches!(queue.pop().unwrap(), Some(SyncJob::TransactionSync)));
    }

    #[test]
    fn test_remove_submission() {
        let temp = TempDir::new().unwrap();
        let mut queue = SyncQueue::load(open_storage(&temp)).unwrap();

        let keep = Uuid::now_v7();
        let drop = Uuid::now_v7();
        queue.enqueue(submission(keep)).unwrap();
        queue.enqueue(submission(drop)).unwrap();

        assert!(queue.remove_submission(drop).unwrap());
        assert!(!queue.remove_submission(drop).unwrap());
        assert_eq!(queue.depth(), 1);
        assert!(matches!(
            queue.peek(),
            Some(SyncJob::TransactionSubmission { transaction }) if transaction.id == keep
        ));
    }
}
