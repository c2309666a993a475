//! Error types for the wallet core

use thiserror::Error;

/// Result type for wallet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wallet errors
#[derive(Error, Debug)]
pub enum Error {
    /// Amount is zero, negative, or outside configured bounds
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Recipient is empty or equals the sender
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Not enough unspent, valid tokens to cover the amount
    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        /// Spendable balance at the time of the request
        available: rust_decimal::Decimal,
        /// Amount the caller asked for
        requested: rust_decimal::Decimal,
    },

    /// Wallet state has not been created yet
    #[error("Wallet not initialized")]
    WalletNotInitialized,

    /// Token failed validation (expired, spent, or bad signature)
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Transaction is structurally malformed
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Signature verification failed
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// A referenced token was already spent, or a duplicate submission
    #[error("Double spending detected: {0}")]
    DoubleSpending(String),

    /// A referenced token is not in this wallet's ledger
    #[error("Token not owned: {0}")]
    TokenNotOwned(String),

    /// Token not found
    #[error("Token not found: {0}")]
    TokenNotFound(String),

    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// Unexpected internal fault during a state transition
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    /// Issuer or network fault (retryable via the sync queue)
    #[error("Sync failed: {0}")]
    SyncFailed(String),

    /// Issuer purchase failed or returned unverifiable tokens
    #[error("Purchase failed: {0}")]
    PurchaseFailed(String),

    /// Redemption set contained no valid, unspent tokens
    #[error("No valid tokens to redeem")]
    NoValidTokens,

    /// No connectivity to the issuer (distinct from server rejection)
    #[error("Issuer unreachable: offline")]
    Offline,

    /// Key material is malformed or missing
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the sync queue should retry the operation later.
    ///
    /// Transient faults leave the job at the head of the queue; everything
    /// else is a permanent failure and the job is dropped with a report.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Offline | Error::SyncFailed(_))
    }

    /// Whether this is an integrity violation worth logging as a
    /// security-relevant event.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Error::DoubleSpending(_) | Error::InvalidSignature(_) | Error::TokenNotOwned(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Offline.is_transient());
        assert!(Error::SyncFailed("timeout".to_string()).is_transient());
        assert!(!Error::PurchaseFailed("rejected".to_string()).is_transient());
        assert!(!Error::InvalidAmount("zero".to_string()).is_transient());
    }

    #[test]
    fn test_integrity_classification() {
        assert!(Error::DoubleSpending("token reuse".to_string()).is_integrity());
        assert!(Error::InvalidSignature("bad sig".to_string()).is_integrity());
        assert!(!Error::Offline.is_integrity());
    }
}
