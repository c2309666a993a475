//! Offline-first value transfer wallet
//!
//! Holds issuer-signed bearer tokens in local storage, transfers them
//! peer-to-peer without connectivity, and reconciles with the issuer's
//! backend through a durable sync queue once a connection returns.
//!
//! Architecture:
//! - `ledger`: token custody — validation, division, spend marking, expiry
//! - `engine`: transaction lifecycle and the double-spend guard
//! - `queue`: durable FIFO of deferred network work
//! - `actor`: single task serializing all state changes
//! - `wallet`: façade wiring the actor to the issuer and the transport
//! - `storage`: RocksDB persistence with atomic multi-record commits
//! - `crypto`: Ed25519 signing and the device key-store seam
//! - `issuer`: the issuer backend seam plus a local implementation

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod actor;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod issuer;
pub mod ledger;
pub mod metrics;
pub mod queue;
pub mod storage;
pub mod types;
pub mod wallet;

pub use config::Config;
pub use crypto::{KeyPair, KeyStore, MemoryKeyStore};
pub use error::{Error, Result};
pub use issuer::{IssuerClient, LocalIssuer};
pub use types::{
    OfflineToken, SyncJob, Transaction, TransactionStatus, TransactionType, TransferPayload,
    WalletId, WalletState,
};
pub use wallet::{LocalTransport, PurchaseOutcome, RedeemOutcome, Transport, Wallet};
