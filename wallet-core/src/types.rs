//! Core types for the wallet
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Memory safety (no unsafe code)
//! - Exact arithmetic (Decimal for money)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Wallet identifier (device-bound identity string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalletId(String);

impl WalletId {
    /// Create new wallet ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identity string is usable as a transfer party
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Digital signature (Ed25519)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Signature bytes (64 bytes)
    #[serde(with = "serde_bytes")]
    bytes: [u8; 64],
}

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self { bytes }
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    /// Verify signature
    pub fn verify(&self, message: &[u8], public_key: &[u8; 32]) -> bool {
        use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};

        let signature = DalekSignature::from_bytes(&self.bytes);

        let verifying_key = match VerifyingKey::from_bytes(public_key) {
            Ok(key) => key,
            Err(_) => return false,
        };

        verifying_key.verify(message, &signature).is_ok()
    }
}

/// A bearer note representing a fixed amount, signed by its minter.
///
/// Issuer-minted tokens carry the issuer's signature; division children are
/// signed by the wallet that performed the split. The `issuer` field names
/// the signer so validation knows which verifying key applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineToken {
    /// Unique token ID
    pub id: Uuid,

    /// Token amount (exact decimal, always positive)
    pub amount: Decimal,

    /// Identity of the signer (issuer or dividing wallet)
    pub issuer: String,

    /// When the token was minted
    pub issued_at: DateTime<Utc>,

    /// After this instant the token is no longer spendable
    pub expires_at: DateTime<Utc>,

    /// Whether the token has been consumed
    pub is_spent: bool,

    /// When the token was consumed
    pub spent_at: Option<DateTime<Utc>>,

    /// Child token IDs produced when this token was split
    pub divisions: Vec<Uuid>,

    /// Signature over the canonical fields
    pub signature: Signature,
}

impl OfflineToken {
    /// Create canonical bytes for signing.
    ///
    /// Covers the immutable identity of the note: id, amount, signer,
    /// issuance, and expiry. Spent-state and division bookkeeping are
    /// deliberately excluded so ledger mutations never invalidate the
    /// minter's signature.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        bincode::serialize(&(
            self.id,
            self.amount,
            &self.issuer,
            self.issued_at.timestamp_nanos_opt().unwrap_or(0),
            self.expires_at.timestamp_nanos_opt().unwrap_or(0),
        ))
        .expect("serialization cannot fail")
    }

    /// Verify the minter's signature
    pub fn verify_signature(&self, public_key: &[u8; 32]) -> bool {
        self.signature.verify(&self.canonical_bytes(), public_key)
    }

    /// Whether the token is past its expiration date
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Output of splitting one token into exact payment + change
#[derive(Debug, Clone)]
pub struct TokenDivisionResult {
    /// The consumed original (marked spent by the split)
    pub original: OfflineToken,

    /// Token for exactly the requested amount
    pub payment: OfflineToken,

    /// Remainder token; `None` when the request matched exactly
    pub change: Option<OfflineToken>,

    /// Amount that was requested
    pub requested_amount: Decimal,

    /// `original.amount - requested_amount` (zero when no change)
    pub change_amount: Decimal,
}

/// Transaction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionType {
    /// Peer-to-peer transfer without connectivity
    OfflineTransfer = 1,
    /// Transfer settled directly against the issuer
    OnlineTransfer = 2,
    /// Tokens minted by the issuer
    TokenPurchase = 3,
    /// Tokens returned to the issuer
    TokenRedemption = 4,
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionStatus {
    /// Created, not yet finalized
    Pending = 1,
    /// Finalized; funding tokens are spent (terminal)
    Completed = 2,
    /// Processing error or rejected verification (terminal)
    Failed = 3,
    /// User abort (terminal)
    Cancelled = 4,
}

impl TransactionStatus {
    /// Check if status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed | TransactionStatus::Cancelled
        )
    }

    /// Transition table: only `Pending` may move, and only to a terminal
    /// state. The retry path (Failed back to Pending) is a dedicated
    /// operation on the engine, not a general transition.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(self, TransactionStatus::Pending) && next.is_terminal()
    }
}

/// A value-transfer record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Transaction type
    pub tx_type: TransactionType,

    /// Sending wallet
    pub sender: WalletId,

    /// Receiving wallet
    pub receiver: WalletId,

    /// Transfer amount (exact decimal)
    pub amount: Decimal,

    /// Creation timestamp
    pub timestamp: DateTime<Utc>,

    /// Current status
    pub status: TransactionStatus,

    /// Tokens funding this transaction
    pub token_ids: Vec<Uuid>,

    /// Sender signature (set by `sign`)
    pub sender_signature: Option<Signature>,

    /// Receiver counter-signature (set on acceptance)
    pub receiver_signature: Option<Signature>,

    /// Free-form diagnostics (connection type, device info, error message);
    /// mutable even after creation
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Transaction {
    /// Create canonical bytes for signing.
    ///
    /// Excludes both signatures (they sign these bytes) and metadata
    /// (mutable post-creation for diagnostics) and status (owned by the
    /// local state machine, not part of the agreement between peers).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        bincode::serialize(&(
            self.id,
            self.tx_type,
            &self.sender,
            &self.receiver,
            self.amount,
            self.timestamp.timestamp_nanos_opt().unwrap_or(0),
            &self.token_ids,
        ))
        .expect("serialization cannot fail")
    }

    /// Verify the sender signature against a public key
    pub fn verify_sender_signature(&self, public_key: &[u8; 32]) -> bool {
        match &self.sender_signature {
            Some(sig) => sig.verify(&self.canonical_bytes(), public_key),
            None => false,
        }
    }
}

/// Per-wallet singleton aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletState {
    /// Wallet identity
    pub wallet_id: WalletId,

    /// Wallet public key (Ed25519)
    pub public_key: [u8; 32],

    /// Sum of valid offline tokens
    pub offline_balance: Decimal,

    /// Last balance reported by the issuer backend
    pub blockchain_balance: Decimal,

    /// Last successful sync with the issuer
    pub last_sync: Option<DateTime<Utc>>,

    /// Automatically purchase tokens when balance drops below threshold
    pub auto_recharge_enabled: bool,

    /// Balance threshold that triggers a recharge
    pub auto_recharge_threshold: Decimal,

    /// Amount purchased by a recharge
    pub auto_recharge_amount: Decimal,
}

impl WalletState {
    /// Create initial state for a freshly provisioned wallet
    pub fn new(wallet_id: WalletId, public_key: [u8; 32]) -> Self {
        Self {
            wallet_id,
            public_key,
            offline_balance: Decimal::ZERO,
            blockchain_balance: Decimal::ZERO,
            last_sync: None,
            auto_recharge_enabled: false,
            auto_recharge_threshold: Decimal::ZERO,
            auto_recharge_amount: Decimal::ZERO,
        }
    }
}

/// A queued operation that requires connectivity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncJob {
    /// Purchase tokens from the issuer
    TokenPurchase {
        /// Amount to purchase
        amount: Decimal,
    },

    /// Submit a finalized transaction for settlement
    TransactionSubmission {
        /// The transaction to submit
        transaction: Transaction,
    },

    /// Refresh the issuer-side balance
    BalanceUpdate {
        /// Wallet to refresh
        wallet_id: WalletId,
    },

    /// Re-synchronize the transaction log with the issuer
    TransactionSync,

    /// Redeem all valid tokens back to the issuer
    TokenRedemption,
}

/// Receipt returned by the issuer for a redemption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionReceipt {
    /// Receipt ID assigned by the issuer
    pub receipt_id: Uuid,

    /// Total value redeemed
    pub total_amount: Decimal,

    /// Token IDs the issuer accepted
    pub token_ids: Vec<Uuid>,

    /// When the issuer processed the redemption
    pub redeemed_at: DateTime<Utc>,
}

/// The opaque byte payload a transport carries between peer wallets.
///
/// Contains the signed transaction, the bearer tokens funding it, and the
/// sender's public key so the receiver can verify both without a directory
/// lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferPayload {
    /// The signed pending transaction
    pub transaction: Transaction,

    /// The bearer tokens being handed over
    pub tokens: Vec<OfflineToken>,

    /// Sender's verifying key
    pub sender_public_key: [u8; 32],
}

impl TransferPayload {
    /// Encode for the transport
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode bytes received from the transport
    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
