//! Issuer backend seam
//!
//! The wallet talks to the token issuer through [`IssuerClient`]; the real
//! deployment points this at the issuer's service, tests and demos use
//! [`LocalIssuer`]. The trait is the online boundary: every call may fail
//! with [`Error::Offline`], which the sync queue treats as transient.

use crate::{
    crypto::KeyPair,
    error::{Error, Result},
    types::{OfflineToken, RedemptionReceipt, Signature, Transaction, WalletId},
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Client for the token issuer's backend
#[async_trait]
pub trait IssuerClient: Send + Sync {
    /// Purchase signed tokens worth `amount`, debiting the wallet's
    /// blockchain balance
    async fn purchase(&self, amount: Decimal, wallet_id: &WalletId) -> Result<Vec<OfflineToken>>;

    /// Redeem tokens back into blockchain balance
    async fn redeem(
        &self,
        tokens: Vec<OfflineToken>,
        wallet_id: &WalletId,
    ) -> Result<RedemptionReceipt>;

    /// Report a completed offline transaction for settlement.
    ///
    /// Idempotent on the backend side; resubmitting after a partial
    /// failure is safe.
    async fn submit(&self, transaction: &Transaction) -> Result<()>;

    /// The wallet's blockchain-side balance as the issuer sees it
    async fn balance(&self, wallet_id: &WalletId) -> Result<Decimal>;
}

/// In-process issuer backing tests and the demo daemon.
///
/// Mints real Ed25519-signed tokens, tracks per-wallet balances, and
/// rejects re-redemption of a token ID. `set_offline` simulates losing
/// connectivity.
pub struct LocalIssuer {
    keypair: KeyPair,
    issuer_id: String,
    token_validity_days: i64,
    offline: AtomicBool,
    inner: Mutex<IssuerLedger>,
}

#[derive(Default)]
struct IssuerLedger {
    balances: HashMap<String, Decimal>,
    redeemed: HashMap<Uuid, Uuid>,
    submitted: HashMap<Uuid, Transaction>,
}

/// Denominations minted for a purchase, largest first
const DENOMINATIONS: [(i64, u32); 4] = [(100, 0), (20, 0), (5, 0), (1, 2)];

impl LocalIssuer {
    /// Create an issuer with a fresh key pair
    pub fn new(issuer_id: impl Into<String>, token_validity_days: i64) -> Self {
        Self {
            keypair: KeyPair::generate(),
            issuer_id: issuer_id.into(),
            token_validity_days,
            offline: AtomicBool::new(false),
            inner: Mutex::new(IssuerLedger::default()),
        }
    }

    /// The issuer's verifying key; wallets seed their trust registry with it
    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key()
    }

    /// Issuer identity string
    pub fn issuer_id(&self) -> &str {
        &self.issuer_id
    }

    /// Credit a wallet's blockchain balance (test/demo funding)
    pub fn credit(&self, wallet_id: &WalletId, amount: Decimal) {
        *self
            .inner
            .lock()
            .balances
            .entry(wallet_id.as_str().to_string())
            .or_insert(Decimal::ZERO) += amount;
    }

    /// Number of transactions submitted for settlement
    pub fn submitted_count(&self) -> usize {
        self.inner.lock().submitted.len()
    }

    /// Toggle simulated connectivity
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Offline);
        }
        Ok(())
    }

    fn mint(&self, amount: Decimal) -> OfflineToken {
        let now = Utc::now();
        let mut token = OfflineToken {
            id: Uuid::now_v7(),
            amount,
            issuer: self.issuer_id.clone(),
            issued_at: now,
            expires_at: now + Duration::days(self.token_validity_days),
            is_spent: false,
            spent_at: None,
            divisions: vec![],
            signature: Signature::from_bytes([0u8; 64]),
        };
        token.signature = self.keypair.sign(&token.canonical_bytes());
        token
    }

    /// Split an amount into denomination-sized tokens, with a final token
    /// carrying any sub-denomination remainder.
    fn split(amount: Decimal) -> Vec<Decimal> {
        let mut remaining = amount;
        let mut parts = Vec::new();

        for (value, scale) in DENOMINATIONS {
            let denom = Decimal::new(value, scale);
            while remaining >= denom {
                parts.push(denom);
                remaining -= denom;
            }
        }

        if remaining > Decimal::ZERO {
            parts.push(remaining);
        }
        parts
    }
}

#[async_trait]
impl IssuerClient for LocalIssuer {
    async fn purchase(&self, amount: Decimal, wallet_id: &WalletId) -> Result<Vec<OfflineToken>> {
        self.check_online()?;

        if amount <= Decimal::ZERO {
            return Err(Error::PurchaseFailed(format!(
                "Amount must be positive, got {}",
                amount
            )));
        }

        {
            let mut inner = self.inner.lock();
            let balance = inner
                .balances
                .entry(wallet_id.as_str().to_string())
                .or_insert(Decimal::ZERO);
            if *balance < amount {
                return Err(Error::PurchaseFailed(format!(
                    "Blockchain balance {} below purchase amount {}",
                    balance, amount
                )));
            }
            *balance -= amount;
        }

        let tokens: Vec<OfflineToken> = Self::split(amount)
            .into_iter()
            .map(|part| self.mint(part))
            .collect();

        tracing::info!(
            wallet = wallet_id.as_str(),
            amount = %amount,
            tokens = tokens.len(),
            "Issued tokens"
        );
        Ok(tokens)
    }

    async fn redeem(
        &self,
        tokens: Vec<OfflineToken>,
        wallet_id: &WalletId,
    ) -> Result<RedemptionReceipt> {
        self.check_online()?;

        if tokens.is_empty() {
            return Err(Error::NoValidTokens);
        }

        let receipt_id = Uuid::now_v7();
        let mut total = Decimal::ZERO;
        let mut token_ids = Vec::with_capacity(tokens.len());

        let mut inner = self.inner.lock();
        for token in &tokens {
            if !token.verify_signature(&self.keypair.public_key()) {
                return Err(Error::InvalidToken(format!(
                    "Token {} does not carry this issuer's signature",
                    token.id
                )));
            }
            if inner.redeemed.contains_key(&token.id) {
                return Err(Error::DoubleSpending(format!(
                    "Token {} was already redeemed",
                    token.id
                )));
            }
            total += token.amount;
            token_ids.push(token.id);
        }

        for id in &token_ids {
            inner.redeemed.insert(*id, receipt_id);
        }
        *inner
            .balances
            .entry(wallet_id.as_str().to_string())
            .or_insert(Decimal::ZERO) += total;

        tracing::info!(
            wallet = wallet_id.as_str(),
            amount = %total,
            tokens = token_ids.len(),
            "Redeemed tokens"
        );
        Ok(RedemptionReceipt {
            receipt_id,
            total_amount: total,
            token_ids,
            redeemed_at: Utc::now(),
        })
    }

    async fn submit(&self, transaction: &Transaction) -> Result<()> {
        self.check_online()?;
        self.inner
            .lock()
            .submitted
            .insert(transaction.id, transaction.clone());
        tracing::debug!(tx_id = %transaction.id, "Transaction submitted for settlement");
        Ok(())
    }

    async fn balance(&self, wallet_id: &WalletId) -> Result<Decimal> {
        self.check_online()?;
        Ok(self
            .inner
            .lock()
            .balances
            .get(wallet_id.as_str())
            .copied()
            .unwrap_or(Decimal::ZERO))
    }
}
