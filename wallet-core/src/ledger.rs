//! Token ledger: the set of offline bearer tokens owned by this wallet
//!
//! The ledger validates tokens, performs division (exact payment + change),
//! tracks spent/unspent state, computes the available balance, and purges
//! expired tokens. All mutation runs inside the wallet actor, so the ledger
//! itself is a plain single-owner struct.

use crate::{
    config::SelectionStrategy,
    crypto::KeyPair,
    error::{Error, Result},
    storage::{Storage, WalletBatch},
    types::{OfflineToken, Signature, TokenDivisionResult, WalletId},
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// How a payment amount is covered by the token set: whole tokens plus at
/// most one division of a larger token for the remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingPlan {
    /// Tokens consumed whole
    pub whole_tokens: Vec<Uuid>,

    /// `(token_id, amount)` to divide for the remainder, if any
    pub divide: Option<(Uuid, Decimal)>,
}

/// Select tokens covering `amount` from a pre-validated candidate set.
///
/// Policy, not invariant: `LargestFirst` favors the fewest tokens that cover
/// the amount, then falls back to dividing the smallest token that alone
/// covers the remainder, minimizing fragmentation. `SmallestFirst` consumes
/// dust first. Pure function so the heuristic is testable independently.
pub fn select_funding(
    tokens: &[OfflineToken],
    amount: Decimal,
    strategy: SelectionStrategy,
) -> Result<FundingPlan> {
    if amount <= Decimal::ZERO {
        return Err(Error::InvalidAmount(format!(
            "Amount must be positive, got {}",
            amount
        )));
    }

    let available: Decimal = tokens.iter().map(|t| t.amount).sum();
    if available < amount {
        return Err(Error::InsufficientBalance {
            available,
            requested: amount,
        });
    }

    let mut candidates: Vec<&OfflineToken> = tokens.iter().collect();
    match strategy {
        SelectionStrategy::LargestFirst => {
            candidates.sort_by(|a, b| b.amount.cmp(&a.amount));
        }
        SelectionStrategy::SmallestFirst => {
            candidates.sort_by(|a, b| a.amount.cmp(&b.amount));
        }
    }

    let mut whole_tokens = Vec::new();
    let mut remaining = amount;
    let mut skipped: Vec<&OfflineToken> = Vec::new();

    for token in candidates {
        if remaining.is_zero() {
            break;
        }
        if token.amount <= remaining {
            whole_tokens.push(token.id);
            remaining -= token.amount;
        } else {
            skipped.push(token);
        }
    }

    if remaining.is_zero() {
        return Ok(FundingPlan {
            whole_tokens,
            divide: None,
        });
    }

    // Every skipped token is larger than the remainder; divide the smallest
    // one that covers it.
    let to_divide = skipped
        .into_iter()
        .min_by(|a, b| a.amount.cmp(&b.amount))
        .ok_or(Error::InsufficientBalance {
            available,
            requested: amount,
        })?;

    Ok(FundingPlan {
        whole_tokens,
        divide: Some((to_divide.id, remaining)),
    })
}

/// The wallet's token ledger
pub struct TokenLedger {
    storage: Arc<Storage>,

    /// Wallet key pair; signs division children
    keypair: KeyPair,

    /// This wallet's identity (the signer name on division children)
    wallet_id: WalletId,

    /// The trusted issuer's identity
    issuer_id: String,

    /// Signer identity -> verifying key. Seeded with the issuer and the
    /// wallet itself; peer keys are registered when payments arrive.
    trusted_keys: HashMap<String, [u8; 32]>,

    /// Cached available balance; invalidated on any ledger mutation
    balance_cache: Option<Decimal>,
}

impl TokenLedger {
    /// Create a ledger over the given storage
    pub fn new(
        storage: Arc<Storage>,
        keypair: KeyPair,
        wallet_id: WalletId,
        issuer_id: String,
        issuer_key: [u8; 32],
    ) -> Self {
        let mut trusted_keys = HashMap::new();
        trusted_keys.insert(issuer_id.clone(), issuer_key);
        trusted_keys.insert(wallet_id.as_str().to_string(), keypair.public_key());

        Self {
            storage,
            keypair,
            wallet_id,
            issuer_id,
            trusted_keys,
            balance_cache: None,
        }
    }

    /// True when any peer can verify this token knowing only the issuer's
    /// key and this wallet's key. Tokens signed by a third wallet fail
    /// this and must be re-minted before being handed over.
    pub fn is_peer_verifiable(&self, token: &OfflineToken) -> bool {
        token.issuer == self.issuer_id || token.issuer == self.wallet_id.as_str()
    }

    /// Register a peer's verifying key so their division children validate
    pub fn register_peer_key(&mut self, peer_id: &str, key: [u8; 32]) {
        self.trusted_keys.insert(peer_id.to_string(), key);
    }

    /// Verifying key for a signer identity, if trusted
    pub fn verifying_key(&self, signer: &str) -> Option<&[u8; 32]> {
        self.trusted_keys.get(signer)
    }

    /// Pure validity check: unexpired, unspent, and carrying a good
    /// signature from a trusted signer. Never mutates.
    pub fn validate(&self, token: &OfflineToken) -> bool {
        if token.is_spent || token.is_expired(Utc::now()) {
            return false;
        }
        match self.trusted_keys.get(&token.issuer) {
            Some(key) => token.verify_signature(key),
            None => false,
        }
    }

    /// All tokens currently passing `validate`
    pub fn spendable_tokens(&self) -> Result<Vec<OfflineToken>> {
        Ok(self
            .storage
            .list_tokens()?
            .into_iter()
            .filter(|t| self.validate(t))
            .collect())
    }

    /// Sum of amounts over tokens passing `validate`.
    ///
    /// O(n) scan, cached until the next ledger mutation.
    pub fn available_balance(&mut self) -> Result<Decimal> {
        if let Some(cached) = self.balance_cache {
            return Ok(cached);
        }

        let balance = self.compute_balance()?;
        self.balance_cache = Some(balance);
        Ok(balance)
    }

    fn compute_balance(&self) -> Result<Decimal> {
        Ok(self.spendable_tokens()?.iter().map(|t| t.amount).sum())
    }

    /// Drop the cached balance after a mutation
    pub fn invalidate_cache(&mut self) {
        self.balance_cache = None;
    }

    /// Mark a token spent. Idempotent; fails only if the token is absent.
    pub fn mark_spent(&mut self, token_id: Uuid) -> Result<()> {
        let mut token = self.storage.get_token(token_id)?;

        if !token.is_spent {
            token.is_spent = true;
            token.spent_at = Some(Utc::now());
            self.storage.put_token(&token)?;
            self.invalidate_cache();
        }

        Ok(())
    }

    /// Remove tokens past their expiration date, returning the removed IDs.
    ///
    /// Expiry removal is a cleanup, not a spend: the tokens were already
    /// invalid and excluded from the balance. Calling again returns an
    /// empty list.
    pub fn sweep_expired(&mut self) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .storage
            .list_tokens()?
            .into_iter()
            .filter(|t| t.is_expired(now))
            .map(|t| t.id)
            .collect();

        if expired.is_empty() {
            return Ok(expired);
        }

        let mut batch = WalletBatch {
            delete_tokens: expired.clone(),
            ..Default::default()
        };
        if let Some(mut state) = self.storage.get_wallet_state()? {
            state.offline_balance = self.compute_balance()?;
            batch.wallet_state = Some(state);
        }
        self.storage.apply_batch(batch)?;
        self.invalidate_cache();

        tracing::info!(count = expired.len(), "Swept expired tokens");
        Ok(expired)
    }

    /// Split a token into an exact payment token plus optional change.
    ///
    /// The original is consumed by the split; both children are signed by
    /// the wallet's own key for single-use peer-verifiable transfer and
    /// recorded in the original's `divisions`.
    pub fn divide(&mut self, token_id: Uuid, amount: Decimal) -> Result<TokenDivisionResult> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "Division amount must be positive, got {}",
                amount
            )));
        }

        let mut original = self.storage.get_token(token_id)?;

        if !self.validate(&original) {
            return Err(Error::InvalidToken(format!(
                "Token {} is spent, expired, or unverifiable",
                token_id
            )));
        }

        if amount > original.amount {
            return Err(Error::InsufficientBalance {
                available: original.amount,
                requested: amount,
            });
        }

        let change_amount = original.amount - amount;
        let payment = self.mint_child(amount, &original);
        let change = if change_amount > Decimal::ZERO {
            Some(self.mint_child(change_amount, &original))
        } else {
            None
        };

        original.is_spent = true;
        original.spent_at = Some(Utc::now());
        original.divisions.push(payment.id);
        if let Some(c) = &change {
            original.divisions.push(c.id);
        }

        let mut put_tokens = vec![original.clone(), payment.clone()];
        if let Some(c) = &change {
            put_tokens.push(c.clone());
        }
        self.storage.apply_batch(WalletBatch {
            put_tokens,
            ..Default::default()
        })?;
        self.invalidate_cache();

        tracing::debug!(
            original = %original.id,
            payment = %payment.id,
            change = ?change.as_ref().map(|c| c.id),
            "Token divided"
        );

        Ok(TokenDivisionResult {
            original,
            payment,
            change,
            requested_amount: amount,
            change_amount,
        })
    }

    /// Mint a division child signed by the wallet's own key.
    ///
    /// Children inherit the parent's expiration date so a split never
    /// extends a token's life.
    fn mint_child(&self, amount: Decimal, parent: &OfflineToken) -> OfflineToken {
        let mut token = OfflineToken {
            id: Uuid::now_v7(),
            amount,
            issuer: self.wallet_id.as_str().to_string(),
            issued_at: Utc::now(),
            expires_at: parent.expires_at,
            is_spent: false,
            spent_at: None,
            divisions: vec![],
            signature: Signature::from_bytes([0u8; 64]),
        };
        token.signature = self.keypair.sign(&token.canonical_bytes());
        token
    }

    /// Accept externally minted tokens into the ledger after verifying each
    /// against the expected signer's key.
    ///
    /// Used for issuer purchases and inbound peer payments. Tokens failing
    /// verification are rejected; the caller decides whether that is a
    /// partial failure. Returns the accepted tokens.
    pub fn accept_tokens(
        &mut self,
        tokens: Vec<OfflineToken>,
        signer_key: &[u8; 32],
    ) -> Result<Vec<OfflineToken>> {
        let now = Utc::now();

        for token in &tokens {
            if token.amount <= Decimal::ZERO {
                return Err(Error::InvalidToken(format!(
                    "Token {} has non-positive amount",
                    token.id
                )));
            }
            if token.is_spent || token.is_expired(now) {
                return Err(Error::InvalidToken(format!(
                    "Token {} is spent or expired",
                    token.id
                )));
            }
            if !token.verify_signature(signer_key) {
                return Err(Error::InvalidSignature(format!(
                    "Token {} signature does not verify against signer key",
                    token.id
                )));
            }
        }

        self.commit_accepted(tokens)
    }

    /// Accept tokens signed by any trusted signer, verified per token.
    ///
    /// Inbound peer payments mix issuer-minted tokens with the sender's
    /// division children, so each token is checked against the key
    /// registered for its own signer name. A token already present in the
    /// ledger is a replay and rejected as double spending.
    pub fn accept_trusted_tokens(
        &mut self,
        tokens: Vec<OfflineToken>,
    ) -> Result<Vec<OfflineToken>> {
        for token in &tokens {
            if token.amount <= Decimal::ZERO {
                return Err(Error::InvalidToken(format!(
                    "Token {} has non-positive amount",
                    token.id
                )));
            }
            if self.storage.has_token(token.id)? {
                return Err(Error::DoubleSpending(format!(
                    "Token {} was already received",
                    token.id
                )));
            }
            if !self.validate(token) {
                return Err(Error::InvalidToken(format!(
                    "Token {} is spent, expired, or not signed by a trusted signer",
                    token.id
                )));
            }
        }

        self.commit_accepted(tokens)
    }

    fn commit_accepted(&mut self, tokens: Vec<OfflineToken>) -> Result<Vec<OfflineToken>> {
        let added: Decimal = tokens.iter().map(|t| t.amount).sum();
        let mut batch = WalletBatch {
            put_tokens: tokens.clone(),
            ..Default::default()
        };
        if let Some(mut state) = self.storage.get_wallet_state()? {
            state.offline_balance = self.compute_balance()? + added;
            batch.wallet_state = Some(state);
        }
        self.storage.apply_batch(batch)?;
        self.invalidate_cache();

        Ok(tokens)
    }

    /// Valid, unspent tokens eligible for redemption.
    ///
    /// Fails with `NoValidTokens` when the filtered set is empty.
    pub fn redeemable_tokens(&self) -> Result<Vec<OfflineToken>> {
        let tokens = self.spendable_tokens()?;
        if tokens.is_empty() {
            return Err(Error::NoValidTokens);
        }
        Ok(tokens)
    }

    /// Storage backing this ledger
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// This wallet's identity
    pub fn wallet_id(&self) -> &WalletId {
        &self.wallet_id
    }

    /// This wallet's signing key pair
    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }
}
