//! Cryptographic operations for the wallet
//!
//! This module provides:
//! - Ed25519 key pair generation, signing, and verification
//! - SHA-256 hashing for canonical bytes
//! - The key-store seam the platform implements (device-local, never
//!   synchronized off-device)

use crate::{Error, Result};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Ed25519 key pair for signing
#[derive(Debug, Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Get public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Get private key bytes (USE WITH CAUTION - should be protected)
    pub fn secret_key(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> crate::types::Signature {
        let signature = self.signing_key.sign(message);
        crate::types::Signature::from_bytes(signature.to_bytes())
    }

    /// Verify a signature made with this key pair
    pub fn verify(&self, message: &[u8], signature: &crate::types::Signature) -> Result<()> {
        let dalek_sig = DalekSignature::from_bytes(signature.as_bytes());
        self.verifying_key
            .verify(message, &dalek_sig)
            .map_err(|e| Error::InvalidSignature(format!("Verification failed: {}", e)))
    }
}

/// Verify a signature with a public key
pub fn verify_signature(
    message: &[u8],
    signature: &crate::types::Signature,
    public_key: &[u8; 32],
) -> bool {
    let dalek_sig = DalekSignature::from_bytes(signature.as_bytes());

    let verifying_key = match VerifyingKey::from_bytes(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };

    verifying_key.verify(message, &dalek_sig).is_ok()
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Device-local store for key material.
///
/// Implemented by the platform key-store collaborator; secrets never leave
/// the device. The wallet stores 32-byte Ed25519 seeds under string refs.
pub trait KeyStore: Send + Sync {
    /// Store a secret under a key reference
    fn store(&self, key_ref: &str, secret: &[u8; 32]) -> Result<()>;

    /// Retrieve a secret; `None` when absent
    fn retrieve(&self, key_ref: &str) -> Result<Option<[u8; 32]>>;

    /// Delete a secret
    fn delete(&self, key_ref: &str) -> Result<()>;
}

/// In-memory key store for tests and demos
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    secrets: parking_lot::RwLock<std::collections::HashMap<String, [u8; 32]>>,
}

impl MemoryKeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn store(&self, key_ref: &str, secret: &[u8; 32]) -> Result<()> {
        self.secrets.write().insert(key_ref.to_string(), *secret);
        Ok(())
    }

    fn retrieve(&self, key_ref: &str) -> Result<Option<[u8; 32]>> {
        Ok(self.secrets.read().get(key_ref).copied())
    }

    fn delete(&self, key_ref: &str) -> Result<()> {
        self.secrets.write().remove(key_ref);
        Ok(())
    }
}

/// Load the wallet key pair from the key store, generating and persisting
/// one on first use.
pub fn load_or_create_keypair(store: &dyn KeyStore, key_ref: &str) -> Result<KeyPair> {
    match store.retrieve(key_ref)? {
        Some(seed) => Ok(KeyPair::from_seed(&seed)),
        None => {
            let keypair = KeyPair::generate();
            store.store(key_ref, &keypair.secret_key())?;
            tracing::info!(key_ref, "Generated new wallet key pair");
            Ok(keypair)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let keypair = KeyPair::generate();
        assert_eq!(keypair.public_key().len(), 32);
    }

    #[test]
    fn test_keypair_from_seed() {
        let seed = [42u8; 32];
        let keypair1 = KeyPair::from_seed(&seed);
        let keypair2 = KeyPair::from_seed(&seed);

        // Same seed should produce same keys
        assert_eq!(keypair1.public_key(), keypair2.public_key());
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let message = b"test message";

        let signature = keypair.sign(message);
        assert!(keypair.verify(message, &signature).is_ok());

        let wrong_message = b"wrong message";
        assert!(keypair.verify(wrong_message, &signature).is_err());
    }

    #[test]
    fn test_verify_signature() {
        let keypair = KeyPair::generate();
        let message = b"test message";
        let signature = keypair.sign(message);
        let public_key = keypair.public_key();

        assert!(verify_signature(message, &signature, &public_key));

        let wrong_keypair = KeyPair::generate();
        assert!(!verify_signature(
            message,
            &signature,
            &wrong_keypair.public_key()
        ));
    }

    #[test]
    fn test_hash_bytes() {
        let hash1 = hash_bytes(b"test data");
        let hash2 = hash_bytes(b"test data");
        assert_eq!(hash1, hash2);

        let hash3 = hash_bytes(b"different data");
        assert_ne!(hash1, hash3);
    }

    #[test]
    fn test_memory_key_store_roundtrip() {
        let store = MemoryKeyStore::new();
        assert!(store.retrieve("wallet-key").unwrap().is_none());

        store.store("wallet-key", &[7u8; 32]).unwrap();
        assert_eq!(store.retrieve("wallet-key").unwrap(), Some([7u8; 32]));

        store.delete("wallet-key").unwrap();
        assert!(store.retrieve("wallet-key").unwrap().is_none());
    }

    #[test]
    fn test_load_or_create_keypair_is_stable() {
        let store = MemoryKeyStore::new();

        let first = load_or_create_keypair(&store, "wallet-key").unwrap();
        let second = load_or_create_keypair(&store, "wallet-key").unwrap();

        assert_eq!(first.public_key(), second.public_key());
    }
}
