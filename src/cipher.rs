//! Cipher Manager
//!
//! Key digesting and per-entry encryption.
//!
//! ## Scheme
//! - Digested key: `SHA-256(routing_key || salt)`. This is what lands on
//!   disk and what probing is derived from.
//! - Entry cipher: Salsa20 keyed by
//!   `SHA-256("saltkv-entry" || routing_key || salt || iv)` with a zero
//!   nonce. Every write draws a fresh IV, so every write gets a fresh key.
//!   Header and payload are enciphered as one continuous stream.
//! - Salt wrapping: with a master key the salt is stored XORed with a
//!   Salsa20 keystream keyed by `SHA-256("saltkv-master" || master_key)`.

use std::num::NonZeroUsize;

use cipher::{KeyIvInit, StreamCipher};
use lru::LruCache;
use parking_lot::Mutex;
use rand::RngCore;
use salsa20::Salsa20;
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};
use crate::store::entry::Entry;

/// Plaintext lookup key of a block
pub type RoutingKey = [u8; 32];

/// Salted hash of a [`RoutingKey`]
pub type DigestedKey = [u8; 32];

/// Store salt length in bytes
pub const SALT_LENGTH: usize = 16;

/// Per-entry IV length in bytes
pub const IV_LENGTH: usize = 16;

/// Digest cache capacity. The same key is digested against both table
/// sizes while a resize is running, so a small cache absorbs most repeats.
const DIGEST_CACHE_SIZE: usize = 128;

const ENTRY_KEY_DOMAIN: &[u8] = b"saltkv-entry";
const MASTER_KEY_DOMAIN: &[u8] = b"saltkv-master";
const SALT_CHECK_DOMAIN: &[u8] = b"saltkv-salt-check";

/// Digests keys and encrypts entries for one store
pub struct CipherManager {
    salt: [u8; SALT_LENGTH],
    digests: Mutex<LruCache<RoutingKey, DigestedKey>>,
}

impl CipherManager {
    /// Create a cipher manager for `salt`
    ///
    /// Fails only if the cipher primitives reject our key/nonce sizes,
    /// which is a build problem rather than a runtime one.
    pub fn new(salt: [u8; SALT_LENGTH]) -> Result<Self> {
        Salsa20::new_from_slices(&[0u8; 32], &[0u8; 8])
            .map_err(|e| StoreError::Config(format!("Salsa20 unavailable: {}", e)))?;

        let capacity = NonZeroUsize::new(DIGEST_CACHE_SIZE)
            .ok_or_else(|| StoreError::Config("digest cache size must be non-zero".into()))?;

        Ok(Self {
            salt,
            digests: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Digest a routing key against this store's salt
    pub fn digest(&self, routing_key: &RoutingKey) -> DigestedKey {
        if let Some(digest) = self.digests.lock().get(routing_key) {
            return *digest;
        }

        let digest: DigestedKey = Sha256::new()
            .chain_update(routing_key)
            .chain_update(self.salt)
            .finalize()
            .into();

        self.digests.lock().put(*routing_key, digest);
        digest
    }

    /// Encrypt an entry in place
    ///
    /// No-op for an entry that is already encrypted. Entries built from a
    /// routing key always carry it in memory; one without is left as is.
    pub fn encrypt<R: RngCore + ?Sized>(&self, entry: &mut Entry, rng: &mut R) {
        if entry.encrypted {
            return;
        }
        let Some(routing_key) = entry.plain_key else {
            tracing::error!("Refusing to encrypt an entry without its routing key");
            return;
        };

        rng.fill_bytes(&mut entry.iv);
        let mut cipher = self.entry_cipher(&routing_key, &entry.iv);
        cipher.apply_keystream(&mut entry.header);
        cipher.apply_keystream(&mut entry.payload);

        entry.digested_key = self.digest(&routing_key);
        entry.encrypted = true;
    }

    /// Decrypt an entry in place if `routing_key` is the key it was stored
    /// under
    ///
    /// Returns `false` without touching the entry when the key does not
    /// match its stored identity (plaintext key if known, else digest).
    pub fn decrypt(&self, entry: &mut Entry, routing_key: &RoutingKey) -> bool {
        let matches = match &entry.plain_key {
            Some(known) => known == routing_key,
            None => entry.digested_key == self.digest(routing_key),
        };
        if !matches {
            return false;
        }
        if !entry.encrypted {
            return true;
        }

        let mut cipher = self.entry_cipher(routing_key, &entry.iv);
        cipher.apply_keystream(&mut entry.header);
        cipher.apply_keystream(&mut entry.payload);

        entry.plain_key = Some(*routing_key);
        entry.encrypted = false;
        true
    }

    fn entry_cipher(&self, routing_key: &RoutingKey, iv: &[u8; IV_LENGTH]) -> Salsa20 {
        let key: [u8; 32] = Sha256::new()
            .chain_update(ENTRY_KEY_DOMAIN)
            .chain_update(routing_key)
            .chain_update(self.salt)
            .chain_update(iv)
            .finalize()
            .into();
        Salsa20::new(&key.into(), &[0u8; 8].into())
    }
}

// =============================================================================
// Salt Wrapping
// =============================================================================

/// XOR the salt with the master key stream. Wrapping and unwrapping are the
/// same operation.
pub fn wrap_salt(salt: &[u8; SALT_LENGTH], master_key: &[u8; 32], nonce: &[u8; 8]) -> [u8; SALT_LENGTH] {
    let key: [u8; 32] = Sha256::new()
        .chain_update(MASTER_KEY_DOMAIN)
        .chain_update(master_key)
        .finalize()
        .into();

    let mut out = *salt;
    let mut cipher = Salsa20::new(&key.into(), &(*nonce).into());
    cipher.apply_keystream(&mut out);
    out
}

/// Short check value stored beside a wrapped salt to detect a wrong
/// master key
pub fn salt_check(salt: &[u8; SALT_LENGTH]) -> [u8; 8] {
    let hash = Sha256::new()
        .chain_update(SALT_CHECK_DOMAIN)
        .chain_update(salt)
        .finalize();
    let mut check = [0u8; 8];
    check.copy_from_slice(&hash[..8]);
    check
}
