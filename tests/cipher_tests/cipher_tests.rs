//! Tests for CipherManager
//!
//! These tests verify:
//! - Digest determinism and salt dependence
//! - Encrypt/decrypt of header and payload
//! - Encryption idempotence
//! - Rejection of the wrong key without mutation
//! - Salt wrapping and the salt check value

use rand::rngs::StdRng;
use rand::SeedableRng;
use saltkv::cipher::{salt_check, wrap_salt, CipherManager, SALT_LENGTH};
use saltkv::store::{Entry, EntryLayout, NewEntry};

// =============================================================================
// Helper Functions
// =============================================================================

fn layout() -> EntryLayout {
    EntryLayout {
        header_len: 32,
        payload_len: 256,
        max_probes: 5,
        store_plain_keys: false,
    }
}

fn make_entry(cipher: &CipherManager, key: [u8; 32], fill: u8) -> Entry {
    let header = vec![fill; 32];
    let payload: Vec<u8> = (0..256).map(|i| (i as u8) ^ fill).collect();
    Entry::create(
        NewEntry {
            routing_key: key,
            digested_key: cipher.digest(&key),
            header: &header,
            payload: &payload,
            store_size: 64,
            generation: 0,
            new_block: true,
            wrong_store: false,
        },
        &layout(),
    )
}

// =============================================================================
// Digest Tests
// =============================================================================

#[test]
fn test_digest_is_deterministic() {
    let salt = [7u8; SALT_LENGTH];
    let a = CipherManager::new(salt).unwrap();
    let b = CipherManager::new(salt).unwrap();

    for i in 0..300u32 {
        let mut key = [0u8; 32];
        key[..4].copy_from_slice(&i.to_be_bytes());
        // Second call on `a` is served from its cache, `b` computes afresh
        assert_eq!(a.digest(&key), b.digest(&key));
        assert_eq!(a.digest(&key), a.digest(&key));
    }
}

#[test]
fn test_digest_is_not_the_key() {
    let cipher = CipherManager::new([1u8; SALT_LENGTH]).unwrap();
    let key = [0x42u8; 32];
    assert_ne!(cipher.digest(&key), key);
}

// =============================================================================
// Entry Encryption Tests
// =============================================================================

#[test]
fn test_encrypt_decrypt_round_trip() {
    let cipher = CipherManager::new([3u8; SALT_LENGTH]).unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let key = [0xAAu8; 32];

    let original = make_entry(&cipher, key, 0x5C);
    let mut entry = original.clone();
    cipher.encrypt(&mut entry, &mut rng);

    assert!(entry.encrypted);
    assert_ne!(entry.header, original.header);
    assert_ne!(entry.payload, original.payload);

    assert!(cipher.decrypt(&mut entry, &key));
    assert!(!entry.encrypted);
    assert_eq!(entry.header, original.header);
    assert_eq!(entry.payload, original.payload);
}

#[test]
fn test_encrypt_is_idempotent() {
    let cipher = CipherManager::new([3u8; SALT_LENGTH]).unwrap();
    let mut rng = StdRng::seed_from_u64(2);

    let mut entry = make_entry(&cipher, [0x11u8; 32], 0);
    cipher.encrypt(&mut entry, &mut rng);
    let once = entry.clone();
    cipher.encrypt(&mut entry, &mut rng);

    assert_eq!(entry, once);
}

#[test]
fn test_fresh_iv_per_encryption() {
    let cipher = CipherManager::new([3u8; SALT_LENGTH]).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let key = [0x22u8; 32];

    let mut first = make_entry(&cipher, key, 9);
    let mut second = make_entry(&cipher, key, 9);
    cipher.encrypt(&mut first, &mut rng);
    cipher.encrypt(&mut second, &mut rng);

    assert_ne!(first.iv, second.iv);
    assert_ne!(first.payload, second.payload);
}

#[test]
fn test_decrypt_with_wrong_key_leaves_entry_alone() {
    let cipher = CipherManager::new([3u8; SALT_LENGTH]).unwrap();
    let mut rng = StdRng::seed_from_u64(4);

    let mut entry = make_entry(&cipher, [0x33u8; 32], 1);
    cipher.encrypt(&mut entry, &mut rng);
    // Forget the plain key, as for an entry read back from disk
    entry.plain_key = None;
    let before = entry.clone();

    assert!(!cipher.decrypt(&mut entry, &[0x34u8; 32]));
    assert_eq!(entry, before);

    assert!(cipher.decrypt(&mut entry, &[0x33u8; 32]));
    assert_eq!(entry.plain_key, Some([0x33u8; 32]));
}

#[test]
fn test_other_salt_cannot_decrypt() {
    let a = CipherManager::new([1u8; SALT_LENGTH]).unwrap();
    let b = CipherManager::new([2u8; SALT_LENGTH]).unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    let key = [0x44u8; 32];

    let mut entry = make_entry(&a, key, 2);
    a.encrypt(&mut entry, &mut rng);
    entry.plain_key = None;

    // Digest differs under another salt, so the key is rejected
    assert!(!b.decrypt(&mut entry, &key));
}

// =============================================================================
// Salt Wrapping Tests
// =============================================================================

#[test]
fn test_wrong_master_key_fails_salt_check() {
    let salt = [0x99u8; SALT_LENGTH];
    let nonce = [5u8; 8];
    let wrapped = wrap_salt(&salt, &[1u8; 32], &nonce);

    let right = wrap_salt(&wrapped, &[1u8; 32], &nonce);
    let wrong = wrap_salt(&wrapped, &[2u8; 32], &nonce);

    assert_eq!(salt_check(&right), salt_check(&salt));
    assert_ne!(salt_check(&wrong), salt_check(&salt));
}
