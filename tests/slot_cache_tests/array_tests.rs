//! Tests for PersistentIntArray and the slot status words
//!
//! These tests verify:
//! - Persistence under each write-back policy
//! - Abort loses unflushed words
//! - Resize and clear
//! - Intact detection on reopen

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use saltkv::slot_cache::{
    fingerprint, is_known_free, is_observed, may_hold, occupied_word, PersistentIntArray,
    FREE_WORD,
};
use saltkv::ticker::{ThreadTicker, Ticker};
use saltkv::CachePersistence;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn ticker() -> Arc<dyn Ticker> {
    Arc::new(ThreadTicker::new("slot-cache-test").unwrap())
}

fn open(temp: &TempDir, len: u64, policy: CachePersistence) -> (PersistentIntArray, bool) {
    PersistentIntArray::open(&temp.path().join("test.slots"), len, policy, ticker()).unwrap()
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_fresh_array_is_zeroed_and_not_intact() {
    let temp = TempDir::new().unwrap();
    let (array, intact) = open(&temp, 64, CachePersistence::OnShutdown);

    assert!(!intact);
    assert_eq!(array.len(), 64);
    assert!((0..64).all(|i| array.get(i) == 0));
}

#[test]
fn test_write_through_survives_abort() {
    let temp = TempDir::new().unwrap();
    {
        let (array, _) = open(&temp, 16, CachePersistence::WriteThrough);
        array.put(3, 0xDEAD_BEEF);
        array.put(15, 7);
        array.abort();
    }

    let (array, intact) = open(&temp, 16, CachePersistence::WriteThrough);
    assert!(intact);
    assert_eq!(array.get(3), 0xDEAD_BEEF);
    assert_eq!(array.get(15), 7);
}

#[test]
fn test_on_shutdown_persists_after_shutdown() {
    let temp = TempDir::new().unwrap();
    {
        let (array, _) = open(&temp, 16, CachePersistence::OnShutdown);
        array.put(0, 11);
        array.put(9, 22);
        assert!(array.is_dirty());
        array.shutdown().unwrap();
    }

    let (array, _) = open(&temp, 16, CachePersistence::OnShutdown);
    assert_eq!(array.get(0), 11);
    assert_eq!(array.get(9), 22);
}

#[test]
fn test_on_shutdown_abort_loses_words() {
    let temp = TempDir::new().unwrap();
    {
        let (array, _) = open(&temp, 16, CachePersistence::OnShutdown);
        array.put(4, 44);
        array.abort();
    }

    let (array, _) = open(&temp, 16, CachePersistence::OnShutdown);
    assert_eq!(array.get(4), 0);
}

#[test]
fn test_periodic_flushes_after_delay() {
    let temp = TempDir::new().unwrap();
    let policy = CachePersistence::Periodic {
        delay: Duration::from_millis(20),
    };
    let (array, _) = open(&temp, 8, policy);
    array.put(2, 99);
    assert!(array.is_dirty());

    let mut flushed = false;
    for _ in 0..200 {
        if !array.is_dirty() {
            flushed = true;
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(flushed, "periodic flush never ran");
    // The dirty flag drops before the write lands
    thread::sleep(Duration::from_millis(100));
    array.abort();

    let (reopened, _) = open(&temp, 8, policy);
    assert_eq!(reopened.get(2), 99);
}

#[test]
fn test_force_write_persists_immediately() {
    let temp = TempDir::new().unwrap();
    {
        let (array, _) = open(&temp, 8, CachePersistence::OnShutdown);
        array.put(5, 55);
        array.force_write().unwrap();
        assert!(!array.is_dirty());
        array.abort();
    }

    let (array, _) = open(&temp, 8, CachePersistence::OnShutdown);
    assert_eq!(array.get(5), 55);
}

// =============================================================================
// Resize and Clear Tests
// =============================================================================

#[test]
fn test_resize_keeps_prefix() {
    let temp = TempDir::new().unwrap();
    let (array, _) = open(&temp, 8, CachePersistence::OnShutdown);
    for i in 0..8 {
        array.put(i, i as u32 + 1);
    }

    array.resize(4).unwrap();
    assert_eq!(array.len(), 4);
    assert_eq!(array.get(3), 4);
    assert_eq!(array.get(5), 0);

    array.resize(12).unwrap();
    assert_eq!(array.len(), 12);
    assert_eq!(array.get(0), 1);
    assert_eq!(array.get(10), 0);
}

#[test]
fn test_reopen_with_other_length_is_not_intact() {
    let temp = TempDir::new().unwrap();
    {
        let (array, _) = open(&temp, 8, CachePersistence::OnShutdown);
        array.put(1, 10);
        array.shutdown().unwrap();
    }

    let (array, intact) = open(&temp, 16, CachePersistence::OnShutdown);
    assert!(!intact);
    assert_eq!(array.len(), 16);
    assert_eq!(array.get(1), 10);
    assert_eq!(array.get(12), 0);
}

#[test]
fn test_clear_resets_all_words() {
    let temp = TempDir::new().unwrap();
    let (array, _) = open(&temp, 8, CachePersistence::OnShutdown);
    array.put(0, 1);
    array.put(7, 2);

    array.clear().unwrap();
    assert!((0..8).all(|i| array.get(i) == 0));
    assert!(!array.is_dirty());
}

// =============================================================================
// Status Word Tests
// =============================================================================

#[test]
fn test_status_words_describe_slots() {
    let digest = [0x5Au8; 32];
    let word = occupied_word(&digest, false, true);

    assert!(is_observed(word));
    assert!(!is_known_free(word));
    assert_eq!(word & 0x00FF_FFFF, fingerprint(&digest));
    assert!(may_hold(word, &digest));

    assert!(is_known_free(FREE_WORD));
    assert!(!may_hold(FREE_WORD, &digest));
}
