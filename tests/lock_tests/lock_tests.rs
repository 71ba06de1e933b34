//! Tests for EntryLockManager
//!
//! These tests verify:
//! - Mutual exclusion per offset
//! - All-or-nothing multi-slot locking
//! - Shutdown wakes waiters and drains holders
//! - Overlapping ascending lock sets never deadlock

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use saltkv::lock::{EntryLockManager, LockFailure};

// =============================================================================
// Helper Functions
// =============================================================================

fn manager() -> Arc<EntryLockManager> {
    Arc::new(EntryLockManager::new(Duration::from_millis(20)))
}

fn set(offsets: &[u64]) -> BTreeSet<u64> {
    offsets.iter().copied().collect()
}

// =============================================================================
// Exclusion Tests
// =============================================================================

#[test]
fn test_one_holder_per_offset() {
    let locks = manager();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            thread::spawn(move || {
                for _ in 0..50 {
                    let handle = locks.lock(42).unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    locks.unlock(handle);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(locks.held_count(), 0);
}

#[test]
fn test_different_offsets_do_not_block() {
    let locks = manager();
    let a = locks.lock(1).unwrap();
    let b = locks.lock_before(2, Instant::now() + Duration::from_millis(50)).unwrap();
    assert_eq!(locks.held_count(), 2);
    locks.unlock(a);
    locks.unlock(b);
}

#[test]
fn test_lock_all_releases_on_drop() {
    let locks = manager();
    {
        let guard = locks.lock_all(&set(&[9, 3, 7]), None).unwrap();
        assert_eq!(guard.len(), 3);
        assert!(guard.contains(3) && guard.contains(7) && guard.contains(9));
        assert_eq!(locks.held_count(), 3);
    }
    assert_eq!(locks.held_count(), 0);
}

#[test]
fn test_lock_all_timeout_releases_partial_set() {
    let locks = manager();
    let blocker = locks.lock(5).unwrap();

    let result = locks.lock_all(
        &set(&[1, 2, 5, 8]),
        Some(Instant::now() + Duration::from_millis(60)),
    );
    assert!(matches!(result, Err(LockFailure::TimedOut)));

    // Only the blocker remains held; 1 and 2 were given back
    assert_eq!(locks.held_count(), 1);
    locks.unlock(blocker);
    assert!(locks.lock_all(&set(&[1, 2, 5, 8]), None).is_ok());
}

#[test]
fn test_overlapping_sets_do_not_deadlock() {
    let locks = manager();
    let done = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..6u64)
        .map(|t| {
            let locks = Arc::clone(&locks);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for i in 0..200u64 {
                    // Sets overlap heavily and are requested in scrambled order
                    let offsets = set(&[(t + i) % 7, (i * 3) % 7, (t * 5 + 1) % 7]);
                    let deadline = Instant::now() + Duration::from_secs(10);
                    let guard = locks.lock_all(&offsets, Some(deadline)).unwrap();
                    drop(guard);
                }
                done.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(done.load(Ordering::SeqCst), 6);
    assert_eq!(locks.held_count(), 0);
}

// =============================================================================
// Shutdown Tests
// =============================================================================

#[test]
fn test_shutdown_wakes_waiters() {
    let locks = Arc::new(EntryLockManager::new(Duration::from_secs(60)));
    let holder = locks.lock(11).unwrap();

    let waiter = {
        let locks = Arc::clone(&locks);
        thread::spawn(move || locks.lock(11))
    };
    thread::sleep(Duration::from_millis(50));

    // Release from another thread once shutdown is underway
    let releaser = {
        let locks = Arc::clone(&locks);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            locks.unlock(holder);
        })
    };

    let started = Instant::now();
    locks.shutdown();
    assert!(started.elapsed() < Duration::from_secs(30));

    assert_eq!(waiter.join().unwrap(), Err(LockFailure::Shutdown));
    releaser.join().unwrap();
    assert_eq!(locks.held_count(), 0);
}

#[test]
fn test_no_locks_after_shutdown() {
    let locks = manager();
    locks.shutdown();
    assert!(locks.is_shutdown());
    assert_eq!(locks.lock(0), Err(LockFailure::Shutdown));
    assert!(matches!(
        locks.lock_all(&set(&[0, 1]), None),
        Err(LockFailure::Shutdown)
    ));
}
