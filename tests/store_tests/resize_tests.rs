//! Tests for online resize
//!
//! These tests verify:
//! - Grow and shrink with a blocking migration
//! - Reads and writes while a resize is pending
//! - Background migration by the cleaner thread
//! - Ignored and rejected resize requests
//! - Concurrent callers while a sweep runs
//! - Forced relocation when the queue overflows
//! - Closing mid-resize loses nothing

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use saltkv::{
    FetchOptions, KeyedBlock, KeyedBlockCallback, PutOptions, PutOutcome, SaltedHashStore,
    StorableBlock, StoreConfig, StoreError, SweepState,
};
use tempfile::TempDir;

const HEADER_LEN: usize = 8;
const PAYLOAD_LEN: usize = 32;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_store(slots: u64) -> (TempDir, SaltedHashStore<KeyedBlockCallback>) {
    let temp = TempDir::new().unwrap();
    let config = StoreConfig::builder()
        .dir(temp.path())
        .name("resize")
        .max_keys(slots)
        .resize_batch(16)
        .start_cleaner(false)
        .build();
    let store = SaltedHashStore::open(config, KeyedBlockCallback::new(HEADER_LEN, PAYLOAD_LEN)).unwrap();
    (temp, store)
}

fn block(id: u64, fill: u8) -> KeyedBlock {
    KeyedBlock::with_full_key(
        format!("resize-{}", id).into_bytes(),
        vec![fill; HEADER_LEN],
        vec![fill ^ 0xFF; PAYLOAD_LEN],
    )
}

fn put_all(store: &SaltedHashStore<KeyedBlockCallback>, blocks: &[KeyedBlock]) {
    for b in blocks {
        assert_eq!(
            store.put(b, b.payload(), b.header(), PutOptions::default()).unwrap(),
            PutOutcome::Stored
        );
    }
}

fn assert_all_fetchable(store: &SaltedHashStore<KeyedBlockCallback>, blocks: &[KeyedBlock]) {
    for b in blocks {
        let found = store
            .fetch(b.routing_key(), None, FetchOptions::default())
            .unwrap()
            .unwrap_or_else(|| panic!("block {:?} lost", b.full_key()));
        assert_eq!(found.header(), b.header());
        assert_eq!(found.payload(), b.payload());
    }
}

// =============================================================================
// Blocking Resize Tests
// =============================================================================

#[test]
fn test_grow_keeps_every_key() {
    let (_temp, store) = setup_temp_store(64);
    let blocks: Vec<_> = (0..20).map(|i| block(i, i as u8)).collect();
    put_all(&store, &blocks);

    store.set_max_keys(256, true).unwrap();

    let stats = store.stats();
    assert_eq!(stats.store_size, 256);
    assert_eq!(stats.prev_store_size, 0);
    assert_eq!(stats.key_count, 20);
    assert_eq!(store.sweep_state(), SweepState::Idle);
    assert_all_fetchable(&store, &blocks);

    for b in &blocks {
        let offset = store.locate(b.routing_key()).unwrap().unwrap();
        assert!(store.candidate_slots(b.routing_key()).contains(&offset));
        assert_eq!(store.inspect_slot(offset).unwrap().store_size, 256);
    }
}

#[test]
fn test_shrink_keeps_every_key() {
    let (_temp, store) = setup_temp_store(512);
    let blocks: Vec<_> = (0..30).map(|i| block(i, i as u8)).collect();
    put_all(&store, &blocks);

    store.set_max_keys(256, true).unwrap();

    let stats = store.stats();
    assert_eq!(stats.store_size, 256);
    assert_eq!(stats.prev_store_size, 0);
    assert_all_fetchable(&store, &blocks);
}

#[test]
fn test_resize_then_rebuild_clears_flag() {
    let (_temp, store) = setup_temp_store(64);
    let blocks: Vec<_> = (0..10).map(|i| block(i, 1)).collect();
    put_all(&store, &blocks);

    store.set_max_keys(128, true).unwrap();
    assert!(store.stats().rebuild_pending);

    let generation = store.stats().generation;
    store.run_maintenance().unwrap();
    let stats = store.stats();
    assert!(!stats.rebuild_pending);
    assert_eq!(stats.generation, generation + 1);
    assert_eq!(stats.key_count, 10);
}

// =============================================================================
// Pending Resize Tests
// =============================================================================

#[test]
fn test_reads_and_writes_while_pending() {
    let (_temp, store) = setup_temp_store(64);
    let old: Vec<_> = (0..15).map(|i| block(i, 2)).collect();
    put_all(&store, &old);

    store.set_max_keys(128, false).unwrap();
    assert_eq!(store.stats().prev_store_size, 64);

    // Old entries are still found through the previous size
    assert_all_fetchable(&store, &old);

    let fresh: Vec<_> = (100..115).map(|i| block(i, 3)).collect();
    put_all(&store, &fresh);
    assert_all_fetchable(&store, &fresh);

    store.run_maintenance().unwrap();
    assert_eq!(store.stats().prev_store_size, 0);
    assert_all_fetchable(&store, &old);
    assert_all_fetchable(&store, &fresh);
}

#[test]
fn test_overwrite_found_at_previous_size() {
    let (_temp, store) = setup_temp_store(64);
    let original = block(7, 1);
    let replacement = block(7, 2);
    put_all(&store, &[original]);

    store.set_max_keys(128, false).unwrap();
    let outcome = store
        .put(
            &replacement,
            replacement.payload(),
            replacement.header(),
            PutOptions {
                overwrite: true,
                is_old_block: false,
            },
        )
        .unwrap();
    assert_eq!(outcome, PutOutcome::Stored);

    let offset = store.locate(replacement.routing_key()).unwrap().unwrap();
    assert!(store.candidate_slots(replacement.routing_key()).contains(&offset));
    assert_eq!(store.inspect_slot(offset).unwrap().store_size, 128);

    store.run_maintenance().unwrap();
    assert_all_fetchable(&store, &[replacement]);
}

#[test]
fn test_second_request_ignored_while_pending() {
    let (_temp, store) = setup_temp_store(64);

    store.set_max_keys(128, false).unwrap();
    store.set_max_keys(32, false).unwrap();
    assert_eq!(store.max_keys(), 128);

    store.run_maintenance().unwrap();
    assert_eq!(store.max_keys(), 128);
    assert_eq!(store.stats().prev_store_size, 0);
}

#[test]
fn test_same_size_is_a_no_op() {
    let (_temp, store) = setup_temp_store(64);
    let generation = store.stats().generation;

    store.set_max_keys(64, true).unwrap();

    let stats = store.stats();
    assert_eq!(stats.store_size, 64);
    assert_eq!(stats.prev_store_size, 0);
    assert_eq!(stats.generation, generation);
}

#[test]
fn test_zero_size_rejected() {
    let (_temp, store) = setup_temp_store(64);
    assert!(matches!(store.set_max_keys(0, true), Err(StoreError::Config(_))));
}

#[test]
fn test_pending_resize_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let config = StoreConfig::builder()
        .dir(temp.path())
        .name("resize")
        .max_keys(64)
        .start_cleaner(false)
        .build();
    let blocks: Vec<_> = (0..10).map(|i| block(i, 4)).collect();
    {
        let store = SaltedHashStore::open(config.clone(), KeyedBlockCallback::new(HEADER_LEN, PAYLOAD_LEN)).unwrap();
        put_all(&store, &blocks);
        store.set_max_keys(200, false).unwrap();
        store.close().unwrap();
    }

    // Reopening with the new size resumes rather than restarting
    let config = StoreConfig { max_keys: 200, ..config };
    let store = SaltedHashStore::open(config, KeyedBlockCallback::new(HEADER_LEN, PAYLOAD_LEN)).unwrap();
    assert_eq!(store.stats().prev_store_size, 64);
    assert_all_fetchable(&store, &blocks);

    store.run_maintenance().unwrap();
    assert_eq!(store.stats().prev_store_size, 0);
    assert_all_fetchable(&store, &blocks);
}

// =============================================================================
// Background Cleaner Tests
// =============================================================================

#[test]
fn test_cleaner_migrates_in_background() {
    let temp = TempDir::new().unwrap();
    let config = StoreConfig::builder()
        .dir(temp.path())
        .name("resize")
        .max_keys(64)
        .resize_batch(8)
        .cleaner_period(Duration::from_millis(50))
        .build();
    let store = SaltedHashStore::open(config, KeyedBlockCallback::new(HEADER_LEN, PAYLOAD_LEN)).unwrap();
    let blocks: Vec<_> = (0..20).map(|i| block(i, 5)).collect();
    put_all(&store, &blocks);

    store.set_max_keys(160, false).unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let stats = store.stats();
        if stats.prev_store_size == 0 && !stats.rebuild_pending {
            break;
        }
        assert!(Instant::now() < deadline, "cleaner never finished: {:?}", stats);
        thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(store.max_keys(), 160);
    assert_all_fetchable(&store, &blocks);
    store.close().unwrap();
}

#[test]
fn test_close_during_background_resize_keeps_keys() {
    let temp = TempDir::new().unwrap();
    let config = StoreConfig::builder()
        .dir(temp.path())
        .name("resize")
        .max_keys(512)
        .resize_batch(4)
        .relocation_queue(4)
        .cleaner_period(Duration::from_millis(20))
        .build();
    let blocks: Vec<_> = (0..60).map(|i| block(i, 9)).collect();
    {
        let store = SaltedHashStore::open(config.clone(), KeyedBlockCallback::new(HEADER_LEN, PAYLOAD_LEN)).unwrap();
        put_all(&store, &blocks);
        store.set_max_keys(2048, false).unwrap();
        thread::sleep(Duration::from_millis(5));
        store.close().unwrap();
    }

    // Wherever the sweep stopped, every block is still reachable
    let config = StoreConfig {
        max_keys: 2048,
        start_cleaner: false,
        ..config
    };
    let store = SaltedHashStore::open(config, KeyedBlockCallback::new(HEADER_LEN, PAYLOAD_LEN)).unwrap();
    assert_all_fetchable(&store, &blocks);

    store.run_maintenance().unwrap();
    let stats = store.stats();
    assert_eq!(stats.prev_store_size, 0);
    assert_eq!(stats.key_count, 60);
    assert_all_fetchable(&store, &blocks);
}

// =============================================================================
// Concurrent Sweep Tests
// =============================================================================

#[test]
fn test_callers_during_resize_and_rebuild() {
    let (_temp, store) = setup_temp_store(512);
    let resident: Vec<_> = (0..60).map(|i| block(i, 6)).collect();
    put_all(&store, &resident);
    let store = Arc::new(store);
    let resident = Arc::new(resident);

    let sweeper = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            store.set_max_keys(2048, true).unwrap();
            store.run_maintenance().unwrap();
        })
    };

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let store = Arc::clone(&store);
            let resident = Arc::clone(&resident);
            thread::spawn(move || {
                let mine: Vec<_> = (0..30).map(|i| block(1000 + t * 100 + i, t as u8)).collect();
                for (i, b) in mine.iter().enumerate() {
                    assert_eq!(
                        store.put(b, b.payload(), b.header(), PutOptions::default()).unwrap(),
                        PutOutcome::Stored
                    );
                    assert_all_fetchable(&store, &mine[..=i]);
                    assert_all_fetchable(&store, &resident[i % 60..i % 60 + 1]);
                }
                mine
            })
        })
        .collect();

    let mut written = Vec::new();
    for writer in writers {
        written.extend(writer.join().unwrap());
    }
    sweeper.join().unwrap();

    let stats = store.stats();
    assert_eq!(stats.store_size, 2048);
    assert_eq!(stats.prev_store_size, 0);
    assert!(!stats.rebuild_pending);
    assert_all_fetchable(&store, &resident);
    assert_all_fetchable(&store, &written);
    assert_eq!(store.key_count(), 180);
}

// =============================================================================
// Relocation Queue Tests
// =============================================================================

fn open_with_queue(temp: &TempDir, slots: u64, relocation_queue: usize) -> SaltedHashStore<KeyedBlockCallback> {
    let config = StoreConfig::builder()
        .dir(temp.path())
        .name("resize")
        .max_keys(slots)
        .resize_batch(16)
        .relocation_queue(relocation_queue)
        .start_cleaner(false)
        .build();
    SaltedHashStore::open(config, KeyedBlockCallback::new(HEADER_LEN, PAYLOAD_LEN)).unwrap()
}

#[test]
fn test_forced_drain_places_every_key_with_room() {
    let temp = TempDir::new().unwrap();
    let store = open_with_queue(&temp, 256, 0);
    let blocks: Vec<_> = (0..40).map(|i| block(i, 7)).collect();
    put_all(&store, &blocks);

    store.set_max_keys(1024, true).unwrap();

    assert_eq!(store.stats().prev_store_size, 0);
    assert_eq!(store.key_count(), 40);
    assert_all_fetchable(&store, &blocks);
}

#[test]
fn test_forced_drain_into_small_table() {
    let temp = TempDir::new().unwrap();
    let store = open_with_queue(&temp, 512, 0);
    let blocks: Vec<_> = (0..100).map(|i| block(i, 8)).collect();
    for b in &blocks {
        store.put(b, b.payload(), b.header(), PutOptions::default()).unwrap();
    }

    store.set_max_keys(32, true).unwrap();
    store.run_maintenance().unwrap();

    let stats = store.stats();
    assert_eq!(stats.store_size, 32);
    assert_eq!(stats.prev_store_size, 0);
    assert!(stats.key_count > 0 && stats.key_count <= 32);

    // Evicted blocks are gone; every survivor is intact and counted once
    let mut survivors = 0;
    for b in &blocks {
        if let Some(found) = store.fetch(b.routing_key(), None, FetchOptions::default()).unwrap() {
            assert_eq!(found.payload(), b.payload());
            survivors += 1;
        }
    }
    assert_eq!(survivors, stats.key_count);
}
