//! Store statistics
//!
//! Per-instance atomic counters. Loaded from the header on open and written
//! back on every header save.

use std::sync::atomic::{AtomicU64, Ordering};

use super::header::StoreHeader;

/// Live counters, updated lock-free from any thread
#[derive(Debug, Default)]
pub(crate) struct StoreCounters {
    pub writes: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub false_positives: AtomicU64,
    pub key_count: AtomicU64,
}

impl StoreCounters {
    pub fn from_header(header: &StoreHeader) -> Self {
        Self {
            writes: AtomicU64::new(header.writes),
            hits: AtomicU64::new(header.hits),
            misses: AtomicU64::new(header.misses),
            false_positives: AtomicU64::new(header.false_positives),
            key_count: AtomicU64::new(header.key_count),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_key(&self) {
        self.key_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement without wrapping below zero
    pub fn drop_key(&self) {
        let _ = self
            .key_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Copy the counters into a header about to be saved
    pub fn store_into(&self, header: &mut StoreHeader) {
        header.writes = self.writes.load(Ordering::Relaxed);
        header.hits = self.hits.load(Ordering::Relaxed);
        header.misses = self.misses.load(Ordering::Relaxed);
        header.false_positives = self.false_positives.load(Ordering::Relaxed);
        header.key_count = self.key_count.load(Ordering::Relaxed);
    }
}

/// Point-in-time view of a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Slots in the table
    pub store_size: u64,
    /// Slots before the running resize, 0 when stable
    pub prev_store_size: u64,
    /// Entries stamped with the current generation plus those written since
    pub key_count: u64,
    pub generation: u32,
    pub writes: u64,
    pub hits: u64,
    pub misses: u64,
    /// Fingerprint matched but the record held another key
    pub false_positives: u64,
    pub rebuild_pending: bool,
}

impl StoreStats {
    /// Fraction of fetches that found their block
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
