//! Probe sequence
//!
//! Maps a digested key and a table size to its candidate slots. The formula
//! is part of the on-disk format: changing it orphans every stored entry.

use std::collections::BTreeSet;

use crate::cipher::DigestedKey;

/// Candidate slots for `digest` in a table of `store_size` slots
///
/// `offset[i] = (h + 141*i^2 + 13*i) mod store_size` with `h` the low 64
/// bits of the digest masked non-negative. A repeated offset is moved
/// forward one slot at a time until unique, unless there are more probes
/// than slots.
pub fn probe_offsets(digest: &DigestedKey, store_size: u64, max_probes: usize) -> Vec<u64> {
    if store_size == 0 {
        return Vec::new();
    }

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let h = u64::from_le_bytes(head) & i64::MAX as u64;

    let dedup = max_probes as u64 <= store_size;
    let mut offsets: Vec<u64> = Vec::with_capacity(max_probes);

    for i in 0..max_probes as u64 {
        let step = 141u64.wrapping_mul(i * i).wrapping_add(13 * i);
        let mut offset = (h.wrapping_add(step) & i64::MAX as u64) % store_size;

        if dedup {
            while offsets.contains(&offset) {
                offset = (offset + 1) % store_size;
            }
        }
        offsets.push(offset);
    }

    offsets
}

/// Sorted, de-duplicated offsets to lock for a key
///
/// Includes the previous table size's candidates while a resize runs.
pub fn lock_set(digest: &DigestedKey, store_size: u64, prev_store_size: u64, max_probes: usize) -> BTreeSet<u64> {
    let mut set: BTreeSet<u64> = probe_offsets(digest, store_size, max_probes).into_iter().collect();
    if prev_store_size != 0 {
        set.extend(probe_offsets(digest, prev_store_size, max_probes));
    }
    set
}
