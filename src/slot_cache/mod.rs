//! Slot Cache Module
//!
//! One status word per slot summarising what is on disk, so lookups can
//! skip reads.
//!
//! ## Word Layout
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┬──────┬──────────────────┐
//! │ bit 31   │ bit 30   │ bit 29   │ bit 28   │27..24│ bits 23..0       │
//! │ observed │ occupied │ newer    │ wrong    │ zero │ key fingerprint  │
//! │          │          │ block    │ store    │      │                  │
//! └──────────┴──────────┴──────────┴──────────┴──────┴──────────────────┘
//! ```
//!
//! A zero word means "never observed". Once observed, a word is kept equal
//! to what the slot really holds, so "observed and not occupied" is exact.
//! A fingerprint match is only a hint (24 bits) and must be confirmed
//! against the record.

mod persistent_array;

pub use persistent_array::PersistentIntArray;

use crate::cipher::DigestedKey;

pub const SLOT_OBSERVED: u32 = 1 << 31;
pub const SLOT_OCCUPIED: u32 = 1 << 30;
pub const SLOT_NEW_BLOCK: u32 = 1 << 29;
pub const SLOT_WRONG_STORE: u32 = 1 << 28;
pub const FINGERPRINT_MASK: u32 = 0x00FF_FFFF;

/// 24-bit fingerprint of a digested key
///
/// Taken from the tail of the digest; probing uses the head.
pub fn fingerprint(digest: &DigestedKey) -> u32 {
    u32::from_be_bytes([0, digest[29], digest[30], digest[31]])
}

/// Status word describing an occupied slot
pub fn occupied_word(digest: &DigestedKey, new_block: bool, wrong_store: bool) -> u32 {
    let mut word = SLOT_OBSERVED | SLOT_OCCUPIED | fingerprint(digest);
    if new_block {
        word |= SLOT_NEW_BLOCK;
    }
    if wrong_store {
        word |= SLOT_WRONG_STORE;
    }
    word
}

/// Status word describing a free slot
pub const FREE_WORD: u32 = SLOT_OBSERVED;

pub fn is_observed(word: u32) -> bool {
    word & SLOT_OBSERVED != 0
}

/// Observed and definitely free
pub fn is_known_free(word: u32) -> bool {
    is_observed(word) && word & SLOT_OCCUPIED == 0
}

/// Observed and occupied
pub fn is_known_occupied(word: u32) -> bool {
    is_observed(word) && word & SLOT_OCCUPIED != 0
}

/// Could this slot hold `digest`?
///
/// True for unobserved slots and for occupied slots whose fingerprint
/// matches.
pub fn may_hold(word: u32, digest: &DigestedKey) -> bool {
    if !is_observed(word) {
        return true;
    }
    word & SLOT_OCCUPIED != 0 && word & FINGERPRINT_MASK == fingerprint(digest)
}
