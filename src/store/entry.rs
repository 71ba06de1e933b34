//! Entry records
//!
//! An entry is plain data; everything that depends on the store's geometry
//! takes an explicit [`EntryLayout`].
//!
//! ## Metadata Record (128 bytes per slot, big-endian)
//! ```text
//!        0 1 2 3 4 5 6 7 8 9 A B C D E F
//! 0x0000 ┌───────────────────────────────┐
//!        │       Digested Routing Key    │
//! 0x0010 │                               │
//! 0x0020 ├───────────────────────────────┤
//!        │          Encryption IV        │
//! 0x0030 ├───────────────┬───────────────┤
//!        │     Flags     │  Store Size   │
//! 0x0040 ├───────────────┴───────────────┤
//!        │       Plain Routing Key       │
//! 0x0050 │   (only with FLAG_PLAINKEY)   │
//! 0x0060 ├───────┬───────────────────────┤
//!        │  Gen  │       Reserved        │
//! 0x0070 ├───────┴───────────────────────┤
//!        │            Reserved           │
//!        └───────────────────────────────┘
//! ```
//!
//! ## Header/Payload Record
//! `header || payload`, zero padded to a multiple of 512 bytes.

use bytes::{Buf, BufMut};

use crate::cipher::{DigestedKey, RoutingKey, IV_LENGTH};
use crate::slot_cache;

/// Metadata record length
pub const METADATA_LENGTH: usize = 0x80;

/// Header/payload records are padded to this alignment
pub const HD_ALIGNMENT: usize = 512;

pub const ENTRY_FLAG_OCCUPIED: u64 = 0x1;
pub const ENTRY_FLAG_PLAINKEY: u64 = 0x2;
pub const ENTRY_FLAG_NEW_BLOCK: u64 = 0x4;
pub const ENTRY_FLAG_WRONG_STORE: u64 = 0x8;

const PLAIN_KEY_POSITION: usize = 0x40;
const GENERATION_POSITION: usize = 0x60;

/// Fixed geometry shared by every entry of one store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLayout {
    pub header_len: usize,
    pub payload_len: usize,
    pub max_probes: usize,
    pub store_plain_keys: bool,
}

impl EntryLayout {
    /// Unpadded header + payload length
    pub fn hd_len(&self) -> usize {
        self.header_len + self.payload_len
    }

    /// Header + payload record length on disk
    pub fn hd_record_len(&self) -> usize {
        self.hd_len().div_ceil(HD_ALIGNMENT).max(1) * HD_ALIGNMENT
    }
}

/// One slot's content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub digested_key: DigestedKey,
    /// Known in memory for entries we created or decrypted; persisted only
    /// with `ENTRY_FLAG_PLAINKEY`
    pub plain_key: Option<RoutingKey>,
    pub iv: [u8; IV_LENGTH],
    pub flags: u64,
    /// Table size the entry's slot was chosen under
    pub store_size: u64,
    pub generation: u32,
    /// Empty until loaded
    pub header: Vec<u8>,
    /// Empty until loaded
    pub payload: Vec<u8>,
    pub encrypted: bool,
    /// Slot this entry was read from or last written to
    pub offset: Option<u64>,
}

/// Parameters for a freshly created entry
pub struct NewEntry<'a> {
    pub routing_key: RoutingKey,
    pub digested_key: DigestedKey,
    pub header: &'a [u8],
    pub payload: &'a [u8],
    pub store_size: u64,
    pub generation: u32,
    pub new_block: bool,
    pub wrong_store: bool,
}

impl Entry {
    /// Build an unencrypted entry from caller data
    pub fn create(new: NewEntry<'_>, layout: &EntryLayout) -> Self {
        let mut flags = ENTRY_FLAG_OCCUPIED;
        if layout.store_plain_keys {
            flags |= ENTRY_FLAG_PLAINKEY;
        }
        if new.new_block {
            flags |= ENTRY_FLAG_NEW_BLOCK;
        }
        if new.wrong_store {
            flags |= ENTRY_FLAG_WRONG_STORE;
        }

        // Copies: encryption works in place
        let mut header = new.header.to_vec();
        header.resize(layout.header_len, 0);
        let mut payload = new.payload.to_vec();
        payload.resize(layout.payload_len, 0);

        Self {
            digested_key: new.digested_key,
            plain_key: Some(new.routing_key),
            iv: [0u8; IV_LENGTH],
            flags,
            store_size: new.store_size,
            generation: new.generation,
            header,
            payload,
            encrypted: false,
            offset: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.flags & ENTRY_FLAG_OCCUPIED == 0
    }

    pub fn is_new_block(&self) -> bool {
        self.flags & ENTRY_FLAG_NEW_BLOCK != 0
    }

    pub fn is_wrong_store(&self) -> bool {
        self.flags & ENTRY_FLAG_WRONG_STORE != 0
    }

    pub fn has_persisted_plain_key(&self) -> bool {
        self.flags & ENTRY_FLAG_PLAINKEY != 0
    }

    /// Slot status word for this entry
    pub fn status_word(&self) -> u32 {
        if self.is_free() {
            slot_cache::FREE_WORD
        } else {
            slot_cache::occupied_word(&self.digested_key, self.is_new_block(), self.is_wrong_store())
        }
    }

    /// Attach header/payload bytes read from disk
    pub fn set_hd(&mut self, record: &[u8], layout: &EntryLayout) {
        let header_end = layout.header_len.min(record.len());
        let payload_end = layout.hd_len().min(record.len());
        self.header = record[..header_end].to_vec();
        self.payload = record[header_end..payload_end].to_vec();
        self.header.resize(layout.header_len, 0);
        self.payload.resize(layout.payload_len, 0);
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Decode a metadata record; header/payload are left empty
pub fn decode_metadata(record: &[u8], offset: u64) -> Entry {
    let mut buf = &record[..METADATA_LENGTH.min(record.len())];
    if buf.len() < METADATA_LENGTH {
        return free_entry(offset);
    }

    let mut digested_key = [0u8; 32];
    buf.copy_to_slice(&mut digested_key);
    let mut iv = [0u8; IV_LENGTH];
    buf.copy_to_slice(&mut iv);
    let flags = buf.get_u64();
    let store_size = buf.get_u64();

    let plain_key = if flags & ENTRY_FLAG_PLAINKEY != 0 {
        let mut key = [0u8; 32];
        key.copy_from_slice(&record[PLAIN_KEY_POSITION..PLAIN_KEY_POSITION + 32]);
        Some(key)
    } else {
        None
    };

    let mut gen_buf = &record[GENERATION_POSITION..GENERATION_POSITION + 4];
    let generation = gen_buf.get_u32();

    Entry {
        digested_key,
        plain_key,
        iv,
        flags,
        store_size,
        generation,
        header: Vec::new(),
        payload: Vec::new(),
        encrypted: true,
        offset: Some(offset),
    }
}

/// Encode an (encrypted) entry's metadata record
pub fn encode_metadata(entry: &Entry) -> [u8; METADATA_LENGTH] {
    debug_assert!(entry.encrypted || entry.is_free());

    let mut out = [0u8; METADATA_LENGTH];
    {
        let mut buf = &mut out[..];
        buf.put_slice(&entry.digested_key);
        buf.put_slice(&entry.iv);
        buf.put_u64(entry.flags);
        buf.put_u64(entry.store_size);
    }

    if entry.has_persisted_plain_key() {
        if let Some(key) = &entry.plain_key {
            out[PLAIN_KEY_POSITION..PLAIN_KEY_POSITION + 32].copy_from_slice(key);
        }
    }

    out[GENERATION_POSITION..GENERATION_POSITION + 4].copy_from_slice(&entry.generation.to_be_bytes());
    out
}

/// Encode an (encrypted) entry's header/payload record, padded
pub fn encode_hd(entry: &Entry, layout: &EntryLayout) -> Vec<u8> {
    let mut out = Vec::with_capacity(layout.hd_record_len());
    out.extend_from_slice(&entry.header);
    out.extend_from_slice(&entry.payload);
    out.resize(layout.hd_record_len(), 0);
    out
}

/// Overwrite the generation field of a raw metadata record in place
pub fn patch_generation(record: &mut [u8], generation: u32) {
    record[GENERATION_POSITION..GENERATION_POSITION + 4].copy_from_slice(&generation.to_be_bytes());
}

/// A free slot at `offset`
pub fn free_entry(offset: u64) -> Entry {
    Entry {
        digested_key: [0u8; 32],
        plain_key: None,
        iv: [0u8; IV_LENGTH],
        flags: 0,
        store_size: 0,
        generation: 0,
        header: Vec::new(),
        payload: Vec::new(),
        encrypted: true,
        offset: Some(offset),
    }
}
