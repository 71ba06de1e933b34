//! Store Header
//!
//! The small fixed-layout `<name>.config` file.
//!
//! ## Layout (104 bytes, big-endian)
//! ```text
//! ┌────────┬──────────────────────────────────────────┐
//! │ 0x00   │ salt [16] (wrapped if SALT_WRAPPED)      │
//! │ 0x10   │ store size u64                           │
//! │ 0x18   │ previous store size u64 (0 = stable)     │
//! │ 0x20   │ key count u64                            │
//! │ 0x28   │ generation u32                           │
//! │ 0x2C   │ flags u32                                │
//! │ 0x30   │ salt wrap nonce [8]                      │
//! │ 0x38   │ salt check [8]                           │
//! │ 0x40   │ writes u64                               │
//! │ 0x48   │ hits u64                                 │
//! │ 0x50   │ misses u64                               │
//! │ 0x58   │ false positives u64                      │
//! │ 0x60   │ CRC32 of bytes 0x00..0x60                │
//! │ 0x64   │ reserved u32                             │
//! └────────┴──────────────────────────────────────────┘
//! ```
//!
//! Saved to `<name>.config.tmp`, synced, then renamed over the real file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};

use crate::cipher::SALT_LENGTH;
use crate::error::{Result, StoreError};

/// Header file length
pub const HEADER_LENGTH: usize = 0x68;

const CRC_POSITION: usize = 0x60;

/// The store was open (or crashed) without a clean close
pub const FLAG_DIRTY: u32 = 0x1;
/// Slot status words must be re-derived from disk
pub const FLAG_REBUILD: u32 = 0x2;
/// `salt` is stored wrapped by the master key
pub const FLAG_SALT_WRAPPED: u32 = 0x4;

/// Decoded `<name>.config`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    /// As stored on disk: wrapped when `FLAG_SALT_WRAPPED` is set
    pub salt: [u8; SALT_LENGTH],
    pub store_size: u64,
    pub prev_store_size: u64,
    pub key_count: u64,
    pub generation: u32,
    pub flags: u32,
    pub wrap_nonce: [u8; 8],
    pub salt_check: [u8; 8],
    pub writes: u64,
    pub hits: u64,
    pub misses: u64,
    pub false_positives: u64,
}

impl StoreHeader {
    /// A fresh header for an empty table
    pub fn new(salt: [u8; SALT_LENGTH], store_size: u64) -> Self {
        Self {
            salt,
            store_size,
            prev_store_size: 0,
            key_count: 0,
            generation: 0,
            flags: 0,
            wrap_nonce: [0u8; 8],
            salt_check: [0u8; 8],
            writes: 0,
            hits: 0,
            misses: 0,
            false_positives: 0,
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u32, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut out = [0u8; HEADER_LENGTH];
        {
            let mut buf = &mut out[..];
            buf.put_slice(&self.salt);
            buf.put_u64(self.store_size);
            buf.put_u64(self.prev_store_size);
            buf.put_u64(self.key_count);
            buf.put_u32(self.generation);
            buf.put_u32(self.flags);
            buf.put_slice(&self.wrap_nonce);
            buf.put_slice(&self.salt_check);
            buf.put_u64(self.writes);
            buf.put_u64(self.hits);
            buf.put_u64(self.misses);
            buf.put_u64(self.false_positives);
        }

        let crc = crc32fast::hash(&out[..CRC_POSITION]);
        out[CRC_POSITION..CRC_POSITION + 4].copy_from_slice(&crc.to_be_bytes());
        out
    }

    /// Decode and verify a header
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LENGTH {
            return Err(StoreError::Corrupt(format!(
                "header is {} bytes, expected {}",
                bytes.len(),
                HEADER_LENGTH
            )));
        }

        let mut trailer = &bytes[CRC_POSITION..CRC_POSITION + 4];
        let stored_crc = trailer.get_u32();
        let actual_crc = crc32fast::hash(&bytes[..CRC_POSITION]);
        if stored_crc != actual_crc {
            return Err(StoreError::Corrupt(format!(
                "header checksum mismatch: stored {:08x}, computed {:08x}",
                stored_crc, actual_crc
            )));
        }

        let mut buf = &bytes[..CRC_POSITION];
        let mut salt = [0u8; SALT_LENGTH];
        buf.copy_to_slice(&mut salt);
        let store_size = buf.get_u64();
        let prev_store_size = buf.get_u64();
        let key_count = buf.get_u64();
        let generation = buf.get_u32();
        let flags = buf.get_u32();
        let mut wrap_nonce = [0u8; 8];
        buf.copy_to_slice(&mut wrap_nonce);
        let mut salt_check = [0u8; 8];
        buf.copy_to_slice(&mut salt_check);

        let header = Self {
            salt,
            store_size,
            prev_store_size,
            key_count,
            generation,
            flags,
            wrap_nonce,
            salt_check,
            writes: buf.get_u64(),
            hits: buf.get_u64(),
            misses: buf.get_u64(),
            false_positives: buf.get_u64(),
        };

        if header.store_size == 0 {
            return Err(StoreError::Corrupt("header records a zero store size".into()));
        }
        Ok(header)
    }

    /// Load the header at `path`; `Ok(None)` if there is none yet
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut bytes = Vec::with_capacity(HEADER_LENGTH);
        file.read_to_end(&mut bytes)?;
        Self::decode(&bytes).map(Some)
    }

    /// Atomically replace the header at `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = tmp_path(path);

        // Step 1: Write and sync the temporary copy
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&self.encode())?;
        file.sync_all()?;
        drop(file);

        // Step 2: Swap it in
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
