//! Block Model
//!
//! What a store needs to know about the blocks it holds: fixed header and
//! payload lengths, whether two different blocks can share a routing key,
//! and how to rebuild (and verify) a block from its stored bytes.
//!
//! Two families ship with the crate:
//! - [`ContentBlock`]: routing key is `SHA-256(header || payload)`, so a key
//!   identifies exactly one block and collisions are impossible.
//! - [`KeyedBlock`]: routing key chosen by the caller (or derived from a
//!   public "full key"); two different blocks may share it.

use sha2::{Digest, Sha256};

use crate::cipher::RoutingKey;
use crate::error::{Result, StoreError};

/// A block that can be stored under its routing key
pub trait StorableBlock: Send {
    fn routing_key(&self) -> &RoutingKey;
}

/// Describes one block family to a store
pub trait StoreCallback: Send + Sync + 'static {
    type Block: StorableBlock;

    /// Fixed header length in bytes
    fn header_len(&self) -> usize;

    /// Fixed payload length in bytes
    fn payload_len(&self) -> usize;

    /// Can two different blocks share one routing key?
    ///
    /// When true, `put` reads back and compares the stored block before
    /// deciding whether a key is already present.
    fn collision_possible(&self) -> bool;

    /// Rebuild a block from decrypted bytes
    ///
    /// Returns [`StoreError::Verify`] if the bytes do not belong to
    /// `routing_key` (or to `full_key`, when one is given).
    fn construct(
        &self,
        header: &[u8],
        payload: &[u8],
        routing_key: &RoutingKey,
        full_key: Option<&[u8]>,
    ) -> Result<Self::Block>;
}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

// =============================================================================
// Content-Hash Blocks
// =============================================================================

/// Block addressed by the hash of its own bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentBlock {
    routing_key: RoutingKey,
    header: Vec<u8>,
    payload: Vec<u8>,
}

impl ContentBlock {
    pub fn new(header: Vec<u8>, payload: Vec<u8>) -> Self {
        let routing_key = sha256(&[&header, &payload]);
        Self {
            routing_key,
            header,
            payload,
        }
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl StorableBlock for ContentBlock {
    fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }
}

/// Store callback for [`ContentBlock`]s of one size
#[derive(Debug, Clone)]
pub struct ContentBlockCallback {
    header_len: usize,
    payload_len: usize,
}

impl ContentBlockCallback {
    pub fn new(header_len: usize, payload_len: usize) -> Self {
        Self {
            header_len,
            payload_len,
        }
    }
}

impl StoreCallback for ContentBlockCallback {
    type Block = ContentBlock;

    fn header_len(&self) -> usize {
        self.header_len
    }

    fn payload_len(&self) -> usize {
        self.payload_len
    }

    fn collision_possible(&self) -> bool {
        false
    }

    fn construct(
        &self,
        header: &[u8],
        payload: &[u8],
        routing_key: &RoutingKey,
        _full_key: Option<&[u8]>,
    ) -> Result<ContentBlock> {
        let block = ContentBlock::new(header.to_vec(), payload.to_vec());
        if block.routing_key != *routing_key {
            return Err(StoreError::Verify(format!(
                "content hash {} does not match key {}",
                hex::encode(block.routing_key),
                hex::encode(routing_key)
            )));
        }
        Ok(block)
    }
}

// =============================================================================
// Keyed Blocks
// =============================================================================

/// Block stored under a key that does not depend on its content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedBlock {
    routing_key: RoutingKey,
    full_key: Option<Vec<u8>>,
    header: Vec<u8>,
    payload: Vec<u8>,
}

impl KeyedBlock {
    /// Block under an arbitrary caller-chosen key
    pub fn new(routing_key: RoutingKey, header: Vec<u8>, payload: Vec<u8>) -> Self {
        Self {
            routing_key,
            full_key: None,
            header,
            payload,
        }
    }

    /// Block whose routing key is the hash of a public full key
    pub fn with_full_key(full_key: Vec<u8>, header: Vec<u8>, payload: Vec<u8>) -> Self {
        Self {
            routing_key: sha256(&[&full_key]),
            full_key: Some(full_key),
            header,
            payload,
        }
    }

    pub fn full_key(&self) -> Option<&[u8]> {
        self.full_key.as_deref()
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl StorableBlock for KeyedBlock {
    fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }
}

/// Store callback for [`KeyedBlock`]s of one size
#[derive(Debug, Clone)]
pub struct KeyedBlockCallback {
    header_len: usize,
    payload_len: usize,
}

impl KeyedBlockCallback {
    pub fn new(header_len: usize, payload_len: usize) -> Self {
        Self {
            header_len,
            payload_len,
        }
    }
}

impl StoreCallback for KeyedBlockCallback {
    type Block = KeyedBlock;

    fn header_len(&self) -> usize {
        self.header_len
    }

    fn payload_len(&self) -> usize {
        self.payload_len
    }

    fn collision_possible(&self) -> bool {
        true
    }

    fn construct(
        &self,
        header: &[u8],
        payload: &[u8],
        routing_key: &RoutingKey,
        full_key: Option<&[u8]>,
    ) -> Result<KeyedBlock> {
        let full_key = match full_key {
            Some(full_key) => {
                if sha256(&[full_key]) != *routing_key {
                    return Err(StoreError::Verify(format!(
                        "full key does not hash to {}",
                        hex::encode(routing_key)
                    )));
                }
                Some(full_key.to_vec())
            }
            None => None,
        };

        Ok(KeyedBlock {
            routing_key: *routing_key,
            full_key,
            header: header.to_vec(),
            payload: payload.to_vec(),
        })
    }
}
