//! # SaltKV
//!
//! An index-less, salted-hash, encrypted on-disk block store with:
//! - Open addressing over a fixed number of slots, no index to load
//! - Per-entry encryption keyed by the entry's own lookup key
//! - A per-slot status cache that lets most misses skip the disk
//! - Fine-grained per-slot locking for concurrent callers
//! - Online resize and cache rebuild on a background thread
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  SaltedHashStore<C>                         │
//! │          fetch / put / set_max_keys / probably_in_store     │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!      ┌────────────────┼─────────────────┬──────────────────┐
//!      │                │                 │                  │
//!      ▼                ▼                 ▼                  ▼
//! ┌──────────┐  ┌───────────────┐  ┌──────────────┐  ┌──────────────┐
//! │  Cipher  │  │ EntryLock     │  │ Slot cache   │  │ Cleaner      │
//! │ Manager  │  │ Manager       │  │ (Persistent  │  │ (resize /    │
//! │ (SHA-256,│  │ (per slot,    │  │  IntArray)   │  │  rebuild)    │
//! │  Salsa20)│  │  ascending)   │  └──────┬───────┘  └──────────────┘
//! └──────────┘  └───────────────┘         │
//!                                         ▼
//!                     ┌───────────────────────────────────────┐
//!                     │ <name>.config  <name>.metadata        │
//!                     │ <name>.hd      <name>.slots           │
//!                     └───────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod block;
pub mod cipher;
pub mod lock;
pub mod slot_cache;
pub mod store;
pub mod ticker;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use block::{
    ContentBlock, ContentBlockCallback, KeyedBlock, KeyedBlockCallback, StorableBlock,
    StoreCallback,
};
pub use cipher::{CipherManager, DigestedKey, RoutingKey};
pub use config::{CachePersistence, StoreConfig};
pub use error::{Result, StoreError};
pub use store::{
    FetchOptions, OverflowStore, PutOptions, PutOutcome, SaltedHashStore, SlotInspection,
    StoreStats, SweepState,
};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of SaltKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
