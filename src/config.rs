//! Configuration for SaltKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Default number of candidate slots per key
pub const DEFAULT_MAX_PROBES: usize = 5;

/// Configuration for one salted hash store instance
#[derive(Clone)]
pub struct StoreConfig {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding the store files
    /// Internal structure:
    ///   {dir}/
    ///     ├── {name}.config     (store header)
    ///     ├── {name}.metadata   (one 128-byte record per slot)
    ///     ├── {name}.hd         (header + payload per slot)
    ///     └── {name}.slots      (slot status cache)
    pub dir: PathBuf,

    /// File name prefix, also used in log lines and thread names
    pub name: String,

    /// Number of slots in the table
    pub max_keys: u64,

    /// Candidate slots probed per key
    pub max_probes: usize,

    /// Persist each entry's plaintext lookup key next to its digest.
    /// Required to move evicted blocks into an overflow store.
    pub store_plain_keys: bool,

    /// Optional key wrapping the salt on disk
    pub master_key: Option<[u8; 32]>,

    // -------------------------------------------------------------------------
    // Slot Cache Configuration
    // -------------------------------------------------------------------------
    /// Keep a status word per slot to skip disk reads
    pub slot_cache: bool,

    /// How eagerly the slot cache is written back to its file
    pub cache_persistence: CachePersistence,

    // -------------------------------------------------------------------------
    // Locking Configuration
    // -------------------------------------------------------------------------
    /// Budget for acquiring all slot locks of one operation
    pub lock_timeout: Duration,

    /// How often a blocked lock waiter re-checks for shutdown
    pub lock_poll_interval: Duration,

    // -------------------------------------------------------------------------
    // Cleaner Configuration
    // -------------------------------------------------------------------------
    /// Spawn the background resize/rebuild thread on open
    pub start_cleaner: bool,

    /// Period between cleaner runs
    pub cleaner_period: Duration,

    /// Slots processed per locked batch during a sweep
    pub resize_batch: u64,

    /// Entries buffered in memory while relocating during a resize
    pub relocation_queue: usize,
}

/// Slot cache write-back policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePersistence {
    /// Write every changed word immediately (safest, slowest)
    WriteThrough,

    /// Flush the whole cache no sooner than `delay` after it became dirty
    Periodic { delay: Duration },

    /// Flush only on clean shutdown or explicit force
    OnShutdown,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./saltkv_data"),
            name: "store".to_string(),
            max_keys: 1024,
            max_probes: DEFAULT_MAX_PROBES,
            store_plain_keys: false,
            master_key: None,
            slot_cache: true,
            cache_persistence: CachePersistence::Periodic {
                delay: Duration::from_secs(30),
            },
            lock_timeout: Duration::from_secs(20),
            lock_poll_interval: Duration::from_secs(10),
            start_cleaner: true,
            cleaner_period: Duration::from_secs(5 * 60),
            resize_batch: 128,
            relocation_queue: 256,
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    // Hand-written so the master key never reaches a log line.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("dir", &self.dir)
            .field("name", &self.name)
            .field("max_keys", &self.max_keys)
            .field("max_probes", &self.max_probes)
            .field("store_plain_keys", &self.store_plain_keys)
            .field("master_key", &self.master_key.map(|_| "<redacted>"))
            .field("slot_cache", &self.slot_cache)
            .field("cache_persistence", &self.cache_persistence)
            .field("lock_timeout", &self.lock_timeout)
            .field("lock_poll_interval", &self.lock_poll_interval)
            .field("start_cleaner", &self.start_cleaner)
            .field("cleaner_period", &self.cleaner_period)
            .field("resize_batch", &self.resize_batch)
            .field("relocation_queue", &self.relocation_queue)
            .finish()
    }
}

impl StoreConfig {
    /// Create a new config builder
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Reject settings the store cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StoreError::Config("store name must not be empty".into()));
        }
        if self.max_keys == 0 {
            return Err(StoreError::Config("max_keys must be at least 1".into()));
        }
        if self.max_probes == 0 {
            return Err(StoreError::Config("max_probes must be at least 1".into()));
        }
        if self.resize_batch == 0 {
            return Err(StoreError::Config("resize_batch must be at least 1".into()));
        }
        if self.start_cleaner && self.cleaner_period.is_zero() {
            return Err(StoreError::Config("cleaner_period must be non-zero".into()));
        }
        if self.lock_poll_interval.is_zero() {
            return Err(StoreError::Config(
                "lock_poll_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for StoreConfig
#[derive(Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Set the directory holding the store files
    pub fn dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.dir = path.into();
        self
    }

    /// Set the store name (file prefix)
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the number of slots
    pub fn max_keys(mut self, max_keys: u64) -> Self {
        self.config.max_keys = max_keys;
        self
    }

    /// Set the number of candidate slots per key
    pub fn max_probes(mut self, probes: usize) -> Self {
        self.config.max_probes = probes;
        self
    }

    pub fn store_plain_keys(mut self, enabled: bool) -> Self {
        self.config.store_plain_keys = enabled;
        self
    }

    pub fn master_key(mut self, key: [u8; 32]) -> Self {
        self.config.master_key = Some(key);
        self
    }

    /// Enable or disable the slot status cache
    pub fn slot_cache(mut self, enabled: bool) -> Self {
        self.config.slot_cache = enabled;
        self
    }

    /// Set the slot cache write-back policy
    pub fn cache_persistence(mut self, policy: CachePersistence) -> Self {
        self.config.cache_persistence = policy;
        self
    }

    /// Set the overall slot lock budget per operation
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.config.lock_poll_interval = interval;
        self
    }

    /// Spawn (or not) the background cleaner thread
    pub fn start_cleaner(mut self, start: bool) -> Self {
        self.config.start_cleaner = start;
        self
    }

    pub fn cleaner_period(mut self, period: Duration) -> Self {
        self.config.cleaner_period = period;
        self
    }

    pub fn resize_batch(mut self, batch: u64) -> Self {
        self.config.resize_batch = batch;
        self
    }

    pub fn relocation_queue(mut self, entries: usize) -> Self {
        self.config.relocation_queue = entries;
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}
