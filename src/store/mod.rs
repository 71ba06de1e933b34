//! Salted Hash Store
//!
//! An index-less, open-addressing hash table on disk. Every key has up to
//! `max_probes` candidate slots derived from its salted digest; there is no
//! index to load, so opening a store costs a handful of small reads.
//!
//! ## Architecture
//! ```text
//!            fetch / put
//!                 │
//!     ┌───────────▼────────────┐
//!     │  header (RwLock, read) │  size / previous size / generation
//!     └───────────┬────────────┘
//!                 │ digest → candidate slots (current ∪ previous size)
//!     ┌───────────▼────────────┐
//!     │ EntryLockManager       │  ascending, bounded by lock_timeout
//!     └───────────┬────────────┘
//!                 │
//!     ┌───────────▼────────────┐      ┌──────────────────────┐
//!     │ slot status cache      │─────►│ <name>.metadata      │ only when the
//!     │ (skip known-free or    │      │ <name>.hd            │ word cannot rule
//!     │  mismatching slots)    │      └──────────────────────┘ the slot out
//!     └───────────┬────────────┘
//!                 │ miss / full
//!     ┌───────────▼────────────┐
//!     │ overflow store         │  at most one, never chained
//!     └────────────────────────┘
//! ```
//!
//! A background cleaner thread migrates entries after `set_max_keys` and
//! re-derives the status cache after an unclean shutdown (see [`sweep`]).

pub(crate) mod entry;
pub(crate) mod files;
mod header;
mod probe;
mod stats;
mod sweep;

pub use entry::{Entry, EntryLayout, NewEntry, HD_ALIGNMENT, METADATA_LENGTH};
pub use probe::{lock_set, probe_offsets};
pub use stats::StoreStats;
pub use sweep::{plan_next_sweep, SweepState, SweepTask};

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::block::{StorableBlock, StoreCallback};
use crate::cipher::{self, CipherManager, DigestedKey, RoutingKey, SALT_LENGTH};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::lock::{EntryLockManager, LockFailure, LockedSlots};
use crate::slot_cache::{self, PersistentIntArray};
use crate::ticker::{ThreadTicker, Ticker};

use entry::{decode_metadata, encode_hd, encode_metadata, ENTRY_FLAG_NEW_BLOCK};
use files::StoreFiles;
use header::{StoreHeader, FLAG_DIRTY, FLAG_REBUILD, FLAG_SALT_WRAPPED};
use stats::StoreCounters;
use sweep::SweepSignal;

// =============================================================================
// Public Types
// =============================================================================

/// Result of a successful `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Written to this store
    Stored,
    /// The same block was already present (its classification may have
    /// been upgraded)
    AlreadyStored,
    /// Written to the overflow store instead
    Redirected,
    /// The store is shutting down; nothing was written
    Dropped,
}

/// Per-call fetch behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Skip entries that are not classified as newer blocks
    pub ignore_old_blocks: bool,
    /// Fall back to the overflow store on a miss
    pub read_overflow: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            ignore_old_blocks: false,
            read_overflow: true,
        }
    }
}

/// Per-call put behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Replace a different block stored under the same key
    pub overwrite: bool,
    /// The block is not "newer"; it may be redirected to the overflow store
    /// rather than displace a newer block
    pub is_old_block: bool,
}

/// What one slot holds, as seen by the status cache and on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInspection {
    pub offset: u64,
    /// Cached status word (0 = unobserved or no cache)
    pub status_word: u32,
    pub occupied: bool,
    pub new_block: bool,
    pub wrong_store: bool,
    /// Table size the entry was written under
    pub store_size: u64,
    pub generation: u32,
}

// =============================================================================
// Store Handle
// =============================================================================

/// A salted hash store holding one [`StoreCallback`] block family
///
/// ## Usage
/// ```ignore
/// let config = StoreConfig::builder().dir("./data").name("chk").max_keys(4096).build();
/// let store = SaltedHashStore::open(config, ContentBlockCallback::new(36, 1024))?;
///
/// let block = ContentBlock::new(header, payload);
/// store.put(&block, block.payload(), block.header(), PutOptions::default())?;
/// let found = store.fetch(block.routing_key(), None, FetchOptions::default())?;
///
/// store.close()?;
/// ```
pub struct SaltedHashStore<C: StoreCallback> {
    inner: Arc<StoreInner<C>>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

/// A store that receives blocks redirected from another store
///
/// Obtained from [`SaltedHashStore::into_overflow_target`]. It cannot be
/// given an overflow store of its own, so redirection never chains.
pub struct OverflowStore<C: StoreCallback> {
    store: SaltedHashStore<C>,
}

/// Table geometry captured once per operation
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    store_size: u64,
    prev_store_size: u64,
    generation: u32,
}

impl Geometry {
    fn of(header: &StoreHeader) -> Self {
        Self {
            store_size: header.store_size,
            prev_store_size: header.prev_store_size,
            generation: header.generation,
        }
    }
}

#[derive(Clone, Copy)]
struct PutRequest<'a> {
    routing_key: &'a RoutingKey,
    header: &'a [u8],
    payload: &'a [u8],
    overwrite: bool,
    is_old_block: bool,
    /// This put is a redirect into an overflow store
    wrong_store: bool,
}

#[derive(Debug, Clone, Copy)]
struct Occupant {
    new_block: bool,
    wrong_store: bool,
}

/// Outcome of scanning a key's current candidates
enum Placement {
    Free(u64),
    Full(Vec<Occupant>),
}

pub(crate) struct StoreInner<C: StoreCallback> {
    name: String,
    header_path: PathBuf,
    config: StoreConfig,
    callback: C,
    layout: EntryLayout,
    cipher: CipherManager,
    locks: EntryLockManager,
    slot_cache: Option<PersistentIntArray>,
    files: StoreFiles,

    /// Store-wide state; fetch/put hold the read side for their whole run
    header: RwLock<StoreHeader>,
    counters: StoreCounters,
    shutdown: AtomicBool,
    rng: Mutex<StdRng>,

    sweep_state: Mutex<SweepState>,
    /// Held while a sweep runs, so the cleaner and `set_max_keys` never
    /// sweep concurrently
    sweep_lock: Mutex<()>,
    signal: Sender<SweepSignal>,

    overflow: OnceLock<Arc<StoreInner<C>>>,
    ticker: Arc<ThreadTicker>,
}

impl<C: StoreCallback> SaltedHashStore<C> {
    /// Open (or create) the store described by `config`
    ///
    /// On startup:
    /// 1. Load the header, creating it for a new store or recreating it
    ///    (and discarding the data) if it is corrupt
    /// 2. Unwrap the salt with the master key, or wrap it if a key was
    ///    just configured
    /// 3. Size the data files and load the slot status cache
    /// 4. Mark the store dirty until a clean close
    /// 5. Start a resize if `max_keys` changed, then start the cleaner
    pub fn open(config: StoreConfig, callback: C) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        let name = config.name.clone();
        let layout = EntryLayout {
            header_len: callback.header_len(),
            payload_len: callback.payload_len(),
            max_probes: config.max_probes,
            store_plain_keys: config.store_plain_keys,
        };
        let header_path = config.dir.join(format!("{}.config", name));
        let slots_path = config.dir.join(format!("{}.slots", name));
        let files = StoreFiles::open(&config.dir, &name, &layout)?;
        let mut rng = StdRng::from_entropy();

        // Step 1: Header
        let mut header = match StoreHeader::load(&header_path) {
            Ok(Some(header)) => header,
            Ok(None) => {
                if files.slot_count()? > 0 {
                    tracing::warn!(store = %name, "Header missing but data files exist, discarding data");
                    files.wipe()?;
                }
                tracing::info!(store = %name, slots = config.max_keys, "Creating new store");
                fresh_header(&config, &mut rng)
            }
            Err(StoreError::Corrupt(reason)) => {
                tracing::warn!(store = %name, %reason, "Store header unreadable, recreating store");
                files.wipe()?;
                remove_if_exists(&slots_path)?;
                let mut header = fresh_header(&config, &mut rng);
                header.set_flag(FLAG_REBUILD, true);
                header
            }
            Err(e) => return Err(e),
        };

        // Step 2: Salt
        let salt = resolve_salt(&mut header, config.master_key.as_ref(), &mut rng)?;
        let cipher = CipherManager::new(salt)?;

        // Step 3: Data files and slot cache
        let slots = header.store_size.max(header.prev_store_size);
        files.set_slot_count(slots)?;

        let unclean = header.has_flag(FLAG_DIRTY);
        if unclean {
            tracing::warn!(store = %name, "Store was not closed cleanly, slot cache will be rebuilt");
            header.set_flag(FLAG_REBUILD, true);
        }

        let ticker = Arc::new(ThreadTicker::new(&name)?);
        let slot_cache = if config.slot_cache {
            let shared: Arc<dyn Ticker> = ticker.clone();
            let (cache, intact) =
                PersistentIntArray::open(&slots_path, slots, config.cache_persistence, shared)?;
            if unclean {
                cache.clear()?;
            } else if !intact {
                header.set_flag(FLAG_REBUILD, true);
            }
            Some(cache)
        } else {
            None
        };

        // Step 4: Dirty until closed
        header.set_flag(FLAG_DIRTY, true);
        header.save(&header_path)?;

        let (signal, signals) = channel::unbounded();
        let counters = StoreCounters::from_header(&header);
        let inner = Arc::new(StoreInner {
            name,
            header_path,
            callback,
            layout,
            cipher,
            locks: EntryLockManager::new(config.lock_poll_interval),
            slot_cache,
            files,
            header: RwLock::new(header),
            counters,
            shutdown: AtomicBool::new(false),
            rng: Mutex::new(rng),
            sweep_state: Mutex::new(SweepState::Idle),
            sweep_lock: Mutex::new(()),
            signal,
            overflow: OnceLock::new(),
            ticker,
            config,
        });

        let store = Self {
            inner,
            cleaner: Mutex::new(None),
        };

        // Step 5: Requested size, then the cleaner
        let wanted = store.inner.config.max_keys;
        if wanted != store.max_keys() {
            store.inner.set_max_keys(wanted, false)?;
        }

        if store.inner.config.start_cleaner {
            let handle = sweep::spawn_cleaner(Arc::clone(&store.inner), signals)?;
            *store.cleaner.lock() = Some(handle);
            store.inner.schedule_first_sweep();
        }

        let stats = store.stats();
        tracing::info!(
            store = %store.inner.name,
            slots = stats.store_size,
            prev_slots = stats.prev_store_size,
            keys = stats.key_count,
            rebuild = stats.rebuild_pending,
            "Opened salted hash store"
        );
        Ok(store)
    }

    /// Look up the block stored under `routing_key`
    ///
    /// Returns:
    /// - `Ok(Some(block))`: found and verified
    /// - `Ok(None)`: not stored, failed verification, or the store is
    ///   shutting down
    pub fn fetch(
        &self,
        routing_key: &RoutingKey,
        full_key: Option<&[u8]>,
        options: FetchOptions,
    ) -> Result<Option<C::Block>> {
        self.inner.fetch(routing_key, full_key, options)
    }

    /// Store a block
    ///
    /// `header` and `payload` must have the callback's fixed lengths.
    pub fn put(
        &self,
        block: &C::Block,
        payload: &[u8],
        header: &[u8],
        options: PutOptions,
    ) -> Result<PutOutcome> {
        self.inner.put(block, payload, header, options)
    }

    /// Zero-I/O hint: could `routing_key` be stored here?
    ///
    /// False only when every candidate slot is known to be free or to hold
    /// a different key. Always true without a slot cache.
    pub fn probably_in_store(&self, routing_key: &RoutingKey) -> bool {
        self.inner.probably_in_store(routing_key)
    }

    /// Resize the table to `new_size` slots
    ///
    /// Ignored if the size is unchanged or a resize is already running.
    /// Entries migrate in the background unless `shrink_now` is set, in
    /// which case this call returns only once the migration is complete.
    pub fn set_max_keys(&self, new_size: u64, shrink_now: bool) -> Result<()> {
        self.inner.set_max_keys(new_size, shrink_now)
    }

    /// Pair this store with an overflow store; may be done once
    ///
    /// Both stores must hold blocks of the same header and payload length.
    pub fn set_overflow(&self, overflow: &OverflowStore<C>) -> Result<()> {
        let ours = &self.inner.layout;
        let theirs = &overflow.store.inner.layout;
        if ours.header_len != theirs.header_len || ours.payload_len != theirs.payload_len {
            return Err(StoreError::Config(format!(
                "overflow store {} holds {}+{} byte blocks, store {} holds {}+{}",
                overflow.store.inner.name,
                theirs.header_len,
                theirs.payload_len,
                self.inner.name,
                ours.header_len,
                ours.payload_len
            )));
        }

        self.inner
            .overflow
            .set(Arc::clone(&overflow.store.inner))
            .map_err(|_| StoreError::Config("an overflow store is already set".into()))?;
        tracing::info!(
            store = %self.inner.name,
            overflow = %overflow.store.inner.name,
            "Overflow store attached"
        );
        Ok(())
    }

    /// Turn this store into an overflow target
    ///
    /// Fails (closing the store) if it already has an overflow store.
    pub fn into_overflow_target(self) -> Result<OverflowStore<C>> {
        if self.inner.overflow.get().is_some() {
            return Err(StoreError::Config(format!(
                "store {} has an overflow store and cannot be one",
                self.inner.name
            )));
        }
        Ok(OverflowStore { store: self })
    }

    /// Run any pending resize or rebuild sweep on the calling thread
    pub fn run_maintenance(&self) -> Result<()> {
        sweep::run_pending(&self.inner, true)
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.stats()
    }

    /// Current number of slots
    pub fn max_keys(&self) -> u64 {
        self.inner.header.read().store_size
    }

    /// Approximate number of stored keys
    pub fn key_count(&self) -> u64 {
        self.inner.counters.key_count.load(Ordering::Relaxed)
    }

    pub fn sweep_state(&self) -> SweepState {
        *self.inner.sweep_state.lock()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Candidate slots of `routing_key` under the current size
    pub fn candidate_slots(&self, routing_key: &RoutingKey) -> Vec<u64> {
        let store_size = self.inner.header.read().store_size;
        let digest = self.inner.cipher.digest(routing_key);
        probe_offsets(&digest, store_size, self.inner.layout.max_probes)
    }

    /// Slot currently holding `routing_key`, if any
    pub fn locate(&self, routing_key: &RoutingKey) -> Result<Option<u64>> {
        self.inner.locate(routing_key)
    }

    /// Compare a slot's cached status word with its on-disk record
    pub fn inspect_slot(&self, offset: u64) -> Result<SlotInspection> {
        self.inner.inspect_slot(offset)
    }

    /// Flush the slot cache, data files and header now
    pub fn force_flush(&self) -> Result<()> {
        self.inner.force_flush()
    }

    /// Stop the cleaner, drain in-flight operations and persist everything
    pub fn close(self) -> Result<()> {
        self.shutdown(true)
    }

    /// Stop without flushing the slot cache, as if the process died
    ///
    /// Data already written stays readable; the next open rebuilds the
    /// slot cache.
    pub fn abort(self) -> Result<()> {
        self.shutdown(false)
    }

    fn shutdown(&self, clean: bool) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Step 1: Stop the cleaner and wait for slot holders to finish
        let _ = self.inner.signal.send(SweepSignal::Shutdown);
        self.inner.locks.shutdown();
        if let Some(handle) = self.cleaner.lock().take() {
            if handle.join().is_err() {
                tracing::error!(store = %self.inner.name, "Cleaner thread panicked");
            }
        }
        self.inner.ticker.stop();

        // Step 2: Persist
        self.inner.finish(clean)
    }
}

impl<C: StoreCallback> Drop for SaltedHashStore<C> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown(true) {
            tracing::error!(store = %self.inner.name, "Error closing store: {}", e);
        }
    }
}

impl<C: StoreCallback> OverflowStore<C> {
    pub fn fetch(
        &self,
        routing_key: &RoutingKey,
        full_key: Option<&[u8]>,
        options: FetchOptions,
    ) -> Result<Option<C::Block>> {
        self.store.fetch(routing_key, full_key, options)
    }

    pub fn put(
        &self,
        block: &C::Block,
        payload: &[u8],
        header: &[u8],
        options: PutOptions,
    ) -> Result<PutOutcome> {
        self.store.put(block, payload, header, options)
    }

    pub fn probably_in_store(&self, routing_key: &RoutingKey) -> bool {
        self.store.probably_in_store(routing_key)
    }

    pub fn set_max_keys(&self, new_size: u64, shrink_now: bool) -> Result<()> {
        self.store.set_max_keys(new_size, shrink_now)
    }

    pub fn run_maintenance(&self) -> Result<()> {
        self.store.run_maintenance()
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub fn key_count(&self) -> u64 {
        self.store.key_count()
    }

    pub fn locate(&self, routing_key: &RoutingKey) -> Result<Option<u64>> {
        self.store.locate(routing_key)
    }

    pub fn inspect_slot(&self, offset: u64) -> Result<SlotInspection> {
        self.store.inspect_slot(offset)
    }

    pub fn close(self) -> Result<()> {
        self.store.close()
    }
}

// =============================================================================
// Operations
// =============================================================================

impl<C: StoreCallback> StoreInner<C> {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn fetch(
        &self,
        routing_key: &RoutingKey,
        full_key: Option<&[u8]>,
        options: FetchOptions,
    ) -> Result<Option<C::Block>> {
        if self.is_shutdown() {
            return Ok(None);
        }

        let found = {
            let header = self.header.read();
            let geo = Geometry::of(&header);
            let digest = self.cipher.digest(routing_key);
            let set = lock_set(&digest, geo.store_size, geo.prev_store_size, self.layout.max_probes);
            let Some(_locked) = self.lock_slots(&set)? else {
                return Ok(None);
            };

            let local = match self.find_entry(&digest, &geo, options.ignore_old_blocks)? {
                Some((offset, entry)) => self.load_plain(offset, entry, routing_key)?,
                None => None,
            };
            match local {
                Some(entry) => Some(entry),
                None if options.read_overflow => {
                    self.fetch_from_overflow(routing_key, &digest, &geo, options.ignore_old_blocks)?
                }
                None => None,
            }
        };

        let Some(entry) = found else {
            StoreCounters::bump(&self.counters.misses);
            return Ok(None);
        };

        match self
            .callback
            .construct(&entry.header, &entry.payload, routing_key, full_key)
        {
            Ok(block) => {
                StoreCounters::bump(&self.counters.hits);
                Ok(Some(block))
            }
            Err(StoreError::Verify(reason)) => {
                tracing::warn!(store = %self.name, %reason, "Stored block failed verification");
                StoreCounters::bump(&self.counters.misses);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Decrypted entry for `routing_key`, without overflow or counters
    fn fetch_entry(&self, routing_key: &RoutingKey, ignore_old: bool) -> Result<Option<Entry>> {
        if self.is_shutdown() {
            return Ok(None);
        }

        let header = self.header.read();
        let geo = Geometry::of(&header);
        let digest = self.cipher.digest(routing_key);
        let set = lock_set(&digest, geo.store_size, geo.prev_store_size, self.layout.max_probes);
        let Some(_locked) = self.lock_slots(&set)? else {
            return Ok(None);
        };

        match self.find_entry(&digest, &geo, ignore_old)? {
            Some((offset, entry)) => self.load_plain(offset, entry, routing_key),
            None => Ok(None),
        }
    }

    /// Look in the overflow store; copy a hit back into a free home slot
    ///
    /// The caller holds this store's locks for `digest`.
    fn fetch_from_overflow(
        &self,
        routing_key: &RoutingKey,
        digest: &DigestedKey,
        geo: &Geometry,
        ignore_old: bool,
    ) -> Result<Option<Entry>> {
        let Some(overflow) = self.overflow.get() else {
            return Ok(None);
        };
        let Some(entry) = overflow.fetch_entry(routing_key, ignore_old)? else {
            return Ok(None);
        };

        if let Err(e) = self.copy_home(&entry, routing_key, digest, geo) {
            tracing::warn!(store = %self.name, "Could not copy block back from overflow: {}", e);
        }
        Ok(Some(entry))
    }

    fn copy_home(
        &self,
        found: &Entry,
        routing_key: &RoutingKey,
        digest: &DigestedKey,
        geo: &Geometry,
    ) -> Result<()> {
        let current = probe_offsets(digest, geo.store_size, self.layout.max_probes);
        let Placement::Free(offset) = self.scan_candidates(&current)? else {
            return Ok(());
        };

        let mut entry = Entry::create(
            NewEntry {
                routing_key: *routing_key,
                digested_key: *digest,
                header: &found.header,
                payload: &found.payload,
                store_size: geo.store_size,
                generation: geo.generation,
                new_block: found.is_new_block(),
                wrong_store: false,
            },
            &self.layout,
        );
        self.write_entry(&mut entry, offset)?;
        self.counters.add_key();
        tracing::debug!(store = %self.name, offset, "Copied block back from overflow");
        Ok(())
    }

    fn put(
        &self,
        block: &C::Block,
        payload: &[u8],
        header: &[u8],
        options: PutOptions,
    ) -> Result<PutOutcome> {
        if header.len() != self.layout.header_len || payload.len() != self.layout.payload_len {
            return Err(StoreError::Verify(format!(
                "block is {}+{} bytes, store holds {}+{}",
                header.len(),
                payload.len(),
                self.layout.header_len,
                self.layout.payload_len
            )));
        }

        self.put_entry(&PutRequest {
            routing_key: block.routing_key(),
            header,
            payload,
            overwrite: options.overwrite,
            is_old_block: options.is_old_block,
            wrong_store: false,
        })
    }

    fn put_entry(&self, req: &PutRequest<'_>) -> Result<PutOutcome> {
        if self.is_shutdown() {
            return Ok(PutOutcome::Dropped);
        }

        let header = self.header.read();
        let geo = Geometry::of(&header);
        let digest = self.cipher.digest(req.routing_key);
        let current = probe_offsets(&digest, geo.store_size, self.layout.max_probes);
        let set = lock_set(&digest, geo.store_size, geo.prev_store_size, self.layout.max_probes);
        let Some(_locked) = self.lock_slots(&set)? else {
            return Ok(PutOutcome::Dropped);
        };

        // Step 1: Same key already stored?
        if let Some((offset, existing)) = self.find_entry(&digest, &geo, false)? {
            if let Some(outcome) = self.update_existing(offset, existing, req, &current, &geo)? {
                return Ok(outcome);
            }
        }

        let mut entry = Entry::create(
            NewEntry {
                routing_key: *req.routing_key,
                digested_key: digest,
                header: req.header,
                payload: req.payload,
                store_size: geo.store_size,
                generation: geo.generation,
                new_block: !req.is_old_block,
                wrong_store: req.wrong_store,
            },
            &self.layout,
        );

        // Step 2: First free candidate
        let occupants = match self.scan_candidates(&current)? {
            Placement::Free(offset) => {
                self.write_entry(&mut entry, offset)?;
                self.counters.add_key();
                tracing::trace!(store = %self.name, offset, "Stored in free slot");
                return Ok(PutOutcome::Stored);
            }
            Placement::Full(occupants) => occupants,
        };

        // Step 3: Old blocks do not displace newer ones if they can go elsewhere
        if req.is_old_block && !req.wrong_store && occupants.iter().all(|o| o.new_block) {
            if let Some(overflow) = self.overflow.get() {
                let redirect = PutRequest {
                    wrong_store: true,
                    ..*req
                };
                return Ok(match overflow.put_entry(&redirect)? {
                    PutOutcome::Stored => PutOutcome::Redirected,
                    other => other,
                });
            }
        }

        // Step 4: Evict
        let offset = current[self.choose_victim(&occupants, req.wrong_store)];
        self.evict(offset, &geo)?;
        self.write_entry(&mut entry, offset)?;
        Ok(PutOutcome::Stored)
    }

    /// Handle a put whose key is already stored at `offset`
    ///
    /// Returns `None` when the old copy was freed and the block still has
    /// to be placed.
    fn update_existing(
        &self,
        offset: u64,
        existing: Entry,
        req: &PutRequest<'_>,
        current: &[u64],
        geo: &Geometry,
    ) -> Result<Option<PutOutcome>> {
        if self.callback.collision_possible() {
            let mut old = existing.clone();
            old.set_hd(&self.files.read_hd(offset)?, &self.layout);
            let same = self.cipher.decrypt(&mut old, req.routing_key)
                && old.header == req.header
                && old.payload == req.payload;

            if !same {
                if !req.overwrite {
                    return Err(StoreError::KeyCollision);
                }

                if !current.contains(&offset) {
                    // Found under the previous size only: re-place under the new one
                    self.release_slot(offset, &existing, geo)?;
                    return Ok(None);
                }

                let mut entry = Entry::create(
                    NewEntry {
                        routing_key: *req.routing_key,
                        digested_key: existing.digested_key,
                        header: req.header,
                        payload: req.payload,
                        store_size: geo.store_size,
                        generation: geo.generation,
                        new_block: !req.is_old_block,
                        wrong_store: req.wrong_store,
                    },
                    &self.layout,
                );
                if existing.generation != geo.generation {
                    self.counters.add_key();
                }
                self.write_entry(&mut entry, offset)?;
                tracing::debug!(store = %self.name, offset, "Overwrote block in place");
                return Ok(Some(PutOutcome::Stored));
            }
        }

        if !req.is_old_block && !existing.is_new_block() {
            let mut upgraded = existing;
            upgraded.flags |= ENTRY_FLAG_NEW_BLOCK;
            self.write_metadata_only(offset, &upgraded)?;
        }
        Ok(Some(PutOutcome::AlreadyStored))
    }

    /// Victim index for a full candidate set
    ///
    /// Slot 0 unless this put is a redirect, in which case a candidate
    /// already holding a redirected block is preferred with odds
    /// `wrong_store_count : max_probes`.
    fn choose_victim(&self, occupants: &[Occupant], wrong_store_put: bool) -> usize {
        if !wrong_store_put {
            return 0;
        }
        let wrong: Vec<usize> = occupants
            .iter()
            .enumerate()
            .filter(|(_, o)| o.wrong_store)
            .map(|(i, _)| i)
            .collect();
        if wrong.is_empty() {
            return 0;
        }

        let r = self.rng.lock().gen_range(0..self.layout.max_probes);
        wrong.get(r).copied().unwrap_or(0)
    }

    /// Prepare `offset` to be overwritten, saving its block to the overflow
    /// store when possible
    fn evict(&self, offset: u64, geo: &Geometry) -> Result<()> {
        let victim = self.read_entry(offset)?;
        if victim.is_free() || victim.generation != geo.generation {
            self.counters.add_key();
        }
        if victim.is_free() {
            return Ok(());
        }

        tracing::debug!(store = %self.name, offset, "Evicting entry");
        if let Some(overflow) = self.overflow.get() {
            if victim.has_persisted_plain_key() {
                self.move_to_overflow(overflow, offset, victim)?;
            }
        }
        Ok(())
    }

    fn move_to_overflow(&self, overflow: &StoreInner<C>, offset: u64, mut victim: Entry) -> Result<()> {
        let Some(routing_key) = victim.plain_key else {
            return Ok(());
        };
        victim.set_hd(&self.files.read_hd(offset)?, &self.layout);
        if !self.cipher.decrypt(&mut victim, &routing_key) {
            tracing::warn!(store = %self.name, offset, "Evicted entry does not decrypt, dropping it");
            return Ok(());
        }

        let request = PutRequest {
            routing_key: &routing_key,
            header: &victim.header,
            payload: &victim.payload,
            overwrite: false,
            is_old_block: !victim.is_new_block(),
            wrong_store: true,
        };
        match overflow.put_entry(&request) {
            Ok(outcome) => {
                tracing::debug!(store = %self.name, offset, ?outcome, "Moved evicted block to overflow")
            }
            Err(e) => {
                tracing::warn!(store = %self.name, offset, "Could not move evicted block to overflow: {}", e)
            }
        }
        Ok(())
    }

    fn probably_in_store(&self, routing_key: &RoutingKey) -> bool {
        let Some(cache) = &self.slot_cache else {
            return true;
        };

        let geo = Geometry::of(&self.header.read());
        let digest = self.cipher.digest(routing_key);
        lock_set(&digest, geo.store_size, geo.prev_store_size, self.layout.max_probes)
            .into_iter()
            .any(|offset| slot_cache::may_hold(cache.get(offset), &digest))
    }

    fn set_max_keys(&self, new_size: u64, shrink_now: bool) -> Result<()> {
        if new_size == 0 {
            return Err(StoreError::Config("store size must be at least 1".into()));
        }

        {
            let mut header = self.header.write();
            if header.prev_store_size != 0 {
                tracing::info!(
                    store = %self.name,
                    requested = new_size,
                    "Resize already in progress, ignoring request"
                );
            } else if header.store_size != new_size {
                let old_size = header.store_size;
                if let Some(cache) = &self.slot_cache {
                    cache.resize(old_size.max(new_size))?;
                }
                if new_size > old_size {
                    self.files.set_slot_count(new_size)?;
                }

                header.prev_store_size = old_size;
                header.store_size = new_size;
                header.set_flag(FLAG_REBUILD, true);
                self.save_header(&mut header)?;
                tracing::info!(store = %self.name, from = old_size, to = new_size, "Resize requested");
            }
        }

        if shrink_now {
            sweep::run_pending(self, false)
        } else {
            self.wake_cleaner();
            Ok(())
        }
    }

    fn stats(&self) -> StoreStats {
        let header = self.header.read();
        StoreStats {
            store_size: header.store_size,
            prev_store_size: header.prev_store_size,
            key_count: self.counters.key_count.load(Ordering::Relaxed),
            generation: header.generation,
            writes: self.counters.writes.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            false_positives: self.counters.false_positives.load(Ordering::Relaxed),
            rebuild_pending: header.has_flag(FLAG_REBUILD),
        }
    }

    fn locate(&self, routing_key: &RoutingKey) -> Result<Option<u64>> {
        if self.is_shutdown() {
            return Err(StoreError::Closed);
        }

        let header = self.header.read();
        let geo = Geometry::of(&header);
        let digest = self.cipher.digest(routing_key);
        let set = lock_set(&digest, geo.store_size, geo.prev_store_size, self.layout.max_probes);
        let Some(_locked) = self.lock_slots(&set)? else {
            return Err(StoreError::Closed);
        };
        Ok(self.find_entry(&digest, &geo, false)?.map(|(offset, _)| offset))
    }

    fn inspect_slot(&self, offset: u64) -> Result<SlotInspection> {
        let set = BTreeSet::from([offset]);
        let Some(_locked) = self.lock_slots(&set)? else {
            return Err(StoreError::Closed);
        };

        // Word first: reading the record must not refresh it
        let status_word = self.slot_word(offset);
        let entry = decode_metadata(&self.files.read_metadata(offset)?, offset);
        Ok(SlotInspection {
            offset,
            status_word,
            occupied: !entry.is_free(),
            new_block: entry.is_new_block(),
            wrong_store: entry.is_wrong_store(),
            store_size: entry.store_size,
            generation: entry.generation,
        })
    }

    fn force_flush(&self) -> Result<()> {
        if let Some(cache) = &self.slot_cache {
            cache.force_write()?;
        }
        self.files.sync()?;
        let mut header = self.header.write();
        self.save_header(&mut header)
    }

    /// Last step of close/abort; every slot lock is already drained
    fn finish(&self, clean: bool) -> Result<()> {
        if !clean {
            if let Some(cache) = &self.slot_cache {
                cache.abort();
            }
            tracing::warn!(store = %self.name, "Store aborted, slot cache left stale");
            return Ok(());
        }

        self.files.sync()?;
        if let Some(cache) = &self.slot_cache {
            cache.shutdown()?;
        }

        let mut header = self.header.write();
        header.set_flag(FLAG_DIRTY, false);
        self.save_header(&mut header)?;
        tracing::info!(
            store = %self.name,
            keys = header.key_count,
            writes = header.writes,
            "Store closed"
        );
        Ok(())
    }

    // =========================================================================
    // Slot Helpers
    // =========================================================================

    /// Lock `offsets` within the configured budget
    ///
    /// `Ok(None)` means the store is shutting down.
    fn lock_slots(&self, offsets: &BTreeSet<u64>) -> Result<Option<LockedSlots<'_>>> {
        let started = Instant::now();
        match self.locks.lock_all(offsets, Some(started + self.config.lock_timeout)) {
            Ok(locked) => Ok(Some(locked)),
            Err(LockFailure::Shutdown) => Ok(None),
            Err(LockFailure::TimedOut) => {
                let waited = started.elapsed();
                tracing::warn!(store = %self.name, ?waited, slots = offsets.len(), "Timed out locking slots");
                Err(StoreError::LockTimeout { waited })
            }
        }
    }

    fn slot_word(&self, offset: u64) -> u32 {
        self.slot_cache.as_ref().map_or(0, |cache| cache.get(offset))
    }

    fn set_slot_word(&self, offset: u64, word: u32) {
        if let Some(cache) = &self.slot_cache {
            cache.put(offset, word);
        }
    }

    /// Read a slot's metadata and refresh its status word
    fn read_entry(&self, offset: u64) -> Result<Entry> {
        let record = self.files.read_metadata(offset)?;
        let entry = decode_metadata(&record, offset);
        self.set_slot_word(offset, entry.status_word());
        Ok(entry)
    }

    /// First candidate (current size, then previous) holding `digest`
    fn find_entry(
        &self,
        digest: &DigestedKey,
        geo: &Geometry,
        ignore_old: bool,
    ) -> Result<Option<(u64, Entry)>> {
        let k = self.layout.max_probes;
        let mut candidates = probe_offsets(digest, geo.store_size, k);
        if geo.prev_store_size != 0 {
            candidates.extend(probe_offsets(digest, geo.prev_store_size, k));
        }

        let mut seen = BTreeSet::new();
        for offset in candidates {
            if !seen.insert(offset) {
                continue;
            }

            let word = self.slot_word(offset);
            if !slot_cache::may_hold(word, digest) {
                continue;
            }
            if ignore_old
                && slot_cache::is_known_occupied(word)
                && word & slot_cache::SLOT_NEW_BLOCK == 0
            {
                continue;
            }

            let entry = self.read_entry(offset)?;
            if entry.is_free() {
                continue;
            }
            if entry.digested_key != *digest {
                if slot_cache::is_known_occupied(word) {
                    StoreCounters::bump(&self.counters.false_positives);
                    tracing::trace!(store = %self.name, offset, "Fingerprint false positive");
                }
                continue;
            }
            if ignore_old && !entry.is_new_block() {
                continue;
            }
            return Ok(Some((offset, entry)));
        }
        Ok(None)
    }

    /// Attach and decrypt an entry's header/payload
    fn load_plain(&self, offset: u64, mut entry: Entry, routing_key: &RoutingKey) -> Result<Option<Entry>> {
        entry.set_hd(&self.files.read_hd(offset)?, &self.layout);
        if !self.cipher.decrypt(&mut entry, routing_key) {
            tracing::warn!(store = %self.name, offset, "Stored plain key does not match its digest");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// First free slot among `current`, or who occupies each of them
    fn scan_candidates(&self, current: &[u64]) -> Result<Placement> {
        let mut occupants = Vec::with_capacity(current.len());
        for &offset in current {
            let word = self.slot_word(offset);
            if slot_cache::is_known_free(word) {
                return Ok(Placement::Free(offset));
            }
            if slot_cache::is_known_occupied(word) {
                occupants.push(Occupant {
                    new_block: word & slot_cache::SLOT_NEW_BLOCK != 0,
                    wrong_store: word & slot_cache::SLOT_WRONG_STORE != 0,
                });
                continue;
            }

            let entry = self.read_entry(offset)?;
            if entry.is_free() {
                return Ok(Placement::Free(offset));
            }
            occupants.push(Occupant {
                new_block: entry.is_new_block(),
                wrong_store: entry.is_wrong_store(),
            });
        }
        Ok(Placement::Full(occupants))
    }

    /// Encrypt (if needed) and write an entry; metadata goes last
    fn write_entry(&self, entry: &mut Entry, offset: u64) -> Result<()> {
        if !entry.encrypted {
            let mut rng = self.rng.lock();
            self.cipher.encrypt(entry, &mut *rng);
        }

        self.files.write_hd(offset, &encode_hd(entry, &self.layout))?;
        self.files.write_metadata(offset, &encode_metadata(entry))?;
        entry.offset = Some(offset);
        self.set_slot_word(offset, entry.status_word());
        StoreCounters::bump(&self.counters.writes);
        Ok(())
    }

    fn write_metadata_only(&self, offset: u64, entry: &Entry) -> Result<()> {
        self.files.write_metadata(offset, &encode_metadata(entry))?;
        self.set_slot_word(offset, entry.status_word());
        Ok(())
    }

    /// Free a slot whose entry is being dropped or moved
    fn release_slot(&self, offset: u64, old: &Entry, geo: &Geometry) -> Result<()> {
        self.files.write_metadata(offset, &[0u8; METADATA_LENGTH])?;
        self.set_slot_word(offset, slot_cache::FREE_WORD);
        if old.generation == geo.generation {
            self.counters.drop_key();
        }
        Ok(())
    }

    // =========================================================================
    // Header & Cleaner Helpers
    // =========================================================================

    /// Save the header with the live counters; the caller holds the write side
    fn save_header(&self, header: &mut StoreHeader) -> Result<()> {
        self.counters.store_into(header);
        header.save(&self.header_path)
    }

    fn wake_cleaner(&self) {
        if self.signal.send(SweepSignal::Wake).is_err() {
            tracing::debug!(store = %self.name, "Cleaner not running");
        }
    }

    /// First cleaner run after a random delay in `[period/2, 3*period/2)`
    fn schedule_first_sweep(&self) {
        let period_ms = (self.config.cleaner_period.as_millis() as u64).max(2);
        let delay_ms = self.rng.lock().gen_range(period_ms / 2..period_ms / 2 * 3);
        let delay = Duration::from_millis(delay_ms);

        let signal = self.signal.clone();
        self.ticker.queue_timed_job(
            Box::new(move || {
                let _ = signal.send(SweepSignal::Wake);
            }),
            delay,
        );
        tracing::debug!(store = %self.name, ?delay, "Scheduled first cleaner run");
    }
}

// =============================================================================
// Open Helpers
// =============================================================================

fn fresh_header(config: &StoreConfig, rng: &mut StdRng) -> StoreHeader {
    let mut salt = [0u8; SALT_LENGTH];
    rng.fill_bytes(&mut salt);
    StoreHeader::new(salt, config.max_keys)
}

/// Recover the plain salt, wrapping it if a master key is newly configured
fn resolve_salt(
    header: &mut StoreHeader,
    master_key: Option<&[u8; 32]>,
    rng: &mut StdRng,
) -> Result<[u8; SALT_LENGTH]> {
    match (header.has_flag(FLAG_SALT_WRAPPED), master_key) {
        (true, None) => Err(StoreError::Config(
            "store salt is wrapped, a master key is required".into(),
        )),
        (true, Some(master_key)) => {
            let salt = cipher::wrap_salt(&header.salt, master_key, &header.wrap_nonce);
            if cipher::salt_check(&salt) != header.salt_check {
                return Err(StoreError::Config("wrong master key for this store".into()));
            }
            Ok(salt)
        }
        (false, Some(master_key)) => {
            let salt = header.salt;
            rng.fill_bytes(&mut header.wrap_nonce);
            header.salt = cipher::wrap_salt(&salt, master_key, &header.wrap_nonce);
            header.salt_check = cipher::salt_check(&salt);
            header.set_flag(FLAG_SALT_WRAPPED, true);
            tracing::info!("Wrapping store salt with the master key");
            Ok(salt)
        }
        (false, None) => Ok(header.salt),
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
