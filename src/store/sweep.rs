//! Background Sweeps
//!
//! Two jobs keep a store healthy, both driven by one cleaner thread per
//! store and both restartable from the header alone:
//!
//! ```text
//!   set_max_keys(n)              unclean shutdown / resize done
//!        │                                  │
//!        ▼                                  ▼
//!  ┌──────────┐  prev_store_size != 0  ┌──────────┐  FLAG_REBUILD
//!  │  Resize  │ ─────────────────────► │ Rebuild  │ ─────────────► Idle
//!  └──────────┘                        └──────────┘
//! ```
//!
//! - **Resize** walks the previous table from its last batch down to slot
//!   0. Entries written under another table size are queued, the queue is
//!   re-inserted under the new size after every batch, and a shrinking
//!   table is truncated behind the walk. An old slot is freed only once its
//!   entry has been written at a new-size candidate, so a queue lost to
//!   shutdown or an I/O error costs nothing: the next resize finds those
//!   entries where they were.
//! - **Rebuild** re-reads every slot and rewrites its status word.
//!
//! Both bump the generation first and stamp it on every entry they visit,
//! recounting keys as they go. A sweep stops early on shutdown or when the
//! header changes under it; it never asks for the header lock while
//! holding slot locks.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{Receiver, RecvTimeoutError};

use super::entry::{decode_metadata, patch_generation, Entry, METADATA_LENGTH};
use super::header::FLAG_REBUILD;
use super::{probe_offsets, Geometry, StoreInner};
use crate::block::StoreCallback;
use crate::error::Result;
use crate::slot_cache;

/// A resize saves its progress every this many batches
const CHECKPOINT_BATCHES: u64 = 16;

/// What the sweep machinery is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    Resizing { from: u64, to: u64 },
    Rebuilding,
}

/// Next job for the cleaner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepTask {
    Resize { from: u64 },
    Rebuild,
    Idle,
}

/// Pick the next sweep from persisted header state
///
/// A pending resize always runs before a rebuild: the resize ends by
/// requesting one anyway.
pub fn plan_next_sweep(prev_store_size: u64, rebuild_pending: bool) -> SweepTask {
    if prev_store_size != 0 {
        SweepTask::Resize {
            from: prev_store_size,
        }
    } else if rebuild_pending {
        SweepTask::Rebuild
    } else {
        SweepTask::Idle
    }
}

/// Messages to the cleaner thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SweepSignal {
    Wake,
    Shutdown,
}

// =============================================================================
// Cleaner Thread
// =============================================================================

pub(super) fn spawn_cleaner<C: StoreCallback>(
    inner: Arc<StoreInner<C>>,
    signals: Receiver<SweepSignal>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("saltkv-cleaner-{}", inner.name))
        .spawn(move || cleaner_loop(inner, signals))?;
    Ok(handle)
}

fn cleaner_loop<C: StoreCallback>(inner: Arc<StoreInner<C>>, signals: Receiver<SweepSignal>) {
    let period = inner.config.cleaner_period;
    let mut woken = false;
    tracing::debug!(store = %inner.name, "Cleaner started");

    loop {
        // Nothing runs before the first (jittered) wake-up
        let signal = if woken {
            signals.recv_timeout(period)
        } else {
            signals.recv().map_err(|_| RecvTimeoutError::Disconnected)
        };
        match signal {
            Ok(SweepSignal::Wake) | Err(RecvTimeoutError::Timeout) => woken = true,
            Ok(SweepSignal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }

        if inner.is_shutdown() {
            break;
        }
        if let Err(e) = run_pending(&inner, true) {
            tracing::error!(store = %inner.name, "Sweep failed, retrying next period: {}", e);
        }
    }

    tracing::debug!(store = %inner.name, "Cleaner stopped");
}

/// Run whatever the header says is pending
///
/// With `include_rebuild` false only a resize is run (used by
/// `set_max_keys(_, true)`).
pub(super) fn run_pending<C: StoreCallback>(inner: &StoreInner<C>, include_rebuild: bool) -> Result<()> {
    let _sweeping = inner.sweep_lock.lock();
    let result = run_tasks(inner, include_rebuild);
    *inner.sweep_state.lock() = SweepState::Idle;
    result
}

fn run_tasks<C: StoreCallback>(inner: &StoreInner<C>, include_rebuild: bool) -> Result<()> {
    loop {
        if inner.is_shutdown() {
            return Ok(());
        }

        let task = {
            let header = inner.header.read();
            plan_next_sweep(header.prev_store_size, header.has_flag(FLAG_REBUILD))
        };
        match task {
            SweepTask::Resize { .. } => {
                if !resize(inner)? {
                    return Ok(());
                }
            }
            SweepTask::Rebuild if include_rebuild => {
                rebuild(inner)?;
                return Ok(());
            }
            SweepTask::Rebuild | SweepTask::Idle => return Ok(()),
        }
    }
}

/// Is the header still describing the sweep that captured `geo`?
fn still_current<C: StoreCallback>(inner: &StoreInner<C>, geo: &Geometry) -> bool {
    if inner.is_shutdown() {
        return false;
    }
    let header = inner.header.read();
    header.store_size == geo.store_size
        && header.prev_store_size == geo.prev_store_size
        && header.generation == geo.generation
}

/// Start a sweep: bump the generation and restart the key count
fn begin_generation<C: StoreCallback>(inner: &StoreInner<C>) -> Result<Geometry> {
    let mut header = inner.header.write();
    header.generation = header.generation.wrapping_add(1);
    inner.counters.key_count.store(0, Ordering::Relaxed);
    inner.save_header(&mut header)?;
    Ok(Geometry::of(&header))
}

// =============================================================================
// Resize
// =============================================================================

/// Migrate every entry to the new table size
///
/// Returns `false` if the sweep was interrupted.
fn resize<C: StoreCallback>(inner: &StoreInner<C>) -> Result<bool> {
    if inner.header.read().prev_store_size == 0 {
        return Ok(true);
    }

    // Step 1: New generation
    let geo = begin_generation(inner)?;
    let (new_size, prev_size) = (geo.store_size, geo.prev_store_size);
    *inner.sweep_state.lock() = SweepState::Resizing {
        from: prev_size,
        to: new_size,
    };
    tracing::info!(
        store = %inner.name,
        from = prev_size,
        to = new_size,
        generation = geo.generation,
        "Resize sweep started"
    );
    let started = Instant::now();

    if new_size > prev_size {
        inner.files.set_slot_count(new_size)?;
    }

    // Step 2: Walk the old table downwards
    let batch = inner.config.resize_batch;
    let mut queue: Vec<Entry> = Vec::new();
    let mut start = (prev_size - 1) / batch * batch;
    let mut batches = 0u64;
    let mut relocated = 0u64;

    loop {
        if !still_current(inner, &geo) {
            return Ok(interrupted(inner, "Resize", queue.len()));
        }

        let end = (start + batch).min(prev_size);
        let Some(queued) = resize_batch(inner, &geo, start, end, &mut queue)? else {
            return Ok(interrupted(inner, "Resize", queue.len()));
        };
        relocated += queued;

        let force = queue.len() > inner.config.relocation_queue;
        drain_queue(inner, &geo, &mut queue, force)?;

        if new_size < prev_size {
            // Queued entries still live in their old slots
            let keep = queue
                .iter()
                .filter_map(|entry| entry.offset)
                .map(|offset| offset + 1)
                .fold(new_size.max(start), u64::max);
            inner.files.set_slot_count(keep)?;
        }

        batches += 1;
        if batches % CHECKPOINT_BATCHES == 0 {
            let mut header = inner.header.write();
            inner.save_header(&mut header)?;
            tracing::debug!(store = %inner.name, next_batch = start, "Resize checkpoint");
        }

        if start == 0 {
            break;
        }
        start -= batch;
    }

    // Step 3: Whatever is still queued goes in, evicting if it must
    drain_queue(inner, &geo, &mut queue, true)?;
    if !queue.is_empty() {
        return Ok(interrupted(inner, "Resize", queue.len()));
    }
    if new_size < prev_size {
        inner.files.set_slot_count(new_size)?;
    }

    // Step 4: Done
    {
        let mut header = inner.header.write();
        if header.prev_store_size != prev_size || header.generation != geo.generation {
            return Ok(false);
        }
        if let Some(cache) = &inner.slot_cache {
            cache.resize(new_size)?;
        }
        header.prev_store_size = 0;
        header.set_flag(FLAG_REBUILD, true);
        inner.save_header(&mut header)?;
    }

    tracing::info!(
        store = %inner.name,
        slots = new_size,
        relocated,
        keys = inner.counters.key_count.load(Ordering::Relaxed),
        elapsed = ?started.elapsed(),
        "Resize sweep complete"
    );
    Ok(true)
}

fn interrupted<C: StoreCallback>(inner: &StoreInner<C>, sweep: &str, unmoved: usize) -> bool {
    tracing::info!(
        store = %inner.name,
        unmoved,
        "{} interrupted, will resume later",
        sweep
    );
    false
}

/// Process slots `[start, end)` of the old table
///
/// Entries already at home are stamped with the new generation; the rest
/// are queued with their old offset. Returns the number queued, or `None`
/// on shutdown.
fn resize_batch<C: StoreCallback>(
    inner: &StoreInner<C>,
    geo: &Geometry,
    start: u64,
    end: u64,
    queue: &mut Vec<Entry>,
) -> Result<Option<u64>> {
    let offsets: BTreeSet<u64> = (start..end).collect();
    let Some(_locked) = inner.lock_slots(&offsets)? else {
        return Ok(None);
    };

    let mut records = inner.files.read_metadata_range(start, end - start)?;
    let mut words = Vec::with_capacity(offsets.len());
    let mut moving = Vec::new();
    let mut dirty = false;

    for (i, record) in records.chunks_exact_mut(METADATA_LENGTH).enumerate() {
        let offset = start + i as u64;
        let entry = decode_metadata(record, offset);

        if entry.is_free() {
            words.push((offset, slot_cache::FREE_WORD));
            continue;
        }

        if entry.store_size == geo.store_size && offset < geo.store_size {
            if entry.generation != geo.generation {
                patch_generation(record, geo.generation);
                inner.counters.add_key();
                dirty = true;
            }
            words.push((offset, entry.status_word()));
            continue;
        }

        // Left in place until relocate() has written it elsewhere
        let mut entry = entry;
        entry.set_hd(&inner.files.read_hd(offset)?, &inner.layout);
        words.push((offset, entry.status_word()));
        moving.push(entry);
    }

    if dirty {
        inner.files.write_metadata_range(start, &records)?;
    }
    for (offset, word) in words {
        inner.set_slot_word(offset, word);
    }

    let queued = moving.len() as u64;
    queue.extend(moving);
    Ok(Some(queued))
}

/// Re-insert queued entries under the new size
///
/// Entries without a free candidate stay queued unless `force` is set. On
/// shutdown or error the queue may be dropped; every queued entry still
/// occupies its old slot.
fn drain_queue<C: StoreCallback>(
    inner: &StoreInner<C>,
    geo: &Geometry,
    queue: &mut Vec<Entry>,
    force: bool,
) -> Result<()> {
    let mut pending = std::mem::take(queue);
    while let Some(entry) = pending.pop() {
        if inner.is_shutdown() {
            queue.push(entry);
            continue;
        }
        match relocate(inner, geo, entry, force) {
            Ok(Some(entry)) => queue.push(entry),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    store = %inner.name,
                    unmoved = pending.len() + queue.len() + 1,
                    "Relocation failed, leaving entries in their old slots"
                );
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Move one queued entry to a new-size candidate, then free its old slot
///
/// Returns it back if it could not be placed yet.
fn relocate<C: StoreCallback>(
    inner: &StoreInner<C>,
    geo: &Geometry,
    mut entry: Entry,
    force: bool,
) -> Result<Option<Entry>> {
    let Some(old_offset) = entry.offset else {
        return Ok(None);
    };
    let candidates = probe_offsets(&entry.digested_key, geo.store_size, inner.layout.max_probes);
    let mut set: BTreeSet<u64> = candidates.iter().copied().collect();
    set.insert(old_offset);
    let Some(_locked) = inner.lock_slots(&set)? else {
        return Ok(Some(entry));
    };

    // Step 1: Still the entry we queued? A put may have moved or replaced it
    let current = inner.read_entry(old_offset)?;
    if current.is_free()
        || current.digested_key != entry.digested_key
        || current.iv != entry.iv
        || current.store_size == geo.store_size
    {
        tracing::trace!(store = %inner.name, offset = old_offset, "Queued entry changed, skipping");
        return Ok(None);
    }
    // Classification may have been upgraded while queued
    entry.flags = current.flags;

    // Step 2: Already a candidate under the new size: restamp in place
    if candidates.contains(&old_offset) {
        entry.store_size = geo.store_size;
        entry.generation = geo.generation;
        inner.write_metadata_only(old_offset, &entry)?;
        inner.counters.add_key();
        return Ok(None);
    }

    // Step 3: Find a home
    let mut free = None;
    for &offset in &candidates {
        let word = inner.slot_word(offset);
        if slot_cache::is_known_free(word) {
            free.get_or_insert(offset);
            continue;
        }
        if !slot_cache::may_hold(word, &entry.digested_key) {
            continue;
        }

        let existing = inner.read_entry(offset)?;
        if existing.is_free() {
            free.get_or_insert(offset);
        } else if existing.digested_key == entry.digested_key {
            // Stored again under the new size while queued
            tracing::trace!(store = %inner.name, offset, "Relocating entry already present");
            inner.release_slot(old_offset, &entry, geo)?;
            return Ok(None);
        }
    }

    let offset = match free {
        Some(offset) => {
            inner.counters.add_key();
            offset
        }
        None if force => {
            let offset = candidates[0];
            inner.evict(offset, geo)?;
            offset
        }
        None => return Ok(Some(entry)),
    };

    // Step 4: Copy, then free the old slot
    entry.store_size = geo.store_size;
    entry.generation = geo.generation;
    inner.write_entry(&mut entry, offset)?;
    inner.files.write_metadata(old_offset, &[0u8; METADATA_LENGTH])?;
    inner.set_slot_word(old_offset, slot_cache::FREE_WORD);
    Ok(None)
}

// =============================================================================
// Rebuild
// =============================================================================

/// Re-derive every status word and recount keys
///
/// Returns `false` if the sweep was interrupted.
fn rebuild<C: StoreCallback>(inner: &StoreInner<C>) -> Result<bool> {
    {
        let header = inner.header.read();
        if header.prev_store_size != 0 || !header.has_flag(FLAG_REBUILD) {
            return Ok(false);
        }
    }

    let geo = begin_generation(inner)?;
    *inner.sweep_state.lock() = SweepState::Rebuilding;
    tracing::info!(store = %inner.name, slots = geo.store_size, "Rebuild sweep started");
    let started = Instant::now();

    let batch = inner.config.resize_batch;
    let mut start = 0;
    while start < geo.store_size {
        if !still_current(inner, &geo) {
            return Ok(interrupted(inner, "Rebuild", 0));
        }
        let end = (start + batch).min(geo.store_size);
        if !rebuild_batch(inner, &geo, start, end)? {
            return Ok(interrupted(inner, "Rebuild", 0));
        }
        start = end;
    }

    {
        let mut header = inner.header.write();
        if header.prev_store_size != 0 || header.generation != geo.generation {
            return Ok(false);
        }
        header.set_flag(FLAG_REBUILD, false);
        inner.save_header(&mut header)?;
    }

    tracing::info!(
        store = %inner.name,
        keys = inner.counters.key_count.load(Ordering::Relaxed),
        elapsed = ?started.elapsed(),
        "Rebuild sweep complete"
    );
    Ok(true)
}

fn rebuild_batch<C: StoreCallback>(inner: &StoreInner<C>, geo: &Geometry, start: u64, end: u64) -> Result<bool> {
    let offsets: BTreeSet<u64> = (start..end).collect();
    let Some(_locked) = inner.lock_slots(&offsets)? else {
        return Ok(false);
    };

    let mut records = inner.files.read_metadata_range(start, end - start)?;
    let mut words = Vec::with_capacity(offsets.len());
    let mut dirty = false;

    for (i, record) in records.chunks_exact_mut(METADATA_LENGTH).enumerate() {
        let offset = start + i as u64;
        let entry = decode_metadata(record, offset);
        if !entry.is_free() && entry.generation != geo.generation {
            patch_generation(record, geo.generation);
            inner.counters.add_key();
            dirty = true;
        }
        words.push((offset, entry.status_word()));
    }

    if dirty {
        inner.files.write_metadata_range(start, &records)?;
    }
    for (offset, word) in words {
        inner.set_slot_word(offset, word);
    }
    Ok(true)
}
