//! Entry Lock Manager
//!
//! Per-slot exclusion for the hash table.
//!
//! ## Rules
//! - Locks are keyed by slot offset and are not reentrant.
//! - A caller that needs several slots acquires them in strictly ascending
//!   order ([`EntryLockManager::lock_all`] does this), which keeps the lock
//!   graph acyclic.
//! - Waits are bounded by `poll_interval` so a shutdown is noticed even by
//!   threads blocked behind a slow holder.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why a lock could not be taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFailure {
    /// The manager is shutting down
    Shutdown,
    /// The caller's deadline passed first
    TimedOut,
}

/// Proof of holding one slot, required to release it
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a slot stays locked until the handle is passed to unlock()"]
pub struct LockHandle {
    offset: u64,
    ticket: u64,
}

impl LockHandle {
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// State of one slot while it is held or awaited
struct SlotLock {
    /// Ticket of the current holder, if any
    holder: Option<u64>,
    /// Threads blocked on `wakeup`
    waiters: usize,
    wakeup: Arc<Condvar>,
}

#[derive(Default)]
struct LockTable {
    slots: HashMap<u64, SlotLock>,
    held: usize,
}

/// Manages per-offset locks for one store
pub struct EntryLockManager {
    table: Mutex<LockTable>,
    /// Signalled when `held` drops to zero during shutdown
    drained: Condvar,
    shutdown: AtomicBool,
    next_ticket: AtomicU64,
    poll_interval: Duration,
}

impl EntryLockManager {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            drained: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_ticket: AtomicU64::new(1),
            poll_interval,
        }
    }

    /// Lock `offset`, waiting as long as needed unless shutdown begins
    pub fn lock(&self, offset: u64) -> Result<LockHandle, LockFailure> {
        self.lock_inner(offset, None)
    }

    /// Lock `offset`, giving up at `deadline`
    pub fn lock_before(&self, offset: u64, deadline: Instant) -> Result<LockHandle, LockFailure> {
        self.lock_inner(offset, Some(deadline))
    }

    fn lock_inner(&self, offset: u64, deadline: Option<Instant>) -> Result<LockHandle, LockFailure> {
        if self.is_shutdown() {
            return Err(LockFailure::Shutdown);
        }

        let mut table = self.table.lock();
        loop {
            if self.is_shutdown() {
                Self::leave(&mut table, offset);
                return Err(LockFailure::Shutdown);
            }

            let slot = table.slots.entry(offset).or_insert_with(|| SlotLock {
                holder: None,
                waiters: 0,
                wakeup: Arc::new(Condvar::new()),
            });

            if slot.holder.is_none() {
                let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                slot.holder = Some(ticket);
                table.held += 1;
                return Ok(LockHandle { offset, ticket });
            }

            let wait_for = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        Self::leave(&mut table, offset);
                        return Err(LockFailure::TimedOut);
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };

            slot.waiters += 1;
            let wakeup = Arc::clone(&slot.wakeup);
            wakeup.wait_for(&mut table, wait_for);
            if let Some(slot) = table.slots.get_mut(&offset) {
                slot.waiters -= 1;
            }
        }
    }

    /// Release a slot and wake one waiter
    pub fn unlock(&self, handle: LockHandle) {
        let mut table = self.table.lock();
        let Some(slot) = table.slots.get_mut(&handle.offset) else {
            tracing::error!(offset = handle.offset, "Unlocking a slot that is not locked");
            return;
        };
        if slot.holder != Some(handle.ticket) {
            tracing::error!(offset = handle.offset, "Unlocking a slot held by someone else");
            return;
        }

        slot.holder = None;
        if slot.waiters > 0 {
            slot.wakeup.notify_one();
        } else {
            table.slots.remove(&handle.offset);
        }

        table.held -= 1;
        if table.held == 0 && self.is_shutdown() {
            self.drained.notify_all();
        }
    }

    /// Lock every offset in `offsets` in ascending order
    ///
    /// Either all offsets are locked or none are: on failure everything
    /// acquired so far is released before returning.
    pub fn lock_all(
        &self,
        offsets: &BTreeSet<u64>,
        deadline: Option<Instant>,
    ) -> Result<LockedSlots<'_>, LockFailure> {
        let mut guard = LockedSlots {
            manager: self,
            handles: Vec::with_capacity(offsets.len()),
        };
        for &offset in offsets {
            let handle = self.lock_inner(offset, deadline)?;
            guard.handles.push(handle);
        }
        Ok(guard)
    }

    /// Refuse new locks, wake all waiters, and wait until no slot is held
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        let mut table = self.table.lock();
        for slot in table.slots.values() {
            slot.wakeup.notify_all();
        }
        while table.held > 0 {
            self.drained.wait_for(&mut table, self.poll_interval);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Number of slots currently held
    pub fn held_count(&self) -> usize {
        self.table.lock().held
    }

    /// A waiter gives up on `offset`
    ///
    /// The wakeup it may have consumed is passed on to the next waiter, and
    /// an idle slot is forgotten.
    fn leave(table: &mut LockTable, offset: u64) {
        let Some(slot) = table.slots.get(&offset) else {
            return;
        };
        if slot.holder.is_some() {
            return;
        }
        if slot.waiters > 0 {
            slot.wakeup.notify_one();
        } else {
            table.slots.remove(&offset);
        }
    }
}

/// A set of held slots, released when dropped
pub struct LockedSlots<'a> {
    manager: &'a EntryLockManager,
    handles: Vec<LockHandle>,
}

impl LockedSlots<'_> {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.handles.iter().any(|h| h.offset == offset)
    }
}

impl Drop for LockedSlots<'_> {
    fn drop(&mut self) {
        // Release in reverse acquisition order
        while let Some(handle) = self.handles.pop() {
            self.manager.unlock(handle);
        }
    }
}
