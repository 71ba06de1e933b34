//! Persistent Int Array
//!
//! A large in-memory array of 32-bit words mirrored to a file.
//!
//! ## Concurrency
//! - Words are atomics inside a `RwLock<Vec<_>>`: `get`/`put` take the read
//!   side and run concurrently, `resize` takes the write side.
//! - The backing file sits behind its own mutex and is only touched by
//!   flushes and write-through puts.
//!
//! ## Durability
//! Losing writes is safe for the slot cache: the entry table is the ground
//! truth, a stale cache only costs extra reads once the store notices it
//! and rebuilds. See [`CachePersistence`].

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::{Mutex, RwLock};

use crate::config::CachePersistence;
use crate::error::Result;
use crate::store::files::{read_at, write_at};
use crate::ticker::Ticker;

/// Bytes per stored word
const WORD_SIZE: u64 = 4;

/// Array of u32 words persisted under a [`CachePersistence`] policy
pub struct PersistentIntArray {
    inner: Arc<ArrayInner>,
}

struct ArrayInner {
    path: PathBuf,
    words: RwLock<Vec<AtomicU32>>,
    /// `None` once shut down or aborted
    file: Mutex<Option<File>>,
    policy: CachePersistence,
    dirty: AtomicBool,
    flush_scheduled: AtomicBool,
    ticker: Arc<dyn Ticker>,
}

impl PersistentIntArray {
    /// Open (or create) the file at `path` and load it into memory
    ///
    /// The in-memory array always has `len` words: missing words read as
    /// zero, surplus words are dropped, and the file is resized to match.
    pub fn open(
        path: &Path,
        len: u64,
        policy: CachePersistence,
        ticker: Arc<dyn Ticker>,
    ) -> Result<(Self, bool)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let wanted = len * WORD_SIZE;
        let intact = file_len == wanted && file_len > 0;

        // Step 1: Read whatever is there (up to the size we want)
        let readable = file_len.min(wanted) as usize;
        let mut raw = vec![0u8; readable];
        read_at(&file, &mut raw, 0)?;

        // Step 2: Decode and zero-extend
        let mut buf = &raw[..];
        let mut words = Vec::with_capacity(len as usize);
        while buf.remaining() >= WORD_SIZE as usize {
            words.push(AtomicU32::new(buf.get_u32()));
        }
        words.resize_with(len as usize, || AtomicU32::new(0));

        // Step 3: Match the file to the array
        if file_len != wanted {
            file.set_len(wanted)?;
        }

        tracing::debug!(
            path = %path.display(),
            words = len,
            intact,
            "Opened persistent int array"
        );

        let array = Self {
            inner: Arc::new(ArrayInner {
                path: path.to_path_buf(),
                words: RwLock::new(words),
                file: Mutex::new(Some(file)),
                policy,
                dirty: AtomicBool::new(false),
                flush_scheduled: AtomicBool::new(false),
                ticker,
            }),
        };
        Ok((array, intact))
    }

    /// Read a word; out-of-range indexes read as zero
    pub fn get(&self, index: u64) -> u32 {
        let words = self.inner.words.read();
        words
            .get(index as usize)
            .map_or(0, |w| w.load(Ordering::Acquire))
    }

    /// Write a word and persist it according to the policy
    pub fn put(&self, index: u64, value: u32) {
        {
            let words = self.inner.words.read();
            let Some(word) = words.get(index as usize) else {
                tracing::debug!(index, len = words.len(), "Ignoring put beyond array end");
                return;
            };
            if word.swap(value, Ordering::AcqRel) == value {
                return;
            }
        }

        match self.inner.policy {
            CachePersistence::WriteThrough => {
                if let Err(e) = self.inner.write_word(index, value) {
                    tracing::warn!(path = %self.inner.path.display(), "Write-through failed: {}", e);
                    self.inner.dirty.store(true, Ordering::Release);
                }
            }
            CachePersistence::Periodic { delay } => {
                self.inner.dirty.store(true, Ordering::Release);
                if !self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
                    let weak: Weak<ArrayInner> = Arc::downgrade(&self.inner);
                    self.inner.ticker.queue_timed_job(
                        Box::new(move || {
                            let Some(inner) = weak.upgrade() else { return };
                            inner.flush_scheduled.store(false, Ordering::Release);
                            if let Err(e) = inner.flush(false) {
                                tracing::warn!(path = %inner.path.display(), "Periodic flush failed: {}", e);
                            }
                        }),
                        delay,
                    );
                }
            }
            CachePersistence::OnShutdown => {
                self.inner.dirty.store(true, Ordering::Release);
            }
        }
    }

    /// Number of words
    pub fn len(&self) -> u64 {
        self.inner.words.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resize in memory and on disk, persisting immediately
    pub fn resize(&self, len: u64) -> Result<()> {
        let mut words = self.inner.words.write();
        words.truncate(len as usize);
        words.resize_with(len as usize, || AtomicU32::new(0));

        let mut file = self.inner.file.lock();
        if let Some(file) = file.as_mut() {
            file.set_len(len * WORD_SIZE)?;
        }
        drop(file);

        self.inner.dirty.store(true, Ordering::Release);
        self.inner.flush_words(&words, true)
    }

    /// Reset every word to zero ("unobserved") and persist
    pub fn clear(&self) -> Result<()> {
        let words = self.inner.words.read();
        for word in words.iter() {
            word.store(0, Ordering::Release);
        }
        self.inner.dirty.store(true, Ordering::Release);
        self.inner.flush_words(&words, false)
    }

    /// Flush and fsync now, regardless of policy
    pub fn force_write(&self) -> Result<()> {
        self.inner.dirty.store(true, Ordering::Release);
        self.inner.flush(true)
    }

    /// True if some words have not reached the file yet
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    /// Flush, fsync and close the file
    pub fn shutdown(&self) -> Result<()> {
        let result = self.inner.flush(true);
        self.inner.file.lock().take();
        result
    }

    /// Close the file without flushing
    pub fn abort(&self) {
        self.inner.file.lock().take();
    }
}

impl ArrayInner {
    fn write_word(&self, index: u64, value: u32) -> Result<()> {
        let file = self.file.lock();
        if let Some(file) = file.as_ref() {
            write_at(file, &value.to_be_bytes(), index * WORD_SIZE)?;
        }
        Ok(())
    }

    fn flush(&self, sync: bool) -> Result<()> {
        let words = self.words.read();
        self.flush_words(&words, sync)
    }

    /// Write the whole array if dirty
    fn flush_words(&self, words: &[AtomicU32], sync: bool) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut buf = BytesMut::with_capacity(words.len() * WORD_SIZE as usize);
        for word in words {
            buf.put_u32(word.load(Ordering::Acquire));
        }

        let file = self.file.lock();
        let Some(file) = file.as_ref() else {
            return Ok(());
        };
        if let Err(e) = write_at(file, &buf, 0) {
            self.dirty.store(true, Ordering::Release);
            return Err(e.into());
        }
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }
}
