//! Ticker
//!
//! Deferred job execution. The store uses it to schedule slot cache flushes
//! and to delay the first cleaner run after startup.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

/// A job queued on a ticker
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs after a delay
pub trait Ticker: Send + Sync {
    /// Run `job` on the ticker's thread no sooner than `delay` from now
    fn queue_timed_job(&self, job: Job, delay: Duration);
}

struct Scheduled {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: BinaryHeap is a max-heap, we want the earliest job on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Ticker backed by one dedicated thread
///
/// Jobs run sequentially on the ticker thread, so they should be short.
/// Dropping the ticker stops the thread; jobs not yet due are discarded.
pub struct ThreadTicker {
    sender: Mutex<Option<Sender<(Instant, Job)>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadTicker {
    /// Spawn the ticker thread
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name(format!("saltkv-ticker-{}", name))
            .spawn(move || run_ticker(rx))?;

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the ticker thread and wait for it
    pub fn stop(&self) {
        self.sender.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Ticker for ThreadTicker {
    fn queue_timed_job(&self, job: Job, delay: Duration) {
        let due = Instant::now() + delay;
        if let Some(tx) = self.sender.lock().as_ref() {
            if tx.send((due, job)).is_err() {
                tracing::debug!("Ticker stopped, dropping job");
            }
        }
    }
}

impl Drop for ThreadTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_ticker(rx: Receiver<(Instant, Job)>) {
    let mut queue: BinaryHeap<Scheduled> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        // Run everything that is due
        let now = Instant::now();
        while queue.peek().map_or(false, |s| s.due <= now) {
            if let Some(scheduled) = queue.pop() {
                run_job(scheduled.job);
            }
        }

        let received = match queue.peek() {
            Some(next) => rx.recv_timeout(next.due.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok((due, job)) => {
                seq += 1;
                queue.push(Scheduled { due, seq, job });
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// A panicking job is logged and dropped; later jobs still run
fn run_job(job: Job) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(%reason, "Ticker job panicked");
    }
}
