//! This module contains `WorkerMonitor` and related types.  It purposes includes:
//!
//! -   allowing idle pool workers to park,
//! -   letting task creators and region masters wake workers when there are things to do, and
//! -   telling parked workers to exit when the runtime shuts down.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// Returned by `park_and_wait` when the worker thread should exit.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct WorkerShouldExit;

/// A data structure for synchronizing idle workers with the rest of the runtime.
///
/// There is one instance per runtime.
pub(crate) struct WorkerMonitor {
    /// The synchronized part.
    sync: Mutex<WorkerParker>,
    /// Workers wait on this when idle.  Notified if workers have things to do.  That include:
    /// -   tasks pushed to any deque or inbox,
    /// -   region assignments posted to a mailbox, and
    /// -   the request to exit.
    workers_have_anything_to_do: Condvar,
    /// Bumped every time something is made available.  A worker that read the epoch before
    /// searching for work does not park if the epoch moved in the meantime.
    work_epoch: AtomicU64,
    /// Mirror of `sync.parked_workers` readable without the mutex.
    parked: AtomicUsize,
    exit_requested: AtomicBool,
}

/// This struct counts the number of workers parked and identifies the last parked worker.
struct WorkerParker {
    /// The total number of workers that may park.
    worker_count: usize,
    /// Number of parked workers.
    parked_workers: usize,
}

impl WorkerParker {
    fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            parked_workers: 0,
        }
    }

    /// Increase the parked-workers counter.
    /// Called before a worker is parked.
    ///
    /// Return true if all the workers are parked.
    fn inc_parked_workers(&mut self) -> bool {
        let old = self.parked_workers;
        debug_assert!(old < self.worker_count);
        let new = old + 1;
        self.parked_workers = new;
        new == self.worker_count
    }

    /// Decrease the parked-workers counter.
    /// Called after a worker is resumed from the parked state.
    fn dec_parked_workers(&mut self) {
        let old = self.parked_workers;
        debug_assert!(old <= self.worker_count);
        debug_assert!(old > 0);
        self.parked_workers = old - 1;
    }
}

impl WorkerMonitor {
    pub fn new(worker_count: usize) -> Self {
        Self {
            sync: Mutex::new(WorkerParker::new(worker_count)),
            workers_have_anything_to_do: Default::default(),
            work_epoch: AtomicU64::new(0),
            parked: AtomicUsize::new(0),
            exit_requested: AtomicBool::new(false),
        }
    }

    /// Read the work epoch.  Call before searching for work, and pass the value to
    /// `park_and_wait` if nothing was found.
    pub fn work_epoch(&self) -> u64 {
        self.work_epoch.load(Ordering::SeqCst)
    }

    /// Wake up workers when more tasks or region assignments are made available.
    pub fn notify_work_available(&self, all: bool) {
        self.work_epoch.fetch_add(1, Ordering::SeqCst);
        if self.parked_workers() == 0 {
            return;
        }
        // Taking the mutex orders this notification after any worker that is between checking
        // the epoch and blocking on the CondVar.
        let _guard = self.sync.lock().unwrap();
        if all {
            self.workers_have_anything_to_do.notify_all();
        } else {
            self.workers_have_anything_to_do.notify_one();
        }
    }

    /// Ask every worker to exit, and wake the parked ones.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
        let _guard = self.sync.lock().unwrap();
        self.work_epoch.fetch_add(1, Ordering::SeqCst);
        self.workers_have_anything_to_do.notify_all();
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    /// Number of workers currently parked.
    pub fn parked_workers(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }

    /// Park a worker and wait on the CondVar `workers_have_anything_to_do`.
    ///
    /// `seen_epoch` is the value of `work_epoch()` read before the worker last searched for work.
    /// If the epoch has moved since then, the worker does not wait.
    ///
    /// This function returns `Ok(())` if the current worker should continue working,
    /// or `Err(WorkerShouldExit)` if the current worker should exit now.
    pub fn park_and_wait(&self, ordinal: usize, seen_epoch: u64) -> Result<(), WorkerShouldExit> {
        let mut sync = self.sync.lock().unwrap();

        // Park this worker
        let all_parked = sync.inc_parked_workers();
        self.parked.fetch_add(1, Ordering::SeqCst);
        trace!(
            "Worker {} parked.  parked/total: {}/{}.  All parked: {}",
            ordinal,
            sync.parked_workers,
            sync.worker_count,
            all_parked
        );

        // The parked counter is published before the epoch is checked, and notifiers bump the
        // epoch before they read the counter.  One of the two sides always sees the other.
        while !self.exit_requested() && self.work_epoch.load(Ordering::SeqCst) == seen_epoch {
            sync = self.workers_have_anything_to_do.wait(sync).unwrap();
        }

        // Unpark this worker.
        sync.dec_parked_workers();
        self.parked.fetch_sub(1, Ordering::SeqCst);
        trace!(
            "Worker {} unparked.  parked/total: {}/{}.",
            ordinal,
            sync.parked_workers,
            sync.worker_count,
        );

        if self.exit_requested() {
            return Err(WorkerShouldExit);
        }

        Ok(())
    }
}
