//! The process-wide runtime: free functions for code lowered from parallel directives.
//!
//! One runtime exists per process at a time.  [`runtime_create`] makes the calling thread the
//! master, and [`runtime_destroy`] must be called on that same thread.  Every other function
//! acts on the worker of the calling thread, so it can be called from the master, from any
//! region body and from any task.  Calling them on a thread that is not a worker of the runtime
//! is a fatal error.
//!
//! Fatal errors are logged with `error!` and then panic.

use std::cell::RefCell;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::runtime::{Runtime, RuntimeBuilder};
use crate::scheduler::{with_current_worker, Footprint, PlacementHint, Schedule, TaskHandle, Worker};
use crate::util::error::{fatal, RuntimeError};
use crate::util::topology::NodeId;
use crate::util::Address;

static RUNTIME_ACTIVE: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// The process runtime, owned by the thread that created it.
    static PROCESS_RUNTIME: RefCell<Option<Runtime>> = const { RefCell::new(None) };
}

fn with_worker<R>(f: impl FnOnce(&Worker) -> R) -> R {
    match with_current_worker(f) {
        Some(result) => result,
        None => fatal(RuntimeError::NotInitialized),
    }
}

/// Whether a process runtime exists.
pub fn is_runtime_active() -> bool {
    RUNTIME_ACTIVE.load(Ordering::Acquire)
}

/// Create the process runtime with options read from `MIRT_*` environment variables.  The
/// calling thread becomes worker 0.
///
/// Note that this function attempts to initialize the built-in logger.  A program that wants
/// its own logger should install it first.
pub fn runtime_create() {
    runtime_create_with(RuntimeBuilder::new())
}

/// Create the process runtime from a builder.  Panics if a runtime already exists.
pub fn runtime_create_with(builder: RuntimeBuilder) {
    match crate::util::logger::try_init() {
        Ok(_) => debug!("mirt initialized the logger."),
        Err(_) => debug!(
            "mirt failed to initialize the logger. Possibly a logger has been initialized by user."
        ),
    }
    if RUNTIME_ACTIVE.swap(true, Ordering::AcqRel) {
        fatal(RuntimeError::AlreadyInitialized);
    }
    match builder.build() {
        Ok(runtime) => PROCESS_RUNTIME.with(|r| *r.borrow_mut() = Some(runtime)),
        Err(e) => {
            RUNTIME_ACTIVE.store(false, Ordering::Release);
            fatal(e)
        }
    }
}

/// Wait until every task has finished, stop the workers and write the worker statistics if the
/// `worker_stats` option is set.  Must be called on the thread that created the runtime.
pub fn runtime_destroy() {
    let Some(runtime) = PROCESS_RUNTIME.with(|r| r.borrow_mut().take()) else {
        fatal(RuntimeError::NotInitialized)
    };
    runtime.shutdown();
    RUNTIME_ACTIVE.store(false, Ordering::Release);
}

/// Queue a task.  The footprints describe the data the task touches and steer where it runs.
/// A placement hint overrides them.
pub fn create_task<F>(
    body: F,
    footprints: Vec<Footprint>,
    hint: Option<PlacementHint>,
) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    with_worker(|w| {
        let mut builder = w.task().footprints(footprints);
        if let Some(hint) = hint {
            builder = builder.hint(hint);
        }
        builder.spawn(move |_| body())
    })
}

/// Queue a task without footprints or hint.
pub fn spawn<F>(body: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    with_worker(|w| w.spawn(move |_| body()))
}

/// Whether the task behind `task` has completed, children included.
pub fn is_task_done(task: TaskHandle) -> bool {
    with_worker(|w| w.is_task_done(task))
}

/// Wait for the tasks the calling task created.  The caller runs other tasks meanwhile.
pub fn task_wait() {
    with_worker(|w| w.task_wait())
}

/// Size of the current team, or of the pool outside any parallel region.
pub fn get_num_workers() -> usize {
    with_worker(|w| w.num_workers())
}

/// Index of the calling thread in the current team.  0 outside any parallel region.
pub fn get_thread_num() -> usize {
    with_worker(|w| w.thread_num())
}

pub fn get_pool_size() -> usize {
    with_worker(|w| w.pool_size())
}

/// How many parallel regions enclose the caller.
pub fn team_level() -> usize {
    with_worker(|w| w.team_level())
}

/// Allocate `size` bytes, bound to a node according to the memory policy.  `node_hint` binds
/// the memory to that node.  Failure is fatal.
pub fn allocate(size: usize, node_hint: Option<NodeId>) -> Address {
    match with_worker(|w| w.allocate(size, node_hint)) {
        Ok(addr) => addr,
        Err(e) => fatal(e),
    }
}

/// Free memory returned by [`allocate`].
pub fn release(start: Address, size: usize) {
    if let Err(e) = with_worker(|w| w.release(start, size)) {
        fatal(e)
    }
}

/// Put the calling thread to sleep.  It does not run tasks meanwhile.
pub fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms))
}

/// Run `body` on a team of `num_threads` workers.  0 asks for the default team size.
pub fn parallel<F>(num_threads: usize, body: F)
where
    F: Fn() + Sync,
{
    with_worker(|w| w.parallel(Some(num_threads), |_| body()))
}

/// A worksharing loop over `range`, followed by a barrier.
pub fn for_loop(range: Range<usize>, schedule: Schedule, body: impl Fn(usize)) {
    with_worker(|w| w.for_loop(range, schedule, body))
}

/// A worksharing loop over `range`, without the closing barrier.
pub fn for_loop_nowait(range: Range<usize>, schedule: Schedule, body: impl Fn(usize)) {
    with_worker(|w| w.for_loop_nowait(range, schedule, body))
}

pub fn barrier() {
    with_worker(|w| w.barrier())
}

/// Run `f` while holding the critical section `name`, or the unnamed one.
pub fn critical<R>(name: Option<&str>, f: impl FnOnce() -> R) -> R {
    with_worker(|w| w.critical(name, f))
}

/// Run `f` on one member of the team and wait for the others.  Returns `None` on the members
/// that did not run it.
pub fn single<R>(f: impl FnOnce() -> R) -> Option<R> {
    with_worker(|w| w.single(f))
}

pub fn single_nowait<R>(f: impl FnOnce() -> R) -> Option<R> {
    with_worker(|w| w.single_nowait(f))
}
