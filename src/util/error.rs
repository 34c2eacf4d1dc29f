//! Errors reported by the runtime.
//!
//! All variants are fatal for the run. Lower layers return them through [`Result`] so they can be
//! tested, and the directive-level entry points in [`crate::task_manager`] and [`crate::Runtime`]
//! report them with `error!` and then panic.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A parallel region asked for more workers than the pool has.
    #[error("team of {requested} workers requested, but the worker pool only has {pool} workers")]
    TeamTooLarge { requested: usize, pool: usize },
    /// An allocation was bound to a node that does not exist.
    #[error("NUMA node {node} does not exist (available nodes: {available})")]
    InvalidNode { node: usize, available: usize },
    /// An allocation does not fit in the memory of its node.
    #[error("cannot allocate {requested} bytes on NUMA node {node} with capacity {capacity} bytes")]
    NodeCapacityExceeded {
        node: usize,
        requested: usize,
        capacity: usize,
    },
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("out of memory: {0}")]
    OutOfMemory(#[source] std::io::Error),
    /// `release` was called with an address the allocator did not hand out.
    #[error("{0} was not allocated by the NUMA allocator")]
    UnknownAllocation(crate::util::Address),
    /// No free slot left for a new task record.
    #[error("task arena exhausted ({capacity} live tasks)")]
    TaskArenaExhausted { capacity: usize },
    #[error("the runtime has already been created")]
    AlreadyInitialized,
    #[error("the runtime has not been created")]
    NotInitialized,
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Report a fatal error and terminate the run.
#[cold]
pub(crate) fn fatal(err: RuntimeError) -> ! {
    error!("{}", err);
    panic!("{}", err)
}
