//! mirt is a NUMA-aware tasking runtime for shared-memory parallel programs.
//!
//! Programs lowered from parallel directives use parallel regions, worksharing loops, tasks,
//! barriers and critical sections.  mirt runs them on a pool of worker threads pinned to the
//! cores of the machine, and places every task near the data it declares it touches:
//!
//! * [`util::topology`] describes the cores, NUMA nodes and node distances of the machine.
//! * [`util::memory`] hands out memory bound to nodes, and remembers where it went.
//! * [`scheduler`] places tasks on workers and balances them by work stealing, nearest first.
//! * [`sync`] provides the team barrier, critical sections and single constructs.
//!
//! A runtime is created with a [`RuntimeBuilder`] and used through the [`Runtime`] it returns,
//! or through the process-wide free functions in [`task_manager`].  Every task and region body
//! receives the [`Worker`] running it.

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod build_info;
pub mod runtime;
pub mod scheduler;
pub mod sync;
pub mod task_manager;
pub mod util;

pub use crate::runtime::{Runtime, RuntimeBuilder};
pub use crate::scheduler::{
    AccessMode, Footprint, PlacementHint, Schedule, TaskHandle, TaskState, Worker,
};
pub use crate::util::error::{Result, RuntimeError};
pub use crate::util::Address;
