//! A NUMA-aware work-stealing scheduler of tasks and parallel regions.

pub(crate) mod affinity;

#[allow(clippy::module_inception)]
mod scheduler;
pub use scheduler::TaskScheduler;

mod stat;
pub use stat::{
    write_task_csv, SchedulerStat, TaskRecord, WorkerLocalStat, TASK_STATS_HEADER, WORKER_STATS_HEADER,
};

mod task;
pub use task::{TaskBuilder, TaskState};

mod task_arena;
pub use task_arena::TaskHandle;

mod footprint;
pub use footprint::{AccessMode, Footprint, NodeDistribution};

mod placement;
pub use placement::{Placement, PlacementHint, PlacementPolicy};

mod team;
pub use team::Team;

mod worksharing;
pub use worksharing::{LoopShare, Schedule};

mod worker;
mod worker_monitor;
pub(crate) use worker::with_current_worker;
pub use worker::{current_worker_ordinal, Worker, WorkerShared, WorkerStatus};
