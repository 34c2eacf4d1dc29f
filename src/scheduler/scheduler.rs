use super::placement::PlacementPolicy;
use super::stat::{SchedulerStat, TaskRecord};
use super::task::Task;
use super::task_arena::TaskArena;
use super::worker::WorkerShared;
use super::worker_monitor::WorkerMonitor;
use crate::util::options::{Options, SchedPolicy};
use crate::util::topology::{NodeId, Topology};
use crossbeam::deque::{self, Injector, Stealer};
use crossbeam::utils::CachePadded;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// The state of the worker pool shared by all workers: one deque and one inbox per worker, the
/// task arena and the placement policy.
pub struct TaskScheduler {
    /// The cold end of each worker's deque.
    pub(crate) stealers: Vec<Stealer<Task>>,
    /// Tasks other workers placed on each worker.
    pub(crate) inboxes: Vec<Injector<Task>>,
    /// Tasks created outside any team under the central policy.
    pub(crate) central: Injector<Task>,
    pub(crate) policy: SchedPolicy,
    pub workers_shared: Vec<Arc<WorkerShared>>,
    pub(crate) worker_monitor: WorkerMonitor,
    pub(crate) arena: TaskArena,
    pub(crate) placement: PlacementPolicy,
    /// Explicit tasks created and not yet finished.
    live_tasks: CachePadded<AtomicUsize>,
    next_task_id: AtomicU64,
    /// For each worker, the other workers grouped by hop distance.
    victims: Vec<Vec<Vec<usize>>>,
    /// For each worker, the other workers nearest first.
    claim_order: Vec<Vec<usize>>,
}

impl TaskScheduler {
    /// Create the scheduler for `options.workers` workers.  Also returns the hot end of each
    /// worker's deque, to be moved to the thread of that worker.
    pub(crate) fn new(options: &Options, topology: Arc<Topology>) -> (Self, Vec<deque::Worker<Task>>) {
        let num_workers = options.workers;
        let cpus = topology.worker_cpus(num_workers);
        let nodes: Vec<NodeId> = cpus.iter().map(|cpu| topology.node_of(*cpu)).collect();
        let diameter = topology.diameter();

        let locals: Vec<deque::Worker<Task>> =
            (0..num_workers).map(|_| deque::Worker::new_lifo()).collect();
        let stealers = locals.iter().map(|local| local.stealer()).collect();
        let inboxes = (0..num_workers).map(|_| Injector::new()).collect();
        let workers_shared = (0..num_workers)
            .map(|ordinal| Arc::new(WorkerShared::new(ordinal, nodes[ordinal], cpus[ordinal], diameter)))
            .collect();

        let victims: Vec<Vec<Vec<usize>>> = (0..num_workers)
            .map(|w| {
                let mut classes = vec![vec![]; diameter + 1];
                for v in (0..num_workers).filter(|v| *v != w) {
                    classes[topology.hops(nodes[w], nodes[v])].push(v);
                }
                classes
            })
            .collect();
        let claim_order = victims.iter().map(|classes| classes.concat()).collect();

        let placement = PlacementPolicy::new(topology, nodes, options.numa_footprint);
        let scheduler = TaskScheduler {
            stealers,
            inboxes,
            central: Injector::new(),
            policy: options.sched_policy,
            workers_shared,
            worker_monitor: WorkerMonitor::new(num_workers),
            arena: TaskArena::new(options.task_capacity),
            placement,
            live_tasks: CachePadded::new(AtomicUsize::new(0)),
            next_task_id: AtomicU64::new(0),
            victims,
            claim_order,
        };
        (scheduler, locals)
    }

    pub fn num_workers(&self) -> usize {
        self.workers_shared.len()
    }

    pub(crate) fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn task_created(&self) {
        self.live_tasks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn task_finished(&self) {
        self.live_tasks.fetch_sub(1, Ordering::AcqRel);
    }

    /// Explicit tasks created and not yet finished.
    pub fn live_tasks(&self) -> usize {
        self.live_tasks.load(Ordering::Acquire)
    }

    /// Candidates for stealing by `worker`, indexed by hop distance.
    pub(crate) fn victims(&self, worker: usize) -> &[Vec<usize>] {
        &self.victims[worker]
    }

    pub(crate) fn claim_order(&self, worker: usize) -> &[usize] {
        &self.claim_order[worker]
    }

    /// Collect the statistics of all workers.
    pub fn statistics(&self) -> SchedulerStat {
        let mut summary = SchedulerStat::default();
        for worker in &self.workers_shared {
            // A worker holds its counters only for the duration of an update.
            let mut stat = worker.stat();
            for _ in 0..100 {
                if stat.is_some() {
                    break;
                }
                std::thread::yield_now();
                stat = worker.stat();
            }
            match stat {
                Some(stat) => summary.merge(&stat),
                None => summary.mark_incomplete(),
            }
        }
        summary
    }

    pub fn harness_stat(&self) -> HashMap<String, String> {
        self.statistics().harness_stat()
    }

    /// The records of all executed tasks, in creation order.  Empty unless `task_stats` is set.
    pub fn task_records(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .workers_shared
            .iter()
            .flat_map(|w| w.task_records.lock().clone())
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::topology::Topology;

    fn options(workers: usize) -> Options {
        let mut options = Options::default();
        options.workers = workers;
        options.task_capacity = 64;
        options
    }

    #[test]
    fn victims_nearest_first() {
        let topology = Arc::new(Topology::uniform(2, 2));
        let (scheduler, locals) = TaskScheduler::new(&options(4), topology);
        assert_eq!(locals.len(), 4);
        assert_eq!(scheduler.num_workers(), 4);
        assert_eq!(scheduler.victims(0), &[vec![1], vec![2, 3]]);
        assert_eq!(scheduler.victims(3), &[vec![2], vec![0, 1]]);
        assert_eq!(scheduler.claim_order(2), &[3, 0, 1]);
    }

    #[test]
    fn more_workers_than_cpus() {
        let topology = Arc::new(Topology::uniform(1, 2));
        let (scheduler, _) = TaskScheduler::new(&options(5), topology);
        assert_eq!(scheduler.num_workers(), 5);
        assert_eq!(scheduler.claim_order(0), &[1, 2, 3, 4]);
        assert!(scheduler.workers_shared.iter().all(|w| w.node == 0));
    }

    #[test]
    fn statistics_of_idle_pool() {
        let topology = Arc::new(Topology::uniform(1, 2));
        let (scheduler, _) = TaskScheduler::new(&options(2), topology);
        let stat = scheduler.statistics();
        assert!(!stat.is_incomplete());
        assert_eq!(stat.workers().len(), 2);
        assert_eq!(scheduler.harness_stat()["tasks.created.count"], "0");
    }
}
