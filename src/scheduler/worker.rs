use super::stat::{TaskRecord, WorkerLocalStat};
use super::task::{Task, TaskBody, TaskBuilder, TaskSpec, TaskState};
use super::task_arena::TaskHandle;
use super::team::{RegionJob, Team};
use crate::runtime::RuntimeShared;
use crate::util::backoff::IdleBackoff;
use crate::util::constants::IDLE_ROUNDS_BEFORE_PARK;
use crate::util::error::{fatal, Result};
use crate::util::options::SchedPolicy;
use crate::util::topology::{CpuId, NodeId};
use crate::util::Address;
use atomic::Atomic;
use atomic_refcell::AtomicRefCell;
use bytemuck::NoUninit;
use crossbeam::deque::{self, Steal};
use crossbeam::queue::SegQueue;
use crossbeam::utils::Backoff;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

thread_local! {
    /// The worker running on the current thread, if any.
    static CURRENT_WORKER: Cell<*const Worker> = const { Cell::new(std::ptr::null()) };
}

/// Run `f` with the worker of the current thread.  Returns `None` on threads that are neither a
/// pool worker nor the thread that created the runtime.
pub(crate) fn with_current_worker<R>(f: impl FnOnce(&Worker) -> R) -> Option<R> {
    let ptr = CURRENT_WORKER.with(|w| w.get());
    if ptr.is_null() {
        None
    } else {
        // SAFETY: The pointer is set by the thread owning the worker, and cleared before the
        // worker is dropped.
        Some(f(unsafe { &*ptr }))
    }
}

/// Get the ordinal of the worker of the current thread, if any.
pub fn current_worker_ordinal() -> Option<usize> {
    with_current_worker(|w| w.ordinal)
}

/// What a worker is doing, as far as claiming it for a team is concerned.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit)]
pub enum WorkerStatus {
    /// A pool worker outside any team.  It may be claimed.
    Free,
    /// Outside any team but never claimable.  The thread that created the runtime is always busy
    /// when not in a team.
    Busy,
    /// Claimed for a team, and about to receive its region assignment.
    Claimed,
    InTeam,
    AtBarrier,
}

// The root task stays at the bottom of the task stack until the worker is retired.
const ROOT_POPPED_MSG: &str = "The root task of the worker has been popped.";

/// The part shared between a worker and the rest of the runtime.
pub struct WorkerShared {
    pub ordinal: usize,
    /// The node the worker is affine to.
    pub node: NodeId,
    /// The CPU the topology assigned to the worker.
    pub cpu: CpuId,
    pub parked: AtomicBool,
    status: Atomic<WorkerStatus>,
    /// Region assignments posted by the worker that claimed this one.
    mailbox: SegQueue<RegionJob>,
    stat: AtomicRefCell<WorkerLocalStat>,
    /// Tasks executed by the worker, kept when the `task_stats` option is set.
    pub(crate) task_records: spin::Mutex<Vec<TaskRecord>>,
}

impl WorkerShared {
    pub fn new(ordinal: usize, node: NodeId, cpu: CpuId, diameter: usize) -> Self {
        WorkerShared {
            ordinal,
            node,
            cpu,
            parked: AtomicBool::new(false),
            status: Atomic::new(if ordinal == 0 {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Free
            }),
            mailbox: SegQueue::new(),
            stat: AtomicRefCell::new(WorkerLocalStat::new(diameter)),
            task_records: spin::Mutex::new(vec![]),
        }
    }

    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.load(Ordering::Acquire)
    }

    /// Switch the status of the owning worker to `to`, and return the status it replaced.  A claim
    /// is left in place: the claimer posts its job right after, and the owner picks it up from the
    /// mailbox.  Returns `Claimed` in that case.
    pub(crate) fn switch_status(&self, to: WorkerStatus) -> WorkerStatus {
        let mut current = self.status();
        loop {
            if current == WorkerStatus::Claimed {
                return current;
            }
            match self
                .status
                .compare_exchange_weak(current, to, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    /// The owner took the job posted by the worker that claimed it.
    pub(crate) fn take_claim(&self) {
        debug_assert_eq!(self.status(), WorkerStatus::Claimed);
        self.status.store(WorkerStatus::InTeam, Ordering::Release);
    }

    /// Claim a free worker for a team.
    pub(crate) fn try_claim(&self) -> bool {
        self.status
            .compare_exchange(
                WorkerStatus::Free,
                WorkerStatus::Claimed,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn post(&self, job: RegionJob) {
        debug_assert_eq!(self.status(), WorkerStatus::Claimed);
        self.mailbox.push(job);
    }

    /// Update the statistics.  Only the owning worker does this.
    pub(crate) fn with_stat_mut<R>(&self, f: impl FnOnce(&mut WorkerLocalStat) -> R) -> R {
        let backoff = Backoff::new();
        loop {
            // Readers only hold the borrow while copying the counters.
            if let Ok(mut stat) = self.stat.try_borrow_mut() {
                return f(&mut stat);
            }
            backoff.snooze();
        }
    }

    /// A copy of the statistics, or `None` if the worker is updating them right now.
    pub fn stat(&self) -> Option<WorkerLocalStat> {
        self.stat.try_borrow().ok().map(|s| s.clone())
    }
}

/// Per-construct counters of a team member.
#[derive(Default)]
pub(crate) struct MemberState {
    pub singles_seen: Cell<u64>,
    pub loops_seen: Cell<u64>,
}

/// A task the worker is executing.  The last one is the current task.
pub(crate) struct ActiveTask {
    pub handle: TaskHandle,
    pub team: Option<Arc<Team>>,
    pub thread_num: usize,
    /// Set for the implicit task of a team member.  Worksharing constructs inside other tasks
    /// behave as in a team of one.
    pub member: Option<MemberState>,
}

/// Aborts the process if a task or region body unwinds.  Region bodies are borrowed from the
/// stack of the thread that entered the region, so they must never be abandoned halfway.
pub(super) struct AbortOnUnwind(pub(super) &'static str);

impl Drop for AbortOnUnwind {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("A {} panicked. Aborting.", self.0);
            std::process::abort();
        }
    }
}

/// A worker.  This part is privately owned by a worker thread, and is handed to every task and
/// region body the thread runs.
pub struct Worker {
    pub(crate) ordinal: usize,
    pub(crate) shared: Arc<WorkerShared>,
    pub(crate) runtime: Arc<RuntimeShared>,
    local: deque::Worker<Task>,
    pub(crate) tasks: RefCell<Vec<ActiveTask>>,
    steal_bias: Cell<usize>,
}

impl Worker {
    pub(crate) fn new(
        ordinal: usize,
        runtime: Arc<RuntimeShared>,
        local: deque::Worker<Task>,
    ) -> Result<Self> {
        let scheduler = &runtime.scheduler;
        let shared = scheduler.workers_shared[ordinal].clone();
        let root = scheduler.arena.create(None, scheduler.next_task_id())?;
        scheduler.arena.set_state(root, TaskState::Running);
        Ok(Worker {
            ordinal,
            shared,
            local,
            tasks: RefCell::new(vec![ActiveTask {
                handle: root,
                team: None,
                thread_num: 0,
                member: None,
            }]),
            steal_bias: Cell::new(ordinal),
            runtime,
        })
    }

    /// Make this the worker of the current thread.
    pub(crate) fn enter(&self) {
        CURRENT_WORKER.with(|w| w.set(self as *const Worker));
    }

    pub(crate) fn leave(&self) {
        CURRENT_WORKER.with(|w| {
            if w.get() == self as *const Worker {
                w.set(std::ptr::null());
            }
        });
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// The NUMA node this worker is affine to.
    pub fn node(&self) -> NodeId {
        self.shared.node
    }

    /// Number of workers in the pool.
    pub fn pool_size(&self) -> usize {
        self.runtime.scheduler.num_workers()
    }

    /// The team of the current task, if any.
    pub(crate) fn current_team(&self) -> Option<Arc<Team>> {
        self.tasks.borrow().last().and_then(|t| t.team.clone())
    }

    /// The innermost team this worker is a member of.
    pub(crate) fn current_region_team(&self) -> Option<Arc<Team>> {
        self.tasks
            .borrow()
            .iter()
            .rev()
            .find(|t| t.member.is_some())
            .and_then(|t| t.team.clone())
    }

    pub(crate) fn current_task(&self) -> TaskHandle {
        self.tasks.borrow().last().expect(ROOT_POPPED_MSG).handle
    }

    /// Size of the current team, or of the pool outside any team.
    pub fn num_workers(&self) -> usize {
        self.current_team()
            .map(|t| t.size())
            .unwrap_or_else(|| self.pool_size())
    }

    /// Index of this worker in the current team.  0 outside any team.
    pub fn thread_num(&self) -> usize {
        self.tasks.borrow().last().map_or(0, |t| t.thread_num)
    }

    /// How many parallel regions enclose the current task.
    pub fn team_level(&self) -> usize {
        self.current_team().map_or(0, |t| t.level())
    }

    /// The member index of this worker in `team`, if it is a member executing the region.
    fn member_index_in(&self, team: &Arc<Team>) -> Option<usize> {
        self.tasks
            .borrow()
            .iter()
            .rev()
            .find(|t| t.member.is_some() && t.team.as_ref().is_some_and(|m| Arc::ptr_eq(m, team)))
            .map(|t| t.thread_num)
    }

    pub(crate) fn idle_backoff(&self) -> IdleBackoff {
        let options = &self.runtime.options;
        IdleBackoff::new(options.backoff_reset_us, options.backoff_roof_us)
    }

    /// Start building a task.
    pub fn task(&self) -> TaskBuilder<'_> {
        TaskBuilder::new(self)
    }

    /// Queue a task without footprints or hints.
    pub fn spawn<F>(&self, body: F) -> TaskHandle
    where
        F: FnOnce(&Worker) + Send + 'static,
    {
        self.task().spawn(body)
    }

    /// The id of the current task.  Ids grow in creation order.
    pub fn task_id(&self) -> u64 {
        self.runtime.scheduler.arena.id(self.current_task())
    }

    /// The id of the task that created the current one.  Root and implicit tasks have no parent.
    pub fn parent_task_id(&self) -> Option<u64> {
        let arena = &self.runtime.scheduler.arena;
        // The parent cannot complete while the current task runs.
        arena.parent(self.current_task()).map(|p| arena.id(p))
    }

    /// The state of a task.  The handle of a task that has completed reports `Done`, even once
    /// its slot has been reused.
    pub fn task_state(&self, task: TaskHandle) -> TaskState {
        self.runtime.scheduler.arena.state(task)
    }

    pub fn is_task_done(&self, task: TaskHandle) -> bool {
        !self.runtime.scheduler.arena.is_live(task)
    }

    pub(crate) fn create_task(&self, spec: TaskSpec, body: TaskBody, arg_size: usize) -> TaskHandle {
        let runtime = &self.runtime;
        let scheduler = &runtime.scheduler;
        let (parent, team) = {
            let tasks = self.tasks.borrow();
            let current = tasks.last().expect(ROOT_POPPED_MSG);
            (current.handle, current.team.clone())
        };
        let id = scheduler.next_task_id();
        let parent_id = scheduler.arena.id(parent);
        let policy = scheduler.policy;
        let to_central = policy == SchedPolicy::Central && team.is_none() && spec.hint.is_none();
        // Footprints only steer placement under the NUMA policy.
        let footprints = if policy == SchedPolicy::Numa {
            spec.footprints.as_slice()
        } else {
            &[]
        };

        // Decided before the task is counted anywhere.
        let inline_limit = runtime.options.inline_limit;
        let placement = if inline_limit > 0
            && footprints.is_empty()
            && spec.hint.is_none()
            && self.local.len() > inline_limit
        {
            None
        } else {
            let eligible = team.as_ref().map(|t| t.members());
            let mut placement = scheduler.placement.place(
                self.ordinal,
                footprints,
                spec.hint,
                eligible,
                &runtime.allocator,
            );
            if let Some(members) = eligible {
                // A task of a team is run by the team, so the closing barrier can wait for it.
                if !members.contains(&placement.worker) {
                    placement.worker = members[id as usize % members.len()];
                }
            }
            Some(placement)
        };

        let handle = match scheduler.arena.create(Some(parent), id) {
            Ok(handle) => handle,
            Err(e) => fatal(e),
        };
        if let Some(team) = &team {
            team.task_created();
        }
        scheduler.task_created();
        self.shared.with_stat_mut(|s| s.created += 1);

        let mut task = Task {
            handle,
            body,
            team,
            name: spec.name,
            id,
            parent_id,
            arg_size,
            comm_cost: None,
            created_by: self.ordinal,
            inlined: false,
        };

        let Some(placement) = placement else {
            trace!("Worker {} runs {:?} inline", self.ordinal, task);
            task.inlined = true;
            self.shared.with_stat_mut(|s| s.inlined += 1);
            self.execute(task, None);
            return handle;
        };
        task.comm_cost = placement.comm_cost;

        let target = placement.worker;
        if to_central {
            trace!("Worker {} queues task {} centrally", self.ordinal, id);
            scheduler.central.push(task);
            scheduler.worker_monitor.notify_work_available(false);
        } else if target == self.ordinal {
            self.local.push(task);
            scheduler.worker_monitor.notify_work_available(false);
        } else {
            trace!("Worker {} places task {} on worker {}", self.ordinal, id, target);
            self.shared.with_stat_mut(|s| s.placed_remote += 1);
            scheduler.inboxes[target].push(task);
            let wake_all = scheduler.workers_shared[target].is_parked();
            scheduler.worker_monitor.notify_work_available(wake_all);
        }
        handle
    }

    /// Execute a task.  `stolen_from` is the hop distance to the victim if the task was stolen.
    pub(crate) fn execute(&self, task: Task, stolen_from: Option<usize>) {
        let scheduler = &self.runtime.scheduler;
        let Task {
            handle,
            body,
            team,
            name,
            id,
            parent_id,
            arg_size,
            comm_cost,
            created_by,
            inlined,
        } = task;
        scheduler.arena.set_state(handle, TaskState::Running);
        let thread_num = team
            .as_ref()
            .and_then(|t| self.member_index_in(t))
            .unwrap_or(0);
        self.tasks.borrow_mut().push(ActiveTask {
            handle,
            team: team.clone(),
            thread_num,
            member: None,
        });
        let started = Instant::now();
        {
            let _guard = AbortOnUnwind("task");
            body(self);
        }
        let exec_time = started.elapsed();
        self.tasks.borrow_mut().pop();
        if self.runtime.options.task_stats {
            self.shared.task_records.lock().push(TaskRecord {
                id,
                parent: parent_id,
                name,
                arg_size,
                created_by,
                executed_by: self.ordinal,
                inlined,
                stolen_hops: stolen_from,
                comm_cost,
                exec_time,
            });
        }
        // Counted before anybody waiting for the task can see it done.
        self.shared
            .with_stat_mut(|s| s.end_of_task(stolen_from, comm_cost));
        scheduler.arena.finish_body(handle);
        if let Some(team) = &team {
            team.task_finished();
        }
        scheduler.task_finished();
    }

    /// Find a task: own deque, then own inbox, then the central queue, then steal from other
    /// workers, nearest first.
    pub(crate) fn find_task(&self) -> Option<(Task, Option<usize>)> {
        if let Some(task) = self.local.pop() {
            return Some((task, None));
        }
        let scheduler = &self.runtime.scheduler;
        loop {
            match scheduler.inboxes[self.ordinal].steal_batch_and_pop(&self.local) {
                Steal::Success(task) => return Some((task, None)),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        // Members of a team only run tasks of their team until the team ends.
        if self.current_region_team().is_none() {
            loop {
                match scheduler.central.steal() {
                    Steal::Success(task) => return Some((task, None)),
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        self.steal()
    }

    fn steal(&self) -> Option<(Task, Option<usize>)> {
        let scheduler = &self.runtime.scheduler;
        let team = self.current_region_team();
        for (hops, class) in scheduler.victims(self.ordinal).iter().enumerate() {
            if class.is_empty() {
                continue;
            }
            let bias = self.steal_bias.get();
            self.steal_bias.set(bias.wrapping_add(1));
            let mut retry = true;
            while retry {
                retry = false;
                for i in 0..class.len() {
                    let victim = class[(bias + i) % class.len()];
                    if let Some(team) = &team {
                        if !team.members().contains(&victim) {
                            continue;
                        }
                    }
                    match scheduler.stealers[victim]
                        .steal()
                        .or_else(|| scheduler.inboxes[victim].steal())
                    {
                        Steal::Success(task) => {
                            trace!(
                                "Worker {} stole task {} from worker {} ({} hops)",
                                self.ordinal,
                                task.id,
                                victim,
                                hops
                            );
                            return Some((task, Some(hops)));
                        }
                        Steal::Retry => retry = true,
                        Steal::Empty => {}
                    }
                }
            }
        }
        None
    }

    /// Run one region assignment or one task, if there is any.
    pub(crate) fn help_once(&self) -> bool {
        if let Some(job) = self.shared.mailbox.pop() {
            self.run_region_member(job);
            return true;
        }
        if let Some((task, stolen_from)) = self.find_task() {
            self.execute(task, stolen_from);
            return true;
        }
        false
    }

    /// Wait for the direct children of the current task, running other tasks meanwhile.
    pub fn task_wait(&self) {
        let arena = &self.runtime.scheduler.arena;
        let current = self.current_task();
        if arena.children_outstanding(current) == 0 {
            return;
        }
        arena.set_state(current, TaskState::Suspended);
        let mut backoff = self.idle_backoff();
        while arena.children_outstanding(current) > 0 {
            if self.help_once() {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
        arena.set_state(current, TaskState::Running);
    }

    /// Help until every task created so far has finished.
    pub(crate) fn wait_for_quiescence(&self) {
        let scheduler = &self.runtime.scheduler;
        let mut backoff = self.idle_backoff();
        while scheduler.live_tasks() > 0 {
            if self.help_once() {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Run `f` in the `critical` section `name`, or the unnamed one.
    pub fn critical<R>(&self, name: Option<&str>, f: impl FnOnce() -> R) -> R {
        self.runtime.critical.run(name, f)
    }

    /// Allocate memory bound to a node according to the memory policy.
    pub fn allocate(&self, size: usize, node_hint: Option<NodeId>) -> Result<Address> {
        self.runtime
            .allocator
            .allocate(size, node_hint, self.shared.node)
    }

    pub fn release(&self, start: Address, size: usize) -> Result<()> {
        self.runtime.allocator.release(start, size)
    }

    /// The loop of a pool worker thread.
    pub(crate) fn run(&self) {
        let monitor = &self.runtime.scheduler.worker_monitor;
        let mut backoff = self.idle_backoff();
        let mut idle_rounds = 0;
        loop {
            let epoch = monitor.work_epoch();
            if self.help_once() {
                backoff.reset();
                idle_rounds = 0;
                continue;
            }
            if monitor.exit_requested() {
                break;
            }
            if backoff.is_at_roof() && idle_rounds >= IDLE_ROUNDS_BEFORE_PARK {
                self.shared.parked.store(true, Ordering::SeqCst);
                let result = monitor.park_and_wait(self.ordinal, epoch);
                self.shared.parked.store(false, Ordering::SeqCst);
                if result.is_err() {
                    break;
                }
                backoff.reset();
                idle_rounds = 0;
            } else {
                backoff.snooze();
                idle_rounds += 1;
            }
        }
        debug!("Worker {} exits", self.ordinal);
    }

    /// Finish the root task at shutdown.  Every task must be done.
    pub(crate) fn retire(&self) {
        let arena = &self.runtime.scheduler.arena;
        let root = self.current_task();
        debug_assert_eq!(self.tasks.borrow().len(), 1);
        arena.finish_body(root);
    }
}
