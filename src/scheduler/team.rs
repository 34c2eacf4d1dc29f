//! Teams and parallel regions.
//!
//! The worker that encounters a parallel region claims free workers, posts each of them a
//! [`RegionJob`] and then runs the region body itself as member 0.  Every member runs the body as
//! its implicit task and meets the others at the closing barrier, which is released once the
//! explicit tasks of the team are done too.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

use super::task::TaskState;
use super::worker::{AbortOnUnwind, ActiveTask, MemberState, Worker, WorkerStatus};
use super::worksharing::LoopShare;
use crate::sync::{SingleGate, TeamBarrier};
use crate::util::error::{fatal, Result, RuntimeError};
use crate::util::options::RegionConfig;

/// The workers executing one instance of a parallel region.
pub struct Team {
    id: u64,
    /// 1 for an outermost region.
    level: usize,
    /// Ordinals of the members.  Member 0 encountered the region.
    members: Vec<usize>,
    pub(crate) barrier: TeamBarrier,
    /// Explicit tasks created in the team and not finished yet.
    pending_tasks: CachePadded<AtomicUsize>,
    pub(crate) single: SingleGate,
    /// Worksharing loops in progress, by construct number.
    loops: spin::Mutex<HashMap<u64, Arc<LoopShare>>>,
    config: RegionConfig,
    parent: Option<Arc<Team>>,
}

impl Team {
    pub(crate) fn new(
        id: u64,
        members: Vec<usize>,
        config: RegionConfig,
        parent: Option<Arc<Team>>,
    ) -> Self {
        let level = parent.as_ref().map_or(1, |p| p.level + 1);
        Team {
            id,
            level,
            barrier: TeamBarrier::new(members.len()),
            members,
            pending_tasks: CachePadded::new(AtomicUsize::new(0)),
            single: SingleGate::new(),
            loops: spin::Mutex::new(HashMap::new()),
            config,
            parent,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    /// The settings resolved when the region was entered.
    pub fn config(&self) -> RegionConfig {
        self.config
    }

    /// The team of the enclosing region, if this one is nested.
    pub fn parent(&self) -> Option<&Arc<Team>> {
        self.parent.as_ref()
    }

    pub(crate) fn task_created(&self) {
        self.pending_tasks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn task_finished(&self) {
        let old = self.pending_tasks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0);
    }

    pub fn pending_tasks(&self) -> usize {
        self.pending_tasks.load(Ordering::Acquire)
    }

    /// The shared state of worksharing loop number `seq`, installed by whichever member gets
    /// there first.
    pub(crate) fn loop_share(&self, seq: u64, create: impl FnOnce() -> LoopShare) -> Arc<LoopShare> {
        self.loops
            .lock()
            .entry(seq)
            .or_insert_with(|| Arc::new(create()))
            .clone()
    }

    pub(crate) fn remove_loop(&self, seq: u64) {
        self.loops.lock().remove(&seq);
    }

    pub(crate) fn loops_in_progress(&self) -> usize {
        self.loops.lock().len()
    }
}

/// The body of a region, with its lifetime erased.  The encountering worker does not return from
/// [`Worker::parallel`] before every member has passed the closing barrier.
#[derive(Copy, Clone)]
pub(crate) struct RegionBody(&'static (dyn Fn(&Worker) + Sync));

/// The assignment of one member to a region.
pub(crate) struct RegionJob {
    pub team: Arc<Team>,
    pub thread_num: usize,
    body: RegionBody,
}

impl Worker {
    /// Run `body` on a team of workers.  `num_threads` of `None` or `Some(0)` asks for the default
    /// team size.  Returns once every member has finished and every task of the team is done.
    ///
    /// Asking for a team larger than the pool is a fatal error.
    pub fn parallel<F>(&self, num_threads: Option<usize>, body: F)
    where
        F: Fn(&Worker) + Sync,
    {
        if let Err(e) = self.try_parallel(num_threads, &body) {
            fatal(e)
        }
    }

    pub fn try_parallel(
        &self,
        num_threads: Option<usize>,
        body: &(dyn Fn(&Worker) + Sync),
    ) -> Result<()> {
        let runtime = &self.runtime;
        let scheduler = &runtime.scheduler;
        let pool = scheduler.num_workers();
        let config = runtime.options.region_config(runtime.provider.as_ref());
        let requested = num_threads
            .filter(|n| *n > 0)
            .or((config.num_threads > 0).then_some(config.num_threads));
        if let Some(requested) = requested {
            if requested > pool {
                return Err(RuntimeError::TeamTooLarge { requested, pool });
            }
        }

        // A region entered from an explicit task nests in the team of that task, whoever runs it.
        let outer = self.current_team();
        // Only the thread that created the runtime waits for workers, and only from its root task.
        // Anybody else may hold workers the waiter needs, and a task the master took from a team
        // keeps that team at its closing barrier.
        let wait = self.ordinal == 0 && self.tasks.borrow().len() == 1;
        let members = self.claim_members(requested.unwrap_or(pool), wait);
        let id = runtime.next_team_id();
        let team = Arc::new(Team::new(id, members, config, outer));
        debug!(
            "Worker {} enters region {} (level {}) with members {:?}, schedule {}",
            self.ordinal,
            id,
            team.level(),
            team.members(),
            config.schedule
        );

        // SAFETY: Every member is done with the body once the closing barrier is released, and
        // `run_region_member` below does not return before that.  A panicking body aborts.
        let body: &'static (dyn Fn(&Worker) + Sync) = unsafe { std::mem::transmute(body) };
        for (thread_num, &ordinal) in team.members().iter().enumerate().skip(1) {
            scheduler.workers_shared[ordinal].post(RegionJob {
                team: team.clone(),
                thread_num,
                body: RegionBody(body),
            });
        }
        if team.size() > 1 {
            scheduler.worker_monitor.notify_work_available(true);
        }
        self.run_region_member(RegionJob {
            team,
            thread_num: 0,
            body: RegionBody(body),
        });
        Ok(())
    }

    /// Claim up to `want` members, this worker first and then free workers nearest first.  When
    /// `wait` is set, back off until `want` workers have been claimed.
    fn claim_members(&self, want: usize, wait: bool) -> Vec<usize> {
        let scheduler = &self.runtime.scheduler;
        let mut members = Vec::with_capacity(want);
        members.push(self.ordinal);
        let mut backoff = self.idle_backoff();
        loop {
            for &ordinal in scheduler.claim_order(self.ordinal) {
                if members.len() >= want {
                    break;
                }
                if !members.contains(&ordinal) && scheduler.workers_shared[ordinal].try_claim() {
                    members.push(ordinal);
                }
            }
            if members.len() >= want || !wait {
                break;
            }
            // Tasks are not run here: one of them may enter a region and wait for the workers
            // this one has claimed already.
            backoff.snooze();
        }
        members
    }

    /// Run a region as one of its members.
    pub(crate) fn run_region_member(&self, job: RegionJob) {
        let RegionJob {
            team,
            thread_num,
            body,
        } = job;
        let scheduler = &self.runtime.scheduler;
        let prior = if thread_num == 0 {
            self.shared.switch_status(WorkerStatus::InTeam)
        } else {
            self.shared.take_claim();
            WorkerStatus::Free
        };

        // The implicit task of this member.
        let handle = match scheduler.arena.create(None, scheduler.next_task_id()) {
            Ok(handle) => handle,
            Err(e) => fatal(e),
        };
        scheduler.arena.set_state(handle, TaskState::Running);
        self.tasks.borrow_mut().push(ActiveTask {
            handle,
            team: Some(team.clone()),
            thread_num,
            member: Some(MemberState::default()),
        });
        trace!(
            "Worker {} runs region {} as member {}",
            self.ordinal,
            team.id(),
            thread_num
        );
        {
            let _guard = AbortOnUnwind("parallel region");
            (body.0)(self);
        }
        scheduler.arena.finish_body(handle);
        self.team_barrier(&team);
        self.tasks.borrow_mut().pop();

        debug_assert_eq!(team.pending_tasks(), 0);
        debug_assert_eq!(team.loops_in_progress(), 0);
        // A worker claimed while it entered its own region is left claimed, and runs the posted
        // job from its mailbox.
        self.shared.switch_status(match prior {
            WorkerStatus::Claimed => WorkerStatus::Free,
            other => other,
        });
    }

    /// Wait at the barrier of `team` until all members have arrived and all tasks of the team are
    /// done.  Runs tasks of the team while waiting.
    pub(crate) fn team_barrier(&self, team: &Team) {
        let prior = self.shared.switch_status(WorkerStatus::AtBarrier);
        let mut backoff = self.idle_backoff();
        team.barrier.arrive_and_wait(
            || team.pending_tasks() == 0,
            || {
                if self.help_once() {
                    backoff.reset();
                } else {
                    backoff.snooze();
                }
            },
        );
        self.shared.switch_status(match prior {
            WorkerStatus::Claimed => WorkerStatus::InTeam,
            other => other,
        });
    }

    /// Wait for the other members of the current team.  Does nothing outside a team.
    pub fn barrier(&self) {
        let team = {
            let tasks = self.tasks.borrow();
            match tasks.last() {
                Some(ActiveTask {
                    team: Some(team),
                    member: Some(_),
                    ..
                }) => team.clone(),
                _ => return,
            }
        };
        self.team_barrier(&team);
    }

    /// Run `f` on the first member of the team that gets here, and wait for the others.  Returns
    /// `None` on the members that skipped `f`.
    pub fn single<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let result = self.single_nowait(f);
        self.barrier();
        result
    }

    /// Like [`Worker::single`], without waiting for the others.
    pub fn single_nowait<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let winner = {
            let tasks = self.tasks.borrow();
            match tasks.last() {
                Some(ActiveTask {
                    team: Some(team),
                    member: Some(member),
                    ..
                }) => {
                    let seen = member.singles_seen.get() + 1;
                    member.singles_seen.set(seen);
                    team.single.try_enter(seen)
                }
                _ => true,
            }
        };
        winner.then(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::options::ScheduleSpec;

    fn config() -> RegionConfig {
        RegionConfig {
            schedule: ScheduleSpec::default(),
            num_threads: 0,
        }
    }

    #[test]
    fn nesting_levels() {
        let outer = Arc::new(Team::new(1, vec![0, 1], config(), None));
        let inner = Team::new(2, vec![1, 2, 3], config(), Some(outer.clone()));
        assert_eq!(outer.level(), 1);
        assert_eq!(inner.level(), 2);
        assert_eq!(inner.size(), 3);
        assert_eq!(inner.parent().map(|p| p.id()), Some(1));
    }

    #[test]
    fn pending_task_count() {
        let team = Team::new(1, vec![0], config(), None);
        team.task_created();
        team.task_created();
        team.task_finished();
        assert_eq!(team.pending_tasks(), 1);
    }
}
