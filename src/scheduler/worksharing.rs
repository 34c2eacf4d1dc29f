//! Worksharing loops: the iterations of a loop are divided among the members of a team.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use super::worker::{ActiveTask, Worker};
use crate::util::options::{SchedulePolicy, ScheduleSpec};

/// How the iterations of a loop are handed out.  The chunk of `None` means the policy's default.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// Without a chunk, one contiguous block per member.  With a chunk, chunks are dealt to the
    /// members in turn.
    Static(Option<usize>),
    /// Members grab the next `chunk` iterations (1 by default) from a shared cursor.
    Dynamic(Option<usize>),
    /// Members grab a share of the remaining iterations proportional to the team size, and at
    /// least `chunk` (1 by default).
    Guided(Option<usize>),
    /// The schedule resolved from the configuration when the region was entered.
    Runtime,
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Static(None)
    }
}

impl Schedule {
    /// Replace `Runtime` by the schedule it stands for.
    pub fn resolve(self, runtime: ScheduleSpec) -> Schedule {
        match self {
            Schedule::Runtime => runtime.into(),
            other => other,
        }
    }
}

impl From<ScheduleSpec> for Schedule {
    fn from(spec: ScheduleSpec) -> Self {
        match spec.policy {
            SchedulePolicy::Static => Schedule::Static(spec.chunk),
            SchedulePolicy::Dynamic => Schedule::Dynamic(spec.chunk),
            SchedulePolicy::Guided => Schedule::Guided(spec.chunk),
        }
    }
}

/// The shared state of one worksharing loop of a team.
pub struct LoopShare {
    start: usize,
    len: usize,
    schedule: Schedule,
    team_size: usize,
    /// Offset of the next iteration to hand out (dynamic and guided).
    cursor: CachePadded<AtomicUsize>,
    /// Chunks each member has taken so far (static).
    rounds: Box<[CachePadded<AtomicUsize>]>,
    finished: AtomicUsize,
}

impl LoopShare {
    /// `schedule` must be resolved already.
    pub fn new(range: Range<usize>, schedule: Schedule, team_size: usize) -> Self {
        debug_assert!(schedule != Schedule::Runtime);
        debug_assert!(team_size > 0);
        LoopShare {
            start: range.start,
            len: range.end.saturating_sub(range.start),
            schedule,
            team_size,
            cursor: CachePadded::new(AtomicUsize::new(0)),
            rounds: (0..team_size)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    fn offsets(&self, lo: usize, hi: usize) -> Range<usize> {
        self.start + lo..self.start + hi.min(self.len)
    }

    /// The next chunk of iterations for member `member`, or `None` once it has no more.
    pub fn next_chunk(&self, member: usize) -> Option<Range<usize>> {
        let size = self.team_size;
        match self.schedule {
            Schedule::Static(None) => {
                if self.rounds[member].fetch_add(1, Ordering::Relaxed) > 0 {
                    return None;
                }
                let q = self.len / size;
                let r = self.len % size;
                let lo = member * q + member.min(r);
                let hi = lo + q + usize::from(member < r);
                (lo < hi).then(|| self.offsets(lo, hi))
            }
            Schedule::Static(Some(chunk)) => {
                let chunk = chunk.max(1);
                let round = self.rounds[member].fetch_add(1, Ordering::Relaxed);
                let lo = (round * size + member).checked_mul(chunk)?;
                (lo < self.len).then(|| self.offsets(lo, lo.saturating_add(chunk)))
            }
            Schedule::Dynamic(chunk) => {
                let chunk = chunk.unwrap_or(1).max(1);
                if self.cursor.load(Ordering::Relaxed) >= self.len {
                    return None;
                }
                let lo = self.cursor.fetch_add(chunk, Ordering::Relaxed);
                (lo < self.len).then(|| self.offsets(lo, lo.saturating_add(chunk)))
            }
            Schedule::Guided(chunk) => {
                let chunk = chunk.unwrap_or(1).max(1);
                let mut lo = self.cursor.load(Ordering::Relaxed);
                loop {
                    if lo >= self.len {
                        return None;
                    }
                    let remaining = self.len - lo;
                    let take = remaining.div_ceil(size).max(chunk).min(remaining);
                    match self.cursor.compare_exchange_weak(
                        lo,
                        lo + take,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return Some(self.offsets(lo, lo + take)),
                        Err(current) => lo = current,
                    }
                }
            }
            Schedule::Runtime => unreachable!("the schedule of a loop is resolved on creation"),
        }
    }

    /// All chunks of `member`, one after the other.
    pub fn chunks(&self, member: usize) -> impl Iterator<Item = Range<usize>> + '_ {
        std::iter::from_fn(move || self.next_chunk(member))
    }

    /// A member is done with the loop.  Returns true for the last one.
    pub fn finish(&self) -> bool {
        self.finished.fetch_add(1, Ordering::AcqRel) + 1 == self.team_size
    }
}

impl Worker {
    /// Run `body` for every index of `range`, dividing the indices among the members of the
    /// current team, and wait for the others.  Every member must call this with the same range
    /// and schedule.
    pub fn for_loop(&self, range: Range<usize>, schedule: Schedule, body: impl Fn(usize)) {
        self.run_loop(range, schedule, body, false)
    }

    /// Like [`Worker::for_loop`], without waiting for the others at the end.
    pub fn for_loop_nowait(&self, range: Range<usize>, schedule: Schedule, body: impl Fn(usize)) {
        self.run_loop(range, schedule, body, true)
    }

    fn run_loop(&self, range: Range<usize>, schedule: Schedule, body: impl Fn(usize), nowait: bool) {
        let construct = {
            let tasks = self.tasks.borrow();
            match tasks.last() {
                Some(ActiveTask {
                    team: Some(team),
                    member: Some(member),
                    thread_num,
                    ..
                }) => {
                    let seq = member.loops_seen.get() + 1;
                    member.loops_seen.set(seq);
                    Some((team.clone(), *thread_num, seq))
                }
                _ => None,
            }
        };
        let Some((team, thread_num, seq)) = construct else {
            range.for_each(body);
            return;
        };

        let share = team.loop_share(seq, || {
            LoopShare::new(range, schedule.resolve(team.config().schedule), team.size())
        });
        for chunk in share.chunks(thread_num) {
            chunk.for_each(&body);
        }
        if share.finish() {
            team.remove_loop(seq);
        }
        if !nowait {
            self.team_barrier(&team);
        }
    }
}
