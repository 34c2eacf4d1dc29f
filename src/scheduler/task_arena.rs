//! Bookkeeping of live tasks.
//!
//! The closure of a task travels with the task through deques.  What other workers need to see
//! (state, the number of outstanding children and the parent link) lives here, in slots addressed
//! by a [`TaskHandle`].

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use atomic::Atomic;
use crossbeam::queue::SegQueue;

use super::task::TaskState;
use crate::util::constants::{LOG_TASK_ARENA_CHUNK, TASK_ARENA_CHUNK};
use crate::util::error::{Result, RuntimeError};

/// Refers to a slot of the [`TaskArena`].  A slot is reused after its task completes, and each
/// reuse bumps the slot's generation, so a handle outliving its task is detectable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    index: u32,
    generation: u32,
}

static_assertions::assert_eq_size!(TaskHandle, u64);

impl TaskHandle {
    const NONE: u64 = u64::MAX;

    fn pack(handle: Option<TaskHandle>) -> u64 {
        match handle {
            Some(h) => ((h.generation as u64) << 32) | h.index as u64,
            None => Self::NONE,
        }
    }

    fn unpack(raw: u64) -> Option<TaskHandle> {
        (raw != Self::NONE).then_some(TaskHandle {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        })
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }
}

struct TaskRecord {
    generation: AtomicU32,
    state: Atomic<TaskState>,
    /// One for the body while it has not finished, plus one for each child not yet done.
    pending: AtomicUsize,
    parent: AtomicU64,
    id: AtomicU64,
}

impl TaskRecord {
    fn new() -> Self {
        TaskRecord {
            generation: AtomicU32::new(0),
            state: Atomic::new(TaskState::Done),
            pending: AtomicUsize::new(0),
            parent: AtomicU64::new(TaskHandle::NONE),
            id: AtomicU64::new(0),
        }
    }
}

type Chunk = Box<[TaskRecord]>;

/// A lock-free table of task records.  Chunks of [`TASK_ARENA_CHUNK`] slots are created lazily,
/// and freed slots are recycled through a queue.
pub(crate) struct TaskArena {
    chunks: Box<[OnceLock<Chunk>]>,
    free: SegQueue<u32>,
    /// Slots below this index have been handed out at least once.
    next_fresh: AtomicUsize,
    live: AtomicUsize,
    capacity: usize,
}

impl TaskArena {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        let num_chunks = capacity.div_ceil(TASK_ARENA_CHUNK);
        TaskArena {
            chunks: (0..num_chunks).map(|_| OnceLock::new()).collect(),
            free: SegQueue::new(),
            next_fresh: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tasks created and not yet done.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn slot(&self, index: u32) -> &TaskRecord {
        let index = index as usize;
        let chunk = self.chunks[index >> LOG_TASK_ARENA_CHUNK].get_or_init(|| {
            (0..TASK_ARENA_CHUNK)
                .map(|_| TaskRecord::new())
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });
        &chunk[index & (TASK_ARENA_CHUNK - 1)]
    }

    fn record(&self, handle: TaskHandle) -> &TaskRecord {
        let record = self.slot(handle.index);
        debug_assert_eq!(
            record.generation.load(Ordering::Acquire),
            handle.generation,
            "stale task handle {:?}",
            handle
        );
        record
    }

    fn take_slot(&self) -> Result<u32> {
        if let Some(index) = self.free.pop() {
            return Ok(index);
        }
        let index = self.next_fresh.fetch_add(1, Ordering::Relaxed);
        if index >= self.capacity {
            self.next_fresh.fetch_sub(1, Ordering::Relaxed);
            // A slot may have been freed while we were racing for a fresh one.
            return self.free.pop().ok_or(RuntimeError::TaskArenaExhausted {
                capacity: self.capacity,
            });
        }
        Ok(index as u32)
    }

    /// Create the record of a new task in the `Ready` state.  The parent, if any, must be running,
    /// and gains one outstanding child.
    pub fn create(&self, parent: Option<TaskHandle>, id: u64) -> Result<TaskHandle> {
        let index = self.take_slot()?;
        let record = self.slot(index);
        let handle = TaskHandle {
            index,
            generation: record.generation.load(Ordering::Acquire),
        };
        record.pending.store(1, Ordering::Relaxed);
        record.state.store(TaskState::Ready, Ordering::Relaxed);
        record.parent.store(TaskHandle::pack(parent), Ordering::Relaxed);
        record.id.store(id, Ordering::Relaxed);
        if let Some(parent) = parent {
            self.record(parent).pending.fetch_add(1, Ordering::AcqRel);
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(handle)
    }

    /// Is `handle` still referring to a task that has not completed?
    pub fn is_live(&self, handle: TaskHandle) -> bool {
        self.state(handle) != TaskState::Done
    }

    pub fn state(&self, handle: TaskHandle) -> TaskState {
        let record = self.slot(handle.index);
        let state = record.state.load(Ordering::Acquire);
        if record.generation.load(Ordering::Acquire) != handle.generation {
            return TaskState::Done;
        }
        state
    }

    pub fn id(&self, handle: TaskHandle) -> u64 {
        self.record(handle).id.load(Ordering::Relaxed)
    }

    pub fn parent(&self, handle: TaskHandle) -> Option<TaskHandle> {
        TaskHandle::unpack(self.record(handle).parent.load(Ordering::Relaxed))
    }

    /// Only meaningful for a task whose body holds its own reference, i.e. a running or
    /// suspended task.
    pub fn set_state(&self, handle: TaskHandle, state: TaskState) {
        self.record(handle).state.store(state, Ordering::Release);
    }

    /// Direct children of a running task that are not done yet.
    pub fn children_outstanding(&self, handle: TaskHandle) -> usize {
        self.record(handle).pending.load(Ordering::Acquire) - 1
    }

    /// The body of `handle` returned.  Drop the body's own reference and complete every task
    /// whose last reference that was, walking up the parent chain.
    ///
    /// Returns the number of tasks completed.
    pub fn finish_body(&self, handle: TaskHandle) -> usize {
        let record = self.record(handle);
        // Suspended until the children are done.  Must be set before the reference is dropped:
        // the last child may complete the task right after.
        record.state.store(TaskState::Suspended, Ordering::Release);
        let mut completed = 0;
        let mut current = Some(handle);
        while let Some(h) = current {
            let record = self.record(h);
            if record.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
                break;
            }
            current = self.complete(h);
            completed += 1;
        }
        completed
    }

    /// Mark a task done and recycle its slot.  Returns its parent.
    fn complete(&self, handle: TaskHandle) -> Option<TaskHandle> {
        let record = self.record(handle);
        let parent = TaskHandle::unpack(record.parent.swap(TaskHandle::NONE, Ordering::AcqRel));
        record.state.store(TaskState::Done, Ordering::Release);
        record.generation.fetch_add(1, Ordering::AcqRel);
        self.free.push(handle.index);
        self.live.fetch_sub(1, Ordering::AcqRel);
        parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_packing() {
        let h = TaskHandle {
            index: 7,
            generation: 3,
        };
        assert_eq!(TaskHandle::unpack(TaskHandle::pack(Some(h))), Some(h));
        assert_eq!(TaskHandle::unpack(TaskHandle::pack(None)), None);
    }

    #[test]
    fn complete_without_children() {
        let arena = TaskArena::new(16);
        let t = arena.create(None, 1).unwrap();
        assert_eq!(arena.state(t), TaskState::Ready);
        assert_eq!(arena.children_outstanding(t), 0);
        assert_eq!(arena.finish_body(t), 1);
        assert_eq!(arena.state(t), TaskState::Done);
        assert!(!arena.is_live(t));
        assert_eq!(arena.live(), 0);
    }

    #[test]
    fn parent_waits_for_children() {
        let arena = TaskArena::new(16);
        let parent = arena.create(None, 1).unwrap();
        arena.set_state(parent, TaskState::Running);
        let a = arena.create(Some(parent), 2).unwrap();
        let b = arena.create(Some(parent), 3).unwrap();
        assert_eq!(arena.children_outstanding(parent), 2);
        assert_eq!(arena.parent(a), Some(parent));

        // The parent body returns first.  It stays suspended on its children.
        assert_eq!(arena.finish_body(parent), 0);
        assert_eq!(arena.state(parent), TaskState::Suspended);

        assert_eq!(arena.finish_body(a), 1);
        assert!(arena.is_live(parent));
        // The last child completes the parent too.
        assert_eq!(arena.finish_body(b), 2);
        assert!(!arena.is_live(parent));
        assert_eq!(arena.live(), 0);
    }

    #[test]
    fn slots_are_reused_with_new_generation() {
        let arena = TaskArena::new(1);
        let first = arena.create(None, 1).unwrap();
        arena.finish_body(first);
        let second = arena.create(None, 2).unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert_eq!(arena.state(first), TaskState::Done);
        assert_eq!(arena.state(second), TaskState::Ready);
        assert_eq!(arena.id(second), 2);
    }

    #[test]
    fn exhausted() {
        let arena = TaskArena::new(2);
        let _a = arena.create(None, 1).unwrap();
        let _b = arena.create(None, 2).unwrap();
        assert!(matches!(
            arena.create(None, 3),
            Err(RuntimeError::TaskArenaExhausted { capacity: 2 })
        ));
    }

    #[test]
    fn concurrent_children() {
        let arena = TaskArena::new(TASK_ARENA_CHUNK * 2);
        let parent = arena.create(None, 0).unwrap();
        let children: Vec<TaskHandle> = (0..1000)
            .map(|i| arena.create(Some(parent), i + 1).unwrap())
            .collect();
        std::thread::scope(|scope| {
            for part in children.chunks(250) {
                let arena = &arena;
                scope.spawn(move || {
                    for child in part {
                        arena.finish_body(*child);
                    }
                });
            }
        });
        assert_eq!(arena.children_outstanding(parent), 0);
        arena.finish_body(parent);
        assert_eq!(arena.live(), 0);
    }
}
