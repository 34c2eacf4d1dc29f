use std::sync::Arc;

use bytemuck::NoUninit;

use super::footprint::Footprint;
use super::placement::PlacementHint;
use super::task_arena::TaskHandle;
use super::team::Team;
use super::worker::Worker;

/// The scheduling state of a task.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit)]
pub enum TaskState {
    /// Queued and not started.
    Ready,
    /// The body is executing.
    Running,
    /// The body is waiting for its children, or has returned while children are outstanding.
    Suspended,
    /// The body and all children have completed.
    Done,
}

pub(crate) type TaskBody = Box<dyn FnOnce(&Worker) + Send + 'static>;

/// A queued task.  Bookkeeping other workers look at is in the task arena under `handle`.
pub(crate) struct Task {
    pub handle: TaskHandle,
    pub body: TaskBody,
    /// The team of the creator.  Tasks of a team are finished before the team's closing barrier.
    pub team: Option<Arc<Team>>,
    pub name: Option<String>,
    pub id: u64,
    /// Id of the creating task.
    pub parent_id: u64,
    /// Size of the captured environment.
    pub arg_size: usize,
    /// Cost computed by placement when footprints decided where the task goes.
    pub comm_cost: Option<u64>,
    /// Ordinal of the creating worker.
    pub created_by: usize,
    /// Executed by its creator without being queued.
    pub inlined: bool,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("arg_size", &self.arg_size)
            .field("created_by", &self.created_by)
            .finish()
    }
}

/// What the creator says about a task besides its body.
#[derive(Clone, Debug, Default)]
pub(crate) struct TaskSpec {
    pub footprints: Vec<Footprint>,
    pub hint: Option<PlacementHint>,
    pub name: Option<String>,
}

/// Creates a task with footprints, a placement hint or a name.
///
/// ```ignore
/// worker
///     .task()
///     .footprint(Footprint::of_slice(&rows, AccessMode::Write))
///     .spawn(move |w| compute(w));
/// ```
#[must_use = "a task is only created by `spawn`"]
pub struct TaskBuilder<'w> {
    worker: &'w Worker,
    spec: TaskSpec,
}

impl<'w> TaskBuilder<'w> {
    pub(crate) fn new(worker: &'w Worker) -> Self {
        TaskBuilder {
            worker,
            spec: TaskSpec::default(),
        }
    }

    pub fn footprint(mut self, footprint: Footprint) -> Self {
        self.spec.footprints.push(footprint);
        self
    }

    pub fn footprints(mut self, footprints: impl IntoIterator<Item = Footprint>) -> Self {
        self.spec.footprints.extend(footprints);
        self
    }

    pub fn hint(mut self, hint: PlacementHint) -> Self {
        self.spec.hint = Some(hint);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.spec.name = Some(name.into());
        self
    }

    /// Queue the task as a child of the task currently running on the worker.  The handle can be
    /// used to ask the worker whether the task is done.
    pub fn spawn<F>(self, body: F) -> TaskHandle
    where
        F: FnOnce(&Worker) + Send + 'static,
    {
        let arg_size = std::mem::size_of::<F>();
        self.worker.create_task(self.spec, Box::new(body), arg_size)
    }
}
