//! The runtime: a pool of workers and everything they share.
//!
//! A runtime is created with a [`RuntimeBuilder`].  The thread that builds it becomes worker 0,
//! the master, and takes part in parallel regions it starts.  The other workers are threads
//! owned by the runtime.  Dropping the runtime waits for all tasks and joins the threads.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::build_info::MIRT_FULL_BUILD_INFO;
use crate::scheduler::affinity::get_total_num_cpus;
use crate::scheduler::{
    write_task_csv, Footprint, PlacementHint, Schedule, SchedulerStat, TaskBuilder, TaskHandle,
    TaskScheduler, Worker,
};
use crate::sync::CriticalSections;
use crate::util::error::{Result, RuntimeError};
use crate::util::memory::NumaAllocator;
use crate::util::options::{ConfigProvider, EnvConfigProvider, Options, TopologySelector};
use crate::util::topology::{NodeId, Topology};
use crate::util::Address;

/// State shared by all workers of a runtime.
pub struct RuntimeShared {
    pub options: Options,
    /// Consulted again at every region entry.
    pub provider: Arc<dyn ConfigProvider>,
    pub topology: Arc<Topology>,
    pub allocator: NumaAllocator,
    pub scheduler: TaskScheduler,
    pub critical: CriticalSections,
    next_team_id: AtomicU64,
}

impl RuntimeShared {
    pub(crate) fn next_team_id(&self) -> u64 {
        self.next_team_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Configures and creates a [`Runtime`].
pub struct RuntimeBuilder {
    options: Options,
    provider: Arc<dyn ConfigProvider>,
    topology: Option<Topology>,
}

impl RuntimeBuilder {
    /// A builder reading options from `MIRT_*` environment variables.
    pub fn new() -> Self {
        Self::with_provider(Arc::new(EnvConfigProvider::default()))
    }

    /// A builder reading options from `provider`, at build time and at every region entry.
    pub fn with_provider(provider: Arc<dyn ConfigProvider>) -> Self {
        let options = Options::from_provider(provider.as_ref());
        RuntimeBuilder {
            options,
            provider,
            topology: None,
        }
    }

    /// Set an option by name.  Returns `false` if the value is invalid.  Panics on unknown names.
    pub fn set_option(&mut self, name: &str, value: &str) -> bool {
        self.options.set_from_str(name, value)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    /// Schedule for `topology` instead of the one selected by the `topology` option.
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = Some(topology);
        self
    }

    fn resolve_topology(&mut self) -> Topology {
        if let Some(topology) = self.topology.take() {
            return topology;
        }
        match self.options.topology {
            TopologySelector::Auto => Topology::probe(),
            TopologySelector::Uniform {
                nodes,
                cores_per_node,
            } => Topology::uniform(nodes, cores_per_node),
        }
    }

    /// Create the runtime and start its workers.  The calling thread becomes worker 0.
    pub fn build(mut self) -> Result<Runtime> {
        let topology = Arc::new(self.resolve_topology());
        let options = self.options.clone();
        info!("{}", MIRT_FULL_BUILD_INFO.as_str());
        info!(
            "Starting {} workers on topology {} ({} nodes, {} cores, diameter {})",
            options.workers,
            topology.name(),
            topology.num_nodes(),
            topology.num_cores(),
            topology.diameter()
        );
        if options.workers > get_total_num_cpus() {
            warn!(
                "{} workers requested, but only {} CPUs are available to the process",
                options.workers,
                get_total_num_cpus()
            );
        }

        let (scheduler, locals) = TaskScheduler::new(&options, topology.clone());
        debug!("The task arena holds {} live tasks", scheduler.arena.capacity());
        let allocator = NumaAllocator::new(topology.clone(), options.memory_policy);
        let shared = Arc::new(RuntimeShared {
            options,
            provider: self.provider,
            topology,
            allocator,
            scheduler,
            critical: CriticalSections::new(),
            next_team_id: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(locals.len());
        for (ordinal, local) in locals.into_iter().enumerate() {
            workers.push(Worker::new(ordinal, shared.clone(), local)?);
        }
        let mut workers = workers.into_iter();
        // Safe to unwrap: the pool has at least one worker.
        let master = Box::new(workers.next().unwrap());

        let mut threads = Vec::with_capacity(workers.len());
        for worker in workers {
            match spawn_worker_thread(worker, &shared) {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    // Let the threads already started go.
                    shared.scheduler.worker_monitor.request_exit();
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(RuntimeError::WorkerSpawn(e));
                }
            }
        }
        master.enter();

        Ok(Runtime {
            shared,
            master,
            threads,
            _not_send: PhantomData,
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_worker_thread(
    worker: Worker,
    shared: &Arc<RuntimeShared>,
) -> std::io::Result<JoinHandle<()>> {
    let ordinal = worker.ordinal;
    let mut builder = std::thread::Builder::new().name(format!("mirt-worker-{}", ordinal));
    if shared.options.stack_size > 0 {
        builder = builder.stack_size(shared.options.stack_size);
    }
    let affinity = shared.options.thread_affinity.clone();
    builder.spawn(move || {
        affinity.resolve_affinity(ordinal, worker.shared.cpu);
        worker.enter();
        worker.run();
        worker.retire();
        worker.leave();
    })
}

/// A running pool of workers.  It can only be used from the thread that built it.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    master: Box<Worker>,
    threads: Vec<JoinHandle<()>>,
    _not_send: PhantomData<*const ()>,
}

impl Runtime {
    /// The worker of the thread that created the runtime.
    pub fn master(&self) -> &Worker {
        &self.master
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    pub fn topology(&self) -> &Topology {
        &self.shared.topology
    }

    pub fn allocator(&self) -> &NumaAllocator {
        &self.shared.allocator
    }

    /// Number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.shared.scheduler.num_workers()
    }

    /// Queue a task.
    pub fn spawn<F>(&self, body: F) -> TaskHandle
    where
        F: FnOnce(&Worker) + Send + 'static,
    {
        self.master.spawn(body)
    }

    /// Start building a task with footprints or a placement hint.
    pub fn task(&self) -> TaskBuilder<'_> {
        self.master.task()
    }

    /// Queue a task with footprints and a placement hint.
    pub fn create_task<F>(
        &self,
        footprints: Vec<Footprint>,
        hint: Option<PlacementHint>,
        body: F,
    ) -> TaskHandle
    where
        F: FnOnce(&Worker) + Send + 'static,
    {
        let mut builder = self.master.task().footprints(footprints);
        if let Some(hint) = hint {
            builder = builder.hint(hint);
        }
        builder.spawn(body)
    }

    /// Wait for the tasks created from the master outside any region.
    pub fn task_wait(&self) {
        self.master.task_wait()
    }

    pub fn parallel<F>(&self, num_threads: Option<usize>, body: F)
    where
        F: Fn(&Worker) + Sync,
    {
        self.master.parallel(num_threads, body)
    }

    pub fn try_parallel(
        &self,
        num_threads: Option<usize>,
        body: &(dyn Fn(&Worker) + Sync),
    ) -> Result<()> {
        self.master.try_parallel(num_threads, body)
    }

    /// A worksharing loop outside any region runs on the master alone.
    pub fn for_loop(&self, range: Range<usize>, schedule: Schedule, body: impl Fn(usize)) {
        self.master.for_loop(range, schedule, body)
    }

    pub fn barrier(&self) {
        self.master.barrier()
    }

    pub fn critical<R>(&self, name: Option<&str>, f: impl FnOnce() -> R) -> R {
        self.master.critical(name, f)
    }

    pub fn single<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        self.master.single(f)
    }

    pub fn allocate(&self, size: usize, node_hint: Option<NodeId>) -> Result<Address> {
        self.master.allocate(size, node_hint)
    }

    pub fn release(&self, start: Address, size: usize) -> Result<()> {
        self.master.release(start, size)
    }

    /// Statistics of all workers, as name/value pairs.
    pub fn statistics(&self) -> HashMap<String, String> {
        self.shared.scheduler.harness_stat()
    }

    pub fn scheduler_stat(&self) -> SchedulerStat {
        self.shared.scheduler.statistics()
    }

    /// Wait for all tasks, stop the workers and write the statistics if asked to.
    pub fn shutdown(self) {
        // Drop does the work.
    }

    fn write_stats(&self) {
        let path = &self.shared.options.stats_file;
        let stat = self.shared.scheduler.statistics();
        let result = File::create(path).and_then(|file| stat.write_csv(&mut BufWriter::new(file)));
        match result {
            Ok(()) => info!("Worker statistics written to {}", path),
            Err(e) => warn!("Cannot write worker statistics to {}: {}", path, e),
        }
    }

    fn write_task_stats(&self) {
        let path = &self.shared.options.task_stats_file;
        let records = self.shared.scheduler.task_records();
        let result = File::create(path)
            .and_then(|file| write_task_csv(&records, &mut BufWriter::new(file)));
        match result {
            Ok(()) => info!("Statistics of {} tasks written to {}", records.len(), path),
            Err(e) => warn!("Cannot write task statistics to {}: {}", path, e),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.master.wait_for_quiescence();
        let scheduler = &self.shared.scheduler;
        scheduler.worker_monitor.request_exit();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("A worker thread panicked");
            }
        }
        if self.shared.options.worker_stats {
            self.write_stats();
        }
        if self.shared.options.task_stats {
            self.write_task_stats();
        }
        self.master.retire();
        self.master.leave();
        debug_assert_eq!(scheduler.arena.live(), 0);
        info!("Runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::options::MapConfigProvider;
    use std::sync::atomic::AtomicUsize;

    fn builder(workers: usize) -> RuntimeBuilder {
        let provider = Arc::new(MapConfigProvider::new());
        let mut builder = RuntimeBuilder::with_provider(provider);
        builder.options_mut().workers = workers;
        builder.options_mut().thread_affinity = crate::util::options::AffinityKind::OsDefault;
        builder.topology(Topology::uniform(2, 2))
    }

    #[test]
    fn build_and_drop() {
        let runtime = builder(4).build().unwrap();
        assert_eq!(runtime.num_workers(), 4);
        assert_eq!(runtime.master().ordinal(), 0);
        assert_eq!(crate::scheduler::current_worker_ordinal(), Some(0));
        drop(runtime);
        assert_eq!(crate::scheduler::current_worker_ordinal(), None);
    }

    #[test]
    fn tasks_finish_before_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let runtime = builder(3).build().unwrap();
        for _ in 0..100 {
            let counter = counter.clone();
            runtime.spawn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        runtime.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn stats_file_written() {
        let path = std::env::temp_dir().join(format!("mirt-stats-{}.csv", std::process::id()));
        let mut builder = builder(2);
        builder.options_mut().worker_stats = true;
        builder.options_mut().stats_file = path.to_string_lossy().into_owned();
        let runtime = builder.build().unwrap();
        runtime.spawn(|_| {});
        runtime.task_wait();
        assert_eq!(runtime.statistics()["tasks.created.count"], "1");
        drop(runtime);

        let text = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert!(text.starts_with(crate::scheduler::WORKER_STATS_HEADER));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn task_stats_file_written() {
        let path = std::env::temp_dir().join(format!("mirt-tasks-{}.csv", std::process::id()));
        let mut builder = builder(2);
        builder.options_mut().task_stats = true;
        builder.options_mut().task_stats_file = path.to_string_lossy().into_owned();
        let runtime = builder.build().unwrap();
        let outer = runtime.task().name("outer").spawn(|w| {
            w.task().name("inner").spawn(|_| {});
            w.task_wait();
        });
        runtime.task_wait();
        let records = runtime.shared.scheduler.task_records();
        assert_eq!(records.len(), 2);
        let outer_id = records.iter().find(|r| r.name.as_deref() == Some("outer")).unwrap().id;
        let inner = records.iter().find(|r| r.name.as_deref() == Some("inner")).unwrap();
        assert_eq!(inner.parent, outer_id);
        assert!(runtime.master().is_task_done(outer));
        drop(runtime);

        let text = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], crate::scheduler::TASK_STATS_HEADER);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains(",outer,"));
        assert!(lines[2].contains(",inner,"));
    }

    #[test]
    fn spawned_task_reports_done() {
        crate::util::test_util::panic_after(10_000, || {
            let runtime = builder(2).build().unwrap();
            let (tx, rx) = std::sync::mpsc::channel::<()>();
            let task = runtime.spawn(move |w| {
                assert!(w.parent_task_id().is_some());
                rx.recv().unwrap();
            });
            assert!(!runtime.master().is_task_done(task));
            tx.send(()).unwrap();
            runtime.task_wait();
            assert!(runtime.master().is_task_done(task));
            assert_eq!(runtime.master().task_state(task), crate::scheduler::TaskState::Done);
            assert_eq!(runtime.master().parent_task_id(), None);
        })
    }
}
