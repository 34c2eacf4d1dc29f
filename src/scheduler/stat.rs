use itertools::Itertools;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Header of the per-worker statistics file.
pub const WORKER_STATS_HEADER: &str = "worker,created,owned,stolen,inlined,comm_tasks,total_comm_cost,avg_comm_cost,lowest_comm_cost,highest_comm_cost,comm_tasks_stolen_by_diameter";

/// Header of the per-task statistics file.
pub const TASK_STATS_HEADER: &str = "task,parent,name,arg_size,created_by,executed_by,inlined,stolen_hops,comm_cost,exec_time_ns";

/// What happened to one task.  Recorded by the worker that executed it when the `task_stats`
/// option is set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: u64,
    /// Id of the task that created this one.
    pub parent: u64,
    pub name: Option<String>,
    pub arg_size: usize,
    pub created_by: usize,
    pub executed_by: usize,
    pub inlined: bool,
    /// Hop distance to the victim, if the task was stolen.
    pub stolen_hops: Option<usize>,
    pub comm_cost: Option<u64>,
    pub exec_time: Duration,
}

impl TaskRecord {
    fn csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{}",
            self.id,
            self.parent,
            self.name.as_deref().map(csv_field).unwrap_or_default(),
            self.arg_size,
            self.created_by,
            self.executed_by,
            self.inlined as u8,
            self.stolen_hops.map(|h| h.to_string()).unwrap_or_default(),
            self.comm_cost.map(|c| c.to_string()).unwrap_or_default(),
            self.exec_time.as_nanos(),
        )
    }
}

/// Quote a field if it would break the row.
fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_owned()
    }
}

/// Write one CSV row per task, in creation order.
pub fn write_task_csv(records: &[TaskRecord], out: &mut impl Write) -> std::io::Result<()> {
    writeln!(out, "{}", TASK_STATS_HEADER)?;
    for record in records.iter().sorted_by_key(|r| r.id) {
        writeln!(out, "{}", record.csv_row())?;
    }
    Ok(())
}

/// Communication cost of the placed tasks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct CommCost {
    total: u64,
    lowest: u64,
    highest: u64,
}

impl CommCost {
    fn new() -> Self {
        CommCost {
            total: 0,
            lowest: u64::MAX,
            highest: 0,
        }
    }

    fn process_cost(&mut self, cost: u64) {
        self.lowest = self.lowest.min(cost);
        self.highest = self.highest.max(cost);
        self.total += cost;
    }

    fn merge_cost_inplace(&mut self, other: &Self) {
        self.lowest = self.lowest.min(other.lowest);
        self.highest = self.highest.max(other.highest);
        self.total += other.total;
    }
}

/// Counters kept by one worker.  Only the owning worker mutates them.
#[derive(Clone, Debug)]
pub struct WorkerLocalStat {
    /// Tasks this worker created.
    pub created: u64,
    /// Tasks executed from the worker's own deque or inbox.
    pub owned: u64,
    /// Tasks executed after stealing them from another worker.
    pub stolen: u64,
    /// Tasks run inline at creation.
    pub inlined: u64,
    /// Tasks this worker placed on another worker.
    pub placed_remote: u64,
    /// Executed tasks whose placement was driven by footprints.
    pub comm_tasks: u64,
    comm_cost: CommCost,
    /// Footprint-placed tasks stolen, indexed by the hop distance to the victim.
    pub stolen_by_distance: Vec<u64>,
}

impl WorkerLocalStat {
    pub fn new(diameter: usize) -> Self {
        WorkerLocalStat {
            created: 0,
            owned: 0,
            stolen: 0,
            inlined: 0,
            placed_remote: 0,
            comm_tasks: 0,
            comm_cost: CommCost::new(),
            stolen_by_distance: vec![0; diameter + 1],
        }
    }

    /// Record the execution of a task.  `stolen_from` is the hop distance to the victim if the
    /// task was stolen.  `comm_cost` is the cost computed when the task was placed.
    pub fn end_of_task(&mut self, stolen_from: Option<usize>, comm_cost: Option<u64>) {
        match stolen_from {
            Some(hops) => {
                self.stolen += 1;
                if comm_cost.is_some() {
                    if hops >= self.stolen_by_distance.len() {
                        self.stolen_by_distance.resize(hops + 1, 0);
                    }
                    self.stolen_by_distance[hops] += 1;
                }
            }
            None => self.owned += 1,
        }
        if let Some(cost) = comm_cost {
            self.comm_tasks += 1;
            self.comm_cost.process_cost(cost);
        }
    }

    pub fn total_comm_cost(&self) -> u64 {
        self.comm_cost.total
    }

    pub fn lowest_comm_cost(&self) -> Option<u64> {
        (self.comm_tasks > 0).then_some(self.comm_cost.lowest)
    }

    pub fn highest_comm_cost(&self) -> Option<u64> {
        (self.comm_tasks > 0).then_some(self.comm_cost.highest)
    }

    pub fn avg_comm_cost(&self) -> f64 {
        if self.comm_tasks == 0 {
            0.0
        } else {
            self.comm_cost.total as f64 / self.comm_tasks as f64
        }
    }

    fn csv_row(&self, ordinal: usize) -> String {
        format!(
            "{},{},{},{},{},{},{},{:.2},{},{},{}",
            ordinal,
            self.created,
            self.owned,
            self.stolen,
            self.inlined,
            self.comm_tasks,
            self.total_comm_cost(),
            self.avg_comm_cost(),
            self.lowest_comm_cost().unwrap_or(0),
            self.highest_comm_cost().unwrap_or(0),
            self.stolen_by_distance.iter().join(";"),
        )
    }
}

/// Statistics of the whole worker pool, merged from each worker's [`WorkerLocalStat`].
#[derive(Default)]
pub struct SchedulerStat {
    workers: Vec<WorkerLocalStat>,
    /// Set when some worker was busy updating its counters while they were collected.
    incomplete: AtomicBool,
}

impl SchedulerStat {
    pub fn merge(&mut self, stat: &WorkerLocalStat) {
        self.workers.push(stat.clone());
    }

    pub(crate) fn mark_incomplete(&self) {
        self.incomplete.store(true, Ordering::Relaxed);
    }

    pub fn is_incomplete(&self) -> bool {
        self.incomplete.load(Ordering::Relaxed)
    }

    pub fn workers(&self) -> &[WorkerLocalStat] {
        &self.workers
    }

    fn sum(&self, f: impl Fn(&WorkerLocalStat) -> u64) -> u64 {
        self.workers.iter().map(f).sum()
    }

    pub fn harness_stat(&self) -> HashMap<String, String> {
        let mut stat = HashMap::new();
        let counters: [(&str, fn(&WorkerLocalStat) -> u64); 6] = [
            ("created", |s| s.created),
            ("owned", |s| s.owned),
            ("stolen", |s| s.stolen),
            ("inlined", |s| s.inlined),
            ("placed-remote", |s| s.placed_remote),
            ("comm", |s| s.comm_tasks),
        ];
        for (name, counter) in counters {
            stat.insert(format!("tasks.{}.count", name), format!("{}", self.sum(counter)));
        }

        let mut overall = CommCost::new();
        for worker in &self.workers {
            overall.merge_cost_inplace(&worker.comm_cost);
        }
        let comm_tasks = self.sum(|s| s.comm_tasks);
        stat.insert(
            "comm-cost.total".to_owned(),
            format!("{}", overall.total),
        );
        if comm_tasks > 0 {
            stat.insert("comm-cost.min".to_owned(), format!("{}", overall.lowest));
            stat.insert("comm-cost.max".to_owned(), format!("{}", overall.highest));
            stat.insert(
                "comm-cost.avg".to_owned(),
                format!("{:.2}", overall.total as f64 / comm_tasks as f64),
            );
        }
        stat.insert("workers".to_owned(), format!("{}", self.workers.len()));
        stat
    }

    /// Write one CSV row per worker.
    pub fn write_csv(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(out, "{}", WORKER_STATS_HEADER)?;
        for (ordinal, worker) in self.workers.iter().enumerate() {
            writeln!(out, "{}", worker.csv_row(ordinal))?;
        }
        Ok(())
    }
}
