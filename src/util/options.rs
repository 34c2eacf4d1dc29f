//! Runtime options.
//!
//! Options are declared with the `options!` macro, which generates the `Options` struct, a
//! validating `set_from_str` and the list of option names.  Values come from a
//! [`ConfigProvider`].  The default provider reads `MIRT_<NAME>` environment variables, and tests
//! use a [`MapConfigProvider`] so they never touch the process environment.
//!
//! Most options are read once when a runtime is built.  `schedule` and `num_threads` are resolved
//! again from the provider each time a parallel region is entered (see [`Options::region_config`]).

use crate::scheduler::affinity::CoreId;
use crate::util::constants::{DEFAULT_STATS_FILE, DEFAULT_TASK_CAPACITY, DEFAULT_TASK_STATS_FILE};
use crate::util::topology::parse_cpu_list;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// How memory handed out by the NUMA allocator is bound to nodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MemoryPolicy {
    /// Leave placement to the OS (first touch).
    System,
    /// Bind each allocation as a whole to one node, rotating over the nodes.
    Coarse,
    /// Interleave the pages of each allocation over all nodes.
    Fine,
    /// Bind each allocation to the node of the allocating worker.
    Local,
}

/// How new tasks are distributed over the workers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SchedPolicy {
    /// One queue shared by all workers for tasks created outside any team.  Footprints are
    /// ignored.
    Central,
    /// Every task goes to the deque of its creator, and idle workers steal.  Footprints are
    /// ignored.
    Ws,
    /// Like `ws`, but footprints steer each task to a worker near its data.
    Numa,
}

/// The policy of a worksharing loop schedule.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SchedulePolicy {
    Static,
    Dynamic,
    Guided,
}

/// The value of the `schedule` option.
///
/// The format is
/// ```text
/// <schedule> ::= <policy> | <policy> "," <chunk>
/// <policy>   ::= "static" | "dynamic" | "guided"
/// ```
/// where `<chunk>` is a positive integer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub policy: SchedulePolicy,
    pub chunk: Option<usize>,
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        ScheduleSpec {
            policy: SchedulePolicy::Static,
            chunk: None,
        }
    }
}

impl FromStr for ScheduleSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(2, ',');
        let policy = parts
            .next()
            .unwrap_or_default()
            .trim()
            .parse::<SchedulePolicy>()
            .map_err(|_| format!("unknown schedule policy in {:?}", s))?;
        let chunk = match parts.next() {
            None => None,
            Some(c) => match c.trim().parse::<usize>() {
                Ok(0) | Err(_) => return Err(format!("chunk size must be a positive integer: {:?}", s)),
                Ok(c) => Some(c),
            },
        };
        Ok(ScheduleSpec { policy, chunk })
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.chunk {
            Some(chunk) => write!(f, "{},{}", self.policy, chunk),
            None => write!(f, "{}", self.policy),
        }
    }
}

/// Whether and how worker threads are pinned to cores.  The thread that creates the runtime is
/// never pinned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AffinityKind {
    /// Do not pin worker threads.
    OsDefault,
    /// Pin each worker to the core the topology assigns it.
    Topology,
    /// Pin worker `i` to the `i % len`-th core of the list.
    RoundRobin(Vec<CoreId>),
}

impl FromStr for AffinityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("osdefault") {
            return Ok(AffinityKind::OsDefault);
        }
        if s.eq_ignore_ascii_case("topology") {
            return Ok(AffinityKind::Topology);
        }
        let cpus = parse_cpu_list(s)?;
        if cpus.is_empty() {
            return Err(format!("empty cpu list: {:?}", s));
        }
        Ok(AffinityKind::RoundRobin(
            cpus.into_iter().map(|c| c as CoreId).collect(),
        ))
    }
}

/// Which machine topology the runtime schedules for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TopologySelector {
    /// Probe the machine.
    Auto,
    /// A synthetic machine with `nodes` nodes of `cores_per_node` cores each.
    Uniform { nodes: usize, cores_per_node: usize },
}

impl FromStr for TopologySelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(TopologySelector::Auto);
        }
        let shape = s
            .strip_prefix("uniform:")
            .ok_or_else(|| format!("expected auto or uniform:<nodes>x<cores>, got {:?}", s))?;
        let (nodes, cores) = shape
            .split_once('x')
            .ok_or_else(|| format!("expected <nodes>x<cores>, got {:?}", shape))?;
        let nodes = nodes.parse::<usize>().map_err(|e| e.to_string())?;
        let cores_per_node = cores.parse::<usize>().map_err(|e| e.to_string())?;
        if nodes == 0 || cores_per_node == 0 {
            return Err("a uniform topology needs at least one node and one core".into());
        }
        Ok(TopologySelector::Uniform {
            nodes,
            cores_per_node,
        })
    }
}

/// A source of option values, looked up by option name (such as `"schedule"`).
pub trait ConfigProvider: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads options from environment variables named `<prefix><NAME>`, e.g. `MIRT_WORKERS`.
pub struct EnvConfigProvider {
    prefix: String,
}

impl EnvConfigProvider {
    pub const DEFAULT_PREFIX: &'static str = "MIRT_";

    pub fn with_prefix(prefix: &str) -> Self {
        EnvConfigProvider {
            prefix: prefix.to_owned(),
        }
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::with_prefix(Self::DEFAULT_PREFIX)
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(format!("{}{}", self.prefix, name.to_uppercase())).ok()
    }
}

/// An in-memory provider.  Values can be changed while a runtime is using it.
#[derive(Default)]
pub struct MapConfigProvider {
    values: spin::RwLock<HashMap<String, String>>,
}

impl MapConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: &str) {
        self.values.write().insert(name.to_owned(), value.to_owned());
    }

    pub fn remove(&self, name: &str) {
        self.values.write().remove(name);
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for MapConfigProvider {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let provider = MapConfigProvider::new();
        for (k, v) in iter {
            provider.set(k, v);
        }
        provider
    }
}

impl ConfigProvider for MapConfigProvider {
    fn get(&self, name: &str) -> Option<String> {
        self.values.read().get(name).cloned()
    }
}

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($name: $type[$validator] = $default),*);
    ];
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        #[derive(Clone, Debug)]
        pub struct Options {
            $(pub $name: $type),*
        }
        impl Options {
            /// The names of all options.
            pub const NAMES: &'static [&'static str] = &[$(stringify!($name)),*];

            /// Set an option from its string form.  Return `false` and keep the old value if
            /// the string cannot be parsed or the value is invalid.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by a config provider or by the builder) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key: {}", s)
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                Options {
                    $($name: $default),*
                }
            }
        }
    ]
}

options! {
    // Number of workers in the pool, including the thread that creates the runtime.
    workers:          usize             [|v: &usize| *v > 0] = num_cpus::get(),
    // Default team size of parallel regions. 0 means all workers. Resolved at region entry.
    num_threads:      usize             [always_valid] = 0,
    // Schedule of worksharing loops that ask for the runtime schedule. Resolved at region entry.
    schedule:         ScheduleSpec      [always_valid] = ScheduleSpec::default(),
    // How new tasks are distributed over the workers.
    sched_policy:     SchedPolicy       [always_valid] = SchedPolicy::Numa,
    // How the NUMA allocator binds memory.
    memory_policy:    MemoryPolicy      [always_valid] = MemoryPolicy::Coarse,
    // Footprints smaller than this many bytes do not steer placement. 0 means the LLC share of one core.
    numa_footprint:   usize             [always_valid] = 0,
    // Run a new task inline when the local deque holds more than this many tasks. 0 disables inlining.
    inline_limit:     usize             [always_valid] = 0,
    // Maximum number of live tasks.
    task_capacity:    usize             [|v: &usize| *v > 0] = DEFAULT_TASK_CAPACITY,
    // Pin workers to cores.
    thread_affinity:  AffinityKind      [always_valid] = AffinityKind::Topology,
    // Stack size of worker threads in bytes. 0 means the platform default.
    stack_size:       usize             [always_valid] = 0,
    // First sleep of an idle worker, in microseconds.
    backoff_reset_us: u64               [|v: &u64| *v > 0] = 1,
    // Longest sleep of an idle worker, in microseconds.
    backoff_roof_us:  u64               [|v: &u64| *v > 0] = 1000,
    // Write per-worker statistics when the runtime is destroyed.
    worker_stats:     bool              [always_valid] = false,
    // Where to write the per-worker statistics.
    stats_file:       String            [|v: &String| !v.is_empty()] = DEFAULT_STATS_FILE.to_owned(),
    // Record every executed task and write the records when the runtime is destroyed.
    task_stats:       bool              [always_valid] = false,
    // Where to write the per-task statistics.
    task_stats_file:  String            [|v: &String| !v.is_empty()] = DEFAULT_TASK_STATS_FILE.to_owned(),
    // The machine topology to schedule for.
    topology:         TopologySelector  [always_valid] = TopologySelector::Auto,
}

/// Settings resolved when a parallel region is entered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegionConfig {
    pub schedule: ScheduleSpec,
    /// 0 means "use the default team size".
    pub num_threads: usize,
}

impl Options {
    /// Build options from a provider.  Options the provider does not know keep their defaults.
    pub fn from_provider(provider: &dyn ConfigProvider) -> Self {
        let mut options = Options::default();
        options.read_provider(provider);
        options
    }

    /// Apply every option the provider has a value for.
    pub fn read_provider(&mut self, provider: &dyn ConfigProvider) {
        for name in Self::NAMES {
            if let Some(val) = provider.get(name) {
                trace!("Trying to process option pair: ({}, {})", name, val);
                self.set_from_str(name, &val);
            }
        }
        if self.backoff_roof_us < self.backoff_reset_us {
            self.backoff_roof_us = self.backoff_reset_us;
        }
    }

    /// Resolve the per-region settings.  The provider's current values take priority over the
    /// values the runtime was built with; malformed values fall back to them.
    pub fn region_config(&self, provider: &dyn ConfigProvider) -> RegionConfig {
        let mut config = RegionConfig {
            schedule: self.schedule,
            num_threads: self.num_threads,
        };
        if let Some(val) = provider.get("schedule") {
            match val.parse::<ScheduleSpec>() {
                Ok(schedule) => config.schedule = schedule,
                Err(e) => debug!("Ignoring schedule={:?}: {}", val, e),
            }
        }
        if let Some(val) = provider.get("num_threads") {
            match val.trim().parse::<usize>() {
                Ok(n) => config.num_threads = n,
                Err(e) => debug!("Ignoring num_threads={:?}: {}", val, e),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{serial_test, with_cleanup};

    #[test]
    fn no_provider_values() {
        let options = Options::from_provider(&MapConfigProvider::new());
        assert_eq!(options.workers, num_cpus::get());
        assert_eq!(options.memory_policy, MemoryPolicy::Coarse);
        assert_eq!(options.schedule, ScheduleSpec::default());
    }

    #[test]
    fn with_valid_values() {
        let provider: MapConfigProvider = [
            ("workers", "3"),
            ("memory_policy", "fine"),
            ("schedule", "guided,4"),
            ("worker_stats", "true"),
            ("sched_policy", "WS"),
        ]
        .into_iter()
        .collect();
        let options = Options::from_provider(&provider);
        assert_eq!(options.workers, 3);
        assert_eq!(options.memory_policy, MemoryPolicy::Fine);
        assert_eq!(
            options.schedule,
            ScheduleSpec {
                policy: SchedulePolicy::Guided,
                chunk: Some(4)
            }
        );
        assert!(options.worker_stats);
        assert_eq!(options.sched_policy, SchedPolicy::Ws);
        assert!(!options.task_stats);
    }

    #[test]
    fn with_invalid_value() {
        let provider: MapConfigProvider = [("workers", "0"), ("task_capacity", "abc")]
            .into_iter()
            .collect();
        let options = Options::from_provider(&provider);
        // Both values are rejected, so the defaults are used.
        assert_eq!(options.workers, num_cpus::get());
        assert_eq!(options.task_capacity, DEFAULT_TASK_CAPACITY);
    }

    #[test]
    #[should_panic(expected = "Invalid Options key")]
    fn with_invalid_key() {
        let mut options = Options::default();
        options.set_from_str("no_such_option", "1");
    }

    #[test]
    fn with_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("MIRT_INLINE_LIMIT", "16");
                    std::env::set_var("MIRT_THREAD_AFFINITY", "0,2-3");

                    let options = Options::from_provider(&EnvConfigProvider::default());
                    assert_eq!(options.inline_limit, 16);
                    assert_eq!(
                        options.thread_affinity,
                        AffinityKind::RoundRobin(vec![0, 2, 3])
                    );
                },
                || {
                    std::env::remove_var("MIRT_INLINE_LIMIT");
                    std::env::remove_var("MIRT_THREAD_AFFINITY");
                },
            )
        })
    }

    #[test]
    fn parse_schedule() {
        assert_eq!(
            "static,10".parse::<ScheduleSpec>(),
            Ok(ScheduleSpec {
                policy: SchedulePolicy::Static,
                chunk: Some(10)
            })
        );
        assert_eq!(
            " Dynamic ".parse::<ScheduleSpec>(),
            Ok(ScheduleSpec {
                policy: SchedulePolicy::Dynamic,
                chunk: None
            })
        );
        assert!("static,0".parse::<ScheduleSpec>().is_err());
        assert!("static,-3".parse::<ScheduleSpec>().is_err());
        assert!("auto".parse::<ScheduleSpec>().is_err());
        assert_eq!(
            "guided,7".parse::<ScheduleSpec>().unwrap().to_string(),
            "guided,7"
        );
    }

    #[test]
    fn parse_topology() {
        assert_eq!(
            "uniform:2x4".parse::<TopologySelector>(),
            Ok(TopologySelector::Uniform {
                nodes: 2,
                cores_per_node: 4
            })
        );
        assert_eq!("AUTO".parse::<TopologySelector>(), Ok(TopologySelector::Auto));
        assert!("uniform:0x4".parse::<TopologySelector>().is_err());
        assert!("mesh".parse::<TopologySelector>().is_err());
    }

    #[test]
    fn region_config_follows_provider() {
        let options = Options::default();
        let provider = MapConfigProvider::new();
        assert_eq!(options.region_config(&provider).schedule, ScheduleSpec::default());

        provider.set("schedule", "dynamic,3");
        provider.set("num_threads", "2");
        let config = options.region_config(&provider);
        assert_eq!(config.schedule.policy, SchedulePolicy::Dynamic);
        assert_eq!(config.schedule.chunk, Some(3));
        assert_eq!(config.num_threads, 2);

        // Malformed values fall back to the built options.
        provider.set("schedule", "sideways");
        assert_eq!(options.region_config(&provider).schedule, ScheduleSpec::default());
    }
}
