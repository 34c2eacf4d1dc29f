//! The machine topology: cores, NUMA nodes, the distances between nodes and the memory of each
//! node.
//!
//! On Linux the topology is read from `/sys/devices/system/node`.  Anywhere else, or when the
//! directory is missing, the machine is treated as one node holding every CPU.

use crate::util::constants::{DEFAULT_LLC_SIZE, LOCAL_NODE_DISTANCE, REMOTE_NODE_DISTANCE};
use std::collections::BTreeMap;
use std::path::Path;

pub type NodeId = usize;
pub type CpuId = usize;

#[derive(Clone, Debug)]
pub struct Topology {
    name: String,
    /// CPUs of each node, sorted.
    node_cpus: Vec<Vec<CpuId>>,
    cpu_to_node: BTreeMap<CpuId, NodeId>,
    /// SLIT distances. `distances[a][b]` is 10 for `a == b`.
    distances: Vec<Vec<u32>>,
    /// Hop counts derived from the distances.
    hops: Vec<Vec<usize>>,
    diameter: usize,
    /// Memory capacity of each node in bytes.
    node_memory: Vec<usize>,
    llc_size: usize,
    /// Number of CPUs sharing one last-level cache.
    llc_shared_cpus: usize,
}

/// Parse a Linux CPU list such as `0-3,8,10-11`.
pub fn parse_cpu_list(list: &str) -> Result<Vec<CpuId>, String> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let start = start
                .trim()
                .parse::<CpuId>()
                .map_err(|e| format!("bad cpu range {:?}: {}", part, e))?;
            let end = end
                .trim()
                .parse::<CpuId>()
                .map_err(|e| format!("bad cpu range {:?}: {}", part, e))?;
            if end < start {
                return Err(format!("bad cpu range {:?}", part));
            }
            cpus.extend(start..=end);
        } else {
            cpus.push(
                part.parse::<CpuId>()
                    .map_err(|e| format!("bad cpu {:?}: {}", part, e))?,
            );
        }
    }
    Ok(cpus)
}

/// Get the total memory of the system in bytes.
fn get_system_total_memory() -> usize {
    use sysinfo::MemoryRefreshKind;
    use sysinfo::{RefreshKind, System};

    // Only load the memory component. Loading everything with `System::new_all()` is slow.
    let sys = System::new_with_specifics(
        RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
    );
    sys.total_memory() as usize
}

impl Topology {
    /// Build a topology from its parts.  `node_cpus[n]` lists the CPUs of node `n` and
    /// `distances` is the square SLIT matrix.
    pub fn from_parts(
        name: &str,
        node_cpus: Vec<Vec<CpuId>>,
        distances: Vec<Vec<u32>>,
        node_memory: Vec<usize>,
        llc_size: usize,
        llc_shared_cpus: usize,
    ) -> Self {
        let num_nodes = node_cpus.len();
        assert!(num_nodes > 0, "a topology needs at least one node");
        assert_eq!(distances.len(), num_nodes);
        assert!(distances.iter().all(|row| row.len() == num_nodes));
        assert_eq!(node_memory.len(), num_nodes);

        let mut node_cpus = node_cpus;
        let mut cpu_to_node = BTreeMap::new();
        for (node, cpus) in node_cpus.iter_mut().enumerate() {
            cpus.sort_unstable();
            cpus.dedup();
            for &cpu in cpus.iter() {
                cpu_to_node.insert(cpu, node);
            }
        }

        // Rank the distinct remote distances: the smallest is 1 hop, the next 2 hops, etc.
        let mut remote: Vec<u32> = distances
            .iter()
            .enumerate()
            .flat_map(|(a, row)| {
                row.iter()
                    .enumerate()
                    .filter(move |(b, _)| *b != a)
                    .map(|(_, d)| *d)
            })
            .collect();
        remote.sort_unstable();
        remote.dedup();
        let hops: Vec<Vec<usize>> = (0..num_nodes)
            .map(|a| {
                (0..num_nodes)
                    .map(|b| {
                        if a == b {
                            0
                        } else {
                            1 + remote.binary_search(&distances[a][b]).unwrap_or(0)
                        }
                    })
                    .collect()
            })
            .collect();
        let diameter = hops.iter().flatten().copied().max().unwrap_or(0);

        Topology {
            name: name.to_owned(),
            node_cpus,
            cpu_to_node,
            distances,
            hops,
            diameter,
            node_memory,
            llc_size,
            llc_shared_cpus: llc_shared_cpus.max(1),
        }
    }

    /// A synthetic machine with `nodes` nodes of `cores_per_node` cores each.  CPUs are numbered
    /// node-major.  Node memory is the system memory split evenly.
    pub fn uniform(nodes: usize, cores_per_node: usize) -> Self {
        assert!(nodes > 0 && cores_per_node > 0);
        let node_cpus = (0..nodes)
            .map(|n| (n * cores_per_node..(n + 1) * cores_per_node).collect())
            .collect();
        let distances = (0..nodes)
            .map(|a| {
                (0..nodes)
                    .map(|b| {
                        if a == b {
                            LOCAL_NODE_DISTANCE
                        } else {
                            REMOTE_NODE_DISTANCE
                        }
                    })
                    .collect()
            })
            .collect();
        let per_node = get_system_total_memory() / nodes;
        Self::from_parts(
            &format!("uniform-{}x{}", nodes, cores_per_node),
            node_cpus,
            distances,
            vec![per_node; nodes],
            DEFAULT_LLC_SIZE,
            cores_per_node,
        )
    }

    /// A single node holding every CPU of the process.
    pub fn single_node() -> Self {
        let cpus = num_cpus::get();
        Self::from_parts(
            "single-node",
            vec![(0..cpus).collect()],
            vec![vec![LOCAL_NODE_DISTANCE]],
            vec![get_system_total_memory()],
            DEFAULT_LLC_SIZE,
            cpus,
        )
    }

    /// Probe the machine.
    pub fn probe() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(all(target_os = "linux", not(feature = "no_numa")))] {
                match Self::probe_sysfs(Path::new("/sys/devices/system")) {
                    Ok(topology) => topology,
                    Err(e) => {
                        debug!("Cannot read the NUMA topology from sysfs ({}). Assume a single node.", e);
                        Self::single_node()
                    }
                }
            } else {
                Self::single_node()
            }
        }
    }

    /// Read the topology from a sysfs tree rooted at `root` (normally `/sys/devices/system`).
    pub fn probe_sysfs(root: &Path) -> std::io::Result<Self> {
        use std::io::{Error, ErrorKind};

        let mut nodes: Vec<(NodeId, Vec<CpuId>, Vec<u32>, usize)> = Vec::new();
        for entry in std::fs::read_dir(root.join("node"))? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(id) = file_name
                .to_str()
                .and_then(|n| n.strip_prefix("node"))
                .and_then(|n| n.parse::<NodeId>().ok())
            else {
                continue;
            };
            let path = entry.path();
            let cpus = parse_cpu_list(&std::fs::read_to_string(path.join("cpulist"))?)
                .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
            let distances = std::fs::read_to_string(path.join("distance"))?
                .split_whitespace()
                .map(|d| d.parse::<u32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
            let memory = std::fs::read_to_string(path.join("meminfo"))
                .ok()
                .and_then(|meminfo| parse_node_mem_total(&meminfo))
                .unwrap_or(0);
            nodes.push((id, cpus, distances, memory));
        }
        if nodes.is_empty() {
            return Err(Error::new(ErrorKind::NotFound, "no NUMA nodes listed"));
        }
        nodes.sort_by_key(|n| n.0);
        // Node ids must be dense so they can index the distance rows.
        if nodes.iter().enumerate().any(|(i, n)| n.0 != i)
            || nodes.iter().any(|n| n.2.len() != nodes.len())
        {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "sparse NUMA node ids are not supported",
            ));
        }
        // Memory-only nodes have no CPUs. They still count as nodes for placement of data.
        let total_memory = get_system_total_memory();
        let num_nodes = nodes.len();
        let mut node_cpus = Vec::with_capacity(num_nodes);
        let mut distances = Vec::with_capacity(num_nodes);
        let mut node_memory = Vec::with_capacity(num_nodes);
        for (_, cpus, dist, memory) in nodes {
            node_cpus.push(cpus);
            distances.push(dist);
            node_memory.push(if memory == 0 {
                total_memory / num_nodes
            } else {
                memory
            });
        }
        let (llc_size, llc_shared_cpus) = probe_llc(root).unwrap_or((DEFAULT_LLC_SIZE, 1));
        let name = format!("sysfs-{}-nodes", num_nodes);
        Ok(Self::from_parts(
            &name,
            node_cpus,
            distances,
            node_memory,
            llc_size,
            llc_shared_cpus,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_nodes(&self) -> usize {
        self.node_cpus.len()
    }

    pub fn num_cores(&self) -> usize {
        self.cpu_to_node.len()
    }

    /// The largest hop count between two nodes.
    pub fn diameter(&self) -> usize {
        self.diameter
    }

    /// The node of `cpu`.  Unknown CPUs belong to node 0.
    pub fn node_of(&self, cpu: CpuId) -> NodeId {
        self.cpu_to_node.get(&cpu).copied().unwrap_or(0)
    }

    pub fn cpus_of(&self, node: NodeId) -> &[CpuId] {
        &self.node_cpus[node]
    }

    /// Nodes exactly `d` hops away from `node`.  `vicinity_of(n, 0)` is `[n]`.
    pub fn vicinity_of(&self, node: NodeId, d: usize) -> Vec<NodeId> {
        (0..self.num_nodes())
            .filter(|&other| self.hops[node][other] == d)
            .collect()
    }

    pub fn hops(&self, from: NodeId, to: NodeId) -> usize {
        self.hops[from][to]
    }

    pub fn distance(&self, from: NodeId, to: NodeId) -> u32 {
        self.distances[from][to]
    }

    /// The cost of moving one byte from node `to` to a core on node `from`.
    pub fn comm_cost(&self, from: NodeId, to: NodeId) -> u64 {
        self.distances[from][to] as u64
    }

    /// Memory capacity of `node` in bytes.
    pub fn node_capacity(&self, node: NodeId) -> usize {
        self.node_memory[node]
    }

    pub fn llc_size(&self) -> usize {
        self.llc_size
    }

    /// The share of the last-level cache one core gets.
    pub fn llc_per_core(&self) -> usize {
        self.llc_size / self.llc_shared_cpus
    }

    /// The CPU each of `num_workers` workers runs on.  CPUs are handed out node-major, so
    /// consecutive workers share a node, and wrap around when there are more workers than CPUs.
    pub fn worker_cpus(&self, num_workers: usize) -> Vec<CpuId> {
        let order: Vec<CpuId> = self.node_cpus.iter().flatten().copied().collect();
        if order.is_empty() {
            return vec![0; num_workers];
        }
        (0..num_workers).map(|w| order[w % order.len()]).collect()
    }
}

/// Parse the `Node N MemTotal: X kB` line of a node's meminfo.
fn parse_node_mem_total(meminfo: &str) -> Option<usize> {
    meminfo.lines().find_map(|line| {
        let (_, rest) = line.split_once("MemTotal:")?;
        let kb = rest.split_whitespace().next()?.parse::<usize>().ok()?;
        Some(kb << 10)
    })
}

/// Read the size of the last-level cache of cpu0 and the number of CPUs sharing it.
fn probe_llc(root: &Path) -> Option<(usize, usize)> {
    let cache = root.join("cpu/cpu0/cache");
    let mut best: Option<(u32, usize, usize)> = None;
    for entry in std::fs::read_dir(cache).ok()? {
        let path = entry.ok()?.path();
        let Some(level) = std::fs::read_to_string(path.join("level"))
            .ok()
            .and_then(|l| l.trim().parse::<u32>().ok())
        else {
            continue;
        };
        let Some(size) = std::fs::read_to_string(path.join("size"))
            .ok()
            .and_then(|s| parse_cache_size(&s))
        else {
            continue;
        };
        let shared = std::fs::read_to_string(path.join("shared_cpu_list"))
            .ok()
            .and_then(|l| parse_cpu_list(&l).ok())
            .map(|cpus| cpus.len())
            .unwrap_or(1);
        if best.map_or(true, |(l, _, _)| level > l) {
            best = Some((level, size, shared));
        }
    }
    best.map(|(_, size, shared)| (size, shared))
}

/// Parse cache sizes such as `32768K` or `8M`.
fn parse_cache_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last()? {
        'K' | 'k' => (&s[..s.len() - 1], 10),
        'M' | 'm' => (&s[..s.len() - 1], 20),
        _ => (s, 0),
    };
    digits.parse::<usize>().ok().map(|n| n << shift)
}
