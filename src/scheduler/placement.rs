//! Decides which worker a new task is queued on.
//!
//! Placement is a heuristic.  A bad choice makes a program slower, never wrong.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

use super::footprint::{Footprint, NodeDistribution};
use crate::util::constants::BYTES_IN_PAGE;
use crate::util::memory::{Binding, NumaAllocator};
use crate::util::topology::{NodeId, Topology};

/// Sample at most this many pages of a footprint when asking the kernel where they are.
const MAX_SAMPLED_PAGES: usize = 64;

/// Where the creator of a task wants it to run.  A hint outranks footprints.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlacementHint {
    /// On this worker.
    Worker(usize),
    /// On any worker of this node.
    Node(NodeId),
}

/// The outcome of [`PlacementPolicy::place`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub worker: usize,
    /// The communication cost of running the task on `worker`, when footprints decided it.
    pub comm_cost: Option<u64>,
}

impl Placement {
    fn on(worker: usize) -> Self {
        Placement {
            worker,
            comm_cost: None,
        }
    }
}

pub struct PlacementPolicy {
    topology: Arc<Topology>,
    /// Node of each worker.
    worker_nodes: Vec<NodeId>,
    /// Distributions with fewer bytes than this do not steer placement.
    cutoff: u64,
    /// Round-robin cursor per node.
    node_cursors: Vec<CachePadded<AtomicUsize>>,
}

impl PlacementPolicy {
    /// `numa_footprint` of zero means the share of the last-level cache of one core.
    pub fn new(topology: Arc<Topology>, worker_nodes: Vec<NodeId>, numa_footprint: usize) -> Self {
        let cutoff = if numa_footprint == 0 {
            topology.llc_per_core()
        } else {
            numa_footprint
        } as u64;
        let node_cursors = (0..topology.num_nodes())
            .map(|_| CachePadded::new(AtomicUsize::new(0)))
            .collect();
        PlacementPolicy {
            topology,
            worker_nodes,
            cutoff,
            node_cursors,
        }
    }

    pub fn cutoff(&self) -> u64 {
        self.cutoff
    }

    pub fn node_of_worker(&self, worker: usize) -> NodeId {
        self.worker_nodes[worker]
    }

    fn is_eligible(&self, worker: usize, eligible: Option<&[usize]>) -> bool {
        worker < self.worker_nodes.len() && eligible.map_or(true, |e| e.contains(&worker))
    }

    /// Pick one of the eligible workers of `node`, rotating between calls.
    fn round_robin(&self, node: NodeId, eligible: Option<&[usize]>) -> Option<usize> {
        if node >= self.node_cursors.len() {
            return None;
        }
        let candidates: Vec<usize> = match eligible {
            Some(workers) => workers
                .iter()
                .copied()
                .filter(|w| self.worker_nodes.get(*w) == Some(&node))
                .collect(),
            None => (0..self.worker_nodes.len())
                .filter(|w| self.worker_nodes[*w] == node)
                .collect(),
        };
        if candidates.is_empty() {
            return None;
        }
        let cursor = self.node_cursors[node].fetch_add(1, Ordering::Relaxed);
        Some(candidates[cursor % candidates.len()])
    }

    /// Choose a worker for a task created by `creator`.  `eligible` restricts the choice to the
    /// creator's team; `None` means every worker.
    pub fn place(
        &self,
        creator: usize,
        footprints: &[Footprint],
        hint: Option<PlacementHint>,
        eligible: Option<&[usize]>,
        allocator: &NumaAllocator,
    ) -> Placement {
        match hint {
            Some(PlacementHint::Worker(w)) => {
                return if self.is_eligible(w, eligible) {
                    Placement::on(w)
                } else {
                    Placement::on(creator)
                };
            }
            Some(PlacementHint::Node(node)) => {
                return Placement::on(self.round_robin(node, eligible).unwrap_or(creator));
            }
            None => {}
        }
        if footprints.is_empty() {
            return Placement::on(creator);
        }

        let creator_node = self.node_of_worker(creator);
        let mut distribution = NodeDistribution::new(self.topology.num_nodes());
        for footprint in footprints {
            self.distribute(footprint, creator_node, allocator, &mut distribution);
        }
        let strict = footprints.iter().any(|f| f.access.writes());
        self.place_with_distribution(creator, &distribution, strict, eligible)
    }

    /// Add the bytes of `footprint` to `distribution`, node by node.
    fn distribute(
        &self,
        footprint: &Footprint,
        creator_node: NodeId,
        allocator: &NumaAllocator,
        distribution: &mut NodeDistribution,
    ) {
        let num_nodes = self.topology.num_nodes();
        let Some(range) = footprint.range() else {
            debug!("Ignoring {:?}: it does not fit the address space", footprint);
            return;
        };
        let (start, size) = (range.start, range.end - range.start);
        if size == 0 {
            return;
        }
        let info = footprint
            .part_of
            .and_then(|enclosing| allocator.lookup(enclosing))
            .or_else(|| allocator.lookup(start));

        if let Some(info) = info {
            match info.binding {
                Binding::Node(node) => {
                    distribution.add(node, size as u64);
                    return;
                }
                Binding::Interleave => {
                    let pages = size.div_ceil(BYTES_IN_PAGE);
                    if pages > num_nodes * MAX_SAMPLED_PAGES {
                        for node in 0..num_nodes {
                            distribution.add(node, (size / num_nodes) as u64);
                        }
                    } else {
                        let mut page = start.align_down(BYTES_IN_PAGE);
                        let end = range.end;
                        while page < end {
                            let from = if page < start { start } else { page };
                            let to = (page + BYTES_IN_PAGE).min(end);
                            let node = info.node_of(page, num_nodes).unwrap_or(creator_node);
                            distribution.add(node, (to - from) as u64);
                            page += BYTES_IN_PAGE;
                        }
                    }
                    return;
                }
                Binding::Os => {}
            }
        }

        // Ask the kernel about a sample of the pages.
        let pages = size.div_ceil(BYTES_IN_PAGE);
        let samples = pages.min(MAX_SAMPLED_PAGES);
        let stride = pages / samples;
        let per_sample = (size / samples) as u64;
        let mut known = false;
        let mut nodes = Vec::with_capacity(samples);
        for i in 0..samples {
            let node = allocator.query_page_node(start + i * stride * BYTES_IN_PAGE);
            known |= node.is_some();
            nodes.push(node);
        }
        if !known {
            trace!("No node known for {:?}. Attributing it to node {}", footprint, creator_node);
            distribution.add(creator_node, size as u64);
            return;
        }
        for node in nodes {
            distribution.add(node.unwrap_or(creator_node), per_sample);
        }
    }

    /// The part of [`PlacementPolicy::place`] after the footprints have been resolved to bytes per
    /// node.  `strict` means some footprint is written.
    pub fn place_with_distribution(
        &self,
        creator: usize,
        distribution: &NodeDistribution,
        strict: bool,
        eligible: Option<&[usize]>,
    ) -> Placement {
        let creator_node = self.node_of_worker(creator);
        if distribution.total() < self.cutoff || distribution.is_uniform() {
            return Placement::on(creator);
        }

        let cost_on = |candidate: NodeId| -> u64 {
            distribution
                .bytes()
                .iter()
                .enumerate()
                .map(|(node, bytes)| bytes.saturating_mul(self.topology.comm_cost(candidate, node)))
                .fold(0, u64::saturating_add)
        };

        let has_eligible_worker = |node: NodeId| match eligible {
            Some(workers) => workers
                .iter()
                .any(|w| self.worker_nodes.get(*w) == Some(&node)),
            None => self.worker_nodes.contains(&node),
        };

        // Least cost, preferring the creator's node and then the lowest id on ties.
        let mut best: Option<(NodeId, u64)> = None;
        for node in 0..self.topology.num_nodes() {
            if !has_eligible_worker(node) {
                continue;
            }
            let cost = cost_on(node);
            let better = match best {
                None => true,
                Some((best_node, best_cost)) => {
                    cost < best_cost || (cost == best_cost && node == creator_node && best_node != creator_node)
                }
            };
            if better {
                best = Some((node, cost));
            }
        }
        let Some((best_node, best_cost)) = best else {
            return Placement::on(creator);
        };

        let creator_qualifies = if strict {
            creator_node == best_node
        } else {
            self.topology.hops(creator_node, best_node) <= 1
        };
        let placement = if creator_qualifies {
            Placement {
                worker: creator,
                comm_cost: Some(cost_on(creator_node)),
            }
        } else {
            match self.round_robin(best_node, eligible) {
                Some(worker) => Placement {
                    worker,
                    comm_cost: Some(best_cost),
                },
                None => Placement {
                    worker: creator,
                    comm_cost: Some(cost_on(creator_node)),
                },
            }
        };
        debug!(
            "Placed task of worker {} with {:?} bytes on worker {} (node {}, cost {:?})",
            creator,
            distribution.bytes(),
            placement.worker,
            self.node_of_worker(placement.worker),
            placement.comm_cost
        );
        placement
    }
}
