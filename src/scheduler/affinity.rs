use crate::util::options::AffinityKind;
use crate::util::topology::CpuId;

/// Represents the ID of a logical CPU on a system.
pub type CoreId = u16;

/// Return the total number of cores allocated to the program.
pub fn get_total_num_cpus() -> usize {
    core_affinity::get_core_ids()
        .map(|ids| ids.len())
        .unwrap_or_else(num_cpus::get)
}

impl AffinityKind {
    /// The core worker `ordinal` should be pinned to, if any.  `topology_cpu` is the CPU the
    /// topology assigned to the worker.
    pub fn core_for(&self, ordinal: usize, topology_cpu: CpuId) -> Option<CoreId> {
        match self {
            AffinityKind::OsDefault => None,
            AffinityKind::Topology => Some(topology_cpu as CoreId),
            AffinityKind::RoundRobin(cpuset) => Some(cpuset[ordinal % cpuset.len()]),
        }
    }

    /// Resolve affinity of a worker thread. Has a side-effect of calling into the kernel to set
    /// the thread affinity.  Return the core the thread is bound to.
    pub fn resolve_affinity(&self, ordinal: usize, topology_cpu: CpuId) -> Option<CoreId> {
        let cpu = self.core_for(ordinal, topology_cpu)?;
        if bind_current_thread_to_core(cpu) {
            debug!("Set affinity for worker {} to core {}", ordinal, cpu);
            Some(cpu)
        } else {
            // Synthetic topologies and restricted cpusets name cores we may not run on.
            debug!("Cannot bind worker {} to core {}. Leave it unbound.", ordinal, cpu);
            None
        }
    }
}

/// Bind the current thread to the specified core.
fn bind_current_thread_to_core(cpu: CoreId) -> bool {
    core_affinity::set_for_current(core_affinity::CoreId { id: cpu as usize })
}
