//! The NUMA allocator.
//!
//! Memory is mapped with anonymous `mmap` and bound to nodes with `mbind`.  Every live
//! allocation is recorded in an address-ordered registry so the placement policy can find the
//! node behind a footprint without asking the kernel.

use crate::util::constants::BYTES_IN_PAGE;
use crate::util::error::{Result, RuntimeError};
use crate::util::options::MemoryPolicy;
use crate::util::topology::{NodeId, Topology};
use crate::util::Address;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// Constants of the Linux memory policy API (linux/mempolicy.h).
const MPOL_BIND: libc::c_int = 2;
const MPOL_INTERLEAVE: libc::c_int = 3;
const MPOL_MF_MOVE: libc::c_uint = 1 << 1;
const MPOL_F_NODE: libc::c_int = 1 << 0;
const MPOL_F_ADDR: libc::c_int = 1 << 1;

/// How the pages of an allocation are spread over the nodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Binding {
    /// All pages on one node.
    Node(NodeId),
    /// Pages interleaved over all nodes, starting at node 0.
    Interleave,
    /// Left to the OS.
    Os,
}

/// A live allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocationInfo {
    pub start: Address,
    pub size: usize,
    pub binding: Binding,
}

impl AllocationInfo {
    /// The node of the page containing `addr`, if it follows from the binding.
    pub fn node_of(&self, addr: Address, num_nodes: usize) -> Option<NodeId> {
        match self.binding {
            Binding::Node(node) => Some(node),
            Binding::Interleave => Some(((addr - self.start) / BYTES_IN_PAGE) % num_nodes),
            Binding::Os => None,
        }
    }
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> std::io::Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Round `size` up to whole pages.  `None` if that does not fit in a `usize`.
pub fn page_align_up(size: usize) -> Option<usize> {
    Some(size.checked_add(BYTES_IN_PAGE - 1)? & !(BYTES_IN_PAGE - 1))
}

fn mmap_anon(size: usize) -> std::io::Result<Address> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            let prot = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_ANON | libc::MAP_PRIVATE;
            let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
            if ptr == libc::MAP_FAILED {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(Address::from_mut_ptr(ptr))
            }
        } else {
            let layout = std::alloc::Layout::from_size_align(size, BYTES_IN_PAGE)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                Err(std::io::ErrorKind::OutOfMemory.into())
            } else {
                Ok(Address::from_mut_ptr(ptr))
            }
        }
    }
}

fn munmap(start: Address, size: usize) -> std::io::Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
        } else {
            let layout = std::alloc::Layout::from_size_align(size, BYTES_IN_PAGE)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            unsafe { std::alloc::dealloc(start.to_mut_ptr(), layout) };
            Ok(())
        }
    }
}

/// Apply a memory policy to `[start, start + size)`.
#[cfg(target_os = "linux")]
fn mbind(start: Address, size: usize, mode: libc::c_int, nodes: &[NodeId], num_nodes: usize) -> std::io::Result<()> {
    const BITS: usize = libc::c_ulong::BITS as usize;
    let mut mask = vec![0 as libc::c_ulong; num_nodes.div_ceil(BITS)];
    for &node in nodes {
        mask[node / BITS] |= 1 << (node % BITS);
    }
    let max_node = (mask.len() * BITS + 1) as libc::c_ulong;
    wrap_libc_call(
        &|| unsafe {
            libc::syscall(
                libc::SYS_mbind,
                start.to_mut_ptr::<libc::c_void>(),
                size as libc::c_ulong,
                mode,
                mask.as_ptr(),
                max_node,
                MPOL_MF_MOVE,
            )
        },
        0,
    )
}

/// Ask the kernel which node backs the page containing `addr`.
#[cfg(target_os = "linux")]
fn get_mempolicy_node(addr: Address) -> Option<NodeId> {
    let mut node: libc::c_int = -1;
    let ret = unsafe {
        libc::syscall(
            libc::SYS_get_mempolicy,
            &mut node as *mut libc::c_int,
            std::ptr::null_mut::<libc::c_ulong>(),
            0 as libc::c_ulong,
            addr.to_mut_ptr::<libc::c_void>(),
            (MPOL_F_NODE | MPOL_F_ADDR) as libc::c_ulong,
        )
    };
    if ret == 0 && node >= 0 {
        Some(node as NodeId)
    } else {
        None
    }
}

pub struct NumaAllocator {
    topology: Arc<Topology>,
    policy: MemoryPolicy,
    /// Whether the kernel is asked to bind memory.
    bind_enabled: bool,
    registry: Mutex<BTreeMap<Address, AllocationInfo>>,
    /// Next node for round-robin coarse allocation.
    next_node: AtomicUsize,
    total_allocated: AtomicUsize,
}

impl NumaAllocator {
    pub fn new(topology: Arc<Topology>, policy: MemoryPolicy) -> Self {
        let bind_enabled = cfg!(all(target_os = "linux", not(feature = "no_numa")))
            && topology.num_nodes() > 1;
        NumaAllocator {
            topology,
            policy,
            bind_enabled,
            registry: Mutex::new(BTreeMap::new()),
            next_node: AtomicUsize::new(0),
            total_allocated: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> MemoryPolicy {
        self.policy
    }

    /// Allocate `size` bytes, rounded up to pages and zeroed.
    ///
    /// `node_hint` asks for a specific node.  `local_node` is the node of the calling worker,
    /// used by the local policy.  An explicit hint binds the memory to that node under every
    /// policy except `system`.
    pub fn allocate(
        &self,
        size: usize,
        node_hint: Option<NodeId>,
        local_node: NodeId,
    ) -> Result<Address> {
        if size == 0 {
            return Err(RuntimeError::ZeroSize);
        }
        let num_nodes = self.topology.num_nodes();
        if let Some(node) = node_hint {
            if node >= num_nodes {
                return Err(RuntimeError::InvalidNode {
                    node,
                    available: num_nodes,
                });
            }
        }
        let Some(size) = page_align_up(size) else {
            return Err(RuntimeError::OutOfMemory(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                format!("{} bytes cannot be rounded up to whole pages", size),
            )));
        };
        let binding = match (self.policy, node_hint) {
            (MemoryPolicy::System, _) => Binding::Os,
            (_, Some(node)) => Binding::Node(node),
            (MemoryPolicy::Coarse, None) => {
                Binding::Node(self.next_node.fetch_add(1, Ordering::Relaxed) % num_nodes)
            }
            (MemoryPolicy::Fine, None) => Binding::Interleave,
            (MemoryPolicy::Local, None) => Binding::Node(local_node.min(num_nodes - 1)),
        };
        let capacity = match binding {
            Binding::Node(node) => Some((node, self.topology.node_capacity(node))),
            _ => None,
        };
        if let Some((node, capacity)) = capacity {
            if size > capacity {
                return Err(RuntimeError::NodeCapacityExceeded {
                    node,
                    requested: size,
                    capacity,
                });
            }
        }

        let start = mmap_anon(size).map_err(RuntimeError::OutOfMemory)?;
        self.bind(start, size, binding);

        let info = AllocationInfo {
            start,
            size,
            binding,
        };
        self.registry.lock().unwrap().insert(start, info);
        self.total_allocated.fetch_add(size, Ordering::Relaxed);
        debug!("Allocated {} bytes at {} ({:?})", size, start, binding);
        Ok(start)
    }

    #[allow(unused_variables)]
    fn bind(&self, start: Address, size: usize, binding: Binding) {
        if !self.bind_enabled {
            return;
        }
        #[cfg(target_os = "linux")]
        {
            let num_nodes = self.topology.num_nodes();
            let result = match binding {
                Binding::Node(node) => mbind(start, size, MPOL_BIND, &[node], num_nodes),
                Binding::Interleave => {
                    let all: Vec<NodeId> = (0..num_nodes).collect();
                    mbind(start, size, MPOL_INTERLEAVE, &all, num_nodes)
                }
                Binding::Os => Ok(()),
            };
            if let Err(e) = result {
                match e.raw_os_error() {
                    // No NUMA support in this kernel or container, or the node is only known to
                    // a synthetic topology. The memory stays usable with default placement.
                    Some(libc::ENOSYS) | Some(libc::EPERM) | Some(libc::EINVAL) => {
                        debug!("mbind({}, {}) unavailable: {}", start, size, e)
                    }
                    _ => warn!("mbind({}, {}) failed: {}", start, size, e),
                }
            }
        }
    }

    /// Free an allocation made by [`NumaAllocator::allocate`].  `size` must be the size that was
    /// asked for (it is rounded the same way).
    pub fn release(&self, start: Address, size: usize) -> Result<()> {
        let info = self
            .registry
            .lock()
            .unwrap()
            .remove(&start)
            .ok_or(RuntimeError::UnknownAllocation(start))?;
        debug_assert_eq!(Some(info.size), page_align_up(size));
        self.total_allocated.fetch_sub(info.size, Ordering::Relaxed);
        munmap(start, info.size).map_err(RuntimeError::OutOfMemory)?;
        debug!("Released {} bytes at {}", info.size, start);
        Ok(())
    }

    /// The live allocation containing `addr`.
    pub fn lookup(&self, addr: Address) -> Option<AllocationInfo> {
        let registry = self.registry.lock().unwrap();
        registry
            .range(..=addr)
            .next_back()
            .map(|(_, info)| *info)
            .filter(|info| addr.is_in_range(info.start, info.size))
    }

    /// The node backing `addr`, from the registry or else from the kernel.
    pub fn node_of(&self, addr: Address) -> Option<NodeId> {
        let num_nodes = self.topology.num_nodes();
        if let Some(node) = self.lookup(addr).and_then(|info| info.node_of(addr, num_nodes)) {
            return Some(node);
        }
        self.query_page_node(addr)
    }

    /// Ask the kernel for the node of the page containing `addr`.  Pages that have not been
    /// touched yet have no node.
    pub fn query_page_node(&self, addr: Address) -> Option<NodeId> {
        if !self.bind_enabled {
            return None;
        }
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                get_mempolicy_node(addr).filter(|&n| n < self.topology.num_nodes())
            } else {
                let _ = addr;
                None
            }
        }
    }

    /// Bytes currently allocated and not released.
    pub fn total_allocated(&self) -> usize {
        self.total_allocated.load(Ordering::Relaxed)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }
}

impl Drop for NumaAllocator {
    fn drop(&mut self) {
        let registry = self.registry.get_mut().unwrap();
        if !registry.is_empty() {
            debug!(
                "{} allocations ({} bytes) were not released",
                registry.len(),
                self.total_allocated.load(Ordering::Relaxed)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(nodes: usize, policy: MemoryPolicy) -> NumaAllocator {
        NumaAllocator::new(Arc::new(Topology::uniform(nodes, 2)), policy)
    }

    #[test]
    fn allocate_and_release() {
        let a = allocator(1, MemoryPolicy::Coarse);
        let start = a.allocate(100, None, 0).unwrap();
        assert!(start.is_aligned_to(BYTES_IN_PAGE));
        assert_eq!(a.total_allocated(), BYTES_IN_PAGE);
        // The memory is usable and zeroed.
        unsafe {
            let p = start.to_mut_ptr::<u8>();
            assert_eq!(*p.add(99), 0);
            *p.add(99) = 42;
        }
        assert_eq!(a.node_of(start + 99usize), Some(0));
        a.release(start, 100).unwrap();
        assert_eq!(a.total_allocated(), 0);
        assert!(a.lookup(start).is_none());
    }

    #[test]
    fn coarse_rotates_nodes() {
        let a = allocator(2, MemoryPolicy::Coarse);
        let x = a.allocate(BYTES_IN_PAGE, None, 0).unwrap();
        let y = a.allocate(BYTES_IN_PAGE, None, 0).unwrap();
        assert_eq!(a.lookup(x).unwrap().binding, Binding::Node(0));
        assert_eq!(a.lookup(y).unwrap().binding, Binding::Node(1));
        a.release(x, BYTES_IN_PAGE).unwrap();
        a.release(y, BYTES_IN_PAGE).unwrap();
    }

    #[test]
    fn hint_and_local_policy() {
        let a = allocator(2, MemoryPolicy::Local);
        let x = a.allocate(1, None, 1).unwrap();
        assert_eq!(a.node_of(x), Some(1));
        let y = a.allocate(1, Some(0), 1).unwrap();
        assert_eq!(a.node_of(y), Some(0));
        a.release(x, 1).unwrap();
        a.release(y, 1).unwrap();
    }

    #[test]
    fn fine_interleaves_pages() {
        let a = allocator(2, MemoryPolicy::Fine);
        let x = a.allocate(4 * BYTES_IN_PAGE, None, 0).unwrap();
        assert_eq!(a.node_of(x), Some(0));
        assert_eq!(a.node_of(x + BYTES_IN_PAGE), Some(1));
        assert_eq!(a.node_of(x + 2 * BYTES_IN_PAGE + 8), Some(0));
        a.release(x, 4 * BYTES_IN_PAGE).unwrap();
    }

    #[test]
    fn system_policy_has_no_binding() {
        let a = allocator(2, MemoryPolicy::System);
        let x = a.allocate(10, Some(1), 0).unwrap();
        assert_eq!(a.lookup(x).unwrap().binding, Binding::Os);
        a.release(x, 10).unwrap();
    }

    #[test]
    fn invalid_requests() {
        let a = allocator(2, MemoryPolicy::Coarse);
        assert!(matches!(a.allocate(0, None, 0), Err(RuntimeError::ZeroSize)));
        assert!(matches!(
            a.allocate(8, Some(2), 0),
            Err(RuntimeError::InvalidNode {
                node: 2,
                available: 2
            })
        ));
        let capacity = a.topology().node_capacity(0);
        assert!(matches!(
            a.allocate(capacity + BYTES_IN_PAGE, Some(0), 0),
            Err(RuntimeError::NodeCapacityExceeded { node: 0, .. })
        ));
        assert!(matches!(
            a.release(unsafe { Address::from_usize(BYTES_IN_PAGE) }, 1),
            Err(RuntimeError::UnknownAllocation(_))
        ));
        for policy in [MemoryPolicy::Coarse, MemoryPolicy::System] {
            let a = allocator(2, policy);
            assert!(matches!(
                a.allocate(usize::MAX - 10, None, 0),
                Err(RuntimeError::OutOfMemory(_))
            ));
            assert_eq!(a.total_allocated(), 0);
        }
    }

    #[test]
    fn page_rounding() {
        assert_eq!(page_align_up(1), Some(BYTES_IN_PAGE));
        assert_eq!(page_align_up(BYTES_IN_PAGE), Some(BYTES_IN_PAGE));
        assert_eq!(page_align_up(BYTES_IN_PAGE + 1), Some(2 * BYTES_IN_PAGE));
        assert_eq!(page_align_up(usize::MAX - BYTES_IN_PAGE + 1), Some(usize::MAX - BYTES_IN_PAGE + 1));
        assert_eq!(page_align_up(usize::MAX - 10), None);
    }

    #[test]
    fn concurrent_allocation() {
        let a = allocator(2, MemoryPolicy::Coarse);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for i in 1..50 {
                        let x = a.allocate(i * 100, None, 0).unwrap();
                        a.release(x, i * 100).unwrap();
                    }
                });
            }
        });
        assert_eq!(a.total_allocated(), 0);
    }
}
