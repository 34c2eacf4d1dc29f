//! Data footprints: which memory a task is going to touch, and how.
//!
//! A footprint only steers placement.  Overlapping footprints never order tasks.

use std::ops::Range;

use crate::util::topology::NodeId;
use crate::util::Address;

/// How a task accesses the memory of a footprint.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    /// Does the task modify the memory?
    pub fn writes(&self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

/// Rows `start..=end` of a row-major block of memory at `base`.  A row is `row_size` elements of
/// `element_size` bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Footprint {
    pub base: Address,
    pub row_size: usize,
    pub element_size: usize,
    pub start: usize,
    pub end: usize,
    pub access: AccessMode,
    /// Base of the allocation (or the enclosing footprint) `base` belongs to.
    pub part_of: Option<Address>,
}

impl Footprint {
    pub fn new(
        base: Address,
        row_size: usize,
        element_size: usize,
        start: usize,
        end: usize,
        access: AccessMode,
    ) -> Self {
        Footprint {
            base,
            row_size,
            element_size,
            start,
            end,
            access,
            part_of: None,
        }
    }

    /// A footprint of `bytes` contiguous bytes from `base`.
    pub fn bytes(base: Address, bytes: usize, access: AccessMode) -> Self {
        Self::new(base, bytes, 1, 0, 0, access)
    }

    /// A footprint covering a whole slice.
    pub fn of_slice<T>(slice: &[T], access: AccessMode) -> Self {
        Self::new(
            Address::from_ptr(slice.as_ptr()),
            slice.len(),
            std::mem::size_of::<T>(),
            0,
            0,
            access,
        )
    }

    /// Rows `start..=end` of the same block.
    pub fn rows(&self, start: usize, end: usize) -> Self {
        Footprint {
            start,
            end,
            ..*self
        }
    }

    pub fn part_of(self, enclosing: Address) -> Self {
        Footprint {
            part_of: Some(enclosing),
            ..self
        }
    }

    fn row_bytes(&self) -> Option<usize> {
        self.row_size.checked_mul(self.element_size)
    }

    /// Number of bytes covered.  `None` if the rows are reversed or the size does not fit the
    /// address space.
    pub fn size(&self) -> Option<usize> {
        let rows = self.end.checked_sub(self.start)?.checked_add(1)?;
        rows.checked_mul(self.row_bytes()?)
    }

    /// First byte covered.
    pub fn start_address(&self) -> Option<Address> {
        let offset = self.start.checked_mul(self.row_bytes()?)?;
        let start = self.base.as_usize().checked_add(offset)?;
        // SAFETY: Only the value is computed here.
        Some(unsafe { Address::from_usize(start) })
    }

    /// The byte range covered, if it lies within the address space.
    pub fn range(&self) -> Option<Range<Address>> {
        let start = self.start_address()?;
        let end = start.as_usize().checked_add(self.size()?)?;
        // SAFETY: As above.
        Some(start..unsafe { Address::from_usize(end) })
    }
}

/// Bytes per NUMA node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeDistribution {
    bytes: Vec<u64>,
}

impl NodeDistribution {
    pub fn new(num_nodes: usize) -> Self {
        NodeDistribution {
            bytes: vec![0; num_nodes],
        }
    }

    pub fn from_bytes(bytes: Vec<u64>) -> Self {
        NodeDistribution { bytes }
    }

    pub fn add(&mut self, node: NodeId, bytes: u64) {
        self.bytes[node] = self.bytes[node].saturating_add(bytes);
    }

    pub fn total(&self) -> u64 {
        self.bytes.iter().fold(0, |sum, b| sum.saturating_add(*b))
    }

    pub fn bytes(&self) -> &[u64] {
        &self.bytes
    }

    /// Are the bytes spread evenly over every node holding any?  A distribution over a single
    /// node is not uniform.
    pub fn is_uniform(&self) -> bool {
        let mut holding = self.bytes.iter().filter(|b| **b > 0);
        match holding.next() {
            None => true,
            Some(first) => {
                let mut count = 1;
                for b in holding {
                    if b != first {
                        return false;
                    }
                    count += 1;
                }
                count > 1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_range() {
        let base = unsafe { Address::from_usize(0x10000) };
        let f = Footprint::new(base, 100, 8, 2, 4, AccessMode::Read);
        assert_eq!(f.size(), Some(3 * 800));
        assert_eq!(f.start_address(), Some(base + 1600));
        assert_eq!(f.range().map(|r| r.end), Some(base + 4000));

        let g = f.rows(0, 0);
        assert_eq!(g.size(), Some(800));
        assert_eq!(g.start_address(), Some(base));
    }

    #[test]
    fn unresolvable_footprints() {
        let base = unsafe { Address::from_usize(0x10000) };
        let huge = Footprint::new(base, usize::MAX / 2, 4, 0, 0, AccessMode::Read);
        assert_eq!(huge.size(), None);
        assert_eq!(huge.range(), None);

        let reversed = Footprint::new(base, 10, 8, 4, 2, AccessMode::Write);
        assert_eq!(reversed.size(), None);
        assert_eq!(reversed.start_address(), Some(base + 320));
        assert_eq!(reversed.range(), None);

        let past_the_end = Footprint::bytes(base, usize::MAX - 0x1000, AccessMode::Read);
        assert_eq!(past_the_end.size(), Some(usize::MAX - 0x1000));
        assert_eq!(past_the_end.range(), None);

        let mut d = NodeDistribution::new(1);
        d.add(0, u64::MAX);
        d.add(0, 1);
        assert_eq!(d.total(), u64::MAX);
    }

    #[test]
    fn slice_footprint() {
        let data = vec![0u32; 64];
        let f = Footprint::of_slice(&data, AccessMode::Write);
        assert_eq!(f.size(), Some(256));
        assert!(f.access.writes());
        assert!(!AccessMode::Read.writes());
    }

    #[test]
    fn uniform_distributions() {
        assert!(NodeDistribution::from_bytes(vec![0, 0]).is_uniform());
        assert!(NodeDistribution::from_bytes(vec![4096, 4096]).is_uniform());
        assert!(NodeDistribution::from_bytes(vec![4096, 0, 4096]).is_uniform());
        assert!(!NodeDistribution::from_bytes(vec![4096, 0]).is_uniform());
        assert!(!NodeDistribution::from_bytes(vec![4096, 8192]).is_uniform());

        let mut d = NodeDistribution::new(2);
        d.add(1, 10);
        d.add(1, 5);
        assert_eq!(d.total(), 15);
        assert_eq!(d.bytes(), &[0, 15]);
    }
}
