use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

const ARRIVALS_MASK: u64 = (1 << 32) - 1;

/// The barrier of a team.
///
/// The upper half of `state` is the generation, the lower half counts the members that have
/// arrived in that generation.  Whoever sees the last arrival and is allowed to release bumps the
/// generation, which lets every waiter go.
pub struct TeamBarrier {
    state: CachePadded<AtomicU64>,
    size: usize,
}

impl TeamBarrier {
    pub fn new(size: usize) -> Self {
        debug_assert!(size > 0 && (size as u64) < ARRIVALS_MASK);
        TeamBarrier {
            state: CachePadded::new(AtomicU64::new(0)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn generation(&self) -> u32 {
        (self.state.load(Ordering::Acquire) >> 32) as u32
    }

    /// Arrive and wait until every member of the team has arrived and `can_release` holds.
    ///
    /// `idle` is called on every round the barrier is not released.  It is expected to run
    /// pending tasks or back off.
    pub fn arrive_and_wait(&self, can_release: impl Fn() -> bool, mut idle: impl FnMut()) {
        let arrived = self.state.fetch_add(1, Ordering::AcqRel) + 1;
        let generation = arrived >> 32;
        debug_assert!((arrived & ARRIVALS_MASK) as usize <= self.size);

        loop {
            let current = self.state.load(Ordering::Acquire);
            if current >> 32 != generation {
                return;
            }
            if (current & ARRIVALS_MASK) as usize == self.size
                && can_release()
                && self
                    .state
                    .compare_exchange(
                        current,
                        (generation + 1) << 32,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                trace!("Barrier generation {} released", generation);
                return;
            }
            idle();
        }
    }
}
