use std::sync::atomic::{AtomicU64, Ordering};

/// Elects one member of a team for each `single` construct.
///
/// Members count the `single` constructs they encounter.  The member that moves the ticket from
/// `k - 1` to `k` runs the `k`-th construct.  Everybody else finds the ticket already at `k` (or
/// beyond, with `nowait`) and skips it.
#[derive(Default)]
pub struct SingleGate {
    ticket: AtomicU64,
}

impl SingleGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to win construct number `seen` (counting from 1).
    pub fn try_enter(&self, seen: u64) -> bool {
        debug_assert!(seen > 0);
        self.ticket
            .compare_exchange(seen - 1, seen, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
