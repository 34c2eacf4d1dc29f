use crossbeam::utils::Backoff;
use std::time::Duration;

/// Backoff for a worker that found nothing to do.
///
/// It first spins and yields through [`crossbeam::utils::Backoff`].  Once that is exhausted it
/// sleeps, doubling the sleep from `reset_us` up to `roof_us` microseconds.
pub struct IdleBackoff {
    spin: Backoff,
    sleep_us: u64,
    reset_us: u64,
    roof_us: u64,
}

impl IdleBackoff {
    pub fn new(reset_us: u64, roof_us: u64) -> Self {
        debug_assert!(reset_us > 0 && reset_us <= roof_us);
        IdleBackoff {
            spin: Backoff::new(),
            sleep_us: reset_us,
            reset_us,
            roof_us,
        }
    }

    /// Wait a little.  Each call waits at least as long as the previous one.
    pub fn snooze(&mut self) {
        if !self.spin.is_completed() {
            self.spin.snooze();
        } else {
            std::thread::sleep(Duration::from_micros(self.sleep_us));
            self.sleep_us = (self.sleep_us * 2).min(self.roof_us);
        }
    }

    /// Has spinning given way to sleeping?
    pub fn is_sleeping(&self) -> bool {
        self.spin.is_completed()
    }

    /// Has the sleep reached its upper bound?
    pub fn is_at_roof(&self) -> bool {
        self.is_sleeping() && self.sleep_us >= self.roof_us
    }

    pub fn current_sleep_us(&self) -> u64 {
        self.sleep_us
    }

    /// Start over after finding work.
    pub fn reset(&mut self) {
        self.spin.reset();
        self.sleep_us = self.reset_us;
    }
}
