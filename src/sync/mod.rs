//! Synchronization primitives used by teams: the team barrier, `critical` sections and the
//! election of `single` constructs.
//!
//! Task-wait is a method of [`crate::Worker`], since it needs the worker to run other tasks while
//! waiting.

mod barrier;
pub use barrier::TeamBarrier;

mod critical;
pub use critical::CriticalSections;

mod single;
pub use single::SingleGate;
