//! Utilities used by the rest of the runtime.

mod address;
pub use self::address::Address;
pub use self::address::ByteSize;

/// Idle backoff of workers.
pub mod backoff;
/// Constants used in mirt.
pub mod constants;
/// Errors reported by the runtime.
pub mod error;
/// The built-in logger.
pub mod logger;
/// The NUMA allocator.
pub mod memory;
/// Runtime options and configuration providers.
pub mod options;
/// The machine topology.
pub mod topology;

#[cfg(any(test, feature = "test_private"))]
pub mod test_util;
