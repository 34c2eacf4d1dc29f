/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// SLIT distance of a node to itself.
pub const LOCAL_NODE_DISTANCE: u32 = 10;
/// SLIT distance used for synthetic topologies between two different nodes.
pub const REMOTE_NODE_DISTANCE: u32 = 20;

/// Last-level cache size assumed when the machine does not report one.
pub const DEFAULT_LLC_SIZE: usize = 8 * BYTES_IN_MBYTE;

/// Default capacity of the task arena.
pub const DEFAULT_TASK_CAPACITY: usize = 1 << 20;

/// Slots per chunk of the task arena.
pub const LOG_TASK_ARENA_CHUNK: usize = 12;
pub const TASK_ARENA_CHUNK: usize = 1 << LOG_TASK_ARENA_CHUNK;

/// Failed scheduling rounds before an idle pool worker parks.
pub const IDLE_ROUNDS_BEFORE_PARK: usize = 64;

/// Default name of the worker statistics file.
pub const DEFAULT_STATS_FILE: &str = "mirt-worker-stats.csv";

/// Default name of the task statistics file.
pub const DEFAULT_TASK_STATS_FILE: &str = "mirt-task-stats.csv";
