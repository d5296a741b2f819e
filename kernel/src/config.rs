//! Kernel-wide configuration constants
//!
//! Pool sizes, the user-visible ABI constants, and layout parameters live
//! here so nothing else hard-codes a number.

/// Number of TCBs in the fixed thread pool
pub const MAX_THREADS: usize = 256;

/// Slots per CNode (k = 12)
pub const CNODE_SLOTS: usize = 4096;

/// Number of CNodes in the fixed pool
pub const MAX_CNODES: usize = 8;

/// Number of endpoint objects in the fixed pool
pub const MAX_ENDPOINTS: usize = 128;

/// Size of the Untyped region donated to the first user service
pub const INITIAL_UNTYPED_BYTES: u64 = 16 * 1024 * 1024;

/// Per-thread IPC scratch buffer size
pub const IPC_SCRATCH_BYTES: usize = 512;

/// Per-thread kernel stack size
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;

/// Root-table slot that maps the table onto itself
pub const RECURSIVE_SLOT: usize = 510;

/// Highest physical frame the bitmap allocator tracks (4 GiB of RAM)
pub const MAX_PHYS_FRAMES: usize = 1 << 20;

/// Periodic preemption frequency
pub const TIMER_HZ: u32 = 100;

/// Syscall numbers are valid in `1..SYSCALL_LIMIT`
pub const SYSCALL_LIMIT: u64 = 100;

/// Entries in the name-registration table
pub const MAX_NAMESPACE_ENTRIES: usize = 32;

/// Bytes of name carried by a registration (two argument words)
pub const NAMESPACE_NAME_BYTES: usize = 16;

/// Priority assigned to the idle thread (lowest; larger is lower)
pub const IDLE_PRIORITY: u8 = 255;

/// Compile-time log filter for the serial logger
pub const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;
