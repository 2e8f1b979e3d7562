//! Kernel configuration constants.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else {
        compile_error!("Unsupported architecture");
    }
}

/// Size of a page frame in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// Size of a kernel stack.
pub const KERNEL_STACK_SIZE: usize = 0x10000;

/// Maximum number of hardware cores the scheduler tracks.
pub const MAX_CPUS: usize = 16;

/// Maximum number of live processes.
pub const MAX_PROCESSES: usize = 256;

/// Maximum number of live threads across all processes.
pub const MAX_THREADS: usize = 512;

/// Number of slots in a process file-descriptor table.
pub const FD_LIMIT: usize = 128;

/// Maximum number of registered devices.
pub const MAX_DEVICES: usize = 64;

/// Maximum length of a registered device name, in bytes.
pub const DEVICE_NAME_MAX: usize = 64;

/// Maximum number of mounted filesystems.
pub const MAX_MOUNTS: usize = 16;

/// Maximum number of MAC filters per process.
pub const MAX_MAC_FILTERS: usize = 32;

/// Maximum number of mapping ranges per address space.
pub const MAX_MAP_RANGES: usize = 128;

/// Maximum length of a path, including the terminator.
pub const PATH_MAX: usize = 1024;

/// Bound on chained symbolic-link resolution.
pub const SYMLINK_HOPS: usize = 8;

/// Capacity of a pipe or PTY byte queue.
pub const PIPE_BUF_SIZE: usize = 0x10000;

/// Scheduler time-slice granted per unit of preference, in timer ticks.
pub const TICKS_PER_PREFERENCE: u64 = 1;

/// Period of the scheduler timer, in microseconds.
pub const TIMER_PERIOD_US: u64 = 1000;
