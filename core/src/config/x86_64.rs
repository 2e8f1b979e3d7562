//! Memory layout for the x86_64 target.

/// Lowest mappable user address. The zero page is never mapped so null
/// dereferences fault.
pub const USER_SPACE_BASE: usize = 0x1000;

/// One past the highest mappable user address (bottom of the canonical
/// hole, minus a guard page).
pub const USER_SPACE_TOP: usize = 0x0000_7fff_ffff_f000;

/// Start of the kernel half of every address space.
pub const KERNEL_SPACE_BASE: usize = 0xffff_8000_0000_0000;

/// Where executable images are placed.
pub const USER_IMAGE_BASE: usize = 0x0000_0000_0040_0000;

/// Top of the user stack.
pub const USER_STACK_TOP: usize = 0x0000_7fff_ffff_f000;

/// Size of the user stack.
pub const USER_STACK_SIZE: usize = 0x100000;

/// Lowest address handed out for anonymous mappings; the per-process
/// allocation base starts here plus an ASLR offset.
pub const USER_MMAP_BASE: usize = 0x0000_6000_0000_0000;

/// Span of the ASLR jitter applied to the allocation base.
pub const ASLR_JITTER: usize = 0x4000_0000;
