//! Memory management: the physical frame allocator, page-table plumbing and
//! per-process address spaces.

mod aspace;
pub mod elf;
pub mod frame;
mod paging;

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub use aspace::{AddrSpace, MapFlags, MappingRange, check_userland_mappability};
pub use frame::{FrameStats, UsableRegion};

use spin::Once;

/// Offset of the direct physical-memory window in the kernel half.
static PHYS_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// The boot page-table root; every map shares its kernel half.
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

static KERNEL_TEMPLATE: Once<[u64; 256]> = Once::new();

/// Kernel-virtual pointer to the physical address `paddr`.
#[inline]
pub fn phys_to_virt(paddr: u64) -> *mut u8 {
    (PHYS_OFFSET.load(Ordering::Relaxed) as u64 + paddr) as *mut u8
}

/// Initialise memory management from the boot handoff: the direct-map
/// offset and the usable regions of the memory map. Captures the running
/// kernel mapping as the shared template for all address spaces.
pub fn init(phys_offset: usize, regions: &[UsableRegion]) {
    PHYS_OFFSET.store(phys_offset, Ordering::Relaxed);
    frame::init(regions);

    let root = crate::arch::read_page_table_root();
    KERNEL_ROOT.store(root, Ordering::Relaxed);
    KERNEL_TEMPLATE.call_once(|| {
        let mut template = [0u64; 256];
        if root != 0 {
            let entries = phys_to_virt(root) as *const u64;
            for (i, slot) in template.iter_mut().enumerate() {
                *slot = unsafe { entries.add(256 + i).read() };
            }
        }
        template
    });
}

/// The shared kernel half, as raw top-level entries.
pub(crate) fn kernel_template() -> &'static [u64; 256] {
    KERNEL_TEMPLATE.call_once(|| [0u64; 256])
}

/// Physical root of the kernel-only page tables, safe to load while tearing
/// down a user map.
pub fn kernel_root_paddr() -> u64 {
    KERNEL_ROOT.load(Ordering::Relaxed)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::PAGE_SIZE;

    /// Point the "physical" allocator at a leaked heap arena so page-table
    /// code runs on the host with identity translation.
    pub fn init_test_arena() {
        static ARENA: Once<u64> = Once::new();
        let base = *ARENA.call_once(|| {
            let layout =
                std::alloc::Layout::from_size_align(32 * 1024 * 1024, PAGE_SIZE).unwrap();
            unsafe { std::alloc::alloc_zeroed(layout) as u64 }
        });
        init(
            0,
            &[UsableRegion {
                base,
                length: 32 * 1024 * 1024,
            }],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PAGE_SIZE, USER_SPACE_TOP};

    fn new_space() -> AddrSpace {
        testing::init_test_arena();
        AddrSpace::new_map().unwrap()
    }

    #[test]
    fn map_then_translate() {
        let mut space = new_space();
        let frames = frame::alloc(4).unwrap();
        space
            .map_range(0x40_0000, frames, 4 * PAGE_SIZE, MapFlags::USER_ACCESSIBLE)
            .unwrap();
        for k in [0usize, 1, PAGE_SIZE, 3 * PAGE_SIZE + 7] {
            assert_eq!(space.virtual_to_physical(0x40_0000 + k), frames + k as u64);
        }
        space.unmap_range(0x40_0000, 4 * PAGE_SIZE).unwrap();
        for k in [0usize, PAGE_SIZE, 3 * PAGE_SIZE] {
            assert_eq!(space.virtual_to_physical(0x40_0000 + k), 0);
        }
        frame::free(frames);
    }

    #[test]
    fn overlapping_map_is_rejected() {
        let mut space = new_space();
        space
            .map_alloc(0x50_0000, 2 * PAGE_SIZE, MapFlags::USER_ACCESSIBLE)
            .unwrap();
        assert!(
            space
                .map_alloc(0x50_1000, PAGE_SIZE, MapFlags::USER_ACCESSIBLE)
                .is_err()
        );
    }

    #[test]
    fn fork_copies_and_isolates() {
        let mut parent = new_space();
        parent
            .map_alloc(0x60_0000, PAGE_SIZE, MapFlags::USER_ACCESSIBLE)
            .unwrap();
        parent.write(0x60_0000, b"parent bytes").unwrap();

        let child = parent.fork_map().unwrap();
        let mut buf = [0u8; 12];
        child.read(0x60_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"parent bytes");

        child.write(0x60_0000, b"child  bytes").unwrap();
        parent.read(0x60_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"parent bytes");
    }

    #[test]
    fn access_checks() {
        let mut space = new_space();
        space
            .map_alloc(0x70_0000, 2 * PAGE_SIZE, MapFlags::USER_ACCESSIBLE)
            .unwrap();
        assert!(space.check_userland_access(0x70_0000, 2 * PAGE_SIZE));
        assert!(space.check_userland_access(0x70_0fff, 2));
        assert!(!space.check_userland_access(0x70_0000, 2 * PAGE_SIZE + 1));
        assert!(!space.check_userland_access(0x90_0000, 1));

        assert!(check_userland_mappability(0x70_0000, PAGE_SIZE));
        assert!(!check_userland_mappability(USER_SPACE_TOP, PAGE_SIZE));
        assert!(!check_userland_mappability(0xffff_8000_dead_0000, 16));
    }

    #[test]
    fn remap_splits_bookkeeping() {
        let mut space = new_space();
        space
            .map_alloc(
                0x80_0000,
                4 * PAGE_SIZE,
                MapFlags::USER_ACCESSIBLE,
            )
            .unwrap();
        space
            .remap_range(
                0x80_1000,
                PAGE_SIZE,
                MapFlags::USER_ACCESSIBLE | MapFlags::READ_ONLY,
            )
            .unwrap();
        assert_eq!(space.ranges().len(), 3);
        // Remapping outside any single range fails.
        assert!(
            space
                .remap_range(0x80_3000, 2 * PAGE_SIZE, MapFlags::USER_ACCESSIBLE)
                .is_err()
        );
    }

    #[test]
    fn partial_unmap_keeps_tails() {
        let mut space = new_space();
        space
            .map_alloc(0xa0_0000, 3 * PAGE_SIZE, MapFlags::USER_ACCESSIBLE)
            .unwrap();
        space.unmap_range(0xa0_1000, PAGE_SIZE).unwrap();
        assert_ne!(space.virtual_to_physical(0xa0_0000), 0);
        assert_eq!(space.virtual_to_physical(0xa0_1000), 0);
        assert_ne!(space.virtual_to_physical(0xa0_2000), 0);
        assert_eq!(space.ranges().len(), 2);
    }
}
