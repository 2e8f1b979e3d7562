//! Bitmap-backed physical page-frame allocator.

use alloc::vec::Vec;

use axerrno::{LinuxError, LinuxResult};
use hashbrown::HashMap;
use kspin::SpinNoIrq;

use crate::config::PAGE_SIZE;

/// A physical region the allocator may hand out, as reported by the boot
/// memory map.
#[derive(Debug, Clone, Copy)]
pub struct UsableRegion {
    pub base: u64,
    pub length: u64,
}

/// Frame-count statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
    pub used: usize,
}

struct FrameAllocator {
    /// Physical address of frame index 0.
    base: u64,
    /// One bit per frame; set means allocated (or unusable).
    bitmap: Vec<u64>,
    frames: usize,
    free: usize,
    /// Run length of each allocation, keyed by its base.
    lengths: HashMap<u64, usize>,
}

static ALLOCATOR: SpinNoIrq<Option<FrameAllocator>> = SpinNoIrq::new(None);

impl FrameAllocator {
    fn new(regions: &[UsableRegion]) -> Self {
        let base = regions
            .iter()
            .map(|r| r.base)
            .min()
            .unwrap_or(0)
            .next_multiple_of(PAGE_SIZE as u64);
        let end = regions
            .iter()
            .map(|r| r.base + r.length)
            .max()
            .unwrap_or(base)
            & !(PAGE_SIZE as u64 - 1);
        let frames = ((end.saturating_sub(base)) / PAGE_SIZE as u64) as usize;

        // Everything starts out allocated; usable regions are then released.
        let mut this = Self {
            base,
            bitmap: alloc::vec![!0u64; frames.div_ceil(64)],
            frames,
            free: 0,
            lengths: HashMap::new(),
        };
        for region in regions {
            let first = region.base.next_multiple_of(PAGE_SIZE as u64);
            let last = (region.base + region.length) & !(PAGE_SIZE as u64 - 1);
            let mut addr = first;
            while addr < last {
                let idx = ((addr - base) / PAGE_SIZE as u64) as usize;
                if this.test(idx) {
                    this.clear(idx);
                    this.free += 1;
                }
                addr += PAGE_SIZE as u64;
            }
        }
        this
    }

    fn test(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set(&mut self, idx: usize) {
        self.bitmap[idx / 64] |= 1 << (idx % 64);
    }

    fn clear(&mut self, idx: usize) {
        self.bitmap[idx / 64] &= !(1 << (idx % 64));
    }

    /// First-fit scan for `pages` contiguous clear bits.
    fn find_run(&self, pages: usize) -> Option<usize> {
        let mut run = 0;
        for idx in 0..self.frames {
            if self.test(idx) {
                run = 0;
            } else {
                run += 1;
                if run == pages {
                    return Some(idx + 1 - pages);
                }
            }
        }
        None
    }

    fn alloc(&mut self, pages: usize) -> LinuxResult<u64> {
        if pages == 0 || pages > self.free {
            return Err(LinuxError::ENOMEM);
        }
        let start = self.find_run(pages).ok_or(LinuxError::ENOMEM)?;
        for idx in start..start + pages {
            self.set(idx);
        }
        self.free -= pages;
        let base = self.base + (start * PAGE_SIZE) as u64;
        self.lengths.insert(base, pages);
        Ok(base)
    }

    fn free_run(&mut self, base: u64, pages: usize) {
        let start = ((base - self.base) / PAGE_SIZE as u64) as usize;
        for idx in start..start + pages {
            if self.test(idx) {
                self.clear(idx);
                self.free += 1;
            }
        }
        self.lengths.remove(&base);
    }
}

/// Initialise the allocator from the boot memory map. Idempotent: a second
/// call is ignored so the boot path and unit tests can share it.
pub fn init(regions: &[UsableRegion]) {
    let mut guard = ALLOCATOR.lock();
    if guard.is_none() {
        let alloc = FrameAllocator::new(regions);
        info!(
            "frame allocator: {} frames at {:#x}",
            alloc.frames, alloc.base
        );
        *guard = Some(alloc);
    }
}

/// Allocate `pages` contiguous, zeroed, page-aligned frames.
pub fn alloc(pages: usize) -> LinuxResult<u64> {
    let base = ALLOCATOR
        .lock()
        .as_mut()
        .ok_or(LinuxError::ENOMEM)?
        .alloc(pages)?;
    unsafe {
        core::ptr::write_bytes(super::phys_to_virt(base), 0, pages * PAGE_SIZE);
    }
    Ok(base)
}

/// Release the run that [`alloc`] returned `base` for.
pub fn free(base: u64) {
    let mut guard = ALLOCATOR.lock();
    if let Some(alloc) = guard.as_mut()
        && let Some(pages) = alloc.lengths.get(&base).copied()
    {
        alloc.free_run(base, pages);
    }
}

/// Release an explicit sub-run. Used by the VMM, which tracks run lengths in
/// its mapping ranges and may free an allocation piecewise.
pub(crate) fn free_run(base: u64, pages: usize) {
    if let Some(alloc) = ALLOCATOR.lock().as_mut() {
        alloc.free_run(base, pages);
    }
}

/// Current frame statistics.
pub fn stats() -> FrameStats {
    match ALLOCATOR.lock().as_ref() {
        Some(alloc) => FrameStats {
            total: alloc.frames,
            free: alloc.free,
            used: alloc.frames - alloc.free,
        },
        None => FrameStats {
            total: 0,
            free: 0,
            used: 0,
        },
    }
}
