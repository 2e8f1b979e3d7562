//! Per-process address spaces.
//!
//! An [`AddrSpace`] is a top-level page table plus a bounded list of
//! [`MappingRange`]s. Ranges are disjoint, lie entirely in user space and,
//! when `is_allocated` is set, own their backing frames: dropping the space
//! (or unmapping the range) is what returns them to the frame allocator.

use alloc::vec::Vec;

use axerrno::{LinuxError, LinuxResult};
use x86_64::structures::paging::PageTableFlags;

use super::{frame, paging::PageTableDir, phys_to_virt};
use crate::config::{MAX_MAP_RANGES, PAGE_SIZE, USER_SPACE_BASE, USER_SPACE_TOP};

bitflags::bitflags! {
    /// Permissions of a mapping range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Accessible from user mode.
        const USER_ACCESSIBLE = 1 << 0;
        /// Writes fault.
        const READ_ONLY = 1 << 1;
        /// Instruction fetches are allowed.
        const EXECUTABLE = 1 << 2;
        /// Survives address-space switches in the TLB.
        const GLOBAL = 1 << 3;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 4;
    }
}

impl MapFlags {
    fn to_pte(self) -> PageTableFlags {
        let mut pte = PageTableFlags::PRESENT;
        if self.contains(MapFlags::USER_ACCESSIBLE) {
            pte |= PageTableFlags::USER_ACCESSIBLE;
        }
        if !self.contains(MapFlags::READ_ONLY) {
            pte |= PageTableFlags::WRITABLE;
        }
        if !self.contains(MapFlags::EXECUTABLE) {
            pte |= PageTableFlags::NO_EXECUTE;
        }
        if self.contains(MapFlags::GLOBAL) {
            pte |= PageTableFlags::GLOBAL;
        }
        if self.contains(MapFlags::WRITE_THROUGH) {
            pte |= PageTableFlags::WRITE_THROUGH;
        }
        pte
    }
}

/// A contiguous, permission-uniform region of an address space.
#[derive(Debug, Clone)]
pub struct MappingRange {
    pub vstart: usize,
    pub pstart: u64,
    pub len: usize,
    pub flags: MapFlags,
    /// Whether the VMM owns the backing frames.
    pub is_allocated: bool,
}

impl MappingRange {
    fn vend(&self) -> usize {
        self.vstart + self.len
    }

    fn overlaps(&self, vstart: usize, len: usize) -> bool {
        vstart < self.vend() && self.vstart < vstart + len
    }
}

/// Returns true iff `[addr, addr + len)` lies wholly inside user space,
/// independent of any particular map. Used to reject hostile placement
/// hints before touching page tables.
pub fn check_userland_mappability(addr: usize, len: usize) -> bool {
    let Some(end) = addr.checked_add(len) else {
        return false;
    };
    addr >= USER_SPACE_BASE && end <= USER_SPACE_TOP
}

/// A user address space: page tables plus range bookkeeping. The kernel
/// half is shared by reference across all spaces.
pub struct AddrSpace {
    table: PageTableDir,
    ranges: Vec<MappingRange>,
}

// The raw table pointer inside is only dereferenced under the owning
// process's address-space lock.
unsafe impl Send for AddrSpace {}
unsafe impl Sync for AddrSpace {}

impl AddrSpace {
    /// A fresh map containing only the shared kernel mapping.
    pub fn new_map() -> LinuxResult<Self> {
        let mut table = PageTableDir::new()?;
        table.install_kernel_half(super::kernel_template());
        Ok(Self {
            table,
            ranges: Vec::new(),
        })
    }

    /// Physical address of the top-level table, for loading into CR3.
    pub fn root_paddr(&self) -> u64 {
        self.table.root_paddr()
    }

    /// The recorded mapping ranges, low to high.
    pub fn ranges(&self) -> &[MappingRange] {
        &self.ranges
    }

    fn check_layout(vstart: usize, len: usize) -> LinuxResult<()> {
        if len == 0 || vstart % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 {
            return Err(LinuxError::EINVAL);
        }
        if !check_userland_mappability(vstart, len) {
            return Err(LinuxError::EFAULT);
        }
        Ok(())
    }

    fn insert_range(&mut self, range: MappingRange) -> LinuxResult<()> {
        if self.ranges.len() >= MAX_MAP_RANGES {
            return Err(LinuxError::ENOMEM);
        }
        if self.ranges.iter().any(|r| r.overlaps(range.vstart, range.len)) {
            return Err(LinuxError::EINVAL);
        }
        let at = self
            .ranges
            .partition_point(|r| r.vstart < range.vstart);
        self.ranges.insert(at, range);
        Ok(())
    }

    fn map_pages(&mut self, range: &MappingRange) -> LinuxResult<()> {
        let pte = range.flags.to_pte();
        for page in 0..range.len / PAGE_SIZE {
            let vaddr = range.vstart + page * PAGE_SIZE;
            let paddr = range.pstart + (page * PAGE_SIZE) as u64;
            if let Err(err) = self.table.map_4k(vaddr, paddr, pte) {
                // Roll back the pages mapped so far.
                for undo in 0..page {
                    self.table.unmap_4k(range.vstart + undo * PAGE_SIZE);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Insert a non-overlapping range backed by caller-owned frames.
    pub fn map_range(
        &mut self,
        vstart: usize,
        pstart: u64,
        len: usize,
        flags: MapFlags,
    ) -> LinuxResult<()> {
        Self::check_layout(vstart, len)?;
        let range = MappingRange {
            vstart,
            pstart,
            len,
            flags,
            is_allocated: false,
        };
        self.insert_range(range.clone())?;
        if let Err(err) = self.map_pages(&range) {
            self.ranges.retain(|r| r.vstart != vstart);
            return Err(err);
        }
        Ok(())
    }

    /// Allocate zeroed frames and map them at `vstart`. The space owns the
    /// frames and frees them on unmap or drop.
    pub fn map_alloc(&mut self, vstart: usize, len: usize, flags: MapFlags) -> LinuxResult<()> {
        Self::check_layout(vstart, len)?;
        let pstart = frame::alloc(len / PAGE_SIZE)?;
        let range = MappingRange {
            vstart,
            pstart,
            len,
            flags,
            is_allocated: true,
        };
        if let Err(err) = self.insert_range(range.clone()) {
            frame::free_run(pstart, len / PAGE_SIZE);
            return Err(err);
        }
        if let Err(err) = self.map_pages(&range) {
            self.ranges.retain(|r| r.vstart != vstart);
            frame::free_run(pstart, len / PAGE_SIZE);
            return Err(err);
        }
        Ok(())
    }

    /// Update the permissions of `[vstart, vstart + len)`. The interval must
    /// fall entirely inside one existing range.
    pub fn remap_range(&mut self, vstart: usize, len: usize, flags: MapFlags) -> LinuxResult<()> {
        Self::check_layout(vstart, len)?;
        let idx = self
            .ranges
            .iter()
            .position(|r| vstart >= r.vstart && vstart + len <= r.vend())
            .ok_or(LinuxError::EINVAL)?;

        let pte = flags.to_pte();
        for page in 0..len / PAGE_SIZE {
            if !self.table.protect_4k(vstart + page * PAGE_SIZE, pte) {
                return Err(LinuxError::EINVAL);
            }
        }

        // Split the bookkeeping so each range stays permission-uniform.
        let old = self.ranges.remove(idx);
        let mut pieces = Vec::new();
        if vstart > old.vstart {
            pieces.push(MappingRange {
                len: vstart - old.vstart,
                ..old.clone()
            });
        }
        pieces.push(MappingRange {
            vstart,
            pstart: old.pstart + (vstart - old.vstart) as u64,
            len,
            flags,
            is_allocated: old.is_allocated,
        });
        if vstart + len < old.vend() {
            pieces.push(MappingRange {
                vstart: vstart + len,
                pstart: old.pstart + (vstart + len - old.vstart) as u64,
                len: old.vend() - (vstart + len),
                flags: old.flags,
                is_allocated: old.is_allocated,
            });
        }
        for piece in pieces {
            let at = self.ranges.partition_point(|r| r.vstart < piece.vstart);
            self.ranges.insert(at, piece);
        }
        Ok(())
    }

    /// Remove every mapping intersecting `[vstart, vstart + len)`, clearing
    /// the page-table entries and freeing frames the space owns.
    pub fn unmap_range(&mut self, vstart: usize, len: usize) -> LinuxResult<()> {
        Self::check_layout(vstart, len)?;
        let end = vstart + len;

        let mut keep = Vec::new();
        for range in core::mem::take(&mut self.ranges) {
            if !range.overlaps(vstart, len) {
                keep.push(range);
                continue;
            }
            let cut_start = range.vstart.max(vstart);
            let cut_end = range.vend().min(end);
            for page_va in (cut_start..cut_end).step_by(PAGE_SIZE) {
                self.table.unmap_4k(page_va);
            }
            if range.is_allocated {
                let base = range.pstart + (cut_start - range.vstart) as u64;
                frame::free_run(base, (cut_end - cut_start) / PAGE_SIZE);
            }
            if range.vstart < cut_start {
                keep.push(MappingRange {
                    len: cut_start - range.vstart,
                    ..range.clone()
                });
            }
            if cut_end < range.vend() {
                keep.push(MappingRange {
                    vstart: cut_end,
                    pstart: range.pstart + (cut_end - range.vstart) as u64,
                    len: range.vend() - cut_end,
                    flags: range.flags,
                    is_allocated: range.is_allocated,
                });
            }
        }
        keep.sort_by_key(|r| r.vstart);
        self.ranges = keep;
        Ok(())
    }

    /// Deep-copy the user half: fresh frames, identical bytes and
    /// permissions. Non-owned ranges (device windows) alias the same frames.
    pub fn fork_map(&self) -> LinuxResult<Self> {
        let mut child = Self::new_map()?;
        for range in &self.ranges {
            if !range.is_allocated {
                child.map_range(range.vstart, range.pstart, range.len, range.flags)?;
                continue;
            }
            let pages = range.len / PAGE_SIZE;
            let pstart = frame::alloc(pages)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys_to_virt(range.pstart),
                    phys_to_virt(pstart),
                    range.len,
                );
            }
            let copy = MappingRange {
                pstart,
                is_allocated: true,
                ..range.clone()
            };
            if let Err(err) = child.insert_range(copy.clone()) {
                frame::free_run(pstart, pages);
                return Err(err);
            }
            if let Err(err) = child.map_pages(&copy) {
                frame::free_run(pstart, pages);
                return Err(err);
            }
        }
        Ok(child)
    }

    /// Page-walk a single address; 0 when unmapped.
    pub fn virtual_to_physical(&self, vaddr: usize) -> u64 {
        self.table.query(vaddr).unwrap_or(0)
    }

    /// True iff the full interval is mapped user-accessible in this space.
    pub fn check_userland_access(&self, addr: usize, len: usize) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        if len == 0 {
            return check_userland_mappability(addr, 1);
        }
        let mut at = addr;
        while at < end {
            match self
                .ranges
                .iter()
                .find(|r| r.flags.contains(MapFlags::USER_ACCESSIBLE) && r.vstart <= at && at < r.vend())
            {
                Some(range) => at = range.vend(),
                None => return false,
            }
        }
        true
    }

    /// Copy `data` into the space at `vaddr`, which must be mapped.
    pub fn write(&self, vaddr: usize, data: &[u8]) -> LinuxResult<()> {
        let mut written = 0;
        while written < data.len() {
            let va = vaddr + written;
            let pa = self.table.query(va).ok_or(LinuxError::EFAULT)?;
            let chunk = (PAGE_SIZE - va % PAGE_SIZE).min(data.len() - written);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data[written..].as_ptr(),
                    phys_to_virt(pa),
                    chunk,
                );
            }
            written += chunk;
        }
        Ok(())
    }

    /// Copy bytes out of the space at `vaddr` into `buf`.
    pub fn read(&self, vaddr: usize, buf: &mut [u8]) -> LinuxResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let va = vaddr + done;
            let pa = self.table.query(va).ok_or(LinuxError::EFAULT)?;
            let chunk = (PAGE_SIZE - va % PAGE_SIZE).min(buf.len() - done);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys_to_virt(pa),
                    buf[done..].as_mut_ptr(),
                    chunk,
                );
            }
            done += chunk;
        }
        Ok(())
    }

    /// Load this space's page tables on the executing core.
    ///
    /// # Safety
    /// The space must stay alive for as long as it is loaded.
    pub unsafe fn activate(&self) {
        unsafe { crate::arch::write_page_table_root(self.root_paddr()) };
    }
}

impl Drop for AddrSpace {
    /// The single free point: releases every owned frame, then the tables.
    /// Must never run for the currently-loaded map.
    fn drop(&mut self) {
        for range in &self.ranges {
            if range.is_allocated {
                frame::free_run(range.pstart, range.len / PAGE_SIZE);
            }
        }
        self.table.release();
    }
}
