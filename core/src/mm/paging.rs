//! Four-level page-table plumbing for x86_64.
//!
//! [`PageTableDir`] owns the top-level table of one address space and the
//! intermediate tables it allocates during mapping. Leaf frames are never
//! owned here; the address-space layer frees them according to its range
//! bookkeeping.

use axerrno::{LinuxError, LinuxResult};
use x86_64::PhysAddr;
use x86_64::structures::paging::{PageTable, PageTableFlags};

use super::{frame, phys_to_virt};
use crate::config::PAGE_SIZE;

const ENTRIES: usize = 512;
/// First entry of the kernel half in a top-level table.
const KERNEL_L4_FIRST: usize = ENTRIES / 2;

fn l4_index(vaddr: usize) -> usize {
    (vaddr >> 39) & 0x1ff
}

fn table_index(vaddr: usize, level: usize) -> usize {
    (vaddr >> (12 + 9 * level)) & 0x1ff
}

unsafe fn table_at<'a>(paddr: u64) -> &'a mut PageTable {
    unsafe { &mut *(phys_to_virt(paddr) as *mut PageTable) }
}

/// The page-table hierarchy of a single address space.
pub(crate) struct PageTableDir {
    root: u64,
}

impl PageTableDir {
    pub fn new() -> LinuxResult<Self> {
        Ok(Self {
            root: frame::alloc(1)?,
        })
    }

    pub const fn root_paddr(&self) -> u64 {
        self.root
    }

    /// Install the shared kernel half: the upper 256 top-level entries,
    /// pointing by reference at the kernel's own lower-level tables.
    pub fn install_kernel_half(&mut self, entries: &[u64; KERNEL_L4_FIRST]) {
        let root = unsafe { table_at(self.root) };
        for (i, raw) in entries.iter().enumerate() {
            if *raw != 0 {
                let flags = PageTableFlags::from_bits_truncate(*raw);
                root[KERNEL_L4_FIRST + i].set_addr(PhysAddr::new(*raw & 0x000f_ffff_ffff_f000), flags);
            }
        }
    }

    /// Resolve the level-3 table for `vaddr` through the top-level entry,
    /// allocating it on demand.
    fn walk_from_root(&mut self, vaddr: usize, create: bool) -> LinuxResult<&mut PageTable> {
        let root = unsafe { table_at(self.root) };
        let entry = &mut root[l4_index(vaddr)];
        if entry.is_unused() {
            if !create {
                return Err(LinuxError::EFAULT);
            }
            let next = frame::alloc(1)?;
            entry.set_addr(
                PhysAddr::new(next),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
            );
        }
        Ok(unsafe { table_at(entry.addr().as_u64()) })
    }

    /// Map one 4 KiB page. Fails if already mapped.
    pub fn map_4k(&mut self, vaddr: usize, paddr: u64, flags: PageTableFlags) -> LinuxResult<()> {
        let l3 = self.walk_from_root(vaddr, true)?;
        let mut table = l3;
        for level in [2, 1] {
            let entry = &mut table[table_index(vaddr, level)];
            if entry.is_unused() {
                let next = frame::alloc(1)?;
                entry.set_addr(
                    PhysAddr::new(next),
                    PageTableFlags::PRESENT
                        | PageTableFlags::WRITABLE
                        | PageTableFlags::USER_ACCESSIBLE,
                );
            }
            table = unsafe { table_at(entry.addr().as_u64()) };
        }
        let entry = &mut table[table_index(vaddr, 0)];
        if !entry.is_unused() {
            return Err(LinuxError::EINVAL);
        }
        entry.set_addr(PhysAddr::new(paddr), flags);
        Ok(())
    }

    /// Clear the entry for `vaddr`, returning the physical address it held.
    pub fn unmap_4k(&mut self, vaddr: usize) -> Option<u64> {
        let table = self.leaf_l1(vaddr)?;
        let entry = &mut table[table_index(vaddr, 0)];
        if entry.is_unused() {
            return None;
        }
        let paddr = entry.addr().as_u64();
        entry.set_unused();
        crate::arch::flush_tlb(Some(vaddr));
        Some(paddr)
    }

    /// Rewrite the flags of an existing entry, keeping its target.
    pub fn protect_4k(&mut self, vaddr: usize, flags: PageTableFlags) -> bool {
        let Some(table) = self.leaf_l1(vaddr) else {
            return false;
        };
        let entry = &mut table[table_index(vaddr, 0)];
        if entry.is_unused() {
            return false;
        }
        let paddr = entry.addr();
        entry.set_addr(paddr, flags);
        crate::arch::flush_tlb(Some(vaddr));
        true
    }

    /// Page-walk `vaddr`, yielding the backing physical address.
    pub fn query(&self, vaddr: usize) -> Option<u64> {
        let mut table = unsafe { table_at(self.root) };
        for level in [3, 2, 1] {
            let entry = &table[table_index(vaddr, level)];
            if entry.is_unused() {
                return None;
            }
            table = unsafe { table_at(entry.addr().as_u64()) };
        }
        let entry = &table[table_index(vaddr, 0)];
        if entry.is_unused() {
            None
        } else {
            Some(entry.addr().as_u64() + (vaddr & (PAGE_SIZE - 1)) as u64)
        }
    }

    fn leaf_l1(&mut self, vaddr: usize) -> Option<&mut PageTable> {
        let mut table = unsafe { table_at(self.root) };
        for level in [3, 2, 1] {
            let entry = &mut table[table_index(vaddr, level)];
            if entry.is_unused() {
                return None;
            }
            table = unsafe { table_at(entry.addr().as_u64()) };
        }
        Some(table)
    }

    /// Free every intermediate table of the user half, then the root. Leaf
    /// frames are the caller's responsibility.
    pub fn release(&mut self) {
        let root = unsafe { table_at(self.root) };
        for l4e in root.iter().take(KERNEL_L4_FIRST) {
            if l4e.is_unused() {
                continue;
            }
            let l3 = unsafe { table_at(l4e.addr().as_u64()) };
            for l3e in l3.iter() {
                if l3e.is_unused() || l3e.flags().contains(PageTableFlags::HUGE_PAGE) {
                    continue;
                }
                let l2 = unsafe { table_at(l3e.addr().as_u64()) };
                for l2e in l2.iter() {
                    if !l2e.is_unused() && !l2e.flags().contains(PageTableFlags::HUGE_PAGE) {
                        frame::free_run(l2e.addr().as_u64(), 1);
                    }
                }
                frame::free_run(l3e.addr().as_u64(), 1);
            }
            frame::free_run(l4e.addr().as_u64(), 1);
        }
        frame::free_run(self.root, 1);
        self.root = 0;
    }
}
