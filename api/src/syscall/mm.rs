//! Memory-management syscalls.

use axerrno::{LinuxError, LinuxResult};
use keel_core::config::PAGE_SIZE;
use keel_core::mac::Capabilities;
use keel_core::mm::{MapFlags, check_userland_mappability};
use keel_core::vfs::FileDescription;
use linux_raw_sys::general::{MAP_ANONYMOUS, MAP_FIXED, PROT_EXEC, PROT_WRITE};

use super::mac;
use crate::file::get_description;
use crate::mm::current;

fn prot_to_flags(prot: u32) -> MapFlags {
    let mut flags = MapFlags::USER_ACCESSIBLE;
    if prot & PROT_WRITE == 0 {
        flags |= MapFlags::READ_ONLY;
    }
    if prot & PROT_EXEC != 0 {
        flags |= MapFlags::EXECUTABLE;
    }
    flags
}

pub fn sys_mmap(
    hint: usize,
    len: usize,
    prot: u32,
    flags: u32,
    fd: i32,
    offset: u64,
) -> LinuxResult<isize> {
    if len == 0 {
        return Err(LinuxError::EINVAL);
    }
    let len = len.next_multiple_of(PAGE_SIZE);
    let proc = current()?;

    let addr = if flags & MAP_FIXED != 0 {
        if hint % PAGE_SIZE != 0 {
            return Err(LinuxError::EINVAL);
        }
        // A fixed hint pointing into the kernel half is hostile, not a
        // placement preference.
        if !check_userland_mappability(hint, len) {
            return Err(LinuxError::EFAULT);
        }
        hint
    } else {
        proc.take_alloc_range(len)
    };
    let map_flags = prot_to_flags(prot);
    debug!(
        "sys_mmap <= addr {:#x} len {:#x} prot {:#x} flags {:#x} fd {}",
        addr, len, prot, flags, fd
    );

    if flags & MAP_ANONYMOUS != 0 {
        proc.aspace.lock().map_alloc(addr, len, map_flags)?;
        return Ok(addr as isize);
    }

    // File-backed: device windows map their physical range, regular files
    // are copied in (no write-back).
    let FileDescription::File(file) = get_description(fd)? else {
        return Err(LinuxError::EBADF);
    };
    match file.mmap(offset, len) {
        Ok(phys) => {
            proc.aspace.lock().map_range(addr, phys, len, map_flags)?;
            return Ok(addr as isize);
        }
        Err(LinuxError::EOPNOTSUPP) => {}
        Err(err) => return Err(err),
    }

    proc.aspace.lock().map_alloc(addr, len, map_flags)?;
    let mut data = alloc::vec![0u8; len];
    let mut done = 0;
    while done < len {
        let n = file.read_at(offset + done as u64, &mut data[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    proc.aspace.lock().write(addr, &data[..done])?;
    Ok(addr as isize)
}

pub fn sys_munmap(addr: usize, len: usize) -> LinuxResult<isize> {
    let len = len.next_multiple_of(PAGE_SIZE);
    debug!("sys_munmap <= {:#x} + {:#x}", addr, len);
    let proc = current()?;
    proc.aspace.lock().unmap_range(addr, len)?;
    Ok(0)
}

pub fn sys_mprotect(addr: usize, len: usize, prot: u32) -> LinuxResult<isize> {
    mac::require_capability(Capabilities::MODIFY_MEM, "mprotect")?;
    let len = len.next_multiple_of(PAGE_SIZE);
    let proc = current()?;
    proc.aspace
        .lock()
        .remap_range(addr, len, prot_to_flags(prot))?;
    Ok(0)
}
