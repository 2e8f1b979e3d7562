//! Typed pointers into user memory.
//!
//! Every access is validated against the current process's address space
//! before the kernel touches it; the syscall layer never dereferences a
//! raw user address. User pages stay mapped while the kernel runs on the
//! process's page tables, so validated pointers are plain dereferences.

use alloc::{string::String, sync::Arc, vec::Vec};
use core::{mem, slice};

use axerrno::{LinuxError, LinuxResult};
use keel_core::config::{PAGE_SIZE, PATH_MAX};
use keel_core::task::{self, Process};

/// The process whose syscall is being serviced.
pub fn current() -> LinuxResult<Arc<Process>> {
    task::current_process().ok_or(LinuxError::ESRCH)
}

fn check_region(addr: usize, len: usize) -> LinuxResult<()> {
    if len == 0 {
        return Ok(());
    }
    let proc = current()?;
    let ok = proc.aspace.lock().check_userland_access(addr, len);
    if ok { Ok(()) } else { Err(LinuxError::EFAULT) }
}

/// A mutable pointer into user space.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct UserPtr<T>(*mut T);

impl<T> From<u64> for UserPtr<T> {
    fn from(value: u64) -> Self {
        Self(value as usize as *mut T)
    }
}

impl<T> UserPtr<T> {
    pub fn address(&self) -> usize {
        self.0 as usize
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn get_as_mut(self) -> LinuxResult<&'static mut T> {
        if self.address() % mem::align_of::<T>() != 0 {
            return Err(LinuxError::EFAULT);
        }
        check_region(self.address(), mem::size_of::<T>())?;
        Ok(unsafe { &mut *self.0 })
    }

    pub fn get_as_mut_slice(self, len: usize) -> LinuxResult<&'static mut [T]> {
        if self.address() % mem::align_of::<T>() != 0 {
            return Err(LinuxError::EFAULT);
        }
        check_region(self.address(), mem::size_of::<T>() * len)?;
        Ok(unsafe { slice::from_raw_parts_mut(self.0, len) })
    }
}

/// An immutable pointer into user space.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct UserConstPtr<T>(*const T);

impl<T> From<u64> for UserConstPtr<T> {
    fn from(value: u64) -> Self {
        Self(value as usize as *const T)
    }
}

impl<T> UserConstPtr<T> {
    pub fn address(&self) -> usize {
        self.0 as usize
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn get_as_ref(self) -> LinuxResult<&'static T> {
        if self.address() % mem::align_of::<T>() != 0 {
            return Err(LinuxError::EFAULT);
        }
        check_region(self.address(), mem::size_of::<T>())?;
        Ok(unsafe { &*self.0 })
    }

    pub fn get_as_slice(self, len: usize) -> LinuxResult<&'static [T]> {
        if self.address() % mem::align_of::<T>() != 0 {
            return Err(LinuxError::EFAULT);
        }
        check_region(self.address(), mem::size_of::<T>() * len)?;
        Ok(unsafe { slice::from_raw_parts(self.0, len) })
    }
}

impl UserConstPtr<u8> {
    /// Read exactly `len` bytes as UTF-8.
    pub fn get_as_str(self, len: usize) -> LinuxResult<&'static str> {
        if len >= PATH_MAX {
            return Err(LinuxError::ENAMETOOLONG);
        }
        let bytes = self.get_as_slice(len)?;
        core::str::from_utf8(bytes).map_err(|_| LinuxError::EILSEQ)
    }

    /// Read a NUL-terminated string, validating page by page so a runaway
    /// scan cannot walk off the mapped region.
    pub fn get_as_c_str(self) -> LinuxResult<&'static str> {
        let start = self.address();
        if start == 0 {
            return Err(LinuxError::EFAULT);
        }
        let mut checked_until = start;
        let mut len = 0usize;
        loop {
            if len >= PATH_MAX {
                return Err(LinuxError::ENAMETOOLONG);
            }
            let at = start + len;
            if at >= checked_until {
                let page_rest = PAGE_SIZE - at % PAGE_SIZE;
                check_region(at, page_rest)?;
                checked_until = at + page_rest;
            }
            if unsafe { (at as *const u8).read_volatile() } == 0 {
                break;
            }
            len += 1;
        }
        let bytes = unsafe { slice::from_raw_parts(start as *const u8, len) };
        core::str::from_utf8(bytes).map_err(|_| LinuxError::EILSEQ)
    }
}

/// Load a NULL-terminated array of C-string pointers (argv/envp style).
pub fn load_string_vector(ptr: UserConstPtr<u64>) -> LinuxResult<Vec<String>> {
    let mut strings = Vec::new();
    if ptr.is_null() {
        return Ok(strings);
    }
    for idx in 0.. {
        let slot = UserConstPtr::<u64>::from(ptr.address() as u64 + idx * 8);
        let raw = *slot.get_as_ref()?;
        if raw == 0 {
            break;
        }
        let s = UserConstPtr::<u8>::from(raw).get_as_c_str()?;
        strings.push(String::from(s));
    }
    Ok(strings)
}
