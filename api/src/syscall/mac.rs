//! MAC syscalls and the enforcement helpers every gated syscall funnels
//! through.

use alloc::string::String;
use alloc::sync::Arc;

use axerrno::{LinuxError, LinuxResult};
use keel_core::mac::{Capabilities, EnforcementAction, FilterPerms, MacFilter};
use keel_core::task::{self, Process};

use crate::mm::{UserConstPtr, current};

/// Apply the process's enforcement action and produce the error the
/// syscall reports. `Kill` never returns.
fn punish(proc: &Arc<Process>, what: &str) -> LinuxError {
    match proc.with_mac(|mac| mac.action()) {
        EnforcementAction::Deny => {}
        EnforcementAction::DenyAndScream => {
            warn!("mac: pid {} denied {}", proc.pid(), what);
        }
        EnforcementAction::Kill => {
            warn!("mac: pid {} killed over {}", proc.pid(), what);
            task::do_exit(proc, 42);
        }
    }
    LinuxError::EACCES
}

/// Enforce an already-evaluated check: `allowed` passes, anything else
/// takes the process's enforcement action.
pub fn require(allowed: bool, what: &str) -> LinuxResult<()> {
    if allowed {
        Ok(())
    } else {
        let proc = current()?;
        Err(punish(&proc, what))
    }
}

/// Fail (or kill) unless the current process holds `cap`.
pub fn require_capability(cap: Capabilities, what: &str) -> LinuxResult<()> {
    let proc = current()?;
    if proc.with_mac(|mac| mac.has_capability(cap)) {
        Ok(())
    } else {
        Err(punish(&proc, what))
    }
}

/// Fail (or kill) unless the path filters grant all of `needed` on `path`.
pub fn require_path_access(path: &str, needed: FilterPerms, what: &str) -> LinuxResult<()> {
    let proc = current()?;
    if proc.with_mac(|mac| mac.check_path(path)).contains(needed) {
        Ok(())
    } else {
        Err(punish(&proc, what))
    }
}

/// Fail (or kill) unless the device filters grant all of `needed`.
pub fn require_device_access(handle: u32, needed: FilterPerms, what: &str) -> LinuxResult<()> {
    let proc = current()?;
    if proc
        .with_mac(|mac| mac.check_device(handle))
        .contains(needed)
    {
        Ok(())
    } else {
        Err(punish(&proc, what))
    }
}

pub fn sys_get_mac_capabilities() -> LinuxResult<isize> {
    let proc = current()?;
    Ok(proc.with_mac(|mac| mac.capabilities().bits()) as isize)
}

/// Replace the capability set; once locked this only ever intersects.
pub fn sys_set_mac_capabilities(bits: u64) -> LinuxResult<isize> {
    let caps = Capabilities::from_bits_truncate(bits as u32);
    let proc = current()?;
    proc.with_mac_mut(|mac| mac.set_capabilities(caps));
    Ok(0)
}

pub fn sys_lock_mac() -> LinuxResult<isize> {
    let proc = current()?;
    proc.with_mac_mut(|mac| mac.lock());
    Ok(0)
}

pub fn sys_set_mac_enforcement(raw: u64) -> LinuxResult<isize> {
    let action = match raw {
        0 => EnforcementAction::Deny,
        1 => EnforcementAction::DenyAndScream,
        2 => EnforcementAction::Kill,
        _ => return Err(LinuxError::EINVAL),
    };
    let proc = current()?;
    proc.with_mac_mut(|mac| mac.set_enforcement(action))?;
    Ok(0)
}

/// ABI form of one MAC filter.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MacFilterAbi {
    /// 0 = path filter, 1 = device filter.
    pub kind: u64,
    /// [`FilterPerms`] bits.
    pub perms: u64,
    pub device_handle: u64,
    pub path_ptr: u64,
    pub path_len: u64,
}

pub fn sys_add_mac_filter(filter: UserConstPtr<MacFilterAbi>) -> LinuxResult<isize> {
    let abi = *filter.get_as_ref()?;
    let perms = FilterPerms::from_bits_truncate(abi.perms as u32);
    let filter = match abi.kind {
        0 => {
            let path = UserConstPtr::<u8>::from(abi.path_ptr).get_as_str(abi.path_len as usize)?;
            MacFilter::Path {
                prefix: String::from(path),
                perms,
            }
        }
        1 => MacFilter::Device {
            handle: abi.device_handle as u32,
            perms,
        },
        _ => return Err(LinuxError::EINVAL),
    };
    let proc = current()?;
    proc.with_mac_mut(|mac| mac.add_filter(filter))?;
    Ok(0)
}
