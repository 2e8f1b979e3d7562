//! Global-facility syscalls: `uname`, hostname, `sysconf`, entropy and the
//! integrity policy.

use axerrno::LinuxResult;
use keel_core::mac::Capabilities;
use keel_core::sys;

use super::mac;
use crate::mm::{UserConstPtr, UserPtr};

const UTS_FIELD: usize = 65;

/// The ABI `uname` record: five NUL-terminated fields.
#[repr(C)]
pub struct UtsNameAbi {
    pub sysname: [u8; UTS_FIELD],
    pub nodename: [u8; UTS_FIELD],
    pub release: [u8; UTS_FIELD],
    pub version: [u8; UTS_FIELD],
    pub machine: [u8; UTS_FIELD],
}

fn fill(field: &mut [u8; UTS_FIELD], value: &str) {
    let n = value.len().min(UTS_FIELD - 1);
    field[..n].copy_from_slice(&value.as_bytes()[..n]);
    field[n] = 0;
}

pub fn sys_uname(out: UserPtr<UtsNameAbi>) -> LinuxResult<isize> {
    let out = out.get_as_mut_slice(1)?;
    let out = &mut out[0];
    let uts = sys::utsname();
    fill(&mut out.sysname, uts.sysname);
    fill(&mut out.nodename, &uts.nodename);
    fill(&mut out.release, uts.release);
    fill(&mut out.version, uts.version);
    fill(&mut out.machine, uts.machine);
    Ok(0)
}

pub fn sys_set_hostname(name: UserConstPtr<u8>, len: usize) -> LinuxResult<isize> {
    mac::require_capability(Capabilities::MANAGE_NET, "set_hostname")?;
    let name = name.get_as_str(len)?;
    sys::set_hostname(name)?;
    info!("hostname set to {:?}", name);
    Ok(0)
}

pub fn sys_sysconf(key: u64) -> LinuxResult<isize> {
    Ok(sys::sysconf(key)? as isize)
}

pub fn sys_getrandom(buf: UserPtr<u8>, len: usize) -> LinuxResult<isize> {
    mac::require_capability(Capabilities::ENTROPY, "getrandom")?;
    let buf = buf.get_as_mut_slice(len)?;
    Ok(keel_core::dev::get_random(buf)? as isize)
}

pub fn sys_integrity_setup(policy: u64) -> LinuxResult<isize> {
    mac::require_capability(Capabilities::MANAGE_POWER, "integrity_setup")?;
    sys::set_integrity_policy(policy)?;
    Ok(0)
}
