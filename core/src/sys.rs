//! Global kernel facilities: hostname, `sysconf` values, the integrity
//! policy and the early-boot panic.

use alloc::string::{String, ToString};

use axerrno::{LinuxError, LinuxResult};
use spin::RwLock;

use crate::config::{FD_LIMIT, MAX_PROCESSES, PAGE_SIZE};

const HOSTNAME_MAX: usize = 64;

static HOSTNAME: RwLock<Option<String>> = RwLock::new(None);

/// The machine's hostname; `keel` until someone sets it.
pub fn hostname() -> String {
    HOSTNAME
        .read()
        .clone()
        .unwrap_or_else(|| "keel".to_string())
}

/// Set the hostname: printable ASCII, bounded length.
pub fn set_hostname(name: &str) -> LinuxResult<()> {
    if name.len() > HOSTNAME_MAX {
        return Err(LinuxError::ENAMETOOLONG);
    }
    if name.is_empty() || !name.bytes().all(|b| (0x21..0x7f).contains(&b)) {
        return Err(LinuxError::EINVAL);
    }
    *HOSTNAME.write() = Some(name.to_string());
    Ok(())
}

/// `uname` fields.
pub struct UtsName {
    pub sysname: &'static str,
    pub nodename: String,
    pub release: &'static str,
    pub version: &'static str,
    pub machine: &'static str,
}

/// The system identification reported by `uname`.
pub fn utsname() -> UtsName {
    UtsName {
        sysname: "Keel",
        nodename: hostname(),
        release: env!("CARGO_PKG_VERSION"),
        version: "keel",
        machine: "x86_64",
    }
}

/// `sysconf` keys, stable ABI values.
pub mod sysconf_key {
    pub const PAGE_SIZE: u64 = 0;
    pub const TOTAL_PAGES: u64 = 1;
    pub const FREE_PAGES: u64 = 2;
    pub const OPEN_MAX: u64 = 3;
    pub const CHILD_MAX: u64 = 4;
    pub const NPROC_ONLINE: u64 = 5;
}

/// Answer a `sysconf` query.
pub fn sysconf(key: u64) -> LinuxResult<u64> {
    let stats = crate::mm::frame::stats();
    Ok(match key {
        sysconf_key::PAGE_SIZE => PAGE_SIZE as u64,
        sysconf_key::TOTAL_PAGES => stats.total as u64,
        sysconf_key::FREE_PAGES => stats.free as u64,
        sysconf_key::OPEN_MAX => FD_LIMIT as u64,
        sysconf_key::CHILD_MAX => MAX_PROCESSES as u64,
        sysconf_key::NPROC_ONLINE => crate::sched::num_cpus() as u64,
        _ => return Err(LinuxError::EINVAL),
    })
}

/// How the kernel reacts when an integrity check fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum IntegrityPolicy {
    /// Log and continue.
    Warn = 0,
    /// Bring the machine down.
    Panic = 1,
}

static INTEGRITY: RwLock<IntegrityPolicy> = RwLock::new(IntegrityPolicy::Warn);

/// Configure the integrity policy.
pub fn set_integrity_policy(raw: u64) -> LinuxResult<()> {
    let policy = match raw {
        0 => IntegrityPolicy::Warn,
        1 => IntegrityPolicy::Panic,
        _ => return Err(LinuxError::EINVAL),
    };
    *INTEGRITY.write() = policy;
    Ok(())
}

pub fn integrity_policy() -> IntegrityPolicy {
    *INTEGRITY.read()
}

/// Invariant violation during early boot (allocator init failure, missing
/// firmware tables). Runtime errors never come here.
pub fn hard_panic(msg: &str) -> ! {
    panic!("hard panic: {msg}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_validation() {
        assert!(set_hostname("").is_err());
        assert!(set_hostname("has space").is_err());
        let long = "x".repeat(65);
        assert!(matches!(
            set_hostname(&long),
            Err(LinuxError::ENAMETOOLONG)
        ));
        set_hostname("testbox").unwrap();
        assert_eq!(hostname(), "testbox");
    }

    #[test]
    fn sysconf_answers() {
        assert_eq!(
            sysconf(sysconf_key::PAGE_SIZE).unwrap(),
            PAGE_SIZE as u64
        );
        assert_eq!(sysconf(sysconf_key::OPEN_MAX).unwrap(), FD_LIMIT as u64);
        assert!(sysconf(999).is_err());
    }
}
