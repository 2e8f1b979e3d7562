//! Mandatory access control: capability bits plus path/device filters.
//!
//! Every process carries a [`MacContext`]. Once the context is locked the
//! capability set can only shrink and the enforcement action is frozen, so
//! a sandboxed process cannot re-grant itself anything.

use alloc::{string::String, vec::Vec};

use axerrno::{LinuxError, LinuxResult};

use crate::config::{MAX_MAC_FILTERS, PATH_MAX};

bitflags::bitflags! {
    /// Things a process is allowed to ask the kernel for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// Alter scheduling parameters of its threads.
        const CHANGE_SCHED = 1 << 0;
        /// Create new processes.
        const SPAWN = 1 << 1;
        /// Read from the entropy pool.
        const ENTROPY = 1 << 2;
        /// Change memory permissions.
        const MODIFY_MEM = 1 << 3;
        /// Use network facilities.
        const USE_NET = 1 << 4;
        /// Administer network facilities.
        const MANAGE_NET = 1 << 5;
        /// Mount and unmount filesystems.
        const MANAGE_MOUNTS = 1 << 6;
        /// Power the machine off or reboot it.
        const MANAGE_POWER = 1 << 7;
        /// Trace other processes.
        const TRACE = 1 << 8;
    }
}

bitflags::bitflags! {
    /// What a filter grants (or, with `DENY_INSTEAD`, revokes).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FilterPerms: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const APPEND_ONLY = 1 << 3;
        const LOCK = 1 << 4;
        /// The filter also covers everything beneath the path.
        const INCLUDES_CONTENTS = 1 << 5;
        /// Grant everything except the listed bits.
        const DENY_INSTEAD = 1 << 6;
    }
}

impl FilterPerms {
    /// The access bits, without the matching modifiers.
    pub fn access_bits(self) -> Self {
        self & (Self::READ | Self::WRITE | Self::EXEC | Self::APPEND_ONLY | Self::LOCK)
    }

    fn effective(self) -> Self {
        if self.contains(Self::DENY_INSTEAD) {
            self.access_bits().symmetric_difference(
                Self::READ | Self::WRITE | Self::EXEC | Self::APPEND_ONLY | Self::LOCK,
            )
        } else {
            self.access_bits()
        }
    }
}

/// One access filter, keyed by path prefix or device handle.
#[derive(Debug, Clone)]
pub enum MacFilter {
    Path { prefix: String, perms: FilterPerms },
    Device { handle: u32, perms: FilterPerms },
}

/// What to do when a check fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementAction {
    /// Fail the syscall with an access error.
    Deny,
    /// Log the offender, then deny.
    DenyAndScream,
    /// Terminate the offending process.
    Kill,
}

/// Per-process MAC state.
#[derive(Debug, Clone)]
pub struct MacContext {
    action: EnforcementAction,
    caps: Capabilities,
    filters: Vec<MacFilter>,
    locked: bool,
}

fn path_filter_matches(prefix: &str, perms: FilterPerms, path: &str) -> bool {
    if path == prefix {
        return true;
    }
    if !perms.contains(FilterPerms::INCLUDES_CONTENTS) {
        return false;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

impl MacContext {
    /// The boot context: everything allowed, nothing filtered.
    pub fn permissive() -> Self {
        Self {
            action: EnforcementAction::Deny,
            caps: Capabilities::all(),
            filters: Vec::new(),
            locked: false,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn has_capability(&self, cap: Capabilities) -> bool {
        self.caps.contains(cap)
    }

    pub fn action(&self) -> EnforcementAction {
        self.action
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Replace the capability set; once locked this can only intersect.
    pub fn set_capabilities(&mut self, caps: Capabilities) {
        if self.locked {
            self.caps &= caps;
        } else {
            self.caps = caps;
        }
    }

    /// Freeze the enforcement action and switch to monotonic weakening.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn set_enforcement(&mut self, action: EnforcementAction) -> LinuxResult<()> {
        if self.locked {
            return Err(LinuxError::EPERM);
        }
        self.action = action;
        Ok(())
    }

    /// Install a filter. The set is bounded and prefixes are length-checked.
    pub fn add_filter(&mut self, filter: MacFilter) -> LinuxResult<()> {
        if let MacFilter::Path { prefix, .. } = &filter {
            if prefix.is_empty() || prefix.len() >= PATH_MAX {
                return Err(LinuxError::ENAMETOOLONG);
            }
        }
        if self.filters.len() >= MAX_MAC_FILTERS {
            return Err(LinuxError::ENOMEM);
        }
        self.filters.push(filter);
        Ok(())
    }

    /// Effective permissions on `path`: the longest matching prefix wins.
    /// An empty filter set permits everything; a non-empty one denies
    /// whatever no filter covers.
    pub fn check_path(&self, path: &str) -> FilterPerms {
        if self.filters.is_empty() {
            return FilterPerms::all().access_bits();
        }
        let mut best: Option<(usize, FilterPerms)> = None;
        for filter in &self.filters {
            let MacFilter::Path { prefix, perms } = filter else {
                continue;
            };
            if path_filter_matches(prefix, *perms, path)
                && best.is_none_or(|(len, _)| prefix.len() > len)
            {
                best = Some((prefix.len(), *perms));
            }
        }
        best.map_or(FilterPerms::empty(), |(_, perms)| perms.effective())
    }

    /// Effective permissions on a device, matched by handle.
    pub fn check_device(&self, handle: u32) -> FilterPerms {
        if self.filters.is_empty() {
            return FilterPerms::all().access_bits();
        }
        for filter in &self.filters {
            if let MacFilter::Device { handle: h, perms } = filter
                && *h == handle
            {
                return perms.effective();
            }
        }
        FilterPerms::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_capabilities_only_shrink() {
        let mut ctx = MacContext::permissive();
        ctx.set_capabilities(Capabilities::SPAWN | Capabilities::ENTROPY);
        ctx.lock();
        ctx.set_capabilities(
            Capabilities::SPAWN | Capabilities::ENTROPY | Capabilities::MODIFY_MEM,
        );
        assert_eq!(
            ctx.capabilities(),
            Capabilities::SPAWN | Capabilities::ENTROPY
        );
        ctx.set_capabilities(Capabilities::ENTROPY);
        assert_eq!(ctx.capabilities(), Capabilities::ENTROPY);
        assert!(ctx.set_enforcement(EnforcementAction::Kill).is_err());
    }

    #[test]
    fn empty_filter_set_permits() {
        let ctx = MacContext::permissive();
        assert!(ctx.check_path("/etc/passwd").contains(FilterPerms::WRITE));
        assert!(ctx.check_device(3).contains(FilterPerms::READ));
    }

    #[test]
    fn longest_prefix_wins() {
        let mut ctx = MacContext::permissive();
        ctx.add_filter(MacFilter::Path {
            prefix: "/usr".into(),
            perms: FilterPerms::READ | FilterPerms::INCLUDES_CONTENTS,
        })
        .unwrap();
        ctx.add_filter(MacFilter::Path {
            prefix: "/usr/bin".into(),
            perms: FilterPerms::READ | FilterPerms::EXEC | FilterPerms::INCLUDES_CONTENTS,
        })
        .unwrap();

        assert_eq!(
            ctx.check_path("/usr/share/doc"),
            FilterPerms::READ
        );
        assert_eq!(
            ctx.check_path("/usr/bin/sh"),
            FilterPerms::READ | FilterPerms::EXEC
        );
        // Non-matching paths are denied once any filter exists.
        assert_eq!(ctx.check_path("/etc/passwd"), FilterPerms::empty());
        // Prefixes only match whole components.
        assert_eq!(ctx.check_path("/usr2"), FilterPerms::empty());
    }

    #[test]
    fn deny_instead_inverts() {
        let mut ctx = MacContext::permissive();
        ctx.add_filter(MacFilter::Path {
            prefix: "/tmp".into(),
            perms: FilterPerms::WRITE | FilterPerms::INCLUDES_CONTENTS | FilterPerms::DENY_INSTEAD,
        })
        .unwrap();
        let perms = ctx.check_path("/tmp/scratch");
        assert!(perms.contains(FilterPerms::READ));
        assert!(!perms.contains(FilterPerms::WRITE));
    }

    #[test]
    fn exact_match_without_contents() {
        let mut ctx = MacContext::permissive();
        ctx.add_filter(MacFilter::Path {
            prefix: "/etc/motd".into(),
            perms: FilterPerms::READ,
        })
        .unwrap();
        assert_eq!(ctx.check_path("/etc/motd"), FilterPerms::READ);
        assert_eq!(ctx.check_path("/etc/motd.bak"), FilterPerms::empty());
    }
}
