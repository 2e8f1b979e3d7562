//! The bounded mount table.
//!
//! Path resolution walks the longest-prefix-matching mount; mounting
//! requires an existing directory target that no mount already covers, and
//! unmounting refuses while files are open below the target unless forced.

use alloc::{string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use axerrno::{LinuxError, LinuxResult};
use spin::RwLock;

use super::{ExtFs, FatFs, FsOps, NodeType};
use crate::config::MAX_MOUNTS;

/// Supported filesystem kinds, by ABI code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FsKind {
    Ext = 1,
    Fat = 2,
}

impl TryFrom<u32> for FsKind {
    type Error = LinuxError;

    fn try_from(raw: u32) -> LinuxResult<Self> {
        match raw {
            1 => Ok(Self::Ext),
            2 => Ok(Self::Fat),
            _ => Err(LinuxError::EINVAL),
        }
    }
}

struct MountEntry {
    source: u32,
    target: String,
    kind: FsKind,
    fs: Arc<dyn FsOps>,
    open_files: Arc<AtomicUsize>,
}

static MOUNTS: RwLock<Vec<MountEntry>> = RwLock::new(Vec::new());

fn covers(target: &str, path: &str) -> bool {
    if target == "/" {
        return true;
    }
    match path.strip_prefix(target) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Mount a fresh filesystem of `kind`, backed by device `source`, at
/// `target` (absolute, normalised).
pub fn mount(source: u32, target: &str, kind: FsKind) -> LinuxResult<()> {
    let fs: Arc<dyn FsOps> = match kind {
        FsKind::Ext => ExtFs::new(source),
        FsKind::Fat => FatFs::new(source),
    };

    {
        let mounts = MOUNTS.read();
        if mounts.iter().any(|m| m.target == target) {
            return Err(LinuxError::EBUSY);
        }
        if mounts.is_empty() {
            if target != "/" {
                return Err(LinuxError::ENOENT);
            }
        } else if super::stat_path(target, true)?.node_type != NodeType::Directory {
            return Err(LinuxError::ENOTDIR);
        }
    }

    let mut mounts = MOUNTS.write();
    if mounts.len() >= MAX_MOUNTS {
        return Err(LinuxError::ENOMEM);
    }
    if mounts.iter().any(|m| m.target == target) {
        return Err(LinuxError::EBUSY);
    }
    info!("mount {:?} ({:?}) at {}", kind, source, target);
    mounts.push(MountEntry {
        source,
        target: String::from(target),
        kind,
        fs,
        open_files: Arc::new(AtomicUsize::new(0)),
    });
    Ok(())
}

/// Remove the mount at `target`. Without `force`, fails while any file is
/// open under it or another mount nests below it.
pub fn unmount(target: &str, force: bool) -> LinuxResult<()> {
    let mut mounts = MOUNTS.write();
    let idx = mounts
        .iter()
        .position(|m| m.target == target)
        .ok_or(LinuxError::ENOENT)?;
    if !force {
        if mounts[idx].open_files.load(Ordering::Acquire) > 0 {
            return Err(LinuxError::EBUSY);
        }
        if mounts
            .iter()
            .any(|m| m.target != target && covers(target, &m.target))
        {
            return Err(LinuxError::EBUSY);
        }
    }
    mounts.remove(idx);
    Ok(())
}

/// Resolve an absolute path to its filesystem, the mount-relative remainder
/// and the mount's open-file counter.
pub fn resolve(path: &str) -> LinuxResult<(Arc<dyn FsOps>, String, Arc<AtomicUsize>)> {
    let mounts = MOUNTS.read();
    let best = mounts
        .iter()
        .filter(|m| covers(&m.target, path))
        .max_by_key(|m| m.target.len())
        .ok_or(LinuxError::ENOENT)?;
    let rel = if best.target == "/" {
        path
    } else {
        &path[best.target.len()..]
    };
    let rel = if rel.is_empty() { "/" } else { rel };
    Ok((
        best.fs.clone(),
        String::from(rel),
        best.open_files.clone(),
    ))
}

/// `(source device, target, kind)` of every mount, for diagnostics.
pub fn list() -> Vec<(u32, String, FsKind)> {
    MOUNTS
        .read()
        .iter()
        .map(|m| (m.source, m.target.clone(), m.kind))
        .collect()
}

/// Flush every mounted filesystem.
pub fn sync_all() -> LinuxResult<()> {
    let filesystems: Vec<Arc<dyn FsOps>> =
        MOUNTS.read().iter().map(|m| m.fs.clone()).collect();
    for fs in filesystems {
        fs.synchronize(None)?;
    }
    Ok(())
}

/// Mount the root filesystem if nothing is mounted yet.
pub fn ensure_root(kind: FsKind) -> LinuxResult<()> {
    match mount(0, "/", kind) {
        Ok(()) | Err(LinuxError::EBUSY) => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{self, AccessMode, OpenOptions};

    #[test]
    fn mount_resolution_and_busy_checks() {
        ensure_root(FsKind::Ext).unwrap();
        let (root_fs, _, _) = resolve("/").unwrap();
        root_fs
            .create_node("/mnt", NodeType::Directory, 0o755)
            .unwrap_or(());
        root_fs
            .create_node("/mnt/fat", NodeType::Directory, 0o755)
            .unwrap_or(());

        // Target must exist and be a directory.
        assert!(mount(0, "/nonexistent", FsKind::Fat).is_err());
        mount(0, "/mnt/fat", FsKind::Fat).unwrap();
        assert!(matches!(
            mount(0, "/mnt/fat", FsKind::Fat),
            Err(LinuxError::EBUSY)
        ));

        // Longest prefix wins.
        let (fs, rel, _) = resolve("/mnt/fat/hello.txt").unwrap();
        assert_eq!(fs.kind(), "fat");
        assert_eq!(rel, "/hello.txt");
        let (fs, rel, _) = resolve("/mnt/other").unwrap();
        assert_eq!(fs.kind(), "ext");
        assert_eq!(rel, "/mnt/other");
        // A sibling whose name shares the prefix is not covered.
        let (fs, _, _) = resolve("/mnt/fat2").unwrap();
        assert_eq!(fs.kind(), "ext");

        // Open files hold the mount busy.
        let (fat, _, _) = resolve("/mnt/fat").unwrap();
        fat.create_node("/data", NodeType::Regular, 0o644).unwrap();
        let file = vfs::open(
            "/mnt/fat/data",
            OpenOptions::new(AccessMode::READ),
        )
        .unwrap();
        assert!(matches!(
            unmount("/mnt/fat", false),
            Err(LinuxError::EBUSY)
        ));
        drop(file);
        unmount("/mnt/fat", false).unwrap();
        assert!(resolve("/mnt/fat").unwrap().0.kind() == "ext");
    }
}
