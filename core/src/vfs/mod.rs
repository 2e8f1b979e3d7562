//! The virtual filesystem layer: the polymorphic filesystem interface, the
//! mount table, path handling and open-file plumbing.

mod ext;
mod fat;
mod fd;
mod file;
pub mod mount;
pub mod path;

use alloc::{string::String, sync::Arc, vec::Vec};

use axerrno::{LinuxError, LinuxResult};

pub use ext::ExtFs;
pub use fat::FatFs;
pub use fd::{FileDescription, FileDescriptor, IoEvents};
pub use file::{AccessMode, RegularFile, SeekFrom};

use crate::config::SYMLINK_HOPS;

/// A handle a filesystem hands out for an open node.
pub type FsHandle = u64;

/// What a VFS node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
}

/// A second/nanosecond timestamp.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpec {
    pub secs: u64,
    pub nanos: u32,
}

impl TimeSpec {
    pub fn now() -> Self {
        let us = crate::time::monotonic_us();
        Self {
            secs: us / 1_000_000,
            nanos: ((us % 1_000_000) * 1000) as u32,
        }
    }
}

/// Node metadata, as reported to user space by `fstat`/`lstat`.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub ino: u64,
    pub mode: u32,
    pub node_type: NodeType,
    pub nlink: u32,
    /// Registry handle for device nodes, 0 otherwise.
    pub rdev: u32,
    pub size: u64,
    pub atime: TimeSpec,
    pub mtime: TimeSpec,
    pub ctime: TimeSpec,
    pub io_block_size: u32,
    pub io_block_count: u64,
}

/// One directory entry, as yielded by [`FsOps::read_entries`].
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub ino: u64,
    pub name: String,
    pub node_type: NodeType,
}

/// The operation set every mounted filesystem implements. Paths are
/// mount-relative and normalised; offsets are explicit so the caller owns
/// the seek index. Operations a filesystem cannot express report
/// `EOPNOTSUPP` rather than pretending to succeed.
pub trait FsOps: Send + Sync {
    /// Short name of the filesystem kind, for diagnostics.
    fn kind(&self) -> &'static str;

    /// Open the node at `path`. The final component is *not* followed when
    /// it is a symlink; chasing is the VFS layer's job.
    fn open(&self, path: &str, mode: AccessMode) -> LinuxResult<FsHandle>;

    fn close(&self, handle: FsHandle);

    fn read(&self, handle: FsHandle, offset: u64, buf: &mut [u8]) -> LinuxResult<usize>;

    fn write(&self, handle: FsHandle, offset: u64, buf: &[u8]) -> LinuxResult<usize>;

    fn stat(&self, handle: FsHandle) -> LinuxResult<FileStat>;

    fn ioctl(&self, _handle: FsHandle, _cmd: u32, _arg: usize) -> LinuxResult<usize> {
        Err(LinuxError::ENOTTY)
    }

    /// Physical base backing `[offset, offset + len)`, for nodes that can
    /// be mapped directly (device windows).
    fn mmap(&self, _handle: FsHandle, _offset: u64, _len: usize) -> LinuxResult<u64> {
        Err(LinuxError::EOPNOTSUPP)
    }

    fn munmap(&self, _handle: FsHandle, _offset: u64, _len: usize) -> LinuxResult<()> {
        Ok(())
    }

    fn truncate(&self, handle: FsHandle, size: u64) -> LinuxResult<()>;

    fn unlink(&self, path: &str) -> LinuxResult<()>;

    /// Rename `src` to `dst`. With `keep` set, an existing destination is
    /// left in place and the call fails.
    fn rename(&self, src: &str, dst: &str, keep: bool) -> LinuxResult<()>;

    fn create_node(&self, path: &str, node_type: NodeType, mode: u32) -> LinuxResult<()>;

    fn create_symlink(&self, _path: &str, _target: &str) -> LinuxResult<()> {
        Err(LinuxError::EOPNOTSUPP)
    }

    fn create_hard_link(&self, _path: &str, _target: &str) -> LinuxResult<()> {
        Err(LinuxError::EOPNOTSUPP)
    }

    fn read_symbolic_link(&self, _path: &str) -> LinuxResult<String> {
        Err(LinuxError::EOPNOTSUPP)
    }

    fn read_entries(&self, handle: FsHandle) -> LinuxResult<Vec<DirEntryInfo>>;

    /// Flush one node, or everything when `handle` is `None`.
    fn synchronize(&self, _handle: Option<FsHandle>) -> LinuxResult<()> {
        Ok(())
    }

    /// Mount-relative path of an open handle.
    fn get_path(&self, handle: FsHandle) -> LinuxResult<String>;
}

/// How a file is opened.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenOptions {
    pub mode: AccessMode,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    /// Do not follow a final symlink; open the link itself.
    pub follow: bool,
    pub nonblocking: bool,
}

impl OpenOptions {
    pub fn new(mode: AccessMode) -> Self {
        Self {
            mode,
            follow: true,
            ..Default::default()
        }
    }
}

/// Open `path` (absolute, normalised), chasing up to [`SYMLINK_HOPS`]
/// symlinks, creating the file first when requested.
pub fn open(path: &str, options: OpenOptions) -> LinuxResult<Arc<RegularFile>> {
    let mut current = String::from(path);
    for _ in 0..SYMLINK_HOPS {
        let (fs, rel, counter) = mount::resolve(&current)?;

        let handle = match fs.open(&rel, options.mode) {
            Ok(handle) => handle,
            Err(LinuxError::ENOENT) if options.create => {
                fs.create_node(&rel, NodeType::Regular, 0o644)?;
                fs.open(&rel, options.mode)?
            }
            Err(err) => return Err(err),
        };

        let stat = fs.stat(handle)?;
        if stat.node_type == NodeType::Symlink && options.follow {
            fs.close(handle);
            let target = fs.read_symbolic_link(&rel)?;
            current = path::compound(path::parent(&current), &target);
            continue;
        }

        if options.truncate && stat.node_type == NodeType::Regular {
            fs.truncate(handle, 0)?;
        }
        let file = RegularFile::new(current, fs, handle, options, counter);
        if options.append {
            file.seek_to_end()?;
        }
        return Ok(Arc::new(file));
    }
    Err(LinuxError::ELOOP)
}

/// Stat by path. `follow` selects `stat` versus `lstat` semantics.
pub fn stat_path(path: &str, follow: bool) -> LinuxResult<FileStat> {
    let mut options = OpenOptions::new(AccessMode::empty());
    options.follow = follow;
    let file = open(path, options)?;
    file.stat()
}

/// Read the target of the symlink at `path`.
pub fn read_link(path: &str) -> LinuxResult<String> {
    let (fs, rel, _) = mount::resolve(path)?;
    fs.read_symbolic_link(&rel)
}
