//! Open regular files (and directories opened for iteration).

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use axerrno::{LinuxError, LinuxResult};

use super::{DirEntryInfo, FileStat, FsHandle, FsOps, NodeType, OpenOptions};

bitflags::bitflags! {
    /// Read/write access of an open file.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMode: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Seek origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Set(u64),
    Current(i64),
    End(i64),
}

/// An open file description backed by a mounted filesystem. Shared between
/// descriptors via `Arc`; the seek index lives here so `dup`ed descriptors
/// move together.
pub struct RegularFile {
    path: String,
    fs: Arc<dyn FsOps>,
    handle: FsHandle,
    pos: AtomicU64,
    mode: AccessMode,
    append: bool,
    /// Open-file count of the owning mount, for unmount busy checks.
    mount_files: Arc<AtomicUsize>,
}

impl RegularFile {
    pub(super) fn new(
        path: String,
        fs: Arc<dyn FsOps>,
        handle: FsHandle,
        options: OpenOptions,
        mount_files: Arc<AtomicUsize>,
    ) -> Self {
        mount_files.fetch_add(1, Ordering::AcqRel);
        Self {
            path,
            fs,
            handle,
            pos: AtomicU64::new(0),
            mode: options.mode,
            append: options.append,
            mount_files,
        }
    }

    /// Absolute path the file was opened by.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn access_mode(&self) -> AccessMode {
        self.mode
    }

    pub fn read(&self, buf: &mut [u8]) -> LinuxResult<usize> {
        if !self.mode.contains(AccessMode::READ) {
            return Err(LinuxError::EBADF);
        }
        let pos = self.pos.load(Ordering::Acquire);
        let n = self.fs.read(self.handle, pos, buf)?;
        self.pos.store(pos + n as u64, Ordering::Release);
        Ok(n)
    }

    pub fn write(&self, buf: &[u8]) -> LinuxResult<usize> {
        if !self.mode.contains(AccessMode::WRITE) {
            return Err(LinuxError::EBADF);
        }
        let pos = if self.append {
            self.fs.stat(self.handle)?.size
        } else {
            self.pos.load(Ordering::Acquire)
        };
        let n = self.fs.write(self.handle, pos, buf)?;
        self.pos.store(pos + n as u64, Ordering::Release);
        Ok(n)
    }

    pub fn seek(&self, from: SeekFrom) -> LinuxResult<u64> {
        let new = match from {
            SeekFrom::Set(off) => off as i64,
            SeekFrom::Current(delta) => self.pos.load(Ordering::Acquire) as i64 + delta,
            SeekFrom::End(delta) => self.fs.stat(self.handle)?.size as i64 + delta,
        };
        if new < 0 {
            return Err(LinuxError::EINVAL);
        }
        self.pos.store(new as u64, Ordering::Release);
        Ok(new as u64)
    }

    pub(super) fn seek_to_end(&self) -> LinuxResult<u64> {
        self.seek(SeekFrom::End(0))
    }

    pub fn stat(&self) -> LinuxResult<FileStat> {
        self.fs.stat(self.handle)
    }

    /// Read at an explicit offset without moving the seek index.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> LinuxResult<usize> {
        if !self.mode.contains(AccessMode::READ) {
            return Err(LinuxError::EBADF);
        }
        self.fs.read(self.handle, offset, buf)
    }

    pub fn ioctl(&self, cmd: u32, arg: usize) -> LinuxResult<usize> {
        self.fs.ioctl(self.handle, cmd, arg)
    }

    pub fn truncate(&self, size: u64) -> LinuxResult<()> {
        if !self.mode.contains(AccessMode::WRITE) {
            return Err(LinuxError::EBADF);
        }
        self.fs.truncate(self.handle, size)
    }

    /// Physical base for directly-mappable nodes; `EOPNOTSUPP` for plain
    /// files, which are mapped by copy instead.
    pub fn mmap(&self, offset: u64, len: usize) -> LinuxResult<u64> {
        self.fs.mmap(self.handle, offset, len)
    }

    pub fn read_entries(&self) -> LinuxResult<Vec<DirEntryInfo>> {
        self.fs.read_entries(self.handle)
    }

    pub fn synchronize(&self) -> LinuxResult<()> {
        self.fs.synchronize(Some(self.handle))
    }

    pub fn is_directory(&self) -> bool {
        self.stat()
            .map(|st| st.node_type == NodeType::Directory)
            .unwrap_or(false)
    }
}

impl Drop for RegularFile {
    fn drop(&mut self) {
        self.fs.close(self.handle);
        self.mount_files.fetch_sub(1, Ordering::AcqRel);
    }
}
