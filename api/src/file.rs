//! FD helpers and the ABI projection of file metadata.

use axerrno::LinuxResult;
use keel_core::vfs::{FileDescription, FileDescriptor, FileStat, NodeType};
use linux_raw_sys::general::{
    S_IFBLK, S_IFCHR, S_IFDIR, S_IFLNK, S_IFREG, stat,
};

use crate::mm::current;

/// Fetch descriptor `fd` of the current process.
pub fn get_file(fd: i32) -> LinuxResult<FileDescriptor> {
    current()?.get_file(fd)
}

/// Shorthand for the open object behind `fd`.
pub fn get_description(fd: i32) -> LinuxResult<FileDescription> {
    Ok(get_file(fd)?.description)
}

/// Install a description in the lowest free slot of the current process.
pub fn add_file(description: FileDescription, close_on_exec: bool) -> LinuxResult<i32> {
    current()?.add_file(FileDescriptor::new(description, close_on_exec))
}

fn type_bits(node_type: NodeType) -> u32 {
    match node_type {
        NodeType::Regular => S_IFREG,
        NodeType::Directory => S_IFDIR,
        NodeType::Symlink => S_IFLNK,
        NodeType::CharDevice => S_IFCHR,
        NodeType::BlockDevice => S_IFBLK,
    }
}

/// Project a [`FileStat`] into the ABI `stat` record.
pub fn stat_to_abi(value: FileStat) -> stat {
    // SAFETY: all-zero is a valid stat.
    let mut out: stat = unsafe { core::mem::zeroed() };
    out.st_ino = value.ino as _;
    out.st_mode = (type_bits(value.node_type) | (value.mode & 0o7777)) as _;
    out.st_nlink = value.nlink as _;
    out.st_size = value.size as _;
    out.st_blksize = value.io_block_size as _;
    out.st_blocks = value.io_block_count as _;
    out.st_atime = value.atime.secs as _;
    out.st_atime_nsec = value.atime.nanos as _;
    out.st_mtime = value.mtime.secs as _;
    out.st_mtime_nsec = value.mtime.nanos as _;
    out.st_ctime = value.ctime.secs as _;
    out.st_ctime_nsec = value.ctime.nanos as _;
    out
}
