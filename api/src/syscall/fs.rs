//! Filesystem, descriptor and mount syscalls.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use axerrno::{LinuxError, LinuxResult};
use keel_core::config::FD_LIMIT;
use keel_core::ipc;
use keel_core::mac::{Capabilities, FilterPerms};
use keel_core::task;
use keel_core::vfs::{
    self, AccessMode, FileDescription, FileDescriptor, NodeType, OpenOptions, SeekFrom, mount,
};
use linux_raw_sys::general::{
    DT_BLK, DT_CHR, DT_DIR, DT_LNK, DT_REG, F_DUPFD, F_DUPFD_CLOEXEC, F_GETFD, F_GETFL, F_SETFD,
    F_SETFL, FD_CLOEXEC, O_ACCMODE, O_APPEND, O_CLOEXEC, O_CREAT, O_NOFOLLOW, O_NONBLOCK,
    O_RDWR, O_TRUNC, O_WRONLY, SEEK_CUR, SEEK_END, SEEK_SET, termios, winsize,
};
use linux_raw_sys::ioctl::{FIONREAD, TCGETS, TCSETS, TCSETSF, TCSETSW, TIOCGWINSZ, TIOCSWINSZ};

use super::mac;
use crate::file::{add_file, get_description, get_file, stat_to_abi};
use crate::mm::{UserConstPtr, UserPtr, current};

fn access_mode(flags: u32) -> AccessMode {
    // flags == 0 is read-only, which also preserves the historical
    // zero-flags quirk.
    match flags & O_ACCMODE {
        O_WRONLY => AccessMode::WRITE,
        O_RDWR => AccessMode::READ | AccessMode::WRITE,
        _ => AccessMode::READ,
    }
}

/// MAC gate for a path open: reads need READ, writes need WRITE, except
/// that an append-only grant covers `O_APPEND` writes.
fn path_open_allowed(path: &str, mode: AccessMode, append: bool) -> LinuxResult<bool> {
    let proc = current()?;
    let granted = proc.with_mac(|m| m.check_path(path));
    if mode.contains(AccessMode::READ) && !granted.contains(FilterPerms::READ) {
        return Ok(false);
    }
    if mode.contains(AccessMode::WRITE)
        && !granted.contains(FilterPerms::WRITE)
        && !(append && granted.contains(FilterPerms::APPEND_ONLY))
    {
        return Ok(false);
    }
    Ok(true)
}

pub fn sys_open(
    dir_fd: i32,
    path: UserConstPtr<u8>,
    len: usize,
    flags: u32,
) -> LinuxResult<isize> {
    let path = path.get_as_str(len)?;
    let proc = current()?;
    let abs = task::compound_at(&proc, dir_fd, path)?;
    debug!("sys_open <= {:?} flags {:#x}", abs, flags);

    let mode = access_mode(flags);
    let append = flags & O_APPEND != 0;
    mac::require(path_open_allowed(&abs, mode, append)?, "open")?;

    let mut options = OpenOptions::new(mode);
    options.append = append;
    options.create = flags & O_CREAT != 0;
    options.truncate = flags & O_TRUNC != 0;
    options.follow = flags & O_NOFOLLOW == 0;
    options.nonblocking = flags & O_NONBLOCK != 0;

    let file = vfs::open(&abs, options)?;
    let stat = file.stat()?;
    if stat.node_type == NodeType::Directory && mode.contains(AccessMode::WRITE) {
        return Err(LinuxError::EISDIR);
    }
    if stat.rdev != 0 {
        let mut needed = FilterPerms::empty();
        if mode.contains(AccessMode::READ) {
            needed |= FilterPerms::READ;
        }
        if mode.contains(AccessMode::WRITE) {
            needed |= FilterPerms::WRITE;
        }
        mac::require_device_access(stat.rdev, needed, "open")?;
    }

    add_file(FileDescription::File(file), flags & O_CLOEXEC != 0).map(|fd| fd as isize)
}

pub fn sys_close(fd: i32) -> LinuxResult<isize> {
    debug!("sys_close <= {}", fd);
    current()?.remove_file(fd)?;
    Ok(0)
}

pub fn sys_read(fd: i32, buf: UserPtr<u8>, count: usize) -> LinuxResult<isize> {
    let buf = buf.get_as_mut_slice(count)?;
    let n = get_description(fd)?.read(buf)?;
    Ok(n as isize)
}

pub fn sys_write(fd: i32, buf: UserConstPtr<u8>, count: usize) -> LinuxResult<isize> {
    let buf = buf.get_as_slice(count)?;
    let n = get_description(fd)?.write(buf)?;
    Ok(n as isize)
}

pub fn sys_seek(fd: i32, offset: i64, whence: u32) -> LinuxResult<isize> {
    let from = match whence {
        SEEK_SET => SeekFrom::Set(offset as u64),
        SEEK_CUR => SeekFrom::Current(offset),
        SEEK_END => SeekFrom::End(offset),
        _ => return Err(LinuxError::EINVAL),
    };
    Ok(get_description(fd)?.seek(from)? as isize)
}

pub fn sys_fstat(fd: i32, out: UserPtr<linux_raw_sys::general::stat>) -> LinuxResult<isize> {
    let stat = get_description(fd)?.stat()?;
    *out.get_as_mut()? = stat_to_abi(stat);
    Ok(0)
}

pub fn sys_lstat(
    path: UserConstPtr<u8>,
    out: UserPtr<linux_raw_sys::general::stat>,
) -> LinuxResult<isize> {
    let path = path.get_as_c_str()?;
    let proc = current()?;
    let abs = task::compound_at(&proc, linux_raw_sys::general::AT_FDCWD, path)?;
    mac::require_path_access(&abs, FilterPerms::READ, "lstat")?;
    let stat = vfs::stat_path(&abs, false)?;
    *out.get_as_mut()? = stat_to_abi(stat);
    Ok(0)
}

pub fn sys_getcwd(buf: UserPtr<u8>, size: usize) -> LinuxResult<isize> {
    let cwd = current()?.cwd();
    if size < cwd.len() + 1 {
        return Err(LinuxError::ERANGE);
    }
    let out = buf.get_as_mut_slice(cwd.len() + 1)?;
    out[..cwd.len()].copy_from_slice(cwd.as_bytes());
    out[cwd.len()] = 0;
    Ok(cwd.len() as isize + 1)
}

pub fn sys_chdir(path: UserConstPtr<u8>) -> LinuxResult<isize> {
    let path = path.get_as_c_str()?;
    let proc = current()?;
    let abs = task::compound_at(&proc, linux_raw_sys::general::AT_FDCWD, path)?;
    debug!("sys_chdir <= {:?}", abs);
    if vfs::stat_path(&abs, true)?.node_type != NodeType::Directory {
        return Err(LinuxError::ENOTDIR);
    }
    proc.set_cwd(abs);
    Ok(0)
}

pub fn sys_pipe(fds: UserPtr<i32>, flags: u32) -> LinuxResult<isize> {
    let out = fds.get_as_mut_slice(2)?;
    let blocking = flags & O_NONBLOCK == 0;
    let cloexec = flags & O_CLOEXEC != 0;
    let (reader, writer) = ipc::pipe_pair(blocking);
    let proc = current()?;
    let rd = proc.add_file(FileDescriptor::new(
        FileDescription::PipeReader(reader),
        cloexec,
    ))?;
    let wr = match proc.add_file(FileDescriptor::new(
        FileDescription::PipeWriter(writer),
        cloexec,
    )) {
        Ok(wr) => wr,
        Err(err) => {
            let _ = proc.remove_file(rd);
            return Err(err);
        }
    };
    out[0] = rd;
    out[1] = wr;
    debug!("sys_pipe => ({}, {})", rd, wr);
    Ok(0)
}

pub fn sys_dup(fd: i32) -> LinuxResult<isize> {
    let mut copy = get_file(fd)?;
    copy.close_on_exec = false;
    current()?.add_file(copy).map(|fd| fd as isize)
}

fn dup_from(fd: i32, min: usize, close_on_exec: bool) -> LinuxResult<isize> {
    let mut copy = get_file(fd)?;
    copy.close_on_exec = close_on_exec;
    let proc = current()?;
    let slot = (min..FD_LIMIT)
        .find(|slot| !proc.is_valid_file(*slot as i32))
        .ok_or(LinuxError::EMFILE)?;
    proc.replace_file(slot as i32, copy)?;
    Ok(slot as isize)
}

pub fn sys_fcntl(fd: i32, cmd: u32, arg: usize) -> LinuxResult<isize> {
    debug!("sys_fcntl <= fd {} cmd {} arg {}", fd, cmd, arg);
    match cmd {
        F_DUPFD => dup_from(fd, arg, false),
        F_DUPFD_CLOEXEC => dup_from(fd, arg, true),
        F_GETFD => Ok(if get_file(fd)?.close_on_exec {
            FD_CLOEXEC as isize
        } else {
            0
        }),
        F_SETFD => {
            current()?.set_close_on_exec(fd, arg & FD_CLOEXEC as usize != 0)?;
            Ok(0)
        }
        F_GETFL => {
            let desc = get_description(fd)?;
            let mut flags = 0u32;
            if desc.is_nonblocking() {
                flags |= O_NONBLOCK;
            }
            match desc {
                FileDescription::File(ref file) => {
                    let mode = file.access_mode();
                    if mode == AccessMode::WRITE {
                        flags |= O_WRONLY;
                    } else if mode == (AccessMode::READ | AccessMode::WRITE) {
                        flags |= O_RDWR;
                    }
                }
                FileDescription::PipeWriter(_) => flags |= O_WRONLY,
                _ => {}
            }
            Ok(flags as isize)
        }
        F_SETFL => {
            get_description(fd)?.set_nonblocking(arg as u32 & O_NONBLOCK != 0)?;
            Ok(0)
        }
        _ => Err(LinuxError::EINVAL),
    }
}

pub fn sys_ioctl(fd: i32, cmd: u32, arg: usize) -> LinuxResult<isize> {
    let desc = get_description(fd)?;
    match (&desc, cmd) {
        (FileDescription::PtyPrimary(pty) | FileDescription::PtySecondary(pty), TCGETS) => {
            *UserPtr::<termios>::from(arg as u64).get_as_mut()? = pty.termios();
            Ok(0)
        }
        (
            FileDescription::PtyPrimary(pty) | FileDescription::PtySecondary(pty),
            TCSETS | TCSETSW | TCSETSF,
        ) => {
            pty.set_termios(*UserConstPtr::<termios>::from(arg as u64).get_as_ref()?);
            Ok(0)
        }
        (FileDescription::PtyPrimary(pty) | FileDescription::PtySecondary(pty), TIOCGWINSZ) => {
            *UserPtr::<winsize>::from(arg as u64).get_as_mut()? = pty.window_size();
            Ok(0)
        }
        (FileDescription::PtyPrimary(pty) | FileDescription::PtySecondary(pty), TIOCSWINSZ) => {
            pty.set_window_size(*UserConstPtr::<winsize>::from(arg as u64).get_as_ref()?);
            Ok(0)
        }
        (FileDescription::PtyPrimary(pty) | FileDescription::PtySecondary(pty), FIONREAD) => {
            *UserPtr::<i32>::from(arg as u64).get_as_mut()? = pty.bytes_available() as i32;
            Ok(0)
        }
        (FileDescription::PipeReader(pipe), FIONREAD) => {
            *UserPtr::<i32>::from(arg as u64).get_as_mut()? = pipe.bytes_available() as i32;
            Ok(0)
        }
        (FileDescription::File(_), _) => desc.ioctl(cmd, arg).map(|v| v as isize),
        _ => Err(LinuxError::ENOTTY),
    }
}

fn same_filesystem(a: &Arc<dyn vfs::FsOps>, b: &Arc<dyn vfs::FsOps>) -> bool {
    Arc::ptr_eq(a, b)
}

pub fn sys_rename(
    src: UserConstPtr<u8>,
    dst: UserConstPtr<u8>,
    keep: bool,
) -> LinuxResult<isize> {
    let proc = current()?;
    let src = task::compound_at(&proc, linux_raw_sys::general::AT_FDCWD, src.get_as_c_str()?)?;
    let dst = task::compound_at(&proc, linux_raw_sys::general::AT_FDCWD, dst.get_as_c_str()?)?;
    debug!("sys_rename <= {:?} -> {:?} keep {}", src, dst, keep);
    mac::require_path_access(&src, FilterPerms::WRITE, "rename")?;
    mac::require_path_access(&dst, FilterPerms::WRITE, "rename")?;

    let (src_fs, src_rel, _) = mount::resolve(&src)?;
    let (dst_fs, dst_rel, _) = mount::resolve(&dst)?;
    if !same_filesystem(&src_fs, &dst_fs) {
        return Err(LinuxError::EXDEV);
    }
    src_fs.rename(&src_rel, &dst_rel, keep)?;
    Ok(0)
}

pub fn sys_mount(
    source: UserConstPtr<u8>,
    target: UserConstPtr<u8>,
    fs_kind: u32,
) -> LinuxResult<isize> {
    mac::require_capability(Capabilities::MANAGE_MOUNTS, "mount")?;
    let proc = current()?;
    let source = source.get_as_c_str()?;
    let target =
        task::compound_at(&proc, linux_raw_sys::general::AT_FDCWD, target.get_as_c_str()?)?;
    let kind = mount::FsKind::try_from(fs_kind)?;

    let device = if source.is_empty() {
        0
    } else {
        let abs = task::compound_at(&proc, linux_raw_sys::general::AT_FDCWD, source)?;
        let stat = vfs::stat_path(&abs, true)?;
        if stat.rdev == 0 {
            return Err(LinuxError::EINVAL);
        }
        mac::require_device_access(
            stat.rdev,
            FilterPerms::READ | FilterPerms::WRITE,
            "mount",
        )?;
        stat.rdev
    };
    mount::mount(device, &target, kind)?;
    Ok(0)
}

pub fn sys_umount(target: UserConstPtr<u8>, force: bool) -> LinuxResult<isize> {
    mac::require_capability(Capabilities::MANAGE_MOUNTS, "umount")?;
    let proc = current()?;
    let target =
        task::compound_at(&proc, linux_raw_sys::general::AT_FDCWD, target.get_as_c_str()?)?;
    mount::unmount(&target, force)?;
    Ok(0)
}

pub fn sys_readlink(
    path: UserConstPtr<u8>,
    buf: UserPtr<u8>,
    size: usize,
) -> LinuxResult<isize> {
    let proc = current()?;
    let abs = task::compound_at(&proc, linux_raw_sys::general::AT_FDCWD, path.get_as_c_str()?)?;
    mac::require_path_access(&abs, FilterPerms::READ, "readlink")?;
    let target = vfs::read_link(&abs)?;
    let n = size.min(target.len());
    buf.get_as_mut_slice(n)?.copy_from_slice(&target.as_bytes()[..n]);
    Ok(n as isize)
}

/// The record header `getdents` writes; the name follows, NUL-terminated.
#[repr(C)]
struct DirEntAbi {
    ino: u64,
    off: u64,
    reclen: u16,
    kind: u8,
}

const DIRENT_HEADER: usize = core::mem::size_of::<DirEntAbi>();

fn dirent_kind(node_type: NodeType) -> u8 {
    (match node_type {
        NodeType::Regular => DT_REG,
        NodeType::Directory => DT_DIR,
        NodeType::Symlink => DT_LNK,
        NodeType::CharDevice => DT_CHR,
        NodeType::BlockDevice => DT_BLK,
    }) as u8
}

pub fn sys_getdents(fd: i32, buf: UserPtr<u8>, len: usize) -> LinuxResult<isize> {
    let FileDescription::File(file) = get_description(fd)? else {
        return Err(LinuxError::ENOTDIR);
    };
    let entries = file.read_entries()?;
    let start = file.seek(SeekFrom::Current(0))? as usize;
    let out = buf.get_as_mut_slice(len)?;

    let mut written = 0usize;
    let mut consumed = 0usize;
    for entry in entries.iter().skip(start) {
        let reclen = (DIRENT_HEADER + entry.name.len() + 1).next_multiple_of(8);
        if written + reclen > len {
            break;
        }
        let header = DirEntAbi {
            ino: entry.ino,
            off: (start + consumed + 1) as u64,
            reclen: reclen as u16,
            kind: dirent_kind(entry.node_type),
        };
        // SAFETY: the slice has room for the header and name.
        unsafe {
            core::ptr::write_unaligned(
                out[written..].as_mut_ptr() as *mut DirEntAbi,
                header,
            );
        }
        out[written + DIRENT_HEADER..written + DIRENT_HEADER + entry.name.len()]
            .copy_from_slice(entry.name.as_bytes());
        out[written + DIRENT_HEADER + entry.name.len()] = 0;
        written += reclen;
        consumed += 1;
    }
    if consumed == 0 && !entries.is_empty() && start < entries.len() {
        // The next entry alone does not fit.
        return Err(LinuxError::EINVAL);
    }
    file.seek(SeekFrom::Set((start + consumed) as u64))?;
    Ok(written as isize)
}

pub fn sys_sync() -> LinuxResult<isize> {
    mount::sync_all()?;
    Ok(0)
}

pub fn sys_fsync(fd: i32) -> LinuxResult<isize> {
    match get_description(fd)? {
        FileDescription::File(file) => {
            file.synchronize()?;
            Ok(0)
        }
        _ => Err(LinuxError::EINVAL),
    }
}

/// Node-type codes for `mknod`.
const KN_REGULAR: u32 = 0;
const KN_DIRECTORY: u32 = 1;
const KN_CHAR: u32 = 2;
const KN_BLOCK: u32 = 3;

pub fn sys_mknod(
    path: UserConstPtr<u8>,
    node_type: u32,
    mode: u32,
    device: u32,
) -> LinuxResult<isize> {
    let proc = current()?;
    let abs = task::compound_at(&proc, linux_raw_sys::general::AT_FDCWD, path.get_as_c_str()?)?;
    mac::require_path_access(&abs, FilterPerms::WRITE, "mknod")?;
    let node_type = match node_type {
        KN_REGULAR => NodeType::Regular,
        KN_DIRECTORY => NodeType::Directory,
        KN_CHAR => NodeType::CharDevice,
        KN_BLOCK => NodeType::BlockDevice,
        _ => return Err(LinuxError::EINVAL),
    };
    let (fs, rel, _) = mount::resolve(&abs)?;
    // Device handles ride in the high mode bits.
    fs.create_node(&rel, node_type, (mode & 0o7777) | (device << 16))?;
    Ok(0)
}

pub fn sys_unlink(path: UserConstPtr<u8>) -> LinuxResult<isize> {
    let proc = current()?;
    let abs = task::compound_at(&proc, linux_raw_sys::general::AT_FDCWD, path.get_as_c_str()?)?;
    debug!("sys_unlink <= {:?}", abs);
    mac::require_path_access(&abs, FilterPerms::WRITE, "unlink")?;
    let (fs, rel, _) = mount::resolve(&abs)?;
    fs.unlink(&rel)?;
    Ok(0)
}

pub fn sys_truncate(fd: i32, size: u64) -> LinuxResult<isize> {
    match get_description(fd)? {
        FileDescription::File(file) => {
            file.truncate(size)?;
            Ok(0)
        }
        _ => Err(LinuxError::EINVAL),
    }
}

pub fn sys_symlink(target: UserConstPtr<u8>, path: UserConstPtr<u8>) -> LinuxResult<isize> {
    let proc = current()?;
    let target = target.get_as_c_str()?;
    let abs = task::compound_at(&proc, linux_raw_sys::general::AT_FDCWD, path.get_as_c_str()?)?;
    mac::require_path_access(&abs, FilterPerms::WRITE, "symlink")?;
    let (fs, rel, _) = mount::resolve(&abs)?;
    fs.create_symlink(&rel, target)?;
    Ok(0)
}

pub fn sys_link(target: UserConstPtr<u8>, path: UserConstPtr<u8>) -> LinuxResult<isize> {
    let proc = current()?;
    let target =
        task::compound_at(&proc, linux_raw_sys::general::AT_FDCWD, target.get_as_c_str()?)?;
    let abs = task::compound_at(&proc, linux_raw_sys::general::AT_FDCWD, path.get_as_c_str()?)?;
    mac::require_path_access(&abs, FilterPerms::WRITE, "link")?;

    let (target_fs, target_rel, _) = mount::resolve(&target)?;
    let (fs, rel, _) = mount::resolve(&abs)?;
    if !same_filesystem(&target_fs, &fs) {
        return Err(LinuxError::EXDEV);
    }
    fs.create_hard_link(&rel, &target_rel)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_flags_open_is_read_only() {
        // The historical quirk: flags == 0 means read-only.
        assert_eq!(access_mode(0), AccessMode::READ);
        assert_eq!(access_mode(O_WRONLY), AccessMode::WRITE);
        assert_eq!(access_mode(O_RDWR), AccessMode::READ | AccessMode::WRITE);
    }

    #[test]
    fn dirent_records_align() {
        assert_eq!(DIRENT_HEADER, 24);
        let reclen = (DIRENT_HEADER + "motd".len() + 1).next_multiple_of(8);
        assert_eq!(reclen % 8, 0);
        assert!(reclen >= DIRENT_HEADER + 5);
    }
}

static PTY_INDEX: AtomicU32 = AtomicU32::new(0);

pub fn sys_openpty(fds: UserPtr<i32>, flags: u32) -> LinuxResult<isize> {
    let out = fds.get_as_mut_slice(2)?;
    let index = PTY_INDEX.fetch_add(1, Ordering::Relaxed);
    let (primary, secondary) = ipc::openpty(index, flags & O_NONBLOCK == 0);
    // Best effort: the registry may be full, the pair still works.
    if let Err(err) = ipc::register_pty_device(secondary.clone()) {
        warn!("openpty: pty{} not registered: {:?}", index, err);
    }

    let cloexec = flags & O_CLOEXEC != 0;
    let proc = current()?;
    let pfd = proc.add_file(FileDescriptor::new(
        FileDescription::PtyPrimary(primary),
        cloexec,
    ))?;
    let sfd = match proc.add_file(FileDescriptor::new(
        FileDescription::PtySecondary(secondary),
        cloexec,
    )) {
        Ok(sfd) => sfd,
        Err(err) => {
            let _ = proc.remove_file(pfd);
            return Err(err);
        }
    };
    out[0] = pfd;
    out[1] = sfd;
    Ok(0)
}
