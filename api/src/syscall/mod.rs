//! The system-call dispatcher.
//!
//! The trap glue hands us the saved register frame: number in `rax`,
//! arguments in `rdi`, `rsi`, `rdx`, `rcx`, `r8`, `r9`. The result goes
//! back in `rax` (all-ones on failure) with the error code in `rdx`.

mod fs;
mod mac;
mod mm;
mod poll;
mod sys;
mod task;

use alloc::format;

use axerrno::{LinuxError, LinuxResult};
use keel_core::arch::TrapFrame;

pub use mac::{require_capability, require_path_access};

/// The stable syscall numbers. 11 is retired and never reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Sysno {
    Exit = 0,
    SetTcb = 1,
    Open = 2,
    Close = 3,
    Read = 4,
    Write = 5,
    Seek = 6,
    Mmap = 7,
    Munmap = 8,
    GetPid = 9,
    GetPPid = 10,
    Exec = 12,
    Fork = 13,
    Wait = 14,
    Uname = 15,
    SetHostname = 16,
    Fstat = 17,
    Lstat = 18,
    GetCwd = 19,
    Chdir = 20,
    Pipe = 21,
    Dup = 22,
    Ioctl = 23,
    Rename = 24,
    Sysconf = 25,
    Spawn = 26,
    ThreadSched = 27,
    Fcntl = 28,
    ExitThread = 29,
    GetRandom = 30,
    Mprotect = 31,
    GetMacCapabilities = 32,
    SetMacCapabilities = 33,
    LockMac = 34,
    SetMacEnforcement = 35,
    AddMacFilter = 36,
    Mount = 37,
    Umount = 38,
    ReadLink = 39,
    GetDents = 40,
    Sync = 41,
    Mknod = 42,
    Unlink = 43,
    Truncate = 44,
    Symlink = 45,
    IntegritySetup = 46,
    OpenPty = 47,
    Fsync = 48,
    Link = 49,
    Ptrace = 50,
    Poll = 51,
}

impl Sysno {
    pub fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::Exit,
            1 => Self::SetTcb,
            2 => Self::Open,
            3 => Self::Close,
            4 => Self::Read,
            5 => Self::Write,
            6 => Self::Seek,
            7 => Self::Mmap,
            8 => Self::Munmap,
            9 => Self::GetPid,
            10 => Self::GetPPid,
            12 => Self::Exec,
            13 => Self::Fork,
            14 => Self::Wait,
            15 => Self::Uname,
            16 => Self::SetHostname,
            17 => Self::Fstat,
            18 => Self::Lstat,
            19 => Self::GetCwd,
            20 => Self::Chdir,
            21 => Self::Pipe,
            22 => Self::Dup,
            23 => Self::Ioctl,
            24 => Self::Rename,
            25 => Self::Sysconf,
            26 => Self::Spawn,
            27 => Self::ThreadSched,
            28 => Self::Fcntl,
            29 => Self::ExitThread,
            30 => Self::GetRandom,
            31 => Self::Mprotect,
            32 => Self::GetMacCapabilities,
            33 => Self::SetMacCapabilities,
            34 => Self::LockMac,
            35 => Self::SetMacEnforcement,
            36 => Self::AddMacFilter,
            37 => Self::Mount,
            38 => Self::Umount,
            39 => Self::ReadLink,
            40 => Self::GetDents,
            41 => Self::Sync,
            42 => Self::Mknod,
            43 => Self::Unlink,
            44 => Self::Truncate,
            45 => Self::Symlink,
            46 => Self::IntegritySetup,
            47 => Self::OpenPty,
            48 => Self::Fsync,
            49 => Self::Link,
            50 => Self::Ptrace,
            51 => Self::Poll,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Exit => "exit",
            Self::SetTcb => "set_tcb",
            Self::Open => "open",
            Self::Close => "close",
            Self::Read => "read",
            Self::Write => "write",
            Self::Seek => "seek",
            Self::Mmap => "mmap",
            Self::Munmap => "munmap",
            Self::GetPid => "getpid",
            Self::GetPPid => "getppid",
            Self::Exec => "exec",
            Self::Fork => "fork",
            Self::Wait => "wait",
            Self::Uname => "uname",
            Self::SetHostname => "set_hostname",
            Self::Fstat => "fstat",
            Self::Lstat => "lstat",
            Self::GetCwd => "getcwd",
            Self::Chdir => "chdir",
            Self::Pipe => "pipe",
            Self::Dup => "dup",
            Self::Ioctl => "ioctl",
            Self::Rename => "rename",
            Self::Sysconf => "sysconf",
            Self::Spawn => "spawn",
            Self::ThreadSched => "thread_sched",
            Self::Fcntl => "fcntl",
            Self::ExitThread => "exit_thread",
            Self::GetRandom => "getrandom",
            Self::Mprotect => "mprotect",
            Self::GetMacCapabilities => "get_mac_capabilities",
            Self::SetMacCapabilities => "set_mac_capabilities",
            Self::LockMac => "lock_mac",
            Self::SetMacEnforcement => "set_mac_enforcement",
            Self::AddMacFilter => "add_mac_filter",
            Self::Mount => "mount",
            Self::Umount => "umount",
            Self::ReadLink => "readlink",
            Self::GetDents => "getdents",
            Self::Sync => "sync",
            Self::Mknod => "mknod",
            Self::Unlink => "unlink",
            Self::Truncate => "truncate",
            Self::Symlink => "symlink",
            Self::IntegritySetup => "integrity_setup",
            Self::OpenPty => "openpty",
            Self::Fsync => "fsync",
            Self::Link => "link",
            Self::Ptrace => "ptrace",
            Self::Poll => "poll",
        }
    }
}

fn dispatch(tf: &mut TrapFrame, sysno: Sysno) -> LinuxResult<isize> {
    match sysno {
        Sysno::Exit => task::sys_exit(tf.arg0() as i32),
        Sysno::SetTcb => task::sys_set_tcb(tf.arg0() as usize),
        Sysno::Open => fs::sys_open(
            tf.arg0() as i32,
            tf.arg1().into(),
            tf.arg2() as usize,
            tf.arg3() as u32,
        ),
        Sysno::Close => fs::sys_close(tf.arg0() as i32),
        Sysno::Read => fs::sys_read(tf.arg0() as i32, tf.arg1().into(), tf.arg2() as usize),
        Sysno::Write => fs::sys_write(tf.arg0() as i32, tf.arg1().into(), tf.arg2() as usize),
        Sysno::Seek => fs::sys_seek(tf.arg0() as i32, tf.arg1() as i64, tf.arg2() as u32),
        Sysno::Mmap => mm::sys_mmap(
            tf.arg0() as usize,
            tf.arg1() as usize,
            tf.arg2() as u32,
            tf.arg3() as u32,
            tf.arg4() as i32,
            tf.arg5(),
        ),
        Sysno::Munmap => mm::sys_munmap(tf.arg0() as usize, tf.arg1() as usize),
        Sysno::GetPid => task::sys_getpid(),
        Sysno::GetPPid => task::sys_getppid(),
        Sysno::Exec => task::sys_exec(tf, tf.arg0().into(), tf.arg1().into(), tf.arg2().into()),
        Sysno::Fork => task::sys_fork(tf),
        Sysno::Wait => task::sys_wait(tf.arg0() as i64, tf.arg1().into(), tf.arg2() as u32),
        Sysno::Uname => sys::sys_uname(tf.arg0().into()),
        Sysno::SetHostname => sys::sys_set_hostname(tf.arg0().into(), tf.arg1() as usize),
        Sysno::Fstat => fs::sys_fstat(tf.arg0() as i32, tf.arg1().into()),
        Sysno::Lstat => fs::sys_lstat(tf.arg0().into(), tf.arg1().into()),
        Sysno::GetCwd => fs::sys_getcwd(tf.arg0().into(), tf.arg1() as usize),
        Sysno::Chdir => fs::sys_chdir(tf.arg0().into()),
        Sysno::Pipe => fs::sys_pipe(tf.arg0().into(), tf.arg1() as u32),
        Sysno::Dup => fs::sys_dup(tf.arg0() as i32),
        Sysno::Ioctl => fs::sys_ioctl(tf.arg0() as i32, tf.arg1() as u32, tf.arg2() as usize),
        Sysno::Rename => fs::sys_rename(tf.arg0().into(), tf.arg1().into(), tf.arg2() != 0),
        Sysno::Sysconf => sys::sys_sysconf(tf.arg0()),
        Sysno::Spawn => task::sys_spawn(tf.arg0().into(), tf.arg1().into(), tf.arg2().into()),
        Sysno::ThreadSched => task::sys_thread_sched(
            tf.arg0() as u32,
            tf.arg1() as u32,
            tf.arg2(),
            tf.arg3(),
        ),
        Sysno::Fcntl => fs::sys_fcntl(tf.arg0() as i32, tf.arg1() as u32, tf.arg2() as usize),
        Sysno::ExitThread => task::sys_exit_thread(),
        Sysno::GetRandom => sys::sys_getrandom(tf.arg0().into(), tf.arg1() as usize),
        Sysno::Mprotect => mm::sys_mprotect(tf.arg0() as usize, tf.arg1() as usize, tf.arg2() as u32),
        Sysno::GetMacCapabilities => mac::sys_get_mac_capabilities(),
        Sysno::SetMacCapabilities => mac::sys_set_mac_capabilities(tf.arg0()),
        Sysno::LockMac => mac::sys_lock_mac(),
        Sysno::SetMacEnforcement => mac::sys_set_mac_enforcement(tf.arg0()),
        Sysno::AddMacFilter => mac::sys_add_mac_filter(tf.arg0().into()),
        Sysno::Mount => fs::sys_mount(tf.arg0().into(), tf.arg1().into(), tf.arg2() as u32),
        Sysno::Umount => fs::sys_umount(tf.arg0().into(), tf.arg1() != 0),
        Sysno::ReadLink => fs::sys_readlink(tf.arg0().into(), tf.arg1().into(), tf.arg2() as usize),
        Sysno::GetDents => fs::sys_getdents(tf.arg0() as i32, tf.arg1().into(), tf.arg2() as usize),
        Sysno::Sync => fs::sys_sync(),
        Sysno::Mknod => fs::sys_mknod(
            tf.arg0().into(),
            tf.arg1() as u32,
            tf.arg2() as u32,
            tf.arg3() as u32,
        ),
        Sysno::Unlink => fs::sys_unlink(tf.arg0().into()),
        Sysno::Truncate => fs::sys_truncate(tf.arg0() as i32, tf.arg1()),
        Sysno::Symlink => fs::sys_symlink(tf.arg0().into(), tf.arg1().into()),
        Sysno::IntegritySetup => sys::sys_integrity_setup(tf.arg0()),
        Sysno::OpenPty => fs::sys_openpty(tf.arg0().into(), tf.arg1() as u32),
        Sysno::Fsync => fs::sys_fsync(tf.arg0() as i32),
        Sysno::Link => fs::sys_link(tf.arg0().into(), tf.arg1().into()),
        Sysno::Ptrace => task::sys_ptrace(tf.arg0() as u32, tf.arg1() as u32, tf.arg2() as i32),
        Sysno::Poll => poll::sys_poll(tf.arg0().into(), tf.arg1() as usize, tf.arg2() as i64),
    }
}

/// Mirror the call into the tracer's descriptor, when one is attached.
fn trace_to_tracer(sysno: Sysno, tf: &TrapFrame) {
    let Some(proc) = keel_core::task::current_process() else {
        return;
    };
    let Some((tracer_pid, fd)) = proc.tracer() else {
        return;
    };
    debug!(
        "trace: pid {} {}({:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x})",
        proc.pid(),
        sysno.name(),
        tf.arg0(),
        tf.arg1(),
        tf.arg2(),
        tf.arg3(),
        tf.arg4(),
        tf.arg5()
    );
    if let Ok(tracer) = keel_core::task::get_by_pid(tracer_pid)
        && let Ok(file) = tracer.get_file(fd)
    {
        let line = format!(
            "{}({:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x})\n",
            sysno.name(),
            tf.arg0(),
            tf.arg1(),
            tf.arg2(),
            tf.arg3(),
            tf.arg4(),
            tf.arg5()
        );
        let _ = file.description.write(line.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::Sysno;

    #[test]
    fn numbers_are_stable() {
        assert_eq!(Sysno::from_raw(0), Some(Sysno::Exit));
        assert_eq!(Sysno::from_raw(2), Some(Sysno::Open));
        assert_eq!(Sysno::from_raw(7), Some(Sysno::Mmap));
        // 11 was retired and must stay dead.
        assert_eq!(Sysno::from_raw(11), None);
        assert_eq!(Sysno::from_raw(14), Some(Sysno::Wait));
        assert_eq!(Sysno::from_raw(37), Some(Sysno::Mount));
        assert_eq!(Sysno::from_raw(51), Some(Sysno::Poll));
        assert_eq!(Sysno::from_raw(52), None);
    }

    #[test]
    fn every_number_round_trips() {
        for raw in 0..64 {
            if let Some(sysno) = Sysno::from_raw(raw) {
                assert_eq!(sysno as u64, raw);
            }
        }
    }
}

/// Entry point from the trap glue.
pub fn handle_syscall(tf: &mut TrapFrame) {
    let raw = tf.syscall_number();
    let Some(sysno) = Sysno::from_raw(raw) else {
        debug!("unknown syscall {}", raw);
        tf.set_return(u64::MAX, LinuxError::ENOSYS.code() as u64);
        return;
    };

    trace!("syscall {}", sysno.name());
    trace_to_tracer(sysno, tf);

    match dispatch(tf, sysno) {
        Ok(value) => tf.set_return(value as u64, 0),
        Err(err) => {
            debug!("syscall {} failed: {:?}", sysno.name(), err);
            tf.set_return(u64::MAX, err.code() as u64);
        }
    }
}
