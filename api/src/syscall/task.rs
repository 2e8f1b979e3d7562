//! Process and thread syscalls.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use axerrno::{LinuxError, LinuxResult};
use keel_core::arch::{self, TrapFrame};
use keel_core::config::{FD_LIMIT, USER_IMAGE_BASE};
use keel_core::mac::{Capabilities, FilterPerms};
use keel_core::mm::{self, AddrSpace, elf};
use keel_core::sched::{self, Deadlines};
use keel_core::task::{self, Process};
use keel_core::vfs::{self, AccessMode, OpenOptions};
use linux_raw_sys::general::WNOHANG;

use super::mac;
use crate::mm::{UserConstPtr, UserPtr, current, load_string_vector};

pub fn sys_exit(code: i32) -> LinuxResult<isize> {
    let proc = current()?;
    task::do_exit(&proc, code)
}

pub fn sys_set_tcb(addr: usize) -> LinuxResult<isize> {
    if addr != 0 && !mm::check_userland_mappability(addr, 1) {
        return Err(LinuxError::EFAULT);
    }
    let thread = sched::current_thread().ok_or(LinuxError::ESRCH)?;
    unsafe { thread.ctx_mut().tls = addr };
    arch::set_tls_base(addr);
    Ok(0)
}

pub fn sys_getpid() -> LinuxResult<isize> {
    Ok(current()?.pid() as isize)
}

pub fn sys_getppid() -> LinuxResult<isize> {
    Ok(current()?.parent_pid() as isize)
}

pub fn sys_fork(tf: &mut TrapFrame) -> LinuxResult<isize> {
    mac::require_capability(Capabilities::SPAWN, "fork")?;
    let parent = current()?;
    let child = task::fork_process(&parent)?;

    // The child resumes from the same frame, seeing 0.
    let mut child_tf = tf.clone();
    child_tf.set_return(0, 0);

    let tls = sched::current_thread()
        .map(|t| unsafe { t.ctx_mut().tls })
        .unwrap_or(0);
    let root = child.aspace.lock().root_paddr();
    match sched::create_user_thread(child_tf, root, tls, child.pid()) {
        Ok(tid) => {
            child.add_thread(tid);
            debug!("sys_fork => pid {}", child.pid());
            Ok(child.pid() as isize)
        }
        Err(err) => {
            task::delete_process(child.pid());
            Err(err)
        }
    }
}

pub fn sys_wait(pid: i64, status: UserPtr<i32>, options: u32) -> LinuxResult<isize> {
    let nohang = options & WNOHANG != 0;
    debug!("sys_wait <= pid {} nohang {}", pid, nohang);
    let proc = current()?;
    match task::wait(&proc, pid, nohang)? {
        Some((child, encoded)) => {
            if !status.is_null() {
                *status.get_as_mut()? = encoded as i32;
            }
            Ok(child as isize)
        }
        None => Ok(0),
    }
}

/// Read the whole binary at `abs` into memory.
fn slurp(abs: &str) -> LinuxResult<Vec<u8>> {
    let file = vfs::open(abs, OpenOptions::new(AccessMode::READ))?;
    let size = file.stat()?.size as usize;
    let mut image = alloc::vec![0u8; size];
    let mut done = 0;
    while done < size {
        let n = file.read_at(done as u64, &mut image[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    image.truncate(done);
    Ok(image)
}

fn exec_paths(
    proc: &Arc<Process>,
    path: UserConstPtr<u8>,
    argv: UserConstPtr<u64>,
    envp: UserConstPtr<u64>,
) -> LinuxResult<(String, Vec<String>, Vec<String>)> {
    let path = path.get_as_c_str()?;
    let abs = task::compound_at(proc, linux_raw_sys::general::AT_FDCWD, path)?;
    let mut args = load_string_vector(argv)?;
    if args.is_empty() {
        args.push(abs.clone());
    }
    let envs = load_string_vector(envp)?;
    Ok((abs, args, envs))
}

pub fn sys_exec(
    tf: &mut TrapFrame,
    path: UserConstPtr<u8>,
    argv: UserConstPtr<u64>,
    envp: UserConstPtr<u64>,
) -> LinuxResult<isize> {
    let proc = current()?;
    let (abs, args, envs) = exec_paths(&proc, path, argv, envp)?;
    info!("sys_exec <= {:?} ({} args)", abs, args.len());
    mac::require_path_access(&abs, FilterPerms::EXEC, "exec")?;

    // Everything that can fail happens against a detached address space;
    // the running image is untouched until the switch below.
    let image = slurp(&abs)?;
    let mut new_space = AddrSpace::new_map()?;
    let loaded = elf::load_image(&mut new_space, &image, USER_IMAGE_BASE, &args, &envs)?;

    let thread = sched::current_thread().ok_or(LinuxError::ESRCH)?;
    let victims = proc.flush_threads(Some(thread.tid()));
    // Siblings may still be mid-switch on other cores with the old map
    // loaded; the swap below must not free it under them.
    for victim in victims {
        while sched::thread_is_current_anywhere(victim) {
            sched::yield_now();
        }
    }
    proc.flush_exec_files();
    proc.reroll_aslr();

    {
        let mut aspace = proc.aspace.lock();
        let old = mem::replace(&mut *aspace, new_space);
        unsafe {
            aspace.activate();
            thread.ctx_mut().page_table_root = aspace.root_paddr();
        }
        drop(aspace);
        // Only now is the old map unloaded and safe to free.
        drop(old);
    }

    unsafe { thread.ctx_mut().tls = 0 };
    arch::set_tls_base(0);
    *tf = TrapFrame::new_user(loaded.entry, loaded.stack_top, 0);
    Ok(0)
}

pub fn sys_spawn(
    path: UserConstPtr<u8>,
    argv: UserConstPtr<u64>,
    envp: UserConstPtr<u64>,
) -> LinuxResult<isize> {
    mac::require_capability(Capabilities::SPAWN, "spawn")?;
    let parent = current()?;
    let (abs, args, envs) = exec_paths(&parent, path, argv, envp)?;
    info!("sys_spawn <= {:?}", abs);
    mac::require_path_access(&abs, FilterPerms::EXEC, "spawn")?;

    let image = slurp(&abs)?;
    let mut space = AddrSpace::new_map()?;
    let loaded = elf::load_image(&mut space, &image, USER_IMAGE_BASE, &args, &envs)?;

    let child = task::create_process(Some(&parent), space)?;
    for slot in 0..FD_LIMIT as i32 {
        if let Ok(fd) = parent.get_file(slot)
            && !fd.close_on_exec
        {
            let _ = child.replace_file(slot, fd);
        }
    }

    let frame = TrapFrame::new_user(loaded.entry, loaded.stack_top, 0);
    let root = child.aspace.lock().root_paddr();
    match sched::create_user_thread(frame, root, 0, child.pid()) {
        Ok(tid) => {
            child.add_thread(tid);
            Ok(child.pid() as isize)
        }
        Err(err) => {
            task::delete_process(child.pid());
            Err(err)
        }
    }
}

/// `thread_sched` operation codes.
const TS_GET_PREFERENCE: u32 = 0;
const TS_SET_PREFERENCE: u32 = 1;
const TS_SET_DEADLINES: u32 = 2;
const TS_SET_MONO: u32 = 3;
const TS_BAN: u32 = 4;
const TS_YIELD: u32 = 5;

pub fn sys_thread_sched(op: u32, tid: u32, a: u64, b: u64) -> LinuxResult<isize> {
    if op == TS_YIELD {
        sched::yield_now();
        return Ok(0);
    }
    mac::require_capability(Capabilities::CHANGE_SCHED, "thread_sched")?;

    let proc = current()?;
    let tid = if tid == 0 { sched::current_tid() } else { tid };
    if task::get_by_thread(tid)?.pid() != proc.pid() {
        return Err(LinuxError::EPERM);
    }
    let thread = sched::get_thread(tid)?;

    match op {
        TS_GET_PREFERENCE => Ok(thread.preference() as isize),
        TS_SET_PREFERENCE => {
            thread.set_preference(a as u8)?;
            Ok(0)
        }
        TS_SET_DEADLINES => {
            let hint = if a == 0 && b == 0 {
                None
            } else {
                Some(Deadlines {
                    run_time: a,
                    period: b,
                })
            };
            thread.set_deadlines(hint)?;
            Ok(0)
        }
        TS_SET_MONO => {
            let core = if a == u64::MAX {
                None
            } else {
                Some(a as usize)
            };
            sched::set_mono_thread(tid, core)?;
            Ok(0)
        }
        TS_BAN => {
            sched::ban_thread(tid, a != 0)?;
            Ok(0)
        }
        _ => Err(LinuxError::EINVAL),
    }
}

pub fn sys_exit_thread() -> LinuxResult<isize> {
    let proc = current()?;
    let tid = sched::current_tid();
    proc.remove_thread(tid);
    if proc.threads().is_empty() {
        task::do_exit(&proc, 0);
    }
    sched::delete_thread(tid)?;
    unreachable!("exit_thread returned");
}

/// `ptrace` requests: attach a tracer fd, or detach.
const PT_ATTACH: u32 = 0;
const PT_DETACH: u32 = 1;

pub fn sys_ptrace(request: u32, pid: u32, fd: i32) -> LinuxResult<isize> {
    mac::require_capability(Capabilities::TRACE, "ptrace")?;
    let proc = current()?;
    let target = task::get_by_pid(pid)?;
    match request {
        PT_ATTACH => {
            if !proc.is_valid_file(fd) {
                return Err(LinuxError::EBADF);
            }
            target.set_tracer(Some((proc.pid(), fd)));
            Ok(0)
        }
        PT_DETACH => {
            target.set_tracer(None);
            Ok(0)
        }
        _ => Err(LinuxError::EINVAL),
    }
}
