//! The process model: PIDs, FD tables, children, working directories, exit
//! state and the MAC context.
//!
//! Parent/child edges are PIDs in both directions, validated against the
//! process table at use; nothing owns a child pointer, so process teardown
//! cannot cycle. A process owns its address space and FD table; reaping it
//! in `wait` is what finally frees the address space.

use alloc::{
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use core::sync::atomic::{AtomicU32, Ordering};

use axerrno::{LinuxError, LinuxResult};
use flatten_objects::FlattenObjects;
use slab::Slab;
use spin::{Mutex, RwLock};

use crate::arch;
use crate::config::{ASLR_JITTER, FD_LIMIT, MAX_PROCESSES, PAGE_SIZE, USER_MMAP_BASE};
use crate::mac::MacContext;
use crate::mm::AddrSpace;
use crate::sched::{self, Tid, WaitQueue};
use crate::vfs::FileDescriptor;

/// Process identifier. 0 is never a valid PID.
pub type Pid = u32;

struct ProcessInner {
    fd_table: FlattenObjects<FileDescriptor, FD_LIMIT>,
    children: Vec<Pid>,
    threads: Vec<Tid>,
    cwd: String,
    /// Bump pointer for anonymous-mapping placement.
    alloc_base: usize,
    exit_code: i32,
    did_exit: bool,
    mac: MacContext,
    /// `(tracer pid, fd in the tracer's table)` receiving syscall traces.
    tracer: Option<(Pid, i32)>,
}

/// A process: address space, FD table, children, exit state, MAC context.
pub struct Process {
    pid: Pid,
    parent: AtomicU32,
    /// The address space, replaced wholesale on `exec`.
    pub aspace: Arc<Mutex<AddrSpace>>,
    inner: Mutex<ProcessInner>,
    /// Signalled every time one of this process's children exits.
    pub child_exit: WaitQueue,
}

static PROCESSES: RwLock<Slab<Arc<Process>>> = RwLock::new(Slab::new());

fn aslr_offset() -> usize {
    let mut raw = [0u8; 8];
    let _ = crate::dev::get_random(&mut raw);
    (usize::from_le_bytes(raw) % ASLR_JITTER) & !(PAGE_SIZE - 1)
}

impl Process {
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent_pid(&self) -> Pid {
        self.parent.load(Ordering::Acquire)
    }

    pub fn set_parent(&self, parent: Pid) {
        self.parent.store(parent, Ordering::Release);
    }

    // ---- FD table ----------------------------------------------------

    /// Place a descriptor in the lowest free slot.
    pub fn add_file(&self, fd: FileDescriptor) -> LinuxResult<i32> {
        self.inner
            .lock()
            .fd_table
            .add(fd)
            .map(|slot| slot as i32)
            .map_err(|_| LinuxError::EMFILE)
    }

    /// Install a descriptor at a specific slot, replacing what was there.
    pub fn replace_file(&self, slot: i32, fd: FileDescriptor) -> LinuxResult<()> {
        if !(0..FD_LIMIT as i32).contains(&slot) {
            return Err(LinuxError::EBADF);
        }
        let mut inner = self.inner.lock();
        inner.fd_table.remove(slot as usize);
        inner
            .fd_table
            .add_at(slot as usize, fd)
            .map(|_| ())
            .map_err(|_| LinuxError::EMFILE)
    }

    pub fn get_file(&self, slot: i32) -> LinuxResult<FileDescriptor> {
        if slot < 0 {
            return Err(LinuxError::EBADF);
        }
        self.inner
            .lock()
            .fd_table
            .get(slot as usize)
            .cloned()
            .ok_or(LinuxError::EBADF)
    }

    pub fn remove_file(&self, slot: i32) -> LinuxResult<FileDescriptor> {
        if slot < 0 {
            return Err(LinuxError::EBADF);
        }
        self.inner
            .lock()
            .fd_table
            .remove(slot as usize)
            .ok_or(LinuxError::EBADF)
    }

    pub fn is_valid_file(&self, slot: i32) -> bool {
        slot >= 0 && self.inner.lock().fd_table.get(slot as usize).is_some()
    }

    /// Flip the close-on-exec flag of one slot.
    pub fn set_close_on_exec(&self, slot: i32, value: bool) -> LinuxResult<()> {
        if slot < 0 {
            return Err(LinuxError::EBADF);
        }
        self.inner
            .lock()
            .fd_table
            .get_mut(slot as usize)
            .map(|fd| fd.close_on_exec = value)
            .ok_or(LinuxError::EBADF)
    }

    /// Close every open file.
    pub fn flush_files(&self) {
        let mut inner = self.inner.lock();
        for slot in 0..FD_LIMIT {
            inner.fd_table.remove(slot);
        }
    }

    /// Close the files marked close-on-exec.
    pub fn flush_exec_files(&self) {
        let mut inner = self.inner.lock();
        for slot in 0..FD_LIMIT {
            if inner
                .fd_table
                .get(slot)
                .is_some_and(|fd| fd.close_on_exec)
            {
                inner.fd_table.remove(slot);
            }
        }
    }

    // ---- working directory, MAC, tracer ------------------------------

    pub fn cwd(&self) -> String {
        self.inner.lock().cwd.clone()
    }

    pub fn set_cwd(&self, cwd: String) {
        self.inner.lock().cwd = cwd;
    }

    /// Read the MAC context.
    pub fn with_mac<R>(&self, f: impl FnOnce(&MacContext) -> R) -> R {
        f(&self.inner.lock().mac)
    }

    /// Mutate the MAC context.
    pub fn with_mac_mut<R>(&self, f: impl FnOnce(&mut MacContext) -> R) -> R {
        f(&mut self.inner.lock().mac)
    }

    pub fn tracer(&self) -> Option<(Pid, i32)> {
        self.inner.lock().tracer
    }

    pub fn set_tracer(&self, tracer: Option<(Pid, i32)>) {
        self.inner.lock().tracer = tracer;
    }

    // ---- anonymous-mapping placement ---------------------------------

    /// Reserve `len` bytes of address range for an anonymous mapping,
    /// leaving a guard page behind it.
    pub fn take_alloc_range(&self, len: usize) -> usize {
        let mut inner = self.inner.lock();
        let base = inner.alloc_base;
        inner.alloc_base += len.next_multiple_of(PAGE_SIZE) + PAGE_SIZE;
        base
    }

    /// Randomise the allocation base again, as `exec` does.
    pub fn reroll_aslr(&self) {
        self.inner.lock().alloc_base = USER_MMAP_BASE + aslr_offset();
    }

    // ---- threads ------------------------------------------------------

    pub fn add_thread(&self, tid: Tid) {
        self.inner.lock().threads.push(tid);
    }

    pub fn remove_thread(&self, tid: Tid) {
        self.inner.lock().threads.retain(|t| *t != tid);
    }

    pub fn threads(&self) -> Vec<Tid> {
        self.inner.lock().threads.clone()
    }

    /// Terminate every thread, except `keep` (the caller during exit and
    /// exec). Returns the terminated TIDs so the caller can drain them off
    /// other cores before pulling the address space.
    pub fn flush_threads(&self, keep: Option<Tid>) -> Vec<Tid> {
        let victims: Vec<Tid> = {
            let mut inner = self.inner.lock();
            let victims = inner
                .threads
                .iter()
                .copied()
                .filter(|t| Some(*t) != keep)
                .collect();
            inner.threads.retain(|t| Some(*t) == keep);
            victims
        };
        for tid in &victims {
            let _ = sched::delete_thread(*tid);
        }
        victims
    }

    // ---- children and exit state --------------------------------------

    pub fn children(&self) -> Vec<Pid> {
        self.inner.lock().children.clone()
    }

    pub fn is_child(&self, pid: Pid) -> bool {
        self.inner.lock().children.contains(&pid)
    }

    fn add_child(&self, pid: Pid) {
        self.inner.lock().children.push(pid);
    }

    fn remove_child(&self, pid: Pid) {
        self.inner.lock().children.retain(|c| *c != pid);
    }

    pub fn did_exit(&self) -> bool {
        self.inner.lock().did_exit
    }

    pub fn exit_code(&self) -> i32 {
        self.inner.lock().exit_code
    }

    fn record_exit(&self, code: i32) {
        let mut inner = self.inner.lock();
        inner.exit_code = code;
        inner.did_exit = true;
    }
}

/// Create a process around an existing address space. Inherits the working
/// directory and MAC context (lock included) from the parent; the boot
/// process starts at `/` with a permissive context.
pub fn create_process(
    parent: Option<&Arc<Process>>,
    aspace: AddrSpace,
) -> LinuxResult<Arc<Process>> {
    let mut table = PROCESSES.write();
    if table.len() >= MAX_PROCESSES {
        return Err(LinuxError::EAGAIN);
    }
    let entry = table.vacant_entry();
    let pid = entry.key() as Pid + 1;

    let (cwd, mac, parent_pid) = match parent {
        Some(parent) => (parent.cwd(), parent.with_mac(Clone::clone), parent.pid()),
        None => ("/".to_string(), MacContext::permissive(), 0),
    };

    let process = Arc::new(Process {
        pid,
        parent: AtomicU32::new(parent_pid),
        aspace: Arc::new(Mutex::new(aspace)),
        inner: Mutex::new(ProcessInner {
            fd_table: FlattenObjects::new(),
            children: Vec::new(),
            threads: Vec::new(),
            cwd,
            alloc_base: USER_MMAP_BASE + aslr_offset(),
            exit_code: 0,
            did_exit: false,
            mac,
            tracer: None,
        }),
        child_exit: WaitQueue::new(),
    });
    entry.insert(process.clone());
    drop(table);

    if let Some(parent) = parent {
        parent.add_child(pid);
    }
    Ok(process)
}

/// Fork: deep-copied address space, shared-object FD clones, same working
/// directory, inherited MAC context.
pub fn fork_process(parent: &Arc<Process>) -> LinuxResult<Arc<Process>> {
    let aspace = parent.aspace.lock().fork_map()?;
    let child = create_process(Some(parent), aspace)?;
    {
        let parent_inner = parent.inner.lock();
        let mut child_inner = child.inner.lock();
        for slot in 0..FD_LIMIT {
            if let Some(fd) = parent_inner.fd_table.get(slot) {
                let _ = child_inner.fd_table.add_at(slot, fd.clone());
            }
        }
        child_inner.alloc_base = parent_inner.alloc_base;
    }
    Ok(child)
}

/// Drop a process's table slot. The last `Arc` going away releases the
/// address space.
pub fn delete_process(pid: Pid) {
    let mut table = PROCESSES.write();
    let idx = pid.wrapping_sub(1) as usize;
    if table.contains(idx) {
        table.remove(idx);
    }
}

pub fn get_by_pid(pid: Pid) -> LinuxResult<Arc<Process>> {
    PROCESSES
        .read()
        .get(pid.wrapping_sub(1) as usize)
        .cloned()
        .ok_or(LinuxError::ESRCH)
}

/// The process owning thread `tid`.
pub fn get_by_thread(tid: Tid) -> LinuxResult<Arc<Process>> {
    let thread = sched::get_thread(tid)?;
    get_by_pid(thread.pid())
}

/// The process of the thread running on this core.
pub fn current_process() -> Option<Arc<Process>> {
    let thread = sched::current_thread()?;
    get_by_pid(thread.pid()).ok()
}

/// Encode an exit code the way `wait` reports it.
pub fn encode_exit_status(code: i32) -> u32 {
    ((code as u32) & 0xff) << 8
}

/// Terminate the current process: flush threads and files, record the exit
/// state, wake the parent and never return. The process stays in the table
/// as a zombie until the parent reaps it.
pub fn do_exit(process: &Arc<Process>, code: i32) -> ! {
    info!("process {} exits with code {}", process.pid(), code);
    let tid = sched::current_tid();
    process.flush_threads(Some(tid));
    process.flush_files();
    process.record_exit(code);

    // Step off the dying address space before the parent can free it.
    unsafe { arch::write_page_table_root(crate::mm::kernel_root_paddr()) };

    if let Ok(parent) = get_by_pid(process.parent_pid()) {
        parent.child_exit.notify_all();
    }
    sched::bail();
}

/// Wait for a child to exit. `pid` of -1 selects any child; `nohang` makes
/// an empty poll return `Ok(None)` instead of blocking. The reaped child's
/// slot and address space are freed here.
pub fn wait(
    process: &Arc<Process>,
    pid: i64,
    nohang: bool,
) -> LinuxResult<Option<(Pid, u32)>> {
    if pid >= 0 && !process.is_child(pid as Pid) {
        return Err(LinuxError::ECHILD);
    }

    let found = process.child_exit.wait_until(|| {
        let children = process.children();
        let targets: Vec<Pid> = match pid {
            -1 => children,
            wanted => children
                .into_iter()
                .filter(|c| *c as i64 == wanted)
                .collect(),
        };
        if targets.is_empty() {
            return Some(Err(LinuxError::ECHILD));
        }
        // Scan every candidate; the first exited child wins.
        for child_pid in targets {
            match get_by_pid(child_pid) {
                Ok(child) if child.did_exit() => {
                    let status = encode_exit_status(child.exit_code());
                    return Some(Ok(Some((child_pid, status))));
                }
                Ok(_) => {}
                Err(_) => {
                    // Stale PID; drop the edge.
                    process.remove_child(child_pid);
                }
            }
        }
        if nohang { Some(Ok(None)) } else { None }
    })?;

    let Some((child_pid, status)) = found else {
        return Ok(None);
    };
    // Another core may still be mid-switch away from the zombie's last
    // thread; its page tables cannot be freed under it.
    while sched::process_is_running(child_pid) {
        sched::yield_now();
    }
    process.remove_child(child_pid);
    delete_process(child_pid);
    Ok(Some((child_pid, status)))
}

/// Resolve `path` against a directory FD: the process working directory
/// for `AT_FDCWD`, else the absolute path of the open file behind the FD.
pub fn compound_at(process: &Arc<Process>, dir_fd: i32, path: &str) -> LinuxResult<String> {
    const AT_FDCWD: i32 = linux_raw_sys::general::AT_FDCWD;
    let base = if dir_fd == AT_FDCWD {
        process.cwd()
    } else {
        process
            .get_file(dir_fd)?
            .description
            .path()
            .ok_or(LinuxError::ENOTDIR)?
    };
    Ok(crate::vfs::path::compound(&base, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{FileDescription, FileDescriptor};

    fn new_process(parent: Option<&Arc<Process>>) -> Arc<Process> {
        crate::mm::testing::init_test_arena();
        create_process(parent, AddrSpace::new_map().unwrap()).unwrap()
    }

    #[test]
    fn parent_child_edges_are_pids() {
        let parent = new_process(None);
        let child = new_process(Some(&parent));
        assert!(parent.is_child(child.pid()));
        assert_eq!(child.parent_pid(), parent.pid());
        assert!(!parent.is_child(9999));

        delete_process(child.pid());
        assert!(get_by_pid(child.pid()).is_err());
    }

    #[test]
    fn fd_table_slots() {
        let proc = new_process(None);
        let (reader, writer) = crate::ipc::pipe_pair(false);
        let rd = proc
            .add_file(FileDescriptor::new(FileDescription::PipeReader(reader), false))
            .unwrap();
        let wr = proc
            .add_file(FileDescriptor::new(
                FileDescription::PipeWriter(writer),
                true,
            ))
            .unwrap();
        assert_eq!((rd, wr), (0, 1));
        assert!(proc.is_valid_file(rd));
        assert!(!proc.is_valid_file(7));

        // flush_exec_files drops only close-on-exec slots.
        proc.flush_exec_files();
        assert!(proc.is_valid_file(rd));
        assert!(!proc.is_valid_file(wr));

        proc.remove_file(rd).unwrap();
        assert!(matches!(proc.get_file(rd), Err(LinuxError::EBADF)));
    }

    #[test]
    fn fork_shares_file_objects_and_cwd() {
        let parent = new_process(None);
        parent.set_cwd("/usr/local".to_string());
        let (reader, writer) = crate::ipc::pipe_pair(false);
        parent
            .add_file(FileDescriptor::new(FileDescription::PipeReader(reader), false))
            .unwrap();
        parent
            .add_file(FileDescriptor::new(
                FileDescription::PipeWriter(writer),
                false,
            ))
            .unwrap();

        let child = fork_process(&parent).unwrap();
        assert_eq!(child.cwd(), "/usr/local");

        // Writing through the child's descriptor is visible to the parent's.
        child.get_file(1).unwrap().description.write(b"hi").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            parent.get_file(0).unwrap().description.read(&mut buf).unwrap(),
            2
        );
        assert_eq!(&buf[..2], b"hi");
    }

    #[test]
    fn wait_rejects_non_children() {
        let proc = new_process(None);
        assert!(matches!(wait(&proc, 42, true), Err(LinuxError::ECHILD)));
        // Any-child wait with no children at all is also ECHILD.
        assert!(matches!(wait(&proc, -1, true), Err(LinuxError::ECHILD)));
    }

    #[test]
    fn compound_at_uses_cwd() {
        let proc = new_process(None);
        proc.set_cwd("/usr/local".to_string());
        assert_eq!(
            compound_at(&proc, linux_raw_sys::general::AT_FDCWD, "../bin/./sh").unwrap(),
            "/usr/bin/sh"
        );
        assert_eq!(
            compound_at(&proc, linux_raw_sys::general::AT_FDCWD, "/etc/motd").unwrap(),
            "/etc/motd"
        );
    }
}
