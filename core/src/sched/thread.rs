//! Threads and the bounded thread table.

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use axerrno::{LinuxError, LinuxResult};
use kspin::SpinNoIrq;
use slab::Slab;
use spin::RwLock;

use crate::arch::{FpContext, GpContext, TrapFrame};
use crate::config::{KERNEL_STACK_SIZE, MAX_THREADS};

/// Thread identifier. 0 is never a valid TID.
pub type Tid = u32;

/// Scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Ready = 0,
    Running = 1,
    Blocked = 2,
    Zombie = 3,
}

impl ThreadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Blocked,
            _ => Self::Zombie,
        }
    }
}

/// A soft real-time hint: the thread wants `run_time` microseconds of CPU
/// in every `period` microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    pub run_time: u64,
    pub period: u64,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct DeadlineState {
    pub hint: Deadlines,
    /// Start of the current period, in monotonic microseconds.
    pub period_start: u64,
    /// CPU time received inside the current period.
    pub ran: u64,
}

/// Saved execution state, touched only by the core that owns the thread at
/// switch time.
pub struct ThreadContext {
    pub gp: GpContext,
    pub fp: FpContext,
    /// Top-level page table to load when this thread runs.
    pub page_table_root: u64,
    /// Top of the kernel stack, installed as the trap stack.
    pub kstack_top: usize,
    /// TLS pointer (FS base).
    pub tls: usize,
    /// User-mode register state for the first entry into user space, and
    /// the template `fork` copies for the child.
    pub trap_frame: TrapFrame,
}

struct KernelStack(*mut u8);

impl KernelStack {
    fn new() -> Self {
        let layout = core::alloc::Layout::from_size_align(KERNEL_STACK_SIZE, 16).unwrap();
        Self(unsafe { alloc::alloc::alloc_zeroed(layout) })
    }

    fn top(&self) -> usize {
        self.0 as usize + KERNEL_STACK_SIZE
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        let layout = core::alloc::Layout::from_size_align(KERNEL_STACK_SIZE, 16).unwrap();
        unsafe { alloc::alloc::dealloc(self.0, layout) };
    }
}

/// A schedulable thread.
pub struct Thread {
    tid: Tid,
    /// Owning process, 0 for kernel threads.
    pid: u32,
    state: AtomicU8,
    banned: AtomicBool,
    /// Scheduling weight, 1..=20.
    preference: AtomicU8,
    /// Core this thread is pinned to; `usize::MAX` when unpinned.
    mono: AtomicUsize,
    pub(super) deadline: SpinNoIrq<Option<DeadlineState>>,
    _stack: KernelStack,
    ctx: UnsafeCell<ThreadContext>,
}

// The context cell is only accessed by the scheduler while the thread is
// not running elsewhere.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    fn new(tid: Tid, pid: u32) -> Self {
        let stack = KernelStack::new();
        let kstack_top = stack.top();
        Self {
            tid,
            pid,
            state: AtomicU8::new(ThreadState::Ready as u8),
            banned: AtomicBool::new(false),
            preference: AtomicU8::new(10),
            mono: AtomicUsize::new(usize::MAX),
            deadline: SpinNoIrq::new(None),
            _stack: stack,
            ctx: UnsafeCell::new(ThreadContext {
                gp: GpContext::default(),
                fp: FpContext::new(),
                page_table_root: crate::mm::kernel_root_paddr(),
                kstack_top,
                tls: 0,
                trap_frame: TrapFrame::default(),
            }),
        }
    }

    pub const fn tid(&self) -> Tid {
        self.tid
    }

    /// Owning process ID; 0 for kernel threads.
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(super) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically claim the thread for execution (Ready -> Running); false
    /// if it was not ready, e.g. a stale queue entry.
    pub(super) fn try_claim_running(&self) -> bool {
        self.state
            .compare_exchange(
                ThreadState::Ready as u8,
                ThreadState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Atomically move Blocked -> Ready; false if the thread was not blocked.
    pub(super) fn try_unblock(&self) -> bool {
        self.state
            .compare_exchange(
                ThreadState::Blocked as u8,
                ThreadState::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_banned(&self) -> bool {
        self.banned.load(Ordering::Acquire)
    }

    pub fn set_banned(&self, banned: bool) {
        self.banned.store(banned, Ordering::Release);
    }

    pub fn preference(&self) -> u8 {
        self.preference.load(Ordering::Acquire)
    }

    pub fn set_preference(&self, preference: u8) -> LinuxResult<()> {
        if !(1..=20).contains(&preference) {
            return Err(LinuxError::EINVAL);
        }
        self.preference.store(preference, Ordering::Release);
        Ok(())
    }

    /// The core this thread is pinned to, if any.
    pub fn mono_core(&self) -> Option<usize> {
        match self.mono.load(Ordering::Acquire) {
            usize::MAX => None,
            core => Some(core),
        }
    }

    pub fn set_mono_core(&self, core: Option<usize>) {
        self.mono
            .store(core.unwrap_or(usize::MAX), Ordering::Release);
    }

    pub fn deadlines(&self) -> Option<Deadlines> {
        self.deadline.lock().map(|d| d.hint)
    }

    pub fn set_deadlines(&self, hint: Option<Deadlines>) -> LinuxResult<()> {
        if let Some(hint) = hint
            && (hint.period == 0 || hint.run_time == 0 || hint.run_time > hint.period)
        {
            return Err(LinuxError::EINVAL);
        }
        *self.deadline.lock() = hint.map(|hint| DeadlineState {
            hint,
            period_start: crate::time::monotonic_us(),
            ran: 0,
        });
        Ok(())
    }

    /// Mutable access to the saved context.
    ///
    /// # Safety
    /// Caller must guarantee the thread is not running on any core.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn ctx_mut(&self) -> &mut ThreadContext {
        unsafe { &mut *self.ctx.get() }
    }
}

static THREADS: RwLock<Slab<Arc<Thread>>> = RwLock::new(Slab::new());

/// Allocate a thread slot; fails with `EAGAIN` when the table is full.
pub(super) fn alloc_thread(pid: u32) -> LinuxResult<Arc<Thread>> {
    let mut table = THREADS.write();
    if table.len() >= MAX_THREADS {
        return Err(LinuxError::EAGAIN);
    }
    let entry = table.vacant_entry();
    let tid = entry.key() as Tid + 1;
    let thread = Arc::new(Thread::new(tid, pid));
    entry.insert(thread.clone());
    Ok(thread)
}

/// Look up a thread by TID.
pub fn get_thread(tid: Tid) -> LinuxResult<Arc<Thread>> {
    THREADS
        .read()
        .get(tid.wrapping_sub(1) as usize)
        .cloned()
        .ok_or(LinuxError::ESRCH)
}

/// Drop a thread's table slot. Outstanding `Arc`s (run queues, `CURRENT`)
/// keep the memory alive until the scheduler lets go.
pub(super) fn remove_thread(tid: Tid) -> Option<Arc<Thread>> {
    let mut table = THREADS.write();
    let idx = tid.wrapping_sub(1) as usize;
    if table.contains(idx) {
        Some(table.remove(idx))
    } else {
        None
    }
}
