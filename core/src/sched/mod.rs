//! The pre-emptive thread scheduler.
//!
//! Round-robin over per-core ready queues. A thread's preference (1..=20)
//! scales its time slice; deadline hints boost threads that have not yet
//! received their declared run time in the current period, and threads that
//! already have are passed over until the period rolls. Mono threads are
//! queued only on their designated core.
//!
//! Queue mutation happens with interrupts disabled; the timer interrupt and
//! the explicit `yield`/`bail` paths both funnel into [`schedule`].

mod thread;
mod wait;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use axerrno::LinuxResult;
use kspin::SpinNoIrq;

pub use thread::{Deadlines, Thread, ThreadContext, ThreadState, Tid, get_thread};
pub use wait::WaitQueue;

use crate::arch::{self, GpContext, TrapFrame};
use crate::config::{MAX_CPUS, TICKS_PER_PREFERENCE, TIMER_PERIOD_US};

struct IdleContext(UnsafeCell<GpContext>);
unsafe impl Sync for IdleContext {}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_QUEUE: SpinNoIrq<VecDeque<Tid>> = SpinNoIrq::new(VecDeque::new());
#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: SpinNoIrq<Option<Arc<Thread>>> = SpinNoIrq::new(None);
#[allow(clippy::declare_interior_mutable_const)]
const IDLE_CTX: IdleContext = IdleContext(UnsafeCell::new(GpContext::zeroed()));
#[allow(clippy::declare_interior_mutable_const)]
const SLICE_ZERO: AtomicI64 = AtomicI64::new(0);

static RUN_QUEUES: [SpinNoIrq<VecDeque<Tid>>; MAX_CPUS] = [EMPTY_QUEUE; MAX_CPUS];
static CURRENT: [SpinNoIrq<Option<Arc<Thread>>>; MAX_CPUS] = [EMPTY_SLOT; MAX_CPUS];
/// The context each core parks in when it has nothing to run.
static IDLE: [IdleContext; MAX_CPUS] = [IDLE_CTX; MAX_CPUS];
/// Remaining time slice of the running thread, in ticks.
static SLICE: [AtomicI64; MAX_CPUS] = [SLICE_ZERO; MAX_CPUS];
/// A dead thread's last reference parks here until the next reschedule on
/// the same core, keeping its stack alive across the final switch.
static GRAVEYARD: [SpinNoIrq<Option<Arc<Thread>>>; MAX_CPUS] = [EMPTY_SLOT; MAX_CPUS];

static NUM_CPUS: AtomicUsize = AtomicUsize::new(1);
static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

/// Record the number of online cores. Called once during boot.
pub fn init(num_cpus: usize) {
    NUM_CPUS.store(num_cpus.clamp(1, MAX_CPUS), Ordering::Relaxed);
}

/// Number of cores the scheduler spreads work over.
pub fn num_cpus() -> usize {
    NUM_CPUS.load(Ordering::Relaxed)
}

/// The thread running on this core, if the core is not idle.
pub fn current_thread() -> Option<Arc<Thread>> {
    CURRENT[arch::cpu_id()].lock().clone()
}

/// TID of the running thread; 0 when idle or in early boot.
pub fn current_tid() -> Tid {
    CURRENT[arch::cpu_id()]
        .lock()
        .as_ref()
        .map_or(0, |t| t.tid())
}

/// Whether any core is still executing (or finishing the last switch away
/// from) a thread of `pid`. Reaping a process's address space must wait
/// for this to clear.
pub fn process_is_running(pid: u32) -> bool {
    for cpu in 0..num_cpus() {
        if CURRENT[cpu].lock().as_ref().is_some_and(|t| t.pid() == pid)
            || GRAVEYARD[cpu].lock().as_ref().is_some_and(|t| t.pid() == pid)
        {
            return true;
        }
    }
    false
}

/// Whether a specific thread is still current (or parked in a graveyard
/// slot) on some core.
pub fn thread_is_current_anywhere(tid: Tid) -> bool {
    for cpu in 0..num_cpus() {
        if CURRENT[cpu].lock().as_ref().is_some_and(|t| t.tid() == tid)
            || GRAVEYARD[cpu].lock().as_ref().is_some_and(|t| t.tid() == tid)
        {
            return true;
        }
    }
    false
}

/// Whether the core is executing on behalf of a user process.
pub fn is_userspace() -> bool {
    CURRENT[arch::cpu_id()]
        .lock()
        .as_ref()
        .is_some_and(|t| t.pid() != 0)
}

fn queue_for(thread: &Thread) -> usize {
    if let Some(core) = thread.mono_core() {
        core % num_cpus()
    } else {
        NEXT_CPU.fetch_add(1, Ordering::Relaxed) % num_cpus()
    }
}

/// Put a thread on a ready queue.
fn enqueue(thread: &Arc<Thread>) {
    let cpu = queue_for(thread);
    RUN_QUEUES[cpu].lock().push_back(thread.tid());
}

/// Move a blocked thread back to ready and queue it.
pub(crate) fn wake(tid: Tid) {
    if let Ok(thread) = get_thread(tid)
        && thread.try_unblock()
    {
        enqueue(&thread);
    }
}

/// Claim the next thread for `cpu`: first a deadline thread that is behind
/// on its budget, else the oldest eligible entry. Claiming transitions
/// Ready -> Running so two cores can never pick the same thread.
fn pick_next(cpu: usize) -> Option<Arc<Thread>> {
    // Entries re-pinned to another core are handed over after our own queue
    // lock is released; taking two queue locks at once would deadlock.
    let mut handover: alloc::vec::Vec<(usize, Tid)> = alloc::vec::Vec::new();
    let mut chosen = None;

    {
        let mut queue = RUN_QUEUES[cpu].lock();
        let now = crate::time::monotonic_us();

        'passes: for boost_pass in [true, false] {
            let mut idx = 0;
            while idx < queue.len() {
                let tid = queue[idx];
                let Ok(thread) = get_thread(tid) else {
                    // Deleted while queued.
                    queue.remove(idx);
                    continue;
                };
                if let Some(core) = thread.mono_core()
                    && core % num_cpus() != cpu
                {
                    queue.remove(idx);
                    handover.push((core % num_cpus(), tid));
                    continue;
                }
                if thread.is_banned() {
                    idx += 1;
                    continue;
                }
                if boost_pass {
                    let mut dl = thread.deadline.lock();
                    match dl.as_mut() {
                        Some(state) => {
                            if now.saturating_sub(state.period_start) >= state.hint.period {
                                state.period_start = now;
                                state.ran = 0;
                            }
                            if state.ran >= state.hint.run_time {
                                // Budget already served (or overdrawn):
                                // deprioritised until the period rolls.
                                idx += 1;
                                continue;
                            }
                        }
                        None => {
                            idx += 1;
                            continue;
                        }
                    }
                }
                if !thread.try_claim_running() {
                    // Stale duplicate or not runnable.
                    queue.remove(idx);
                    continue;
                }
                queue.remove(idx);
                chosen = Some(thread);
                break 'passes;
            }
        }
    }

    for (core, tid) in handover {
        RUN_QUEUES[core].lock().push_back(tid);
    }
    chosen
}

fn idle_ctx(cpu: usize) -> *mut GpContext {
    IDLE[cpu].0.get()
}

/// Core of the scheduler: pick, account, switch. Interrupts must be
/// disabled. Returns (in the caller's context) when the caller is scheduled
/// again.
fn schedule() {
    let cpu = arch::cpu_id();
    // Release whoever died on this core last time around.
    GRAVEYARD[cpu].lock().take();

    let next = pick_next(cpu);

    let prev = {
        let mut slot = CURRENT[cpu].lock();
        match &next {
            Some(next) => slot.replace(next.clone()),
            None => {
                // Keep running if the current thread still can.
                if slot
                    .as_ref()
                    .is_some_and(|t| t.state() == ThreadState::Running && !t.is_banned())
                {
                    return;
                }
                slot.take()
            }
        }
    };

    let prev_ctx: *mut GpContext = match &prev {
        Some(prev) => unsafe { &mut prev.ctx_mut().gp },
        None => idle_ctx(cpu),
    };
    let next_ctx: *const GpContext = match &next {
        Some(next) => unsafe { &next.ctx_mut().gp },
        None => idle_ctx(cpu),
    };
    if core::ptr::eq(prev_ctx, next_ctx) {
        return;
    }

    if let Some(prev) = &prev {
        unsafe { prev.ctx_mut().fp.save() };
        match prev.state() {
            ThreadState::Running => {
                // Preempted or yielding: back of the line.
                prev.set_state(ThreadState::Ready);
                enqueue(prev);
            }
            ThreadState::Zombie => {
                *GRAVEYARD[cpu].lock() = Some(prev.clone());
            }
            // Blocked threads are owned by their wait queue now.
            _ => {}
        }
    }

    match &next {
        Some(next) => {
            let ctx = unsafe { next.ctx_mut() };
            SLICE[cpu].store(
                next.preference() as i64 * TICKS_PER_PREFERENCE as i64,
                Ordering::Relaxed,
            );
            arch::set_kernel_stack(ctx.kstack_top);
            arch::set_tls_base(ctx.tls);
            if ctx.page_table_root != arch::read_page_table_root() {
                unsafe { arch::write_page_table_root(ctx.page_table_root) };
            }
            ctx.fp.restore();
        }
        None => unsafe {
            arch::write_page_table_root(crate::mm::kernel_root_paddr());
        },
    }

    // Drop the Arcs before switching stacks: a thread that never resumes
    // must not strand references in its dead frame.
    drop(prev);
    drop(next);
    unsafe { arch::context_switch(prev_ctx, next_ctx) };
}

/// Voluntarily give up the CPU.
pub fn yield_now() {
    let reenable = arch::irqs_enabled();
    arch::disable_interrupts();
    schedule();
    if reenable {
        arch::enable_interrupts();
    }
}

/// Timer-interrupt hook: clock accounting, deadline accounting, preemption.
/// Must be called with interrupts disabled, after the interrupt was
/// acknowledged.
pub fn timer_tick() {
    let cpu = arch::cpu_id();
    if cpu == 0 {
        crate::time::on_tick();
    }
    if let Some(current) = CURRENT[cpu].lock().clone()
        && let Some(state) = current.deadline.lock().as_mut()
    {
        state.ran += TIMER_PERIOD_US;
    }
    if SLICE[cpu].fetch_sub(1, Ordering::Relaxed) <= 1 {
        schedule();
    }
}

/// Terminate the calling thread and never return. Switches off the dying
/// address space before the thread becomes reapable.
pub fn bail() -> ! {
    arch::disable_interrupts();
    unsafe { arch::write_page_table_root(crate::mm::kernel_root_paddr()) };
    let cpu = arch::cpu_id();
    if let Some(current) = CURRENT[cpu].lock().as_ref() {
        current.set_state(ThreadState::Zombie);
        thread::remove_thread(current.tid());
    }
    schedule();
    unreachable!("bailed thread was rescheduled");
}

/// The per-core idle loop: run ready threads, halt when there are none.
/// Entered at the end of boot on every core, with interrupts enabled.
pub fn idle_core() -> ! {
    loop {
        arch::disable_interrupts();
        schedule();
        arch::halt_until_interrupt();
    }
}

/// Entry stub popped by the first switch into a new thread: interrupts on,
/// argument into place, then the entry function. Falling out of the entry
/// terminates the thread.
#[cfg(target_os = "none")]
#[unsafe(naked)]
unsafe extern "C" fn thread_start() {
    core::arch::naked_asm!("sti", "mov rdi, r13", "call r12", "jmp {bail}", bail = sym bail_trampoline);
}

#[cfg(not(target_os = "none"))]
extern "C" fn thread_start() {
    unreachable!("thread_start is only reachable on the kernel target");
}

#[cfg(target_os = "none")]
extern "C" fn bail_trampoline() -> ! {
    bail()
}

/// First user-space entry: load the thread's prepared trap frame and drop
/// to ring 3.
extern "C" fn user_entry(tid: usize) -> ! {
    let thread = get_thread(tid as Tid).expect("entered user thread vanished");
    let frame: *const TrapFrame = unsafe { &thread.ctx_mut().trap_frame };
    drop(thread);
    unsafe { enter_user(frame) }
}

#[cfg(target_os = "none")]
#[unsafe(naked)]
unsafe extern "C" fn enter_user(frame: *const TrapFrame) -> ! {
    core::arch::naked_asm!(
        "cli",
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
    );
}

#[cfg(not(target_os = "none"))]
unsafe extern "C" fn enter_user(_frame: *const TrapFrame) -> ! {
    unreachable!("enter_user is only reachable on the kernel target");
}

/// Spawn a kernel thread. Fails with `EAGAIN` when the thread table is
/// full.
pub fn create_kernel_thread(entry: fn(usize), arg: usize) -> LinuxResult<Tid> {
    let thread = thread::alloc_thread(0)?;
    unsafe {
        let ctx = thread.ctx_mut();
        ctx.gp = GpContext::prepared(ctx.kstack_top, thread_start as usize, entry as usize, arg);
    }
    enqueue(&thread);
    Ok(thread.tid())
}

/// Spawn a thread that enters user space through `frame`, running on the
/// address space rooted at `page_table_root` for process `pid`.
pub fn create_user_thread(
    frame: TrapFrame,
    page_table_root: u64,
    tls: usize,
    pid: u32,
) -> LinuxResult<Tid> {
    let thread = thread::alloc_thread(pid)?;
    unsafe {
        let ctx = thread.ctx_mut();
        ctx.trap_frame = frame;
        ctx.page_table_root = page_table_root;
        ctx.tls = tls;
        ctx.gp = GpContext::prepared(
            ctx.kstack_top,
            thread_start as usize,
            user_entry as usize,
            thread.tid() as usize,
        );
    }
    enqueue(&thread);
    Ok(thread.tid())
}

/// Tear a thread down. Safe against threads blocked on a wait queue or
/// running on another core; self-deletion never returns.
pub fn delete_thread(tid: Tid) -> LinuxResult<()> {
    let thread = get_thread(tid)?;
    thread.set_state(ThreadState::Zombie);
    thread::remove_thread(tid);
    if current_tid() == tid {
        bail();
    }
    drop(thread);
    Ok(())
}

/// Exclude or re-admit a thread from scheduling.
pub fn ban_thread(tid: Tid, banned: bool) -> LinuxResult<()> {
    get_thread(tid)?.set_banned(banned);
    Ok(())
}

/// Pin `tid` to `core`, or unpin it.
pub fn set_mono_thread(tid: Tid, core: Option<usize>) -> LinuxResult<()> {
    if let Some(core) = core
        && core >= num_cpus()
    {
        return Err(axerrno::LinuxError::EINVAL);
    }
    get_thread(tid)?.set_mono_core(core);
    Ok(())
}
