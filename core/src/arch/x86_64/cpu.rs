//! Per-CPU identity, interrupt control and paging-register access.
//!
//! On non-kernel targets (host unit tests) these degrade to no-ops so the
//! core logic stays testable.

/// Record this core's scheduler index. Must be called once per core before
/// the scheduler runs on it.
pub fn init_cpu(id: usize) {
    #[cfg(target_os = "none")]
    unsafe {
        x86_64::registers::model_specific::GsBase::write(x86_64::VirtAddr::new(id as u64));
    }
    #[cfg(not(target_os = "none"))]
    let _ = id;
}

/// The scheduler index of the executing core.
#[inline]
pub fn cpu_id() -> usize {
    #[cfg(target_os = "none")]
    {
        x86_64::registers::model_specific::GsBase::read().as_u64() as usize
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Whether interrupts are enabled on this core.
#[inline]
pub fn irqs_enabled() -> bool {
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::are_enabled()
    }
    #[cfg(not(target_os = "none"))]
    {
        false
    }
}

#[inline]
pub fn disable_interrupts() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();
}

#[inline]
pub fn enable_interrupts() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable();
}

/// Enable interrupts and halt until the next one arrives.
#[inline]
pub fn halt_until_interrupt() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable_and_hlt();
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// Physical address of the active top-level page table.
#[inline]
pub fn read_page_table_root() -> u64 {
    #[cfg(target_os = "none")]
    {
        x86_64::registers::control::Cr3::read()
            .0
            .start_address()
            .as_u64()
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Load a new top-level page table.
///
/// # Safety
/// `root` must be the physical address of a valid page-table hierarchy that
/// maps the executing kernel code.
#[inline]
pub unsafe fn write_page_table_root(root: u64) {
    #[cfg(target_os = "none")]
    unsafe {
        use x86_64::structures::paging::PhysFrame;
        let frame = PhysFrame::from_start_address_unchecked(x86_64::PhysAddr::new(root));
        let (_, flags) = x86_64::registers::control::Cr3::read();
        x86_64::registers::control::Cr3::write(frame, flags);
    }
    #[cfg(not(target_os = "none"))]
    let _ = root;
}

/// Install the TLS pointer (FS base) for the executing thread.
pub fn set_tls_base(addr: usize) {
    #[cfg(target_os = "none")]
    unsafe {
        x86_64::registers::model_specific::FsBase::write(x86_64::VirtAddr::new(addr as u64));
    }
    #[cfg(not(target_os = "none"))]
    let _ = addr;
}

static KERNEL_STACK_HOOK: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

/// Register the binary's hook that points the trap stack (TSS RSP0) at a
/// thread's kernel stack.
pub fn register_kernel_stack_hook(hook: fn(usize)) {
    KERNEL_STACK_HOOK.store(hook as usize, core::sync::atomic::Ordering::Release);
}

/// Make `top` the stack traps land on. No-op until the binary registers its
/// hook.
pub fn set_kernel_stack(top: usize) {
    let hook = KERNEL_STACK_HOOK.load(core::sync::atomic::Ordering::Acquire);
    if hook != 0 {
        let hook: fn(usize) = unsafe { core::mem::transmute(hook) };
        hook(top);
    }
}

/// Invalidate the TLB entry covering `vaddr`, or the whole TLB when `None`.
#[inline]
pub fn flush_tlb(vaddr: Option<usize>) {
    #[cfg(target_os = "none")]
    match vaddr {
        Some(vaddr) => x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr as u64)),
        None => x86_64::instructions::tlb::flush_all(),
    }
    #[cfg(not(target_os = "none"))]
    let _ = vaddr;
}
