mod gdt;
mod idt;
mod lapic;

pub use gdt::set_kernel_stack;
pub use lapic::init_timer;

/// Descriptor tables, trap vectors and the CPU features the core relies on
/// (NX for page protection, SSE for the FP context switch).
pub fn early_init() {
    gdt::init();
    idt::init();
    unsafe {
        use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};
        use x86_64::registers::model_specific::{Efer, EferFlags};
        Efer::update(|flags| flags.insert(EferFlags::NO_EXECUTE_ENABLE));
        Cr0::update(|flags| {
            flags.remove(Cr0Flags::EMULATE_COPROCESSOR);
            flags.insert(Cr0Flags::MONITOR_COPROCESSOR);
        });
        Cr4::update(|flags| {
            flags.insert(Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
        });
    }
}

/// Boot-time entropy for the kernel RNG: the cycle counter is the only
/// source this early.
pub fn entropy_seed() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}
