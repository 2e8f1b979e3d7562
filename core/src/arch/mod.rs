//! Architecture support for the kernel core.
//!
//! Only what the scheduler and the VMM need lives here: saved register
//! state, the context switch, CR3 handling and interrupt control. The rest
//! of the machine (GDT, IDT, APIC, timers) is owned by the kernel binary.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else {
        compile_error!("Unsupported architecture");
    }
}
