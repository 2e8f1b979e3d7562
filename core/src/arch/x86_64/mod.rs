mod context;
mod cpu;
mod trap;

pub use context::{FpContext, GpContext, context_switch};
pub use cpu::{
    cpu_id, disable_interrupts, enable_interrupts, flush_tlb, halt_until_interrupt, init_cpu,
    irqs_enabled, read_page_table_root, register_kernel_stack_hook, set_kernel_stack,
    set_tls_base, write_page_table_root,
};
pub use trap::{KERNEL_CS, KERNEL_SS, TrapFrame, USER_CS, USER_SS};
