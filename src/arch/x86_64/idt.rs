//! The IDT and the trap entry stubs.
//!
//! Every stub saves the register file in the core's `TrapFrame` layout,
//! hands a pointer to a Rust handler and restores on the way out. The
//! syscall gate (0x80) is the only ring-3 callable vector.

use core::arch::naked_asm;

use keel_core::arch::TrapFrame;
use lazy_static::lazy_static;
use x86_64::VirtAddr;
use x86_64::structures::idt::InterruptDescriptorTable;

use super::lapic;

pub const TIMER_VECTOR: u8 = 0x20;
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Save the register file (no error code on the stack), call `$handler`
/// with the frame pointer, restore, return.
macro_rules! trap_stub {
    ($name:ident, $handler:ident) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            naked_asm!(
                "push rax",
                "push rbx",
                "push rcx",
                "push rdx",
                "push rsi",
                "push rdi",
                "push rbp",
                "push r8",
                "push r9",
                "push r10",
                "push r11",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "mov rdi, rsp",
                "call {handler}",
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
                handler = sym $handler,
            );
        }
    };
}

/// Same, for vectors where the CPU pushes an error code: it rides in the
/// second argument and is dropped before `iretq`.
macro_rules! trap_stub_err {
    ($name:ident, $handler:ident) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            naked_asm!(
                "push rax",
                "push rbx",
                "push rcx",
                "push rdx",
                "push rsi",
                "push rdi",
                "push rbp",
                "push r8",
                "push r9",
                "push r10",
                "push r11",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "mov rdi, rsp",
                "mov rsi, [rsp + 15 * 8]",
                "call {handler}",
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
                "add rsp, 8",
                "iretq",
                handler = sym $handler,
            );
        }
    };
}

trap_stub!(timer_entry, timer_handler);
trap_stub!(syscall_entry, syscall_handler);
trap_stub_err!(page_fault_entry, page_fault_handler);
trap_stub_err!(protection_fault_entry, protection_fault_handler);
trap_stub_err!(double_fault_entry, double_fault_handler);

extern "C" fn timer_handler(_tf: &mut TrapFrame) {
    // Acknowledge first: the tick may switch away and only return to this
    // frame much later.
    lapic::eoi();
    keel_core::sched::timer_tick();
}

extern "C" fn syscall_handler(tf: &mut TrapFrame) {
    // The gate cleared IF; syscalls may block and need the timer running.
    keel_core::arch::enable_interrupts();
    keel_api::handle_syscall(tf);
    keel_core::arch::disable_interrupts();
}

/// Kill the offending process, or panic if the kernel itself faulted.
fn fatal_fault(tf: &TrapFrame, what: &str, detail: u64) -> ! {
    if tf.is_user()
        && let Some(proc) = keel_core::task::current_process()
    {
        warn!(
            "pid {}: {} at {:#x} ({:#x})",
            proc.pid(),
            what,
            tf.rip,
            detail
        );
        keel_core::task::do_exit(&proc, 139);
    }
    panic!("{} in kernel at {:#x} ({:#x})", what, tf.rip, detail);
}

extern "C" fn page_fault_handler(tf: &mut TrapFrame, error: u64) {
    let addr = x86_64::registers::control::Cr2::read_raw();
    let _ = error;
    fatal_fault(tf, "page fault", addr);
}

extern "C" fn protection_fault_handler(tf: &mut TrapFrame, error: u64) {
    fatal_fault(tf, "general protection fault", error);
}

extern "C" fn double_fault_handler(tf: &mut TrapFrame, error: u64) {
    panic!("double fault at {:#x} ({:#x})", tf.rip, error);
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        unsafe {
            idt.page_fault
                .set_handler_addr(VirtAddr::new(page_fault_entry as usize as u64));
            idt.general_protection_fault
                .set_handler_addr(VirtAddr::new(protection_fault_entry as usize as u64));
            idt.double_fault
                .set_handler_addr(VirtAddr::new(double_fault_entry as usize as u64))
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST);
            idt[TIMER_VECTOR].set_handler_addr(VirtAddr::new(timer_entry as usize as u64));
            idt[SYSCALL_VECTOR]
                .set_handler_addr(VirtAddr::new(syscall_entry as usize as u64))
                .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}
