//! GDT and TSS. The selector layout is fixed and shared with the core's
//! trap-frame constants.

use core::cell::UnsafeCell;

use keel_core::config::KERNEL_STACK_SIZE;
use lazy_static::lazy_static;
use x86_64::VirtAddr;
use x86_64::instructions::segmentation::{CS, DS, ES, SS, Segment};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;

struct SyncCell<T>(UnsafeCell<T>);
unsafe impl<T> Sync for SyncCell<T> {}

static TSS: SyncCell<TaskStateSegment> = SyncCell(UnsafeCell::new(TaskStateSegment::new()));

/// Separate stack for double faults; a corrupt kernel stack must not take
/// the handler down with it.
static DF_STACK: SyncCell<[u8; KERNEL_STACK_SIZE]> =
    SyncCell(UnsafeCell::new([0; KERNEL_STACK_SIZE]));

pub const DOUBLE_FAULT_IST: u16 = 0;

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    user_data: SegmentSelector,
    user_code: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let tss = gdt.append(Descriptor::tss_segment(unsafe { &*TSS.0.get() }));
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                user_data,
                user_code,
                tss,
            },
        )
    };
}

pub fn init() {
    unsafe {
        (*TSS.0.get()).interrupt_stack_table[DOUBLE_FAULT_IST as usize] =
            VirtAddr::new(DF_STACK.0.get() as u64 + KERNEL_STACK_SIZE as u64);
    }

    // The core hard-codes the selector values; the table must agree.
    assert_eq!(GDT.1.kernel_code.0, keel_core::arch::KERNEL_CS);
    assert_eq!(GDT.1.kernel_data.0, keel_core::arch::KERNEL_SS);
    assert_eq!(GDT.1.user_data.0, keel_core::arch::USER_SS);
    assert_eq!(GDT.1.user_code.0, keel_core::arch::USER_CS);

    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        SS::set_reg(GDT.1.kernel_data);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

/// Point the trap stack at a thread's kernel stack; the scheduler calls
/// this on every switch.
pub fn set_kernel_stack(top: usize) {
    unsafe {
        (*TSS.0.get()).privilege_stack_table[0] = VirtAddr::new(top as u64);
    }
}
