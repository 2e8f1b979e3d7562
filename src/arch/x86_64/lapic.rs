//! Just enough local-APIC to acknowledge interrupts and run the periodic
//! timer. Proper calibration against the HPET/PIT belongs to the platform
//! glue; the divider below approximates the configured tick on QEMU-class
//! hardware.

use keel_core::mm::phys_to_virt;

const LAPIC_BASE: u64 = 0xfee0_0000;

const REG_EOI: u64 = 0xb0;
const REG_SPURIOUS: u64 = 0xf0;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INIT: u64 = 0x380;
const REG_TIMER_DIVIDE: u64 = 0x3e0;

const TIMER_PERIODIC: u32 = 1 << 17;
const TIMER_INITIAL_COUNT: u32 = 1_000_000;

fn write(reg: u64, value: u32) {
    unsafe {
        (phys_to_virt(LAPIC_BASE + reg) as *mut u32).write_volatile(value);
    }
}

/// Acknowledge the in-service interrupt.
pub fn eoi() {
    write(REG_EOI, 0);
}

/// Enable the APIC and start the periodic scheduler tick.
pub fn init_timer() {
    write(REG_SPURIOUS, 0x100 | 0xff);
    write(REG_TIMER_DIVIDE, 0b1011); // divide by 1
    write(REG_LVT_TIMER, TIMER_PERIODIC | super::idt::TIMER_VECTOR as u32);
    write(REG_TIMER_INIT, TIMER_INITIAL_COUNT);
    keel_core::arch::enable_interrupts();
}
