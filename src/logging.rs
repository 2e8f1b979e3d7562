//! The logging backend: wires `axlog` to the COM1 serial port.

use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::instructions::port::Port;

const COM1: u16 = 0x3f8;

static READY: AtomicBool = AtomicBool::new(false);

fn serial_setup() {
    unsafe {
        Port::<u8>::new(COM1 + 1).write(0x00); // no interrupts
        Port::<u8>::new(COM1 + 3).write(0x80); // DLAB
        Port::<u8>::new(COM1).write(0x01); // 115200 baud
        Port::<u8>::new(COM1 + 1).write(0x00);
        Port::<u8>::new(COM1 + 3).write(0x03); // 8n1
        Port::<u8>::new(COM1 + 2).write(0xc7); // FIFO
    }
}

fn serial_put(byte: u8) {
    unsafe {
        let mut lsr = Port::<u8>::new(COM1 + 5);
        while lsr.read() & 0x20 == 0 {
            core::hint::spin_loop();
        }
        Port::<u8>::new(COM1).write(byte);
    }
}

struct LogIfImpl;

#[crate_interface::impl_interface]
impl axlog::LogIf for LogIfImpl {
    fn console_write_str(s: &str) {
        if !READY.load(Ordering::Acquire) {
            return;
        }
        for byte in s.bytes() {
            if byte == b'\n' {
                serial_put(b'\r');
            }
            serial_put(byte);
        }
    }

    fn current_time() -> core::time::Duration {
        core::time::Duration::from_micros(keel_core::time::monotonic_us())
    }

    fn current_cpu_id() -> Option<usize> {
        Some(keel_core::arch::cpu_id())
    }

    fn current_task_id() -> Option<u64> {
        Some(keel_core::sched::current_tid() as u64)
    }
}

pub fn init() {
    serial_setup();
    READY.store(true, Ordering::Release);
    axlog::init();
    axlog::set_max_level(option_env!("LOG").unwrap_or("info"));
}
