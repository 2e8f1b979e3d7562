//! 16550 serial ports, registered as `serial0..3`.
//!
//! Only the data path lives here; port probing and early-boot console
//! output belong to the kernel binary. On non-kernel targets the port
//! accessors are compiled out and the devices act as sinks.

use alloc::format;
use alloc::sync::Arc;

use axerrno::LinuxResult;

use super::{Device, DeviceOps, register};

const COM_PORTS: [u16; 4] = [0x3f8, 0x2f8, 0x3e8, 0x2e8];

struct SerialPort {
    base: u16,
}

impl SerialPort {
    #[cfg(target_os = "none")]
    fn put(&self, byte: u8) {
        use x86_64::instructions::port::Port;
        unsafe {
            let mut lsr: Port<u8> = Port::new(self.base + 5);
            while lsr.read() & 0x20 == 0 {
                core::hint::spin_loop();
            }
            let mut data: Port<u8> = Port::new(self.base);
            data.write(byte);
        }
    }

    #[cfg(not(target_os = "none"))]
    fn put(&self, _byte: u8) {}

    #[cfg(target_os = "none")]
    fn try_get(&self) -> Option<u8> {
        use x86_64::instructions::port::Port;
        unsafe {
            let mut lsr: Port<u8> = Port::new(self.base + 5);
            if lsr.read() & 0x01 != 0 {
                let mut data: Port<u8> = Port::new(self.base);
                Some(data.read())
            } else {
                None
            }
        }
    }

    #[cfg(not(target_os = "none"))]
    fn try_get(&self) -> Option<u8> {
        None
    }
}

impl DeviceOps for SerialPort {
    fn read(&self, _offset: u64, buf: &mut [u8]) -> LinuxResult<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.try_get() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> LinuxResult<usize> {
        for byte in buf {
            self.put(*byte);
        }
        Ok(buf.len())
    }
}

/// Register `serial0..3`.
pub fn register_serial_ports() -> LinuxResult<()> {
    for (i, base) in COM_PORTS.iter().enumerate() {
        register(Device::new_char(
            format!("serial{i}"),
            Arc::new(SerialPort { base: *base }),
        ))?;
    }
    Ok(())
}
