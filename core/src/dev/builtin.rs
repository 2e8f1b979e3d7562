//! The always-present character devices: `null`, `zero`, `urandom`.

use alloc::sync::Arc;

use axerrno::LinuxResult;
use rand::{RngCore, SeedableRng, rngs::SmallRng};
use spin::Mutex;

use super::{Device, DeviceOps, register};

struct Null;

impl DeviceOps for Null {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> LinuxResult<usize> {
        Ok(0)
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> LinuxResult<usize> {
        Ok(buf.len())
    }
}

struct Zero;

impl DeviceOps for Zero {
    fn read(&self, _offset: u64, buf: &mut [u8]) -> LinuxResult<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> LinuxResult<usize> {
        Ok(buf.len())
    }
}

struct Urandom {
    rng: Mutex<SmallRng>,
}

impl DeviceOps for Urandom {
    fn read(&self, _offset: u64, buf: &mut [u8]) -> LinuxResult<usize> {
        self.rng.lock().fill_bytes(buf);
        Ok(buf.len())
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> LinuxResult<usize> {
        // Writes stir nothing but are accepted, like the real thing.
        Ok(buf.len())
    }
}

/// Draw from the kernel entropy pool.
pub fn get_random(buf: &mut [u8]) -> LinuxResult<usize> {
    match super::fetch("urandom") {
        Some(handle) => super::read(handle, 0, buf),
        None => {
            buf.fill(0);
            Ok(buf.len())
        }
    }
}

/// Register the built-in devices. `seed` comes from the boot-time entropy
/// source (the binary's RNG back-end).
pub fn init_builtin(seed: u64) -> LinuxResult<()> {
    register(Device::new_char("null", Arc::new(Null)))?;
    register(Device::new_char("zero", Arc::new(Zero)))?;
    register(Device::new_char(
        "urandom",
        Arc::new(Urandom {
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }),
    ))?;
    Ok(())
}
