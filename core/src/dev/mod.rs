//! The device registry: a bounded name -> resource table with a uniform
//! operation set.
//!
//! A handle is a small non-zero integer (0 is reserved for "no device") and
//! doubles as the device's unique ID. Ops a device does not implement
//! report `not supported`; every dispatched op holds the device's own
//! mutex.

mod builtin;
mod fb;
mod serial;

use alloc::{string::String, sync::Arc, vec::Vec};

use axerrno::{LinuxError, LinuxResult};
use spin::{Mutex, RwLock};

pub use builtin::{get_random, init_builtin};
pub use fb::{FramebufferInfo, register_bootfb};
pub use serial::register_serial_ports;

use crate::config::{DEVICE_NAME_MAX, MAX_DEVICES};

/// Registry handle of a device; 0 is never valid.
pub type DevHandle = u32;

/// The capability set of a device. Every operation defaults to "not
/// supported"; devices override what they actually do.
pub trait DeviceOps: Send + Sync {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> LinuxResult<usize> {
        Err(LinuxError::EOPNOTSUPP)
    }

    fn write(&self, _offset: u64, _buf: &[u8]) -> LinuxResult<usize> {
        Err(LinuxError::EOPNOTSUPP)
    }

    fn ioctl(&self, _cmd: u32, _arg: usize) -> LinuxResult<usize> {
        Err(LinuxError::ENOTTY)
    }

    fn sync(&self) -> LinuxResult<()> {
        Ok(())
    }

    /// Physical base to map for `mmap` of `[offset, offset + len)`.
    fn mmap(&self, _offset: u64, _len: usize) -> LinuxResult<u64> {
        Err(LinuxError::EOPNOTSUPP)
    }

    fn munmap(&self, _offset: u64, _len: usize) -> LinuxResult<()> {
        Ok(())
    }
}

/// A registered device resource.
pub struct Device {
    name: String,
    is_block: bool,
    block_size: u32,
    block_count: u64,
    /// Held across every dispatched operation.
    lock: Mutex<()>,
    ops: Arc<dyn DeviceOps>,
}

impl Device {
    /// A character device.
    pub fn new_char(name: impl Into<String>, ops: Arc<dyn DeviceOps>) -> Self {
        Self {
            name: name.into(),
            is_block: false,
            block_size: 0,
            block_count: 0,
            lock: Mutex::new(()),
            ops,
        }
    }

    /// A block device with fixed geometry.
    pub fn new_block(
        name: impl Into<String>,
        block_size: u32,
        block_count: u64,
        ops: Arc<dyn DeviceOps>,
    ) -> Self {
        Self {
            name: name.into(),
            is_block: true,
            block_size,
            block_count,
            lock: Mutex::new(()),
            ops,
        }
    }
}

static REGISTRY: RwLock<Vec<Arc<Device>>> = RwLock::new(Vec::new());

fn name_ok(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= DEVICE_NAME_MAX
        && name.bytes().all(|b| (0x20..0x7f).contains(&b))
}

/// Register a device under its unique name, yielding its handle.
pub fn register(device: Device) -> LinuxResult<DevHandle> {
    if !name_ok(&device.name) {
        return Err(LinuxError::EINVAL);
    }
    let mut registry = REGISTRY.write();
    if registry.len() >= MAX_DEVICES {
        return Err(LinuxError::ENOMEM);
    }
    if registry.iter().any(|d| d.name == device.name) {
        return Err(LinuxError::EEXIST);
    }
    registry.push(Arc::new(device));
    Ok(registry.len() as DevHandle)
}

/// Look a device up by name; a linear scan.
pub fn fetch(name: &str) -> Option<DevHandle> {
    let registry = REGISTRY.read();
    registry
        .iter()
        .position(|d| d.name == name)
        .map(|idx| idx as DevHandle + 1)
}

fn get(handle: DevHandle) -> LinuxResult<Arc<Device>> {
    REGISTRY
        .read()
        .get(handle.wrapping_sub(1) as usize)
        .cloned()
        .ok_or(LinuxError::ENOENT)
}

/// Name of a registered device.
pub fn name(handle: DevHandle) -> LinuxResult<String> {
    Ok(get(handle)?.name.clone())
}

pub fn is_block(handle: DevHandle) -> LinuxResult<bool> {
    Ok(get(handle)?.is_block)
}

pub fn block_size(handle: DevHandle) -> LinuxResult<u32> {
    Ok(get(handle)?.block_size)
}

pub fn block_count(handle: DevHandle) -> LinuxResult<u64> {
    Ok(get(handle)?.block_count)
}

/// The registered device names, in handle order.
pub fn names() -> Vec<String> {
    REGISTRY.read().iter().map(|d| d.name.clone()).collect()
}

pub fn read(handle: DevHandle, offset: u64, buf: &mut [u8]) -> LinuxResult<usize> {
    let device = get(handle)?;
    let _guard = device.lock.lock();
    device.ops.read(offset, buf)
}

pub fn write(handle: DevHandle, offset: u64, buf: &[u8]) -> LinuxResult<usize> {
    let device = get(handle)?;
    let _guard = device.lock.lock();
    device.ops.write(offset, buf)
}

pub fn ioctl(handle: DevHandle, cmd: u32, arg: usize) -> LinuxResult<usize> {
    let device = get(handle)?;
    let _guard = device.lock.lock();
    device.ops.ioctl(cmd, arg)
}

pub fn sync(handle: DevHandle) -> LinuxResult<()> {
    let device = get(handle)?;
    let _guard = device.lock.lock();
    device.ops.sync()
}

pub fn mmap(handle: DevHandle, offset: u64, len: usize) -> LinuxResult<u64> {
    let device = get(handle)?;
    let _guard = device.lock.lock();
    device.ops.mmap(offset, len)
}

pub fn munmap(handle: DevHandle, offset: u64, len: usize) -> LinuxResult<()> {
    let device = get(handle)?;
    let _guard = device.lock.lock();
    device.ops.munmap(offset, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl DeviceOps for Echo {
        fn read(&self, _offset: u64, buf: &mut [u8]) -> LinuxResult<usize> {
            buf.fill(b'e');
            Ok(buf.len())
        }
    }

    #[test]
    fn register_fetch_dispatch() {
        let handle = register(Device::new_char("echo0", Arc::new(Echo))).unwrap();
        assert_eq!(fetch("echo0"), Some(handle));
        assert_eq!(fetch("missing"), None);
        assert!(matches!(
            register(Device::new_char("echo0", Arc::new(Echo))),
            Err(LinuxError::EEXIST)
        ));

        let mut buf = [0u8; 4];
        assert_eq!(read(handle, 0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"eeee");
        // Absent ops report not-supported rather than pretending.
        assert!(matches!(
            write(handle, 0, b"x"),
            Err(LinuxError::EOPNOTSUPP)
        ));
        assert!(matches!(ioctl(handle, 1, 0), Err(LinuxError::ENOTTY)));
        assert!(!is_block(handle).unwrap());
    }

    #[test]
    fn bad_names_are_rejected() {
        assert!(register(Device::new_char("", Arc::new(Echo))).is_err());
        let long = alloc::string::String::from_utf8(alloc::vec![b'a'; 65]).unwrap();
        assert!(register(Device::new_char(long, Arc::new(Echo))).is_err());
        assert!(register(Device::new_char("bad\nname", Arc::new(Echo))).is_err());
    }
}
