//! The boot framebuffer device, `bootfb`.
//!
//! The descriptor comes straight from the bootloader handoff. Reads and
//! writes go through the direct map; `mmap` hands user space the physical
//! window to map.

use alloc::sync::Arc;

use axerrno::{LinuxError, LinuxResult};

use super::{Device, DeviceOps, register};

/// Framebuffer geometry from the boot protocol.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Physical base address of the pixel array.
    pub address: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Bits per pixel.
    pub bpp: u16,
    pub red_mask_shift: u8,
    pub green_mask_shift: u8,
    pub blue_mask_shift: u8,
}

impl FramebufferInfo {
    fn byte_len(&self) -> u64 {
        self.pitch as u64 * self.height as u64
    }
}

struct BootFb {
    info: FramebufferInfo,
}

impl DeviceOps for BootFb {
    fn read(&self, offset: u64, buf: &mut [u8]) -> LinuxResult<usize> {
        let len = self.info.byte_len();
        if offset >= len {
            return Ok(0);
        }
        let n = buf.len().min((len - offset) as usize);
        unsafe {
            core::ptr::copy_nonoverlapping(
                crate::mm::phys_to_virt(self.info.address + offset),
                buf.as_mut_ptr(),
                n,
            );
        }
        Ok(n)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> LinuxResult<usize> {
        let len = self.info.byte_len();
        if offset >= len {
            return Err(LinuxError::ENOSPC);
        }
        let n = buf.len().min((len - offset) as usize);
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                crate::mm::phys_to_virt(self.info.address + offset),
                n,
            );
        }
        Ok(n)
    }

    fn mmap(&self, offset: u64, len: usize) -> LinuxResult<u64> {
        if offset + len as u64 > self.info.byte_len() {
            return Err(LinuxError::EINVAL);
        }
        Ok(self.info.address + offset)
    }
}

/// Register the boot framebuffer described by the boot protocol.
pub fn register_bootfb(info: FramebufferInfo) -> LinuxResult<()> {
    info!(
        "bootfb: {}x{} {}bpp at {:#x}",
        info.width, info.height, info.bpp, info.address
    );
    register(Device::new_block(
        "bootfb",
        info.pitch,
        info.height as u64,
        Arc::new(BootFb { info }),
    ))?;
    Ok(())
}
