//! The boot protocol: what the bootloader glue hands `kernel_main`.
//!
//! The glue (Limine/Stivale2/Multiboot2 tag parsing) normalises whatever
//! the firmware provides into these structures; nothing else in the kernel
//! sees a bootloader.

pub use keel_core::dev::FramebufferInfo;

/// Classification of one boot memory-map region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(dead_code)]
pub enum MemoryKind {
    Usable = 0,
    Reserved = 1,
    AcpiReclaimable = 2,
    AcpiNvs = 3,
    Bad = 4,
    BootloaderReclaimable = 5,
    KernelAndModules = 6,
    Framebuffer = 7,
}

/// One region of the boot memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

/// Everything the kernel needs from the bootloader.
#[derive(Debug)]
pub struct BootInfo {
    pub memory_map: &'static [MemoryRegion],
    pub framebuffer: Option<FramebufferInfo>,
    /// Physical address of the ACPI RSDP.
    pub rsdp: u64,
    /// Where the kernel image sits physically.
    pub kernel_phys: u64,
    /// Where the kernel image is mapped.
    pub kernel_virt: u64,
    /// Offset of the direct physical-memory window.
    pub phys_offset: usize,
}
