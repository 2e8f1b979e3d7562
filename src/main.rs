//! The keel kernel binary: boot handoff, early machine setup and the
//! initialisation ordering that brings the core up, ending in the idle
//! loop with `init` spawned.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[macro_use]
extern crate axlog;

extern crate alloc;

mod boot;

#[cfg(target_os = "none")]
mod arch;
#[cfg(target_os = "none")]
mod logging;

use boot::{BootInfo, MemoryKind};
use keel_core::mm::UsableRegion;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

/// Static bootstrap heap; the frame allocator's bitmap and every early
/// `Vec` live here.
#[cfg(target_os = "none")]
static mut BOOT_HEAP: [u8; 0x400000] = [0; 0x400000];

const MAX_BOOT_REGIONS: usize = 64;

fn usable_regions(info: &BootInfo, out: &mut [UsableRegion; MAX_BOOT_REGIONS]) -> usize {
    let mut count = 0;
    for region in info.memory_map {
        if region.kind == MemoryKind::Usable && count < MAX_BOOT_REGIONS {
            out[count] = UsableRegion {
                base: region.base,
                length: region.length,
            };
            count += 1;
        }
    }
    count
}

/// Entry point handed control by the boot glue (Limine/Stivale2/Multiboot2
/// tag parsing lives in front of this, and has already built `info`).
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main(info: &'static BootInfo) -> ! {
    unsafe {
        let heap = &raw mut BOOT_HEAP;
        ALLOCATOR.lock().init(heap.cast(), (*heap).len());
    }

    arch::early_init();
    logging::init();
    info!("keel {} booting", env!("CARGO_PKG_VERSION"));

    if info.rsdp == 0 {
        keel_core::sys::hard_panic("no ACPI RSDP from the bootloader");
    }

    let mut regions = [UsableRegion { base: 0, length: 0 }; MAX_BOOT_REGIONS];
    let count = usable_regions(info, &mut regions);
    if count == 0 {
        keel_core::sys::hard_panic("boot memory map has no usable regions");
    }
    keel_core::mm::init(info.phys_offset, &regions[..count]);

    keel_core::arch::init_cpu(0);
    keel_core::arch::register_kernel_stack_hook(arch::set_kernel_stack);
    keel_core::sched::init(1);

    keel_core::dev::init_builtin(arch::entropy_seed()).expect("builtin devices");
    keel_core::dev::register_serial_ports().expect("serial devices");
    if let Some(fb) = info.framebuffer {
        keel_core::dev::register_bootfb(fb).expect("bootfb device");
    }

    keel_api::init();
    arch::init_timer();

    spawn_init();
    keel_core::sched::idle_core();
}

/// Load `/bin/init` as PID 1. An empty root filesystem is survivable: the
/// kernel idles and the serial console stays up.
#[cfg(target_os = "none")]
fn spawn_init() {
    use alloc::string::ToString;
    use keel_core::arch::TrapFrame;
    use keel_core::config::USER_IMAGE_BASE;
    use keel_core::mm::{AddrSpace, elf};
    use keel_core::vfs::{self, AccessMode, OpenOptions};

    let image = match vfs::open("/bin/init", OpenOptions::new(AccessMode::READ)) {
        Ok(file) => {
            let size = file.stat().map(|st| st.size as usize).unwrap_or(0);
            let mut data = alloc::vec![0u8; size];
            match file.read_at(0, &mut data) {
                Ok(n) => {
                    data.truncate(n);
                    data
                }
                Err(err) => {
                    warn!("init: unreadable /bin/init: {:?}", err);
                    return;
                }
            }
        }
        Err(err) => {
            warn!("init: no /bin/init ({:?}); idling", err);
            return;
        }
    };

    let result = AddrSpace::new_map().and_then(|mut space| {
        let loaded = elf::load_image(
            &mut space,
            &image,
            USER_IMAGE_BASE,
            &["/bin/init".to_string()],
            &[],
        )?;
        let proc = keel_core::task::create_process(None, space)?;
        let frame = TrapFrame::new_user(loaded.entry, loaded.stack_top, 0);
        let root = proc.aspace.lock().root_paddr();
        let tid = keel_core::sched::create_user_thread(frame, root, 0, proc.pid())?;
        proc.add_thread(tid);
        Ok(proc.pid())
    });
    match result {
        Ok(pid) => info!("init spawned as pid {}", pid),
        Err(err) => warn!("init: spawn failed: {:?}", err),
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    keel_core::arch::disable_interrupts();
    error!("kernel panic: {}", info);
    loop {
        core::hint::spin_loop();
    }
}

/// Host builds only exist so the workspace compiles and tests everywhere;
/// the kernel proper is the `target_os = "none"` build.
#[cfg(not(target_os = "none"))]
fn main() {
    let _ = usable_regions;
}
