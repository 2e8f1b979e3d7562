//! The system-call surface of the keel kernel: user-pointer validation,
//! the ABI structs, and the dispatcher projecting the kernel core into the
//! stable syscall table.

#![cfg_attr(not(test), no_std)]
#![allow(missing_docs)]

#[macro_use]
extern crate axlog;

extern crate alloc;

pub mod file;
pub mod mm;
pub mod syscall;

pub use syscall::handle_syscall;

use keel_core::vfs::{NodeType, mount};

/// Mount the root filesystem and populate the conventional tree, wiring
/// every registered device into `/dev`.
pub fn init() {
    mount::ensure_root(mount::FsKind::Ext).expect("failed to mount the root filesystem");

    let (fs, _, _) = mount::resolve("/").expect("root filesystem vanished");
    for dir in ["/bin", "/dev", "/etc", "/tmp"] {
        let _ = fs.create_node(dir, NodeType::Directory, 0o755);
    }
    for (idx, name) in keel_core::dev::names().iter().enumerate() {
        let handle = idx as u32 + 1;
        let path = alloc::format!("/dev/{name}");
        // Device handles ride in the high mode bits, as mknod encodes them.
        let _ = fs.create_node(&path, NodeType::CharDevice, 0o666 | (handle << 16));
    }
    info!("vfs initialised: {} devices in /dev", keel_core::dev::names().len());
}
