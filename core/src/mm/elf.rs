//! ELF image loading for `exec` and `spawn`.
//!
//! Static executables and position-independent images are supported; the
//! latter are rebased onto the process allocation base so two execs of the
//! same file land at different addresses.

use alloc::{string::String, vec::Vec};

use axerrno::{LinuxError, LinuxResult};
use xmas_elf::{ElfFile, header, program};

use super::{AddrSpace, MapFlags};
use crate::config::{PAGE_SIZE, USER_STACK_SIZE, USER_STACK_TOP};

const AT_NULL: u64 = 0;
const AT_PAGESZ: u64 = 6;
const AT_ENTRY: u64 = 9;

/// Where a loaded image starts executing.
pub struct LoadedImage {
    pub entry: usize,
    pub stack_top: usize,
}

fn segment_flags(flags: program::Flags) -> MapFlags {
    let mut mapping = MapFlags::USER_ACCESSIBLE;
    if !flags.is_write() {
        mapping |= MapFlags::READ_ONLY;
    }
    if flags.is_execute() {
        mapping |= MapFlags::EXECUTABLE;
    }
    mapping
}

fn align_down(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

fn align_up(value: usize) -> usize {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Map one load segment, skipping pages an earlier segment already covers.
fn map_segment(
    space: &mut AddrSpace,
    vaddr: usize,
    mem_size: usize,
    flags: MapFlags,
) -> LinuxResult<()> {
    let mut start = align_down(vaddr);
    let mut end = align_up(vaddr + mem_size);
    while start < end && space.virtual_to_physical(start) != 0 {
        start += PAGE_SIZE;
    }
    while end > start && space.virtual_to_physical(end - PAGE_SIZE) != 0 {
        end -= PAGE_SIZE;
    }
    if start < end {
        space.map_alloc(start, end - start, flags)?;
    }
    Ok(())
}

/// Load `image` into `space`, map the stack and seed it with `args`/`envs`
/// and a minimal auxiliary vector.
pub fn load_image(
    space: &mut AddrSpace,
    image: &[u8],
    base: usize,
    args: &[String],
    envs: &[String],
) -> LinuxResult<LoadedImage> {
    let elf = ElfFile::new(image).map_err(|_| LinuxError::ENOEXEC)?;
    let rebase = match elf.header.pt2.type_().as_type() {
        header::Type::Executable => 0,
        header::Type::SharedObject => base,
        _ => return Err(LinuxError::ENOEXEC),
    };

    for ph in elf.program_iter() {
        if ph.get_type() != Ok(program::Type::Load) {
            continue;
        }
        let vaddr = rebase + ph.virtual_addr() as usize;
        let mem_size = ph.mem_size() as usize;
        if mem_size == 0 {
            continue;
        }
        map_segment(space, vaddr, mem_size, segment_flags(ph.flags()))?;

        let offset = ph.offset() as usize;
        let file_size = ph.file_size() as usize;
        let data = image
            .get(offset..offset + file_size)
            .ok_or(LinuxError::ENOEXEC)?;
        // Frames come back zeroed, so the BSS tail needs no work.
        space.write(vaddr, data)?;
    }

    let entry = rebase + elf.header.pt2.entry_point() as usize;

    let stack_bottom = USER_STACK_TOP - USER_STACK_SIZE;
    space.map_alloc(stack_bottom, USER_STACK_SIZE, MapFlags::USER_ACCESSIBLE)?;
    let stack_top = write_startup_block(space, entry, args, envs)?;

    Ok(LoadedImage { entry, stack_top })
}

/// Lay out `argc`/`argv`/`envp`/auxv at the top of the stack, SysV style,
/// and return the initial stack pointer.
fn write_startup_block(
    space: &mut AddrSpace,
    entry: usize,
    args: &[String],
    envs: &[String],
) -> LinuxResult<usize> {
    let mut strings = Vec::new();
    let mut offsets = Vec::with_capacity(args.len() + envs.len());
    for s in args.iter().chain(envs) {
        offsets.push(strings.len());
        strings.extend_from_slice(s.as_bytes());
        strings.push(0);
    }
    let str_base = (USER_STACK_TOP - strings.len()) & !0xf;

    let mut words: Vec<u64> = Vec::new();
    words.push(args.len() as u64);
    for (i, _) in args.iter().enumerate() {
        words.push((str_base + offsets[i]) as u64);
    }
    words.push(0);
    for (i, _) in envs.iter().enumerate() {
        words.push((str_base + offsets[args.len() + i]) as u64);
    }
    words.push(0);
    for (key, value) in [
        (AT_PAGESZ, PAGE_SIZE as u64),
        (AT_ENTRY, entry as u64),
        (AT_NULL, 0),
    ] {
        words.push(key);
        words.push(value);
    }

    let mut sp = str_base - words.len() * 8;
    sp &= !0xf;

    let mut block = Vec::with_capacity(words.len() * 8);
    for word in &words {
        block.extend_from_slice(&word.to_le_bytes());
    }
    space.write(sp, &block)?;
    space.write(str_base, &strings)?;
    Ok(sp)
}
