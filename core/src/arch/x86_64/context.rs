/// Callee-saved register state of a suspended kernel context.
///
/// Field order is fixed: [`context_switch`] addresses the struct by offset.
#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct GpContext {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl GpContext {
    /// An all-zero context, for statics.
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }

    /// A context that, once switched to, pops `entry_stub` off `stack_top`
    /// and jumps to it with `r12`/`r13` preloaded. The stub is expected to
    /// move `r12` (entry) and `r13` (argument) into place and call through.
    ///
    /// # Safety
    /// `stack_top` must be the writable top of a fresh kernel stack with at
    /// least one slot of headroom.
    pub unsafe fn prepared(stack_top: usize, entry_stub: usize, entry: usize, arg: usize) -> Self {
        let slot = (stack_top - 8) as *mut u64;
        unsafe { slot.write(entry_stub as u64) };
        Self {
            rsp: slot as u64,
            r12: entry as u64,
            r13: arg as u64,
            ..Default::default()
        }
    }
}

/// Saved SSE/x87 state (an FXSAVE area).
#[repr(C, align(16))]
pub struct FpContext([u8; 512]);

impl FpContext {
    /// A freshly initialised FPU state: default control word, default MXCSR.
    pub fn new() -> Self {
        let mut area = [0u8; 512];
        area[0] = 0x7f; // FCW = 0x037f
        area[1] = 0x03;
        area[24] = 0x80; // MXCSR = 0x1f80
        area[25] = 0x1f;
        Self(area)
    }

    /// Capture the current FPU state.
    #[inline]
    pub fn save(&mut self) {
        #[cfg(target_os = "none")]
        unsafe {
            core::arch::asm!("fxsave64 [{}]", in(reg) self.0.as_mut_ptr(), options(nostack));
        }
    }

    /// Load this FPU state onto the CPU.
    #[inline]
    pub fn restore(&self) {
        #[cfg(target_os = "none")]
        unsafe {
            core::arch::asm!("fxrstor64 [{}]", in(reg) self.0.as_ptr(), options(nostack));
        }
    }
}

impl Default for FpContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Switch kernel contexts: save the callee-saved registers into `old`,
/// restore them from `new` and return on the new stack.
///
/// # Safety
/// Both pointers must reference valid [`GpContext`] values; `new` must have
/// been produced by a previous save or by [`GpContext::prepared`].
#[cfg(target_os = "none")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old: *mut GpContext, new: *const GpContext) {
    core::arch::naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ret",
    );
}

/// Host builds never switch contexts; the stub keeps the scheduler linkable
/// under `cargo test`.
#[cfg(not(target_os = "none"))]
pub unsafe extern "C" fn context_switch(_old: *mut GpContext, _new: *const GpContext) {
    unreachable!("context_switch is only reachable on the kernel target");
}
