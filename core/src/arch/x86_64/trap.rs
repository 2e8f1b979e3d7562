/// Kernel code segment selector.
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data segment selector.
pub const KERNEL_SS: u16 = 0x10;
/// User data segment selector (RPL 3).
pub const USER_SS: u16 = 0x1b;
/// User code segment selector (RPL 3).
pub const USER_CS: u16 = 0x23;

const RFLAGS_IF: u64 = 1 << 9;

/// Registers saved on kernel entry, in the order the trap stubs push them,
/// followed by the frame the CPU pushes on a privilege change.
///
/// The syscall convention reads the number from `rax` and the arguments
/// from `rdi`, `rsi`, `rdx`, `rcx`, `r8` and `r9`; the result is returned
/// in `rax` with the error code in `rdx`.
#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // Pushed by the CPU.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// A frame that enters user space at `entry` with the given stack, with
    /// interrupts enabled and `arg` in the first argument register.
    pub fn new_user(entry: usize, stack: usize, arg: usize) -> Self {
        Self {
            rdi: arg as u64,
            rip: entry as u64,
            cs: USER_CS as u64,
            rflags: RFLAGS_IF,
            rsp: stack as u64,
            ss: USER_SS as u64,
            ..Default::default()
        }
    }

    /// The syscall number.
    pub const fn syscall_number(&self) -> u64 {
        self.rax
    }

    pub const fn arg0(&self) -> u64 {
        self.rdi
    }

    pub const fn arg1(&self) -> u64 {
        self.rsi
    }

    pub const fn arg2(&self) -> u64 {
        self.rdx
    }

    pub const fn arg3(&self) -> u64 {
        self.rcx
    }

    pub const fn arg4(&self) -> u64 {
        self.r8
    }

    pub const fn arg5(&self) -> u64 {
        self.r9
    }

    /// Whether the frame was captured in user mode.
    pub const fn is_user(&self) -> bool {
        self.cs & 0b11 == 0b11
    }

    /// Store the result/errno pair handed back to user space.
    pub const fn set_return(&mut self, value: u64, errno: u64) {
        self.rax = value;
        self.rdx = errno;
    }
}
