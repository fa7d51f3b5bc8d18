//! Register context used by every unwind strategy.

use super::Arch;

/// The subset of machine registers an unwind step reads or recovers.
///
/// Slots are generic so that one struct serves every architecture:
///
/// | slot     | arm64 | arm | x86_64 | x86 |
/// |----------|-------|-----|--------|-----|
/// | `fp`     | x29   | r7  | rbp    | ebp |
/// | `fp_alt` | -     | r11 | -      | -   |
/// | `jni_sp` | x28   | r10 | -      | -   |
/// | `dex`    | x20   | r4  | -      | -   |
/// | `lr`     | x30   | r14 | -      | -   |
///
/// On 32-bit architectures every slot holds a zero-extended 32-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterContext
{
    /// Architecture the values belong to
    pub arch: Arch,
    /// Program counter
    pub pc: u64,
    /// Stack pointer
    pub sp: u64,
    /// Link register (return address register on ARM)
    pub lr: u64,
    /// Frame pointer
    pub fp: u64,
    /// Secondary frame pointer (ARM-mode r11)
    pub fp_alt: u64,
    /// Managed-runtime thread register used as a frame base in JNI trampolines
    pub jni_sp: u64,
    /// Register holding the interpreter's dex pc in managed frames
    pub dex: u64,
}

impl RegisterContext
{
    /// A zeroed context for `arch`.
    pub const fn new(arch: Arch) -> Self
    {
        Self {
            arch,
            pc: 0,
            sp: 0,
            lr: 0,
            fp: 0,
            fp_alt: 0,
            jni_sp: 0,
            dex: 0,
        }
    }

    /// DWARF register number of the return address column.
    pub const fn return_address_register(arch: Arch) -> u16
    {
        match arch {
            Arch::Arm => 14,
            Arch::Arm64 => 30,
            Arch::X86 => 8,
            Arch::X86_64 => 16,
        }
    }

    /// DWARF register number of the stack pointer.
    pub const fn stack_pointer_register(arch: Arch) -> u16
    {
        match arch {
            Arch::Arm => 13,
            Arch::Arm64 => 31,
            Arch::X86 => 4,
            Arch::X86_64 => 7,
        }
    }

    /// Read a register by DWARF number.
    ///
    /// Returns `None` for registers the context does not track.
    pub fn dwarf(&self, register: u16) -> Option<u64>
    {
        self.dwarf_slot(register).map(|slot| match slot {
            Slot::Pc => self.pc,
            Slot::Sp => self.sp,
            Slot::Lr => self.lr,
            Slot::Fp => self.fp,
            Slot::FpAlt => self.fp_alt,
            Slot::JniSp => self.jni_sp,
            Slot::Dex => self.dex,
        })
    }

    /// Write a register by DWARF number. Returns `false` if it is not tracked.
    pub fn set_dwarf(&mut self, register: u16, value: u64) -> bool
    {
        let value = self.arch.mask(value);
        let Some(slot) = self.dwarf_slot(register) else {
            return false;
        };
        match slot {
            Slot::Pc => self.pc = value,
            Slot::Sp => self.sp = value,
            Slot::Lr => self.lr = value,
            Slot::Fp => self.fp = value,
            Slot::FpAlt => self.fp_alt = value,
            Slot::JniSp => self.jni_sp = value,
            Slot::Dex => self.dex = value,
        }
        true
    }

    fn dwarf_slot(&self, register: u16) -> Option<Slot>
    {
        let slot = match (self.arch, register) {
            (Arch::Arm64, 20) | (Arch::Arm, 4) => Slot::Dex,
            (Arch::Arm64, 28) | (Arch::Arm, 10) => Slot::JniSp,
            (Arch::Arm64, 29) | (Arch::Arm, 7) | (Arch::X86_64, 6) | (Arch::X86, 5) => Slot::Fp,
            (Arch::Arm, 11) => Slot::FpAlt,
            (Arch::Arm64, 30) | (Arch::Arm, 14) => Slot::Lr,
            (Arch::Arm64, 31) | (Arch::Arm, 13) | (Arch::X86_64, 7) | (Arch::X86, 4) => Slot::Sp,
            (Arch::Arm64, 32) | (Arch::Arm, 15) | (Arch::X86_64, 16) | (Arch::X86, 8) => Slot::Pc,
            _ => return None,
        };
        Some(slot)
    }

    /// Snapshot the calling function's registers.
    ///
    /// The recorded pc lies inside the caller, so an unwind starting from the
    /// returned context begins with the caller's own frame.
    #[cfg(target_arch = "aarch64")]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn capture() -> Self
    {
        let (pc, sp, fp, lr, x20, x28): (u64, u64, u64, u64, u64, u64);
        // SAFETY: only moves register values into outputs; touches no memory.
        unsafe {
            std::arch::asm!(
                "adr {pc}, .",
                "mov {sp}, sp",
                "mov {fp}, x29",
                "mov {lr}, x30",
                "mov {x20}, x20",
                "mov {x28}, x28",
                pc = out(reg) pc,
                sp = out(reg) sp,
                fp = out(reg) fp,
                lr = out(reg) lr,
                x20 = out(reg) x20,
                x28 = out(reg) x28,
                options(nomem, nostack, preserves_flags),
            );
        }
        Self {
            arch: Arch::Arm64,
            pc,
            sp,
            lr,
            fp,
            fp_alt: 0,
            jni_sp: x28,
            dex: x20,
        }
    }

    /// Snapshot the calling function's registers.
    ///
    /// The recorded pc lies inside the caller, so an unwind starting from the
    /// returned context begins with the caller's own frame.
    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn capture() -> Self
    {
        let (pc, sp, fp): (u64, u64, u64);
        // SAFETY: only moves register values into outputs; touches no memory.
        unsafe {
            std::arch::asm!(
                "lea {pc}, [rip]",
                "mov {sp}, rsp",
                "mov {fp}, rbp",
                pc = out(reg) pc,
                sp = out(reg) sp,
                fp = out(reg) fp,
                options(nomem, nostack, preserves_flags),
            );
        }
        Self {
            arch: Arch::X86_64,
            pc,
            sp,
            fp,
            ..Self::new(Arch::X86_64)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot
{
    Pc,
    Sp,
    Lr,
    Fp,
    FpAlt,
    JniSp,
    Dex,
}
