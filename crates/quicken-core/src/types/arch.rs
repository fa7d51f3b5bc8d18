//! Target architectures.

use std::fmt;

/// CPU architecture of a register context, an ELF image or a table.
///
/// QUT tables exist for [`Arch::Arm`] and [`Arch::Arm64`]. Frame-pointer and
/// DWARF-direct unwinding also run on the x86 family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch
{
    /// 32-bit ARM (A32/T32)
    Arm,
    /// 64-bit ARM (A64)
    Arm64,
    /// 32-bit x86
    X86,
    /// x86-64
    X86_64,
}

impl Arch
{
    /// Architecture of the running process, if it is one we know.
    pub const fn current() -> Option<Self>
    {
        if cfg!(target_arch = "aarch64") {
            Some(Arch::Arm64)
        } else if cfg!(target_arch = "arm") {
            Some(Arch::Arm)
        } else if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "x86") {
            Some(Arch::X86)
        } else {
            None
        }
    }

    /// Size of a machine word in bytes.
    pub const fn word_size(self) -> usize
    {
        match self {
            Arch::Arm | Arch::X86 => 4,
            Arch::Arm64 | Arch::X86_64 => 8,
        }
    }

    /// Tag written into table file headers.
    pub const fn tag(self) -> u64
    {
        match self {
            Arch::Arm => 1,
            Arch::Arm64 => 2,
            Arch::X86 => 3,
            Arch::X86_64 => 4,
        }
    }

    /// Inverse of [`Arch::tag`].
    pub const fn from_tag(tag: u64) -> Option<Self>
    {
        match tag {
            1 => Some(Arch::Arm),
            2 => Some(Arch::Arm64),
            3 => Some(Arch::X86),
            4 => Some(Arch::X86_64),
            _ => None,
        }
    }

    /// Whether QUT tables can be generated and stepped for this architecture.
    pub const fn has_quicken_tables(self) -> bool
    {
        matches!(self, Arch::Arm | Arch::Arm64)
    }

    /// Truncate a value to the architecture's word width.
    pub const fn mask(self, value: u64) -> u64
    {
        match self.word_size() {
            4 => value & 0xffff_ffff,
            _ => value,
        }
    }

    /// Map an `object` architecture to ours.
    pub fn from_object(arch: object::Architecture) -> Option<Self>
    {
        match arch {
            object::Architecture::Arm => Some(Arch::Arm),
            object::Architecture::Aarch64 => Some(Arch::Arm64),
            object::Architecture::I386 => Some(Arch::X86),
            object::Architecture::X86_64 => Some(Arch::X86_64),
            _ => None,
        }
    }
}

impl fmt::Display for Arch
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_tag_round_trip()
    {
        for arch in [Arch::Arm, Arch::Arm64, Arch::X86, Arch::X86_64] {
            assert_eq!(Arch::from_tag(arch.tag()), Some(arch));
        }
        assert_eq!(Arch::from_tag(0), None);
        assert_eq!(Arch::from_tag(9), None);
    }

    #[test]
    fn test_mask_truncates_32_bit_only()
    {
        assert_eq!(Arch::Arm.mask(0x1_0000_0004), 4);
        assert_eq!(Arch::Arm64.mask(0x1_0000_0004), 0x1_0000_0004);
    }

    #[test]
    fn test_quicken_support()
    {
        assert!(Arch::Arm.has_quicken_tables());
        assert!(Arch::Arm64.has_quicken_tables());
        assert!(!Arch::X86_64.has_quicken_tables());
    }
}
