//! Return-address adjustment.
//!
//! Every frame after the first holds a return address, which points past the
//! call. Table lookups need an address inside the call instruction, so the
//! pc is moved back by the size of the call. The size is per architecture;
//! Thumb needs a look at the instruction bytes because calls there are
//! either 2 or 4 bytes long.

use std::ops::Range;

use crate::{memory::MemoryAccess, types::Arch};

/// A 32-bit Thumb BL/BLX: both halfwords start with `0b111`, the first with
/// `0b1111`.
const THUMB_BL_MASK: u32 = 0xe000_f000;

/// How far to move `pc` back into the call instruction.
///
/// `rel_pc` and `load_bias` are link-time values of the library containing
/// `pc`; `readable` is the address range of its mapping, `None` when the
/// mapping is not readable. For Thumb code the four bytes before the return
/// address are read through `memory`, but only when they lie inside
/// `readable`; otherwise the 16-bit call size is assumed.
pub fn pc_adjustment(
    arch: Arch,
    rel_pc: u64,
    load_bias: u64,
    pc: u64,
    readable: Option<Range<u64>>,
    memory: &dyn MemoryAccess,
) -> u64
{
    match arch {
        Arch::Arm => arm_adjustment(rel_pc, load_bias, pc, readable, memory),
        Arch::Arm64 => {
            if rel_pc < 4 {
                0
            } else {
                4
            }
        }
        Arch::X86 | Arch::X86_64 => u64::from(rel_pc != 0),
    }
}

fn arm_adjustment(rel_pc: u64, load_bias: u64, pc: u64, readable: Option<Range<u64>>, memory: &dyn MemoryAccess)
    -> u64
{
    let short = |value: u64| if value < 2 { 0 } else { 2 };
    if rel_pc < load_bias {
        return short(rel_pc);
    }
    let adjusted = rel_pc - load_bias;
    if adjusted < 5 {
        return short(adjusted);
    }
    if pc & 1 == 0 {
        return 4;
    }
    let instruction = pc
        .checked_sub(5)
        .filter(|address| readable.is_some_and(|range| *address >= range.start && address + 4 < range.end))
        .and_then(|address| memory.read_u32(address));
    match instruction {
        Some(value) if value & THUMB_BL_MASK == THUMB_BL_MASK => 4,
        _ => 2,
    }
}

/// Adjustment applied to a pc that could not be resolved to a library.
pub const fn default_adjustment(arch: Arch) -> u64
{
    match arch {
        Arch::Arm => 2,
        Arch::Arm64 => 4,
        Arch::X86 | Arch::X86_64 => 1,
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::memory::SliceMemory;

    #[test]
    fn test_fixed_adjustments()
    {
        let memory = SliceMemory::default();
        assert_eq!(pc_adjustment(Arch::Arm64, 0x1000, 0, 0x7000_1000, None, &memory), 4);
        assert_eq!(pc_adjustment(Arch::Arm64, 3, 0, 0x7000_0003, None, &memory), 0);
        assert_eq!(pc_adjustment(Arch::X86_64, 0x10, 0, 0x10, None, &memory), 1);
        assert_eq!(pc_adjustment(Arch::X86_64, 0, 0, 0x10, None, &memory), 0);
    }

    #[test]
    fn test_arm_mode_and_small_offsets()
    {
        let memory = SliceMemory::default();
        assert_eq!(pc_adjustment(Arch::Arm, 0x2000, 0, 0x4000_2000, None, &memory), 4);
        assert_eq!(pc_adjustment(Arch::Arm, 0x1003, 0x1000, 0x4000_0003, None, &memory), 2);
        assert_eq!(pc_adjustment(Arch::Arm, 0x1001, 0x1000, 0x4000_0001, None, &memory), 0);
        assert_eq!(pc_adjustment(Arch::Arm, 0x800, 0x1000, 0x4000_0800, None, &memory), 2);
    }

    #[test]
    fn test_thumb_inspects_call_instruction()
    {
        // bl: f7ff fffe, stored as two little-endian halfwords.
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(&[0xff, 0xf7, 0xfe, 0xff]);
        bytes[8..10].copy_from_slice(&[0x80, 0x47]); // blx r0
        let memory = SliceMemory::new(0x4000_0000, bytes);

        let code = || Some(0x4000_0000..0x4000_1000);

        assert_eq!(pc_adjustment(Arch::Arm, 0x1004, 0, 0x4000_0005, code(), &memory), 4);
        assert_eq!(pc_adjustment(Arch::Arm, 0x100b, 0, 0x4000_000b, code(), &memory), 2);
        // Unreadable bytes before the pc.
        assert_eq!(pc_adjustment(Arch::Arm, 0x1004, 0, 0x3000_0005, Some(0x3000_0000..0x3000_1000), &memory), 2);
    }

    #[test]
    fn test_thumb_call_outside_readable_mapping_is_short()
    {
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(&[0xff, 0xf7, 0xfe, 0xff]);
        let memory = SliceMemory::new(0x4000_0000, bytes);

        // Mapping not readable.
        assert_eq!(pc_adjustment(Arch::Arm, 0x1004, 0, 0x4000_0005, None, &memory), 2);
        // The call would start before the mapping.
        assert_eq!(pc_adjustment(Arch::Arm, 0x1004, 0, 0x4000_0005, Some(0x4000_0004..0x4000_1000), &memory), 2);
        // The call bytes reach the end of the mapping.
        assert_eq!(pc_adjustment(Arch::Arm, 0x1004, 0, 0x4000_0005, Some(0x3fff_f000..0x4000_0004), &memory), 2);
        assert_eq!(pc_adjustment(Arch::Arm, 0x1004, 0, 0x4000_0005, Some(0x3fff_f000..0x4000_0005), &memory), 4);
    }
}
