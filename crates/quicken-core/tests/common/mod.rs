//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use gimli::write::{
    Address, CallFrameInstruction, CommonInformationEntry, EhFrame, EndianVec, FrameDescriptionEntry, FrameTable,
};
use gimli::{Encoding, Format, LittleEndian, Register};
use object::write::Object;
use object::{Architecture, BinaryFormat, Endianness, SectionKind};

/// Start of the function described by [`arm64_eh_frame`].
pub const FUNCTION_START: u64 = 0x1000;
/// Length of that function.
pub const FUNCTION_LEN: u32 = 0x40;

/// `.eh_frame` for one AArch64 function that pushes a frame record at +4
/// and addresses its frame through x29 from +8 on.
pub fn arm64_eh_frame() -> Vec<u8>
{
    let encoding = Encoding {
        format: Format::Dwarf32,
        version: 1,
        address_size: 8,
    };
    let mut table = FrameTable::default();
    let mut cie = CommonInformationEntry::new(encoding, 4, -8, Register(30));
    cie.add_instruction(CallFrameInstruction::Cfa(Register(31), 0));
    let cie_id = table.add_cie(cie);

    let mut fde = FrameDescriptionEntry::new(Address::Constant(FUNCTION_START), FUNCTION_LEN);
    fde.add_instruction(4, CallFrameInstruction::CfaOffset(16));
    fde.add_instruction(4, CallFrameInstruction::Offset(Register(29), -16));
    fde.add_instruction(4, CallFrameInstruction::Offset(Register(30), -8));
    fde.add_instruction(8, CallFrameInstruction::CfaRegister(Register(29)));
    table.add_fde(cie_id, fde);

    let mut eh_frame = EhFrame(EndianVec::new(LittleEndian));
    table.write_eh_frame(&mut eh_frame).expect("write eh_frame");
    eh_frame.0.into_vec()
}

/// A little-endian AArch64 ELF with a `.text` section and, optionally, the
/// CFI from [`arm64_eh_frame`].
pub fn arm64_elf(with_cfi: bool) -> Vec<u8>
{
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::Aarch64, Endianness::Little);
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.append_section_data(text, &[0u8; 0x2000], 16);
    if with_cfi {
        let eh_frame = obj.add_section(Vec::new(), b".eh_frame".to_vec(), SectionKind::ReadOnlyData);
        obj.append_section_data(eh_frame, &arm64_eh_frame(), 8);
    }
    obj.write().expect("write elf")
}

/// Write [`arm64_elf`] to `dir/name` and return its path.
pub fn write_arm64_library(dir: &Path, name: &str, with_cfi: bool) -> PathBuf
{
    let path = dir.join(name);
    std::fs::write(&path, arm64_elf(with_cfi)).expect("write library");
    path
}

/// `.ARM.exidx` placed at address 0: `pop {r4, lr}` for [`FUNCTION_START`],
/// a cannot-unwind entry at `FUNCTION_START + 0x100` and an end marker at
/// `FUNCTION_START + 0x200`.
pub fn arm_exidx() -> Vec<u8>
{
    let rel = |target: u64, place: u64| (target.wrapping_sub(place) as u32) & 0x7fff_ffff;
    [
        rel(FUNCTION_START, 0),
        0x80a8_b0b0,
        rel(FUNCTION_START + 0x100, 8),
        1,
        rel(FUNCTION_START + 0x200, 16),
        1,
    ]
    .iter()
    .flat_map(|word| word.to_le_bytes())
    .collect()
}

/// A little-endian 32-bit ARM ELF whose only unwind information is
/// [`arm_exidx`].
pub fn write_arm_library(dir: &Path, name: &str) -> PathBuf
{
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::Arm, Endianness::Little);
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.append_section_data(text, &[0u8; 0x2000], 4);
    let exidx = obj.add_section(Vec::new(), b".ARM.exidx".to_vec(), SectionKind::ReadOnlyData);
    obj.append_section_data(exidx, &arm_exidx(), 4);

    let path = dir.join(name);
    std::fs::write(&path, obj.write().expect("write elf")).expect("write library");
    path
}

/// An AArch64 shared object with no sections and one executable load
/// segment linked at `load_bias`.
pub fn write_biased_library(dir: &Path, name: &str, load_bias: u64) -> PathBuf
{
    use object::elf;
    use object::write::elf::{FileHeader, ProgramHeader, Writer};

    let mut buffer = Vec::new();
    let mut writer = Writer::new(Endianness::Little, true, &mut buffer);
    writer.reserve_file_header();
    writer.reserve_program_headers(1);
    let size = writer.reserved_len() as u64;
    writer
        .write_file_header(&FileHeader {
            os_abi: 0,
            abi_version: 0,
            e_type: elf::ET_DYN,
            e_machine: elf::EM_AARCH64,
            e_entry: 0,
            e_flags: 0,
        })
        .expect("file header");
    writer.write_align_program_headers();
    writer.write_program_header(&ProgramHeader {
        p_type: elf::PT_LOAD,
        p_flags: elf::PF_R | elf::PF_X,
        p_offset: 0,
        p_vaddr: load_bias,
        p_paddr: load_bias,
        p_filesz: size,
        p_memsz: size,
        p_align: 0x1000,
    });

    let path = dir.join(name);
    std::fs::write(&path, buffer).expect("write library");
    path
}
