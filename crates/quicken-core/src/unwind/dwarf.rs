//! DWARF-direct stepping.
//!
//! Evaluates CFI rows straight from a library's ELF image instead of a
//! precomputed table: `.eh_frame_hdr` lookup first, then a scan of
//! `.eh_frame`, then `.debug_frame`, then the same sections of the embedded
//! `.gnu_debugdata` image.
//!
//! Allocates an unwind context per step, so it is not signal safe.

use std::sync::Arc;

use gimli::{
    BaseAddresses, CfaRule, DebugFrame, EhFrame, EhFrameHdr, EndianSlice, Register, RegisterRule, RunTimeEndian,
    UnwindContext, UnwindSection, UnwindTableRow,
};

use super::FrameStepper;
use crate::{
    elf::ElfImage,
    error::UnwindError,
    interface::QuickenInterface,
    qut::{StepContext, StepOutcome},
    types::{Arch, RegisterContext},
};

type Slice<'d> = EndianSlice<'d, RunTimeEndian>;

/// Steps frames of one library by evaluating its CFI.
#[derive(Debug, Clone)]
pub struct DwarfStepper
{
    interface: Arc<QuickenInterface>,
}

impl DwarfStepper
{
    pub fn new(interface: Arc<QuickenInterface>) -> Self
    {
        Self { interface }
    }
}

impl FrameStepper for DwarfStepper
{
    fn rel_pc(&self, pc: u64) -> u64
    {
        self.interface.rel_pc(pc)
    }

    fn load_bias(&self) -> u64
    {
        self.interface.load_bias()
    }

    fn step(&self, regs: &mut RegisterContext, rel_pc: u64, ctx: &StepContext<'_>) -> Result<StepOutcome, UnwindError>
    {
        step_image(self.interface.image(), regs, rel_pc, ctx)
    }
}

/// Step `regs` with the CFI of `image`.
///
/// ## Errors
///
/// `UnwindInfo` if no CFI covers `rel_pc` or a rule cannot be evaluated,
/// `ReadStackFailed` if a saved register lies outside the stack.
pub fn step_image(
    image: &ElfImage,
    regs: &mut RegisterContext,
    rel_pc: u64,
    ctx: &StepContext<'_>,
) -> Result<StepOutcome, UnwindError>
{
    let arch = image.arch();
    let endian = image.endian();
    let address_size = arch.word_size() as u8;
    let mut unwind_ctx = UnwindContext::<usize>::new();

    let mut images = vec![image];
    images.extend(image.embedded());
    for image in images {
        if let Some(eh) = image.eh_frame() {
            let mut eh_frame = EhFrame::new(&eh.data, endian);
            eh_frame.set_address_size(address_size);
            let mut bases = BaseAddresses::default().set_eh_frame(eh.address);
            if let Some(hdr) = image.eh_frame_hdr() {
                bases = bases.set_eh_frame_hdr(hdr.address);
                let header = EhFrameHdr::new(&hdr.data, endian);
                if let Some(row) = lookup_with_hdr(&eh_frame, header, &bases, address_size, &mut unwind_ctx, rel_pc) {
                    return apply_row(&row, arch, regs, ctx);
                }
            }
            if let Some(row) = scan_section(&eh_frame, &bases, &mut unwind_ctx, rel_pc) {
                return apply_row(&row, arch, regs, ctx);
            }
        }
        if let Some(debug) = image.debug_frame() {
            let mut debug_frame = DebugFrame::new(&debug.data, endian);
            debug_frame.set_address_size(address_size);
            let bases = BaseAddresses::default();
            if let Some(row) = scan_section(&debug_frame, &bases, &mut unwind_ctx, rel_pc) {
                return apply_row(&row, arch, regs, ctx);
            }
        }
    }
    Err(UnwindError::UnwindInfo)
}

fn lookup_with_hdr(
    eh_frame: &EhFrame<Slice<'_>>,
    header: EhFrameHdr<Slice<'_>>,
    bases: &BaseAddresses,
    address_size: u8,
    unwind_ctx: &mut UnwindContext<usize>,
    rel_pc: u64,
) -> Option<UnwindTableRow<usize>>
{
    let parsed = header.parse(bases, address_size).ok()?;
    let table = parsed.table()?;
    let pointer = table.lookup(rel_pc, bases).ok()?;
    let offset = table.pointer_to_offset(pointer).ok()?;
    let fde = eh_frame
        .partial_fde_from_offset(bases, offset)
        .ok()?
        .parse(|section, base_addresses, cie_offset| section.cie_from_offset(base_addresses, cie_offset))
        .ok()?;
    if !fde.contains(rel_pc) {
        return None;
    }
    fde.unwind_info_for_address(eh_frame, bases, unwind_ctx, rel_pc)
        .ok()
        .cloned()
}

fn scan_section<'d, S>(
    section: &S,
    bases: &BaseAddresses,
    unwind_ctx: &mut UnwindContext<usize>,
    rel_pc: u64,
) -> Option<UnwindTableRow<usize>>
where
    S: UnwindSection<Slice<'d>>,
{
    let mut entries = section.entries(bases);
    while let Ok(Some(entry)) = entries.next() {
        let gimli::CieOrFde::Fde(partial) = entry else {
            continue;
        };
        let Ok(fde) = partial.parse(|unwind_section, base_addresses, cie_offset| {
            unwind_section.cie_from_offset(base_addresses, cie_offset)
        }) else {
            continue;
        };
        if !fde.contains(rel_pc) {
            continue;
        }
        if let Ok(row) = fde.unwind_info_for_address(section, bases, unwind_ctx, rel_pc) {
            return Some(row.clone());
        }
    }
    None
}

fn read_saved(ctx: &StepContext<'_>, address: u64, arch: Arch) -> Result<u64, UnwindError>
{
    let address = arch.mask(address);
    if !ctx.stack.contains(address, arch.word_size() as u64) {
        return Err(UnwindError::ReadStackFailed);
    }
    ctx.memory
        .read_word(address, arch)
        .ok_or(UnwindError::ReadStackFailed)
}

fn apply_row(
    row: &UnwindTableRow<usize>,
    arch: Arch,
    regs: &mut RegisterContext,
    ctx: &StepContext<'_>,
) -> Result<StepOutcome, UnwindError>
{
    let cfa = match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => regs
            .dwarf(register.0)
            .ok_or(UnwindError::UnwindInfo)?
            .wrapping_add(*offset as u64),
        CfaRule::Expression(_) => return Err(UnwindError::UnwindInfo),
    };
    let cfa = arch.mask(cfa);
    let return_register = Register(RegisterContext::return_address_register(arch));

    let mut next = *regs;
    let mut return_address = None;
    let mut outermost = false;
    for (register, rule) in row.registers() {
        let value = match rule {
            RegisterRule::Undefined => {
                outermost |= *register == return_register;
                continue;
            }
            RegisterRule::SameValue => continue,
            RegisterRule::Offset(offset) => read_saved(ctx, cfa.wrapping_add(*offset as u64), arch)?,
            RegisterRule::ValOffset(offset) => cfa.wrapping_add(*offset as u64),
            RegisterRule::Register(source) => regs.dwarf(source.0).ok_or(UnwindError::UnwindInfo)?,
            _ => return Err(UnwindError::UnwindInfo),
        };
        next.set_dwarf(register.0, value);
        if *register == return_register {
            return_address = Some(arch.mask(value));
        }
    }

    next.sp = cfa;
    next.pc = if outermost {
        0
    } else {
        match (return_address, arch) {
            (Some(address), _) => address,
            (None, Arch::Arm | Arch::Arm64) => regs.lr,
            (None, Arch::X86 | Arch::X86_64) => return Err(UnwindError::UnwindInfo),
        }
    };
    *regs = next;
    Ok(StepOutcome {
        finished: regs.pc == 0,
        dex_pc: None,
    })
}

#[cfg(test)]
mod tests
{
    use gimli::write::{CallFrameInstruction, CommonInformationEntry, EhFrame as WriteEhFrame, EndianVec, FrameDescriptionEntry, FrameTable};
    use gimli::{Encoding, Format, LittleEndian};

    use super::*;
    use crate::memory::{SliceMemory, StackRange};

    fn arm64_eh_frame() -> Vec<u8>
    {
        let encoding = Encoding {
            address_size: 8,
            format: Format::Dwarf32,
            version: 1,
        };
        let mut table = FrameTable::default();
        let mut cie = CommonInformationEntry::new(encoding, 4, -8, Register(30));
        cie.add_instruction(CallFrameInstruction::Cfa(Register(31), 0));
        let cie_id = table.add_cie(cie);
        let mut fde = FrameDescriptionEntry::new(gimli::write::Address::Constant(0x1000), 0x40);
        fde.add_instruction(4, CallFrameInstruction::CfaOffset(16));
        fde.add_instruction(8, CallFrameInstruction::Cfa(Register(29), 16));
        fde.add_instruction(8, CallFrameInstruction::Offset(Register(30), -8));
        fde.add_instruction(8, CallFrameInstruction::Offset(Register(29), -16));
        table.add_fde(cie_id, fde);
        let mut eh_frame = WriteEhFrame(EndianVec::new(LittleEndian));
        table.write_eh_frame(&mut eh_frame).expect("write eh_frame");
        eh_frame.0.into_vec()
    }

    fn arm64_row(rel_pc: u64) -> Option<UnwindTableRow<usize>>
    {
        let bytes = arm64_eh_frame();
        let mut eh_frame = EhFrame::new(&bytes, RunTimeEndian::Little);
        eh_frame.set_address_size(8);
        let bases = BaseAddresses::default().set_eh_frame(0);
        let mut unwind_ctx = UnwindContext::<usize>::new();
        scan_section(&eh_frame, &bases, &mut unwind_ctx, rel_pc)
    }

    #[test]
    fn test_leaf_row_returns_through_lr()
    {
        let memory = SliceMemory::new(0x8000, vec![0; 0x40]);
        let ctx = StepContext::new(&memory, StackRange::new(0x8000, 0x8040));
        let mut regs = RegisterContext::new(Arch::Arm64);
        regs.sp = 0x8000;
        regs.lr = 0x2222;

        let row = arm64_row(0x1000).expect("row");
        let outcome = apply_row(&row, Arch::Arm64, &mut regs, &ctx).expect("step");
        assert!(!outcome.finished);
        assert_eq!(regs.pc, 0x2222);
        assert_eq!(regs.sp, 0x8000);
    }

    #[test]
    fn test_body_row_restores_frame_record()
    {
        let mut memory = SliceMemory::new(0x8000, vec![0; 0x40]);
        memory.write_word(0x8010, 0x8030, Arch::Arm64);
        memory.write_word(0x8018, 0x3333, Arch::Arm64);
        let ctx = StepContext::new(&memory, StackRange::new(0x8000, 0x8040));
        let mut regs = RegisterContext::new(Arch::Arm64);
        regs.sp = 0x8000;
        regs.fp = 0x8010;

        let row = arm64_row(0x1010).expect("row");
        apply_row(&row, Arch::Arm64, &mut regs, &ctx).expect("step");
        assert_eq!(regs.pc, 0x3333);
        assert_eq!(regs.lr, 0x3333);
        assert_eq!(regs.fp, 0x8030);
        assert_eq!(regs.sp, 0x8020);
    }

    #[test]
    fn test_saved_register_outside_stack_fails()
    {
        let memory = SliceMemory::new(0x8000, vec![0; 0x40]);
        let ctx = StepContext::new(&memory, StackRange::new(0x8000, 0x8040));
        let mut regs = RegisterContext::new(Arch::Arm64);
        regs.fp = 0x9000;
        let row = arm64_row(0x1010).expect("row");
        assert_eq!(apply_row(&row, Arch::Arm64, &mut regs, &ctx), Err(UnwindError::ReadStackFailed));
    }

    #[test]
    fn test_no_row_outside_fde()
    {
        assert!(arm64_row(0x0fff).is_none());
        assert!(arm64_row(0x1040).is_none());
    }
}
