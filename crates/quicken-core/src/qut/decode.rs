//! Bytecode interpreter: one unwind step over a QUT table.

use super::{
    instructions::opcode,
    sections::{row_bytes, EntryBytes, QutSections},
};
use crate::{
    error::UnwindError,
    memory::{MemoryAccess, StackRange},
    types::{Arch, RegisterContext},
};

/// What a step needs besides the registers.
#[derive(Clone, Copy)]
pub struct StepContext<'a>
{
    /// Memory that saved registers are read from
    pub memory: &'a dyn MemoryAccess,
    /// Every stack read must fall inside this range
    pub stack: StackRange,
}

impl<'a> StepContext<'a>
{
    pub fn new(memory: &'a dyn MemoryAccess, stack: StackRange) -> Self
    {
        Self { memory, stack }
    }
}

/// Result of a successful step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome
{
    /// The recovered pc is zero: the walk reached the outermost frame.
    pub finished: bool,
    /// Dex pc of the frame just left, if the bytecode recorded one.
    pub dex_pc: Option<u64>,
}

/// Step `regs` from the frame containing `rel_pc` to its caller.
///
/// ## Errors
///
/// - `UnwindInfo` if no entry covers `rel_pc` or the entry is a gap.
/// - `TableIndexOverflow` if the bytecode runs past its storage.
/// - `ReadStackFailed` if a saved register lies outside the stack.
/// - `InvalidQutInstr` on an unknown opcode.
///
/// `regs` may be partially updated when an error is returned.
pub fn step(
    sections: &QutSections,
    rel_pc: u64,
    regs: &mut RegisterContext,
    ctx: &StepContext<'_>,
) -> Result<StepOutcome, UnwindError>
{
    let command = sections.find_command(rel_pc).ok_or(UnwindError::UnwindInfo)?;
    let arch = sections.arch();
    let mut cursor = match sections.entry_bytes(command)? {
        EntryBytes::Gap => return Err(UnwindError::UnwindInfo),
        EntryBytes::Inline(word) => ByteCursor::new(&[], word, row_bytes(arch), arch.word_size()),
        EntryBytes::Rows(rows) => match rows.split_first() {
            Some((first, rest)) => ByteCursor::new(rest, *first, arch.word_size(), arch.word_size()),
            None => return Err(UnwindError::UnwindInfo),
        },
    };

    let mut eval = Evaluator {
        arch,
        cfa: regs.sp,
        pc_set: false,
        dex_pc: None,
        regs: &mut *regs,
        ctx,
    };
    match arch {
        Arch::Arm64 => eval.decode64(&mut cursor)?,
        Arch::Arm => eval.decode32(&mut cursor)?,
        Arch::X86 | Arch::X86_64 => return Err(UnwindError::UnsupportedArch),
    }

    let Evaluator { cfa, pc_set, dex_pc, .. } = eval;
    if !pc_set {
        regs.pc = regs.lr;
    }
    regs.sp = arch.mask(cfa);
    Ok(StepOutcome {
        finished: regs.pc == 0,
        dex_pc,
    })
}

/// Yields bytecode bytes most significant first, word after word.
struct ByteCursor<'a>
{
    rest: &'a [u64],
    current: u64,
    remaining: usize,
    word_bytes: usize,
}

impl<'a> ByteCursor<'a>
{
    fn new(rest: &'a [u64], current: u64, remaining: usize, word_bytes: usize) -> Self
    {
        Self {
            rest,
            current,
            remaining,
            word_bytes,
        }
    }

    fn next_byte(&mut self) -> Option<u8>
    {
        if self.remaining == 0 {
            let (first, rest) = self.rest.split_first()?;
            self.current = *first;
            self.rest = rest;
            self.remaining = self.word_bytes;
        }
        self.remaining -= 1;
        Some(((self.current >> (self.remaining * 8)) & 0xff) as u8)
    }

    /// Operand byte of a two-byte instruction.
    fn operand(&mut self) -> Result<u8, UnwindError>
    {
        self.next_byte().ok_or(UnwindError::TableIndexOverflow)
    }

    fn sleb128(&mut self) -> Result<i64, UnwindError>
    {
        let mut result = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = self.operand()?;
            if shift < 64 {
                result |= i64::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }
}

struct Evaluator<'r, 'c>
{
    arch: Arch,
    cfa: u64,
    pc_set: bool,
    dex_pc: Option<u64>,
    regs: &'r mut RegisterContext,
    ctx: &'r StepContext<'c>,
}

enum Flow
{
    Continue,
    End,
}

impl Evaluator<'_, '_>
{
    fn read_stack(&self, address: u64) -> Result<u64, UnwindError>
    {
        let address = self.arch.mask(address);
        let len = self.arch.word_size() as u64;
        if !self.ctx.stack.contains(address, len) {
            return Err(UnwindError::ReadStackFailed);
        }
        self.ctx
            .memory
            .read_word(address, self.arch)
            .ok_or(UnwindError::ReadStackFailed)
    }

    /// Address `offset` bytes below the cfa.
    fn below_cfa(&self, offset: i64) -> u64
    {
        self.arch.mask(self.cfa.wrapping_sub(offset as u64))
    }

    fn set_cfa(&mut self, value: u64)
    {
        self.cfa = self.arch.mask(value);
    }

    /// Shared handling of the one-byte `cfa += / -=` forms and the trailing
    /// opcodes both architectures encode identically.
    fn common(&mut self, byte: u8, cursor: &mut ByteCursor<'_>) -> Result<Option<Flow>, UnwindError>
    {
        let flow = match byte {
            0x00..=0x3f => {
                self.set_cfa(self.cfa.wrapping_add(u64::from(byte & 0x3f) << 2));
                Flow::Continue
            }
            0x40..=0x7f => {
                self.set_cfa(self.cfa.wrapping_sub(u64::from(byte & 0x3f) << 2));
                Flow::Continue
            }
            opcode::VSP_SET_BY_SP => {
                self.cfa = self.regs.sp;
                Flow::Continue
            }
            opcode::VSP_SET_BY_JNI_SP => {
                let imm = u64::from(cursor.operand()? & 0x7f) << 2;
                self.set_cfa(self.regs.jni_sp.wrapping_add(imm));
                Flow::Continue
            }
            opcode::VSP_SET_IMM => {
                let value = cursor.sleb128()?;
                self.set_cfa(value as u64);
                Flow::Continue
            }
            opcode::DEX_PC_SET => {
                self.dex_pc = Some(self.regs.dex);
                Flow::Continue
            }
            opcode::END_OF_INSTRUCTIONS => Flow::End,
            opcode::FINISH => {
                self.regs.pc = 0;
                self.regs.lr = 0;
                self.pc_set = true;
                Flow::End
            }
            0xE0..=0xEF => {
                self.regs.lr = self.read_stack(self.below_cfa(i64::from(byte & 0xf) << 2))?;
                Flow::Continue
            }
            opcode::JNI_REG_SLEB => {
                let offset = cursor.sleb128()?;
                self.regs.jni_sp = self.read_stack(self.below_cfa(offset))?;
                Flow::Continue
            }
            opcode::SP_SLEB => {
                let offset = cursor.sleb128()?;
                self.regs.sp = self.read_stack(self.below_cfa(offset))?;
                Flow::Continue
            }
            opcode::LR_SLEB => {
                let offset = cursor.sleb128()?;
                self.regs.lr = self.read_stack(self.below_cfa(offset))?;
                Flow::Continue
            }
            opcode::PC_SLEB => {
                let offset = cursor.sleb128()?;
                self.regs.pc = self.read_stack(self.below_cfa(offset))?;
                self.pc_set = true;
                Flow::Continue
            }
            opcode::VSP_OFFSET_SLEB => {
                let offset = cursor.sleb128()?;
                self.set_cfa(self.cfa.wrapping_add(offset as u64));
                Flow::Continue
            }
            _ => return Ok(None),
        };
        Ok(Some(flow))
    }

    fn decode64(&mut self, cursor: &mut ByteCursor<'_>) -> Result<(), UnwindError>
    {
        while let Some(byte) = cursor.next_byte() {
            if let Some(flow) = self.common(byte, cursor)? {
                if let Flow::End = flow {
                    return Ok(());
                }
                continue;
            }
            match byte {
                opcode::VSP_SET_BY_FP => self.cfa = self.regs.fp,
                opcode::VSP_SET_BY_FP_PROLOGUE => {
                    self.set_cfa(self.regs.fp.wrapping_add(16));
                    self.regs.lr = self.read_stack(self.below_cfa(8))?;
                    self.regs.fp = self.read_stack(self.below_cfa(16))?;
                    if self.regs.fp == 0 {
                        return Ok(());
                    }
                }
                opcode::VSP_SET_BY_FP_IMM => {
                    let imm = u64::from(cursor.operand()? & 0x7f) << 2;
                    self.set_cfa(self.regs.fp.wrapping_add(imm));
                }
                0xA0..=0xAF => self.regs.dex = self.read_stack(self.below_cfa(i64::from(byte & 0xf) << 2))?,
                0xC0..=0xCF => self.regs.jni_sp = self.read_stack(self.below_cfa(i64::from(byte & 0xf) << 2))?,
                0xD0..=0xDF => {
                    self.regs.fp = self.read_stack(self.below_cfa(i64::from(byte & 0xf) << 2))?;
                    if self.regs.fp == 0 {
                        return Ok(());
                    }
                }
                opcode::X20_R7_SLEB => {
                    let offset = cursor.sleb128()?;
                    self.regs.dex = self.read_stack(self.below_cfa(offset))?;
                }
                opcode::FP_REG_SLEB => {
                    let offset = cursor.sleb128()?;
                    self.regs.fp = self.read_stack(self.below_cfa(offset))?;
                    if self.regs.fp == 0 {
                        return Ok(());
                    }
                }
                _ => return Err(UnwindError::InvalidQutInstr),
            }
        }
        Ok(())
    }

    fn decode32(&mut self, cursor: &mut ByteCursor<'_>) -> Result<(), UnwindError>
    {
        while let Some(byte) = cursor.next_byte() {
            if let Some(flow) = self.common(byte, cursor)? {
                if let Flow::End = flow {
                    return Ok(());
                }
                continue;
            }
            let offset = i64::from(byte & 0xf) << 2;
            match byte {
                opcode::VSP_SET_BY_FP => self.cfa = self.regs.fp,
                opcode::VSP_SET_BY_FP_PROLOGUE => {
                    self.set_cfa(self.regs.fp.wrapping_add(8));
                    self.regs.lr = self.read_stack(self.below_cfa(4))?;
                    self.regs.fp = self.read_stack(self.below_cfa(8))?;
                }
                opcode::VSP_SET_BY_R11 => self.cfa = self.regs.fp_alt,
                opcode::VSP_SET_BY_R11_PROLOGUE => {
                    self.set_cfa(self.regs.fp_alt.wrapping_add(8));
                    self.regs.lr = self.read_stack(self.below_cfa(4))?;
                    self.regs.fp_alt = self.read_stack(self.below_cfa(8))?;
                }
                opcode::VSP_SET_BY_FP_IMM => {
                    let imm = u64::from(cursor.operand()? & 0x7f) << 2;
                    self.set_cfa(self.regs.fp.wrapping_add(imm));
                }
                opcode::VSP_SET_BY_R11_IMM => {
                    let imm = u64::from(cursor.operand()? & 0x7f) << 2;
                    self.set_cfa(self.regs.fp_alt.wrapping_add(imm));
                }
                0xA0..=0xAF => self.regs.dex = self.read_stack(self.below_cfa(offset))?,
                0xB0..=0xBF => self.regs.fp = self.read_stack(self.below_cfa(offset))?,
                0xC0..=0xCF => self.regs.jni_sp = self.read_stack(self.below_cfa(offset))?,
                0xD0..=0xDF => self.regs.fp_alt = self.read_stack(self.below_cfa(offset))?,
                opcode::X20_R7_SLEB => {
                    let offset = cursor.sleb128()?;
                    self.regs.fp = self.read_stack(self.below_cfa(offset))?;
                }
                opcode::FP_REG_SLEB => {
                    let offset = cursor.sleb128()?;
                    self.regs.fp_alt = self.read_stack(self.below_cfa(offset))?;
                }
                _ => return Err(UnwindError::InvalidQutInstr),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::{
        memory::SliceMemory,
        qut::{
            instructions::{encode, QutInstruction, QutOp},
            sections::SectionsBuilder,
        },
    };

    const STACK_BASE: u64 = 0x7000_0000;

    fn stack(words: &[(u64, u64)], arch: Arch) -> SliceMemory
    {
        let mut mem = SliceMemory::new(STACK_BASE, vec![0; 0x400]);
        for (address, value) in words {
            mem.write_word(*address, *value, arch);
        }
        mem
    }

    fn single_entry(arch: Arch, bytes: &[u8]) -> QutSections
    {
        let mut builder = SectionsBuilder::new(arch);
        builder.push(0x1000, Some(bytes));
        builder.push_gap(0x2000);
        builder.finish()
    }

    #[test]
    fn test_arm64_prologue_step()
    {
        let sections = single_entry(Arch::Arm64, &[0x81]);
        let fp = STACK_BASE + 0x100;
        let mem = stack(&[(fp, STACK_BASE + 0x200), (fp + 8, 0x5555_1234)], Arch::Arm64);
        let ctx = StepContext::new(&mem, StackRange::new(mem.base(), mem.end()));

        let mut regs = RegisterContext::new(Arch::Arm64);
        regs.sp = STACK_BASE + 0x80;
        regs.fp = fp;
        let outcome = step(&sections, 0x1010, &mut regs, &ctx).unwrap();

        assert!(!outcome.finished);
        assert_eq!(regs.pc, 0x5555_1234);
        assert_eq!(regs.sp, fp + 16);
        assert_eq!(regs.fp, STACK_BASE + 0x200);
    }

    #[test]
    fn test_arm64_sp_entry_with_dex_pc()
    {
        let list = [
            QutInstruction::new(QutOp::VspOffset, 48),
            QutInstruction::new(QutOp::DexPcSet, 0),
            QutInstruction::new(QutOp::Lr, 40),
            QutInstruction::new(QutOp::X20, 8),
            QutInstruction::new(QutOp::X29, 48),
        ];
        let entry = encode(Arch::Arm64, &list).unwrap();
        let sections = single_entry(Arch::Arm64, &entry.bytes);

        let sp = STACK_BASE + 0x40;
        let cfa = sp + 48;
        let mem = stack(&[(cfa - 40, 0xabcd), (cfa - 8, 0x77), (cfa - 48, 0x1)], Arch::Arm64);
        let ctx = StepContext::new(&mem, StackRange::new(mem.base(), mem.end()));
        let mut regs = RegisterContext::new(Arch::Arm64);
        regs.sp = sp;
        regs.dex = 0x9000;

        let outcome = step(&sections, 0x1ff0, &mut regs, &ctx).unwrap();
        assert_eq!(outcome.dex_pc, Some(0x9000));
        assert_eq!(regs.pc, 0xabcd);
        assert_eq!(regs.dex, 0x77);
        assert_eq!(regs.fp, 0x1);
        assert_eq!(regs.sp, cfa);
    }

    #[test]
    fn test_finish_ends_the_walk()
    {
        let sections = single_entry(Arch::Arm64, &[0x9f]);
        let mem = stack(&[], Arch::Arm64);
        let ctx = StepContext::new(&mem, StackRange::new(mem.base(), mem.end()));
        let mut regs = RegisterContext::new(Arch::Arm64);
        regs.lr = 0x1234;
        regs.sp = STACK_BASE;

        let outcome = step(&sections, 0x1000, &mut regs, &ctx).unwrap();
        assert!(outcome.finished);
        assert_eq!(regs.pc, 0);
    }

    #[test]
    fn test_arm_r11_prologue_masks_to_32_bits()
    {
        let sections = single_entry(Arch::Arm, &[0x83, 0xa3]);
        let r11 = STACK_BASE + 0x40;
        let cfa = r11 + 8;
        let mem = stack(&[(cfa - 4, 0x0040_1001), (cfa - 8, STACK_BASE + 0x80), (cfa - 12, 0x44)], Arch::Arm);
        let ctx = StepContext::new(&mem, StackRange::new(mem.base(), mem.end()));
        let mut regs = RegisterContext::new(Arch::Arm);
        regs.sp = STACK_BASE;
        regs.fp_alt = r11;

        step(&sections, 0x1000, &mut regs, &ctx).unwrap();
        assert_eq!(regs.pc, 0x0040_1001);
        assert_eq!(regs.fp_alt, STACK_BASE + 0x80);
        assert_eq!(regs.dex, 0x44);
        assert_eq!(regs.sp, cfa);
    }

    #[test]
    fn test_errors()
    {
        let mem = stack(&[], Arch::Arm64);
        let ctx = StepContext::new(&mem, StackRange::new(mem.base(), mem.end()));
        let mut regs = RegisterContext::new(Arch::Arm64);
        regs.sp = STACK_BASE + 0x10;

        let sections = single_entry(Arch::Arm64, &[0x84]);
        assert_eq!(step(&sections, 0x0fff, &mut regs, &ctx), Err(UnwindError::UnwindInfo));
        assert_eq!(step(&sections, 0x2000, &mut regs, &ctx), Err(UnwindError::UnwindInfo));

        // lr lies below the stack bottom
        let sections = single_entry(Arch::Arm64, &[0x48, 0xe1]);
        assert_eq!(step(&sections, 0x1000, &mut regs, &ctx), Err(UnwindError::ReadStackFailed));

        let sections = single_entry(Arch::Arm64, &[0x90]);
        assert_eq!(step(&sections, 0x1000, &mut regs, &ctx), Err(UnwindError::InvalidQutInstr));

        // sleb operand cut off by the end of the entry
        let sections = single_entry(Arch::Arm64, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x80]);
        assert_eq!(step(&sections, 0x1000, &mut regs, &ctx), Err(UnwindError::TableIndexOverflow));
    }
}
