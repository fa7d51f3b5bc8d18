//! Intermediate instructions and their bytecode encoding.
//!
//! The generator first describes each table entry as a list of
//! [`QutInstruction`]s (an operation plus a 32-bit immediate), then
//! [`encode`] turns the list into bytes.
//!
//! ## Bytecode
//!
//! ```text
//! 00nn nnnn          cfa += n << 2
//! 01nn nnnn          cfa -= n << 2
//! 1000 0000          cfa = fp                      (x29 / r7)
//! 1000 0001          cfa = fp + 2w, lr = [cfa - w], fp = [cfa - 2w]
//! 1000 0010          cfa = r11                     (arm)
//! 1000 0011          cfa = r11 + 8, lr = [cfa - 4], r11 = [cfa - 8]
//! 1000 0100          cfa = sp
//! 1000 0101 0nnn..   cfa = fp + (n << 2)
//! 1000 0110 0nnn..   cfa = r11 + (n << 2)          (arm)
//! 1001 0101 0nnn..   cfa = jni_sp + (n << 2)       (x28 / r10)
//! 1001 0110 sleb     cfa = sleb
//! 1001 0111          dex_pc = dex register         (x20 / r4)
//! 1001 1001          end of instructions
//! 1001 1111          finished: pc = lr = 0
//! 1010 nnnn          dex register = [cfa - (n << 2)]
//! 1011 nnnn          r7 = [cfa - (n << 2)]         (arm)
//! 1100 nnnn          jni register = [cfa - (n << 2)]
//! 1101 nnnn          x29 / r11 = [cfa - (n << 2)]
//! 1110 nnnn          lr = [cfa - (n << 2)]
//! 1111 1001 sleb     x20 / r7 = [cfa - sleb]
//! 1111 1010 sleb     x28 / r10 = [cfa - sleb]
//! 1111 1011 sleb     x29 / r11 = [cfa - sleb]
//! 1111 1100 sleb     sp = [cfa - sleb]
//! 1111 1101 sleb     lr = [cfa - sleb]
//! 1111 1110 sleb     pc = [cfa - sleb]
//! 1111 1111 sleb     cfa += sleb
//! ```

use smallvec::SmallVec;
use thiserror::Error;

use crate::types::Arch;

/// Bytecode opcodes.
pub mod opcode
{
    pub const VSP_DECREASE: u8 = 0x40;
    pub const VSP_SET_BY_FP: u8 = 0x80;
    pub const VSP_SET_BY_FP_PROLOGUE: u8 = 0x81;
    pub const VSP_SET_BY_R11: u8 = 0x82;
    pub const VSP_SET_BY_R11_PROLOGUE: u8 = 0x83;
    pub const VSP_SET_BY_SP: u8 = 0x84;
    pub const VSP_SET_BY_FP_IMM: u8 = 0x85;
    pub const VSP_SET_BY_R11_IMM: u8 = 0x86;
    pub const VSP_SET_BY_JNI_SP: u8 = 0x95;
    pub const VSP_SET_IMM: u8 = 0x96;
    pub const DEX_PC_SET: u8 = 0x97;
    pub const END_OF_INSTRUCTIONS: u8 = 0x99;
    pub const FINISH: u8 = 0x9F;
    pub const DEX_REG_PREFIX: u8 = 0xA0;
    pub const R7_PREFIX: u8 = 0xB0;
    pub const JNI_REG_PREFIX: u8 = 0xC0;
    pub const FP_REG_PREFIX: u8 = 0xD0;
    pub const LR_PREFIX: u8 = 0xE0;
    pub const X20_R7_SLEB: u8 = 0xF9;
    pub const JNI_REG_SLEB: u8 = 0xFA;
    pub const FP_REG_SLEB: u8 = 0xFB;
    pub const SP_SLEB: u8 = 0xFC;
    pub const LR_SLEB: u8 = 0xFD;
    pub const PC_SLEB: u8 = 0xFE;
    pub const VSP_OFFSET_SLEB: u8 = 0xFF;
}

/// Operation of an intermediate instruction.
///
/// Register operations mean `register = [cfa - imm]`; `VspSetBy*` set the
/// cfa from a register plus `imm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QutOp
{
    R4,
    R7,
    R10,
    R11,
    SpOffset,
    Lr,
    Pc,
    X20,
    X28,
    X29,
    VspOffset,
    VspSetImm,
    VspSetByR7,
    VspSetByR11,
    VspSetByX29,
    VspSetBySp,
    VspSetByJniSp,
    DexPcSet,
    EndOfIns,
    Finish,
}

/// One intermediate instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QutInstruction
{
    pub op: QutOp,
    pub imm: i32,
}

impl QutInstruction
{
    pub const fn new(op: QutOp, imm: i32) -> Self
    {
        Self { op, imm }
    }
}

/// The instructions of one table entry.
pub type InstructionList = SmallVec<[QutInstruction; 8]>;

/// Bytecode of one table entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedEntry
{
    pub bytes: SmallVec<[u8; 16]>,
    /// Whether a frame record was folded into a single prologue opcode.
    pub prologue: bool,
}

/// Why an instruction list has no bytecode form.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError
{
    #[error("immediate of {0:?} is not 4-byte aligned")]
    Misaligned(QutInstruction),

    #[error("immediate of {0:?} is out of range")]
    OutOfRange(QutInstruction),

    #[error("{0:?} is not available on {1}")]
    Unsupported(QutInstruction, Arch),
}

/// Compact prefix and SLEB opcode for a register restore.
fn register_encoding(arch: Arch, op: QutOp) -> Option<(Option<u8>, Option<u8>)>
{
    use opcode::*;
    let encoding = match (arch, op) {
        (Arch::Arm64, QutOp::X20) => (Some(DEX_REG_PREFIX), Some(X20_R7_SLEB)),
        (Arch::Arm64, QutOp::X28) => (Some(JNI_REG_PREFIX), Some(JNI_REG_SLEB)),
        (Arch::Arm64, QutOp::X29) => (Some(FP_REG_PREFIX), Some(FP_REG_SLEB)),
        (Arch::Arm, QutOp::R4) => (Some(DEX_REG_PREFIX), None),
        (Arch::Arm, QutOp::R7) => (Some(R7_PREFIX), Some(X20_R7_SLEB)),
        (Arch::Arm, QutOp::R10) => (Some(JNI_REG_PREFIX), Some(JNI_REG_SLEB)),
        (Arch::Arm, QutOp::R11) => (Some(FP_REG_PREFIX), Some(FP_REG_SLEB)),
        (Arch::Arm | Arch::Arm64, QutOp::Lr) => (Some(LR_PREFIX), Some(LR_SLEB)),
        (Arch::Arm | Arch::Arm64, QutOp::SpOffset) => (None, Some(SP_SLEB)),
        (Arch::Arm | Arch::Arm64, QutOp::Pc) => (None, Some(PC_SLEB)),
        _ => return None,
    };
    Some(encoding)
}

pub(crate) fn push_sleb128(out: &mut SmallVec<[u8; 16]>, mut value: i64)
{
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn push_vsp_offset(out: &mut SmallVec<[u8; 16]>, imm: i32)
{
    let magnitude = imm.unsigned_abs();
    if imm == 0 {
        return;
    }
    if magnitude <= 252 {
        let sign = if imm > 0 { 0 } else { opcode::VSP_DECREASE };
        out.push(sign | ((magnitude >> 2) & 0x3f) as u8);
    } else {
        out.push(opcode::VSP_OFFSET_SLEB);
        push_sleb128(out, i64::from(imm));
    }
}

/// Encode one entry's instruction list for `arch`.
///
/// A frame record (`cfa = fp + 2w` with `lr` at `cfa - w` and `fp` at
/// `cfa - 2w`) is folded into a single prologue opcode wherever its three
/// instructions appear in the list.
///
/// ## Errors
///
/// Returns `EncodeError` for misaligned immediates, immediates outside the
/// opcode's range, and operations that do not exist on `arch`. The caller
/// drops the whole entry.
pub fn encode(arch: Arch, instructions: &[QutInstruction]) -> Result<EncodedEntry, EncodeError>
{
    let word = i32::try_from(arch.word_size()).unwrap_or(8);
    let mut consumed: SmallVec<[bool; 8]> = SmallVec::from_elem(false, instructions.len());
    let mut entry = EncodedEntry::default();
    let out = &mut entry.bytes;

    for (i, ins) in instructions.iter().enumerate() {
        if consumed[i] {
            continue;
        }
        if ins.imm & 3 != 0 {
            return Err(EncodeError::Misaligned(*ins));
        }
        let imm = ins.imm;
        match ins.op {
            QutOp::VspOffset => push_vsp_offset(out, imm),
            QutOp::VspSetImm => {
                out.push(opcode::VSP_SET_IMM);
                push_sleb128(out, i64::from(imm));
            }
            QutOp::VspSetByX29 | QutOp::VspSetByR7 | QutOp::VspSetByR11 => {
                let (saved, plain, prologue, with_imm) = match (arch, ins.op) {
                    (Arch::Arm64, QutOp::VspSetByX29) => (
                        QutOp::X29,
                        opcode::VSP_SET_BY_FP,
                        opcode::VSP_SET_BY_FP_PROLOGUE,
                        opcode::VSP_SET_BY_FP_IMM,
                    ),
                    (Arch::Arm, QutOp::VspSetByR7) => (
                        QutOp::R7,
                        opcode::VSP_SET_BY_FP,
                        opcode::VSP_SET_BY_FP_PROLOGUE,
                        opcode::VSP_SET_BY_FP_IMM,
                    ),
                    (Arch::Arm, QutOp::VspSetByR11) => (
                        QutOp::R11,
                        opcode::VSP_SET_BY_R11,
                        opcode::VSP_SET_BY_R11_PROLOGUE,
                        opcode::VSP_SET_BY_R11_IMM,
                    ),
                    _ => return Err(EncodeError::Unsupported(*ins, arch)),
                };

                if imm == 2 * word {
                    let find = |op: QutOp, imm: i32| {
                        instructions
                            .iter()
                            .enumerate()
                            .skip(i + 1)
                            .find(|(j, other)| !consumed[*j] && other.op == op && other.imm == imm)
                            .map(|(j, _)| j)
                    };
                    if let (Some(lr), Some(fp)) = (find(QutOp::Lr, word), find(saved, 2 * word)) {
                        consumed[lr] = true;
                        consumed[fp] = true;
                        out.push(prologue);
                        entry.prologue = true;
                        continue;
                    }
                }

                if imm == 0 {
                    out.push(plain);
                } else if imm > 0 && imm <= 508 {
                    out.push(with_imm);
                    out.push(((imm >> 2) & 0x7f) as u8);
                } else {
                    return Err(EncodeError::OutOfRange(*ins));
                }
            }
            QutOp::VspSetBySp => {
                out.push(opcode::VSP_SET_BY_SP);
                push_vsp_offset(out, imm);
            }
            QutOp::VspSetByJniSp => {
                if !(0..=508).contains(&imm) {
                    return Err(EncodeError::OutOfRange(*ins));
                }
                out.push(opcode::VSP_SET_BY_JNI_SP);
                out.push(((imm >> 2) & 0x7f) as u8);
            }
            QutOp::DexPcSet => out.push(opcode::DEX_PC_SET),
            QutOp::EndOfIns => out.push(opcode::END_OF_INSTRUCTIONS),
            QutOp::Finish => out.push(opcode::FINISH),
            op => {
                let (prefix, sleb) = register_encoding(arch, op).ok_or(EncodeError::Unsupported(*ins, arch))?;
                match (prefix, sleb) {
                    (Some(prefix), _) if (0..=60).contains(&imm) => out.push(prefix | ((imm >> 2) & 0xf) as u8),
                    (_, Some(sleb)) => {
                        out.push(sleb);
                        push_sleb128(out, i64::from(imm));
                    }
                    _ => return Err(EncodeError::OutOfRange(*ins)),
                }
            }
        }
    }

    Ok(entry)
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn ins(op: QutOp, imm: i32) -> QutInstruction
    {
        QutInstruction::new(op, imm)
    }

    #[test]
    fn test_arm64_frame_record_folds_into_prologue()
    {
        let list = [ins(QutOp::VspSetByX29, 16), ins(QutOp::X29, 16), ins(QutOp::Lr, 8)];
        let entry = encode(Arch::Arm64, &list).unwrap();
        assert_eq!(entry.bytes.as_slice(), &[0x81]);
        assert!(entry.prologue);
    }

    #[test]
    fn test_arm_r11_frame_record()
    {
        let list = [ins(QutOp::VspSetByR11, 8), ins(QutOp::Lr, 4), ins(QutOp::R11, 8), ins(QutOp::R4, 12)];
        let entry = encode(Arch::Arm, &list).unwrap();
        assert_eq!(entry.bytes.as_slice(), &[0x83, 0xA3]);
    }

    #[test]
    fn test_sp_based_entry()
    {
        // cfa = sp + 48; x29 = [cfa - 48]; lr = [cfa - 40]; x20 = [cfa - 8]
        let list = [
            ins(QutOp::VspOffset, 48),
            ins(QutOp::X29, 48),
            ins(QutOp::Lr, 40),
            ins(QutOp::X20, 8),
        ];
        let entry = encode(Arch::Arm64, &list).unwrap();
        assert_eq!(entry.bytes.as_slice(), &[0x0C, 0xDC, 0xEA, 0xA2]);
        assert!(!entry.prologue);
    }

    #[test]
    fn test_large_offsets_use_sleb()
    {
        let list = [ins(QutOp::VspOffset, 4096), ins(QutOp::Lr, 64), ins(QutOp::VspOffset, -8)];
        let entry = encode(Arch::Arm64, &list).unwrap();
        assert_eq!(entry.bytes.as_slice(), &[0xFF, 0x80, 0x20, 0xFD, 0xC0, 0x00, 0x42]);
    }

    #[test]
    fn test_fp_with_immediate()
    {
        let entry = encode(Arch::Arm64, &[ins(QutOp::VspSetByX29, 32)]).unwrap();
        assert_eq!(entry.bytes.as_slice(), &[0x85, 0x08]);
        assert_eq!(
            encode(Arch::Arm64, &[ins(QutOp::VspSetByX29, 512)]),
            Err(EncodeError::OutOfRange(ins(QutOp::VspSetByX29, 512)))
        );
    }

    #[test]
    fn test_rejections()
    {
        assert!(matches!(
            encode(Arch::Arm64, &[ins(QutOp::VspOffset, 6)]),
            Err(EncodeError::Misaligned(_))
        ));
        assert!(matches!(
            encode(Arch::Arm, &[ins(QutOp::R4, 64)]),
            Err(EncodeError::OutOfRange(_))
        ));
        assert!(matches!(
            encode(Arch::Arm64, &[ins(QutOp::R7, 4)]),
            Err(EncodeError::Unsupported(_, Arch::Arm64))
        ));
    }

    #[test]
    fn test_sleb128()
    {
        let mut out = SmallVec::<[u8; 16]>::new();
        push_sleb128(&mut out, 2);
        push_sleb128(&mut out, -2);
        push_sleb128(&mut out, 127);
        push_sleb128(&mut out, -128);
        assert_eq!(out.as_slice(), &[0x02, 0x7e, 0xff, 0x00, 0x80, 0x7f]);
    }
}
