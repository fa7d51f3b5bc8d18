//! # ARM Exception Index
//!
//! 32-bit ARM libraries often carry no DWARF CFI at all; their unwind
//! information lives in `.ARM.exidx` (one 8-byte entry per function, sorted
//! by address) and `.ARM.extab` (longer opcode sequences referenced from
//! exidx). This module turns each entry's EHABI opcodes into the same
//! [`QutInstruction`] lists the DWARF path produces.
//!
//! Only the effect on the cfa and on the registers a QUT table tracks (r4,
//! r7, r10, r11, sp, lr, pc) is kept. VFP and WMMX pops just move the cfa.

use smallvec::SmallVec;
use thiserror::Error;

use crate::{
    elf::SectionBlob,
    qut::{InstructionList, QutInstruction, QutOp},
};

const OP_FINISH: u8 = 0xb0;
const CANT_UNWIND: u32 = 1;
const MAX_EXTAB_WORDS: u32 = 5;

/// Why an exidx entry has no instruction form.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExidxError
{
    #[error("function is marked EXIDX_CANTUNWIND")]
    CantUnwind,

    #[error("failed to read unwind data at {0:#x}")]
    ReadFailed(u64),

    #[error("unsupported personality index {0}")]
    InvalidPersonality(u32),

    #[error("extab entry claims {0} additional words")]
    Malformed(u32),

    #[error("refuse-to-unwind opcode")]
    Refused,

    #[error("spare opcode {0:#04x}")]
    Spare(u8),

    #[error("reserved opcode {0:#04x}")]
    Reserved(u8),

    #[error("vsp = r{0} is not expressible")]
    UnsupportedVspRegister(u8),

    #[error("opcodes end without finish")]
    Truncated,
}

/// One decoded index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExidxEntry
{
    /// Link-time address of the first instruction of the function
    pub start: u64,
    /// Translated opcodes
    pub instructions: Result<InstructionList, ExidxError>,
}

/// Word reader over `.ARM.exidx` and `.ARM.extab`, addressed by link-time
/// address.
struct UnwindData<'a>
{
    exidx: &'a SectionBlob,
    extab: Option<&'a SectionBlob>,
    big_endian: bool,
}

impl UnwindData<'_>
{
    fn word(&self, address: u64) -> Result<u32, ExidxError>
    {
        let read = |blob: &SectionBlob| {
            let offset = usize::try_from(address.checked_sub(blob.address)?).ok()?;
            let bytes: [u8; 4] = blob.data.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
            Some(if self.big_endian {
                u32::from_be_bytes(bytes)
            } else {
                u32::from_le_bytes(bytes)
            })
        };
        read(self.exidx)
            .or_else(|| self.extab.and_then(read))
            .ok_or(ExidxError::ReadFailed(address))
    }
}

/// Resolve a prel31 field stored at `place`.
fn prel31(word: u32, place: u64) -> u64
{
    let offset = ((word << 1) as i32) >> 1;
    place.wrapping_add_signed(i64::from(offset)) & 0xffff_ffff
}

/// Decode every entry of `exidx`.
///
/// Entry `i` covers the functions from its start to the start of entry
/// `i + 1`, so callers use the last entry only as an end marker.
pub fn decode_entries(exidx: &SectionBlob, extab: Option<&SectionBlob>, big_endian: bool) -> Vec<ExidxEntry>
{
    let data = UnwindData {
        exidx,
        extab,
        big_endian,
    };
    let count = exidx.data.len() / 8;
    let mut entries = Vec::with_capacity(count);
    for index in 0..count {
        let place = exidx.address + (index as u64) * 8;
        let Ok(word) = data.word(place) else {
            continue;
        };
        let instructions = entry_opcodes(&data, place).and_then(|opcodes| translate(&opcodes));
        entries.push(ExidxEntry {
            start: prel31(word, place),
            instructions,
        });
    }
    entries
}

/// Collect the opcode bytes of the entry at `place`, terminated by finish.
fn entry_opcodes(data: &UnwindData<'_>, place: u64) -> Result<SmallVec<[u8; 24]>, ExidxError>
{
    let mut opcodes: SmallVec<[u8; 24]> = SmallVec::new();
    let value = data.word(place + 4)?;
    if value == CANT_UNWIND {
        return Err(ExidxError::CantUnwind);
    }

    if value & 0x8000_0000 != 0 {
        // inline compact model, personality routine 0
        let personality = (value >> 24) & 0xf;
        if personality != 0 {
            return Err(ExidxError::InvalidPersonality(personality));
        }
        opcodes.extend([(value >> 16) as u8, (value >> 8) as u8, value as u8]);
    } else {
        let mut address = prel31(value, place + 4);
        let header = data.word(address)?;
        let extra_words = if header & 0x8000_0000 != 0 {
            match (header >> 24) & 0xf {
                0 => {
                    opcodes.push((header >> 16) as u8);
                    0
                }
                1 | 2 => (header >> 16) & 0xff,
                personality => return Err(ExidxError::InvalidPersonality(personality)),
            }
        } else {
            // generic model: skip the personality routine pointer
            address += 4;
            let header = data.word(address)?;
            opcodes.push((header >> 16) as u8);
            (header >> 24) & 0xff
        };
        let header = data.word(address)?;
        opcodes.extend([(header >> 8) as u8, header as u8]);
        if extra_words > MAX_EXTAB_WORDS {
            return Err(ExidxError::Malformed(extra_words));
        }
        for _ in 0..extra_words {
            address += 4;
            opcodes.extend(data.word(address)?.to_be_bytes());
        }
    }

    if opcodes.last() != Some(&OP_FINISH) {
        opcodes.push(OP_FINISH);
    }
    Ok(opcodes)
}

/// Accumulates the effect of opcodes between two cfa redefinitions.
#[derive(Default)]
struct Translator
{
    /// Bytes popped since the cfa was last defined
    vsp: i32,
    /// Registers popped, with the vsp they were popped from
    saved: SmallVec<[(QutOp, i32); 8]>,
    out: InstructionList,
}

impl Translator
{
    fn pop(&mut self, op: Option<QutOp>)
    {
        if let Some(op) = op {
            self.saved.retain(|(saved, _)| *saved != op);
            self.saved.push((op, self.vsp));
        }
        self.vsp += 4;
    }

    /// Emit the pending cfa adjustment and restores, then start over from
    /// the new cfa.
    fn flush(&mut self)
    {
        if self.vsp != 0 {
            self.out.push(QutInstruction::new(QutOp::VspOffset, self.vsp));
        }
        let mut restores: SmallVec<[QutInstruction; 8]> = self
            .saved
            .iter()
            .map(|(op, popped_at)| QutInstruction::new(*op, self.vsp - popped_at))
            .collect();
        restores.sort_by_key(|ins| ins.imm);
        let sp_restored = restores.iter().any(|ins| ins.op == QutOp::SpOffset);
        self.out.extend(restores);
        if sp_restored {
            self.out.push(QutInstruction::new(QutOp::VspSetBySp, 0));
        }
        self.vsp = 0;
        self.saved.clear();
    }
}

fn core_register(register: u8) -> Option<QutOp>
{
    match register {
        4 => Some(QutOp::R4),
        7 => Some(QutOp::R7),
        10 => Some(QutOp::R10),
        11 => Some(QutOp::R11),
        13 => Some(QutOp::SpOffset),
        14 => Some(QutOp::Lr),
        15 => Some(QutOp::Pc),
        _ => None,
    }
}

/// Translate EHABI opcodes into QUT instructions.
fn translate(opcodes: &[u8]) -> Result<InstructionList, ExidxError>
{
    let mut bytes = opcodes.iter().copied();
    let mut next = || bytes.next().ok_or(ExidxError::Truncated);
    let mut state = Translator::default();

    loop {
        let byte = next()?;
        match byte {
            // 00xxxxxx: vsp += (x << 2) + 4
            0x00..=0x3f => state.vsp += (i32::from(byte & 0x3f) << 2) + 4,
            // 01xxxxxx: vsp -= (x << 2) + 4
            0x40..=0x7f => state.vsp -= (i32::from(byte & 0x3f) << 2) + 4,
            // 1000iiii iiiiiiii: pop r4-r15 under mask
            0x80..=0x8f => {
                let mask = (u16::from(byte & 0xf) << 8) | u16::from(next()?);
                if mask == 0 {
                    return Err(ExidxError::Refused);
                }
                for register in 4..=15u8 {
                    if mask & (1 << (register - 4)) != 0 {
                        state.pop(core_register(register));
                    }
                }
                if mask & (1 << (13 - 4)) != 0 {
                    state.flush();
                }
            }
            // 1001nnnn: vsp = r[n]
            0x90..=0x9f => {
                let register = byte & 0xf;
                if register == 13 || register == 15 {
                    return Err(ExidxError::Reserved(byte));
                }
                let op = match register {
                    7 => QutOp::VspSetByR7,
                    11 => QutOp::VspSetByR11,
                    _ => return Err(ExidxError::UnsupportedVspRegister(register)),
                };
                if state.saved.is_empty() {
                    // the sp-relative adjustments are superseded
                    state.vsp = 0;
                }
                state.flush();
                state.out.push(QutInstruction::new(op, 0));
            }
            // 10100nnn / 10101nnn: pop r4-r[4+n] (and lr)
            0xa0..=0xaf => {
                for register in 4..=4 + (byte & 0x7) {
                    state.pop(core_register(register));
                }
                if byte & 0x8 != 0 {
                    state.pop(Some(QutOp::Lr));
                }
            }
            OP_FINISH => {
                state.flush();
                return Ok(state.out);
            }
            // 10110001 0000iiii: pop r0-r3 under mask
            0xb1 => {
                let mask = next()?;
                if mask == 0 || mask & 0xf0 != 0 {
                    return Err(ExidxError::Spare(byte));
                }
                state.vsp += 4 * mask.count_ones() as i32;
            }
            // 10110010 uleb128: vsp += 0x204 + (uleb128 << 2)
            0xb2 => {
                let mut value: u32 = 0;
                let mut shift = 0;
                loop {
                    let byte = next()?;
                    value |= u32::from(byte & 0x7f).checked_shl(shift).unwrap_or(0);
                    shift += 7;
                    if byte & 0x80 == 0 {
                        break;
                    }
                }
                state.vsp = state.vsp.wrapping_add(0x204).wrapping_add((value << 2) as i32);
            }
            // 10110011 sssscccc: pop d[s]-d[s+c] saved by FSTMFDX
            0xb3 => state.vsp += i32::from(next()? & 0xf) * 8 + 12,
            0xb4..=0xb7 => return Err(ExidxError::Spare(byte)),
            // 10111nnn: pop d8-d[8+n] saved by FSTMFDX
            0xb8..=0xbf => state.vsp += i32::from(byte & 0x7) * 8 + 12,
            // 11000110 sssscccc: pop wR[s]-wR[s+c]
            0xc6 => state.vsp += i32::from(next()? & 0xf) * 8 + 8,
            // 11000111 0000iiii: pop wCGR under mask
            0xc7 => {
                let mask = next()?;
                if mask == 0 || mask & 0xf0 != 0 {
                    return Err(ExidxError::Spare(byte));
                }
                state.vsp += 4 * mask.count_ones() as i32;
            }
            // 11000nnn: pop wR10-wR[10+n]
            0xc0..=0xc5 => state.vsp += i32::from(byte & 0x7) * 8 + 8,
            // 1100100x sssscccc: pop d[16+s]-d[16+s+c] / d[s]-d[s+c] saved by VPUSH
            0xc8 | 0xc9 => state.vsp += i32::from(next()? & 0xf) * 8 + 8,
            // 11010nnn: pop d8-d[8+n] saved by VPUSH
            0xd0..=0xd7 => state.vsp += i32::from(byte & 0x7) * 8 + 8,
            _ => return Err(ExidxError::Spare(byte)),
        }
    }
}

#[cfg(test)]
mod tests
{
    use std::sync::Arc;

    use super::*;

    fn ins(op: QutOp, imm: i32) -> QutInstruction
    {
        QutInstruction::new(op, imm)
    }

    fn blob(address: u64, words: &[u32]) -> SectionBlob
    {
        let data: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
        SectionBlob {
            address,
            data: Arc::from(data),
        }
    }

    /// prel31 encoding of `target` stored at `place`.
    fn rel(target: u64, place: u64) -> u32
    {
        (target.wrapping_sub(place) as u32) & 0x7fff_ffff
    }

    #[test]
    fn test_prel31_sign_extends()
    {
        assert_eq!(prel31(0x10, 0x2000), 0x2010);
        assert_eq!(prel31(0x7fff_fff0, 0x2000), 0x1ff0);
    }

    #[test]
    fn test_push_r4_lr()
    {
        // pop {r4, lr}
        let list = translate(&[0xa8, OP_FINISH]).unwrap();
        assert_eq!(list.as_slice(), &[ins(QutOp::VspOffset, 8), ins(QutOp::Lr, 4), ins(QutOp::R4, 8)]);
    }

    #[test]
    fn test_frame_pointer_then_pops()
    {
        // vsp = r7; pop {r7, lr}
        let list = translate(&[0x97, 0x84, 0x08, OP_FINISH]).unwrap();
        assert_eq!(
            list.as_slice(),
            &[
                ins(QutOp::VspSetByR7, 0),
                ins(QutOp::VspOffset, 8),
                ins(QutOp::Lr, 4),
                ins(QutOp::R7, 8),
            ]
        );
    }

    #[test]
    fn test_vsp_set_discards_unsaved_adjustment()
    {
        // vsp += 16; vsp = r11
        let list = translate(&[0x03, 0x9b, OP_FINISH]).unwrap();
        assert_eq!(list.as_slice(), &[ins(QutOp::VspSetByR11, 0)]);
    }

    #[test]
    fn test_sp_pop_redefines_cfa()
    {
        // pop {sp}
        let list = translate(&[0x82, 0x00, OP_FINISH]).unwrap();
        assert_eq!(
            list.as_slice(),
            &[ins(QutOp::VspOffset, 4), ins(QutOp::SpOffset, 4), ins(QutOp::VspSetBySp, 0)]
        );
    }

    #[test]
    fn test_vfp_and_large_adjustments_move_cfa()
    {
        // vpush {d8}; vsp += 0x204 + (1 << 2); pop {r0, r1}
        let list = translate(&[0xd0, 0xb2, 0x01, 0xb1, 0x03, OP_FINISH]).unwrap();
        assert_eq!(list.as_slice(), &[ins(QutOp::VspOffset, 8 + 0x208 + 8)]);
    }

    #[test]
    fn test_rejected_opcodes()
    {
        assert_eq!(translate(&[0x80, 0x00]), Err(ExidxError::Refused));
        assert_eq!(translate(&[0x9d]), Err(ExidxError::Reserved(0x9d)));
        assert_eq!(translate(&[0x95]), Err(ExidxError::UnsupportedVspRegister(5)));
        assert_eq!(translate(&[0xb4]), Err(ExidxError::Spare(0xb4)));
        assert_eq!(translate(&[0xa8]), Err(ExidxError::Truncated));
    }

    #[test]
    fn test_decodes_inline_and_extab_entries()
    {
        let exidx_address = 0x2000;
        let extab_address = 0x3000;
        // generic model: personality pointer, then 1 extra word
        let extab = blob(extab_address, &[0x0000_1234, 0x0181_b0b0, 0xb0b0_b0b0]);
        let exidx = blob(
            exidx_address,
            &[
                rel(0x1000, exidx_address),
                0x80a8_b0b0,
                rel(0x1100, exidx_address + 8),
                rel(extab_address, exidx_address + 12),
                rel(0x1200, exidx_address + 16),
                CANT_UNWIND,
            ],
        );

        let entries = decode_entries(&exidx, Some(&extab), false);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].start, 0x1000);
        assert_eq!(
            entries[0].instructions.as_deref(),
            Ok(&[ins(QutOp::VspOffset, 8), ins(QutOp::Lr, 4), ins(QutOp::R4, 8)][..])
        );
        // pop {r8, r9, r11, r12}
        assert_eq!(entries[1].start, 0x1100);
        assert_eq!(
            entries[1].instructions.as_deref(),
            Ok(&[ins(QutOp::VspOffset, 16), ins(QutOp::R11, 8)][..])
        );
        assert_eq!(entries[2].start, 0x1200);
        assert_eq!(entries[2].instructions, Err(ExidxError::CantUnwind));
    }

    #[test]
    fn test_nonzero_inline_personality_is_rejected()
    {
        let exidx = blob(0x2000, &[rel(0x1000, 0x2000), 0x8100_b0b0]);
        let entries = decode_entries(&exidx, None, false);
        assert_eq!(entries[0].instructions, Err(ExidxError::InvalidPersonality(1)));
    }
}
