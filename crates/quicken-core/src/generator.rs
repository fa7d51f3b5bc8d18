//! # Table Generation
//!
//! Translates DWARF call frame information into QUT tables.
//!
//! Every row of every FDE becomes one table entry. The row's CFA rule and
//! register rules are translated into [`QutInstruction`]s, which are then
//! encoded and packed. Rows whose rules have no bytecode form (CFA
//! expressions, registers recovered from other registers, out-of-range
//! offsets) become gaps, so stepping through them reports missing unwind
//! information instead of producing a wrong caller.
//!
//! When a library carries several CFI sources, they are consulted in the
//! order `.debug_frame`, `.eh_frame`, then the same two sections of the
//! embedded `.gnu_debugdata` image, and finally `.ARM.exidx`. An FDE or
//! exidx entry is skipped if a higher-priority source already covers any
//! part of its range.

use std::collections::BTreeMap;
use std::time::Instant;

use gimli::{
    BaseAddresses, CfaRule, DebugFrame, EhFrame, EndianSlice, Register, RegisterRule, RunTimeEndian, UnwindContext,
    UnwindSection,
};
use smallvec::smallvec;
use tracing::{debug, info, trace, warn};

use crate::{
    elf::{ElfImage, SectionBlob},
    error::{QuickenError, QuickenResult},
    exidx::{self, ExidxError},
    qut::{
        encode,
        sections::SectionsBuilder,
        InstructionList, QutInstruction, QutOp, QutSections,
    },
    types::{Arch, RegisterContext},
};

/// Counters collected while generating one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationStats
{
    /// FDEs translated
    pub fdes: usize,
    /// FDEs skipped because a higher-priority source covers them
    pub shadowed_fdes: usize,
    /// FDEs that could not be parsed or evaluated
    pub broken_fdes: usize,
    /// CFI rows seen
    pub rows: usize,
    /// Rows whose rules have no instruction form
    pub unsupported_rows: usize,
    /// Rows whose instructions could not be encoded
    pub unencodable_rows: usize,
    /// `.ARM.exidx` entries translated
    pub exidx_entries: usize,
    /// `.ARM.exidx` entries whose opcodes could not be translated
    pub broken_exidx_entries: usize,
    /// Index entries in the packed table
    pub entries: usize,
    /// Table rows in the packed table
    pub table_rows: usize,
}

/// Which section a CFI blob came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfiKind
{
    DebugFrame,
    EhFrame,
    ArmExidx,
}

/// One source of call frame information.
#[derive(Debug, Clone, Copy)]
pub struct CfiSource<'a>
{
    pub kind: CfiKind,
    pub section: &'a SectionBlob,
    /// `.ARM.extab`, referenced from `.ARM.exidx` entries
    pub extab: Option<&'a SectionBlob>,
}

impl<'a> CfiSource<'a>
{
    pub fn new(kind: CfiKind, section: &'a SectionBlob) -> Self
    {
        Self {
            kind,
            section,
            extab: None,
        }
    }
}

/// Produces QUT tables for libraries.
///
/// The table manager is generic over this so callers can substitute their
/// own producer.
pub trait TableGenerator: Send + Sync
{
    /// Build the table for `image`.
    ///
    /// ## Errors
    ///
    /// Fails when the image's architecture has no table support.
    fn generate(&self, image: &ElfImage) -> QuickenResult<(QutSections, GenerationStats)>;
}

/// The default generator, driven by the image's DWARF CFI.
#[derive(Debug, Clone, Copy, Default)]
pub struct CfiTableGenerator;

impl TableGenerator for CfiTableGenerator
{
    fn generate(&self, image: &ElfImage) -> QuickenResult<(QutSections, GenerationStats)>
    {
        generate_for_image(image)
    }
}

/// CFI sources of `image` in priority order.
pub fn cfi_sources<'a>(image: &'a ElfImage) -> Vec<CfiSource<'a>>
{
    let mut sources = Vec::with_capacity(5);
    let mut add = |image: &'a ElfImage| {
        if let Some(section) = image.debug_frame() {
            sources.push(CfiSource::new(CfiKind::DebugFrame, section));
        }
        if let Some(section) = image.eh_frame() {
            sources.push(CfiSource::new(CfiKind::EhFrame, section));
        }
    };
    add(image);
    if let Some(embedded) = image.embedded() {
        add(embedded);
    }
    if let Some(section) = image.arm_exidx() {
        sources.push(CfiSource {
            kind: CfiKind::ArmExidx,
            section,
            extab: image.arm_extab(),
        });
    }
    sources
}

/// Generate the table for an ELF image.
///
/// ## Errors
///
/// `QuickenError::UnsupportedArch` unless the image is ARM or AArch64.
pub fn generate_for_image(image: &ElfImage) -> QuickenResult<(QutSections, GenerationStats)>
{
    let arch = image.arch();
    if !arch.has_quicken_tables() {
        return Err(QuickenError::UnsupportedArch(arch.to_string()));
    }
    let started = Instant::now();
    let sources = cfi_sources(image);
    let (sections, stats) = generate_from_cfi(arch, image.endian(), &sources);
    info!(
        path = %image.path().display(),
        %arch,
        sources = sources.len(),
        fdes = stats.fdes,
        entries = stats.entries,
        table_rows = stats.table_rows,
        unsupported_rows = stats.unsupported_rows,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "generated quicken table"
    );
    Ok((sections, stats))
}

/// A CFI row translated into instructions. `None` marks a gap.
#[derive(Debug)]
struct RowEntry
{
    end: u64,
    instructions: Option<InstructionList>,
}

/// A table for the single CFI entry covering one pc.
#[derive(Debug)]
pub struct FunctionTable
{
    /// First address the entry covers
    pub start: u64,
    /// First address past the entry
    pub end: u64,
    pub sections: QutSections,
}

impl FunctionTable
{
    pub fn contains(&self, pc: u64) -> bool
    {
        (self.start..self.end).contains(&pc)
    }
}

/// Build a table for only the FDE or exidx entry of `image` covering `pc`.
///
/// Sources are consulted in the same priority order as a full generation,
/// so the entry produces the same bytecode a file table would hold. `None`
/// if no source covers `pc` or the architecture has no table support.
pub fn generate_for_pc(image: &ElfImage, pc: u64) -> Option<FunctionTable>
{
    let arch = image.arch();
    if !arch.has_quicken_tables() {
        return None;
    }
    let sources = cfi_sources(image);
    let (sections, _, covered) = build(arch, image.endian(), &sources, Some(pc));
    let (start, end) = covered.containing(pc)?;
    trace!(
        path = %image.path().display(),
        start = format_args!("{start:#x}"),
        end = format_args!("{end:#x}"),
        "built in-memory table"
    );
    Some(FunctionTable { start, end, sections })
}

/// Generate a table from raw CFI sections, highest priority first.
///
/// Broken FDEs and untranslatable rows are counted and skipped; generation
/// itself does not fail.
pub fn generate_from_cfi(arch: Arch, endian: RunTimeEndian, sources: &[CfiSource<'_>])
    -> (QutSections, GenerationStats)
{
    let (sections, stats, _) = build(arch, endian, sources, None);
    (sections, stats)
}

/// Translate `sources`, restricted to entries covering `only` when set.
fn build(arch: Arch, endian: RunTimeEndian, sources: &[CfiSource<'_>], only: Option<u64>)
    -> (QutSections, GenerationStats, Coverage)
{
    let mut stats = GenerationStats::default();
    let mut covered = Coverage::default();
    let mut rows: BTreeMap<u64, RowEntry> = BTreeMap::new();

    for source in sources {
        let data = EndianSlice::new(&source.section.data, endian);
        let address_size = arch.word_size() as u8;
        match source.kind {
            CfiKind::DebugFrame => {
                let mut section = DebugFrame::from(data);
                section.set_address_size(address_size);
                let bases = BaseAddresses::default();
                collect_rows(&section, &bases, arch, only, &mut covered, &mut rows, &mut stats);
            }
            CfiKind::EhFrame => {
                let mut section = EhFrame::from(data);
                section.set_address_size(address_size);
                let bases = BaseAddresses::default().set_eh_frame(source.section.address);
                collect_rows(&section, &bases, arch, only, &mut covered, &mut rows, &mut stats);
            }
            CfiKind::ArmExidx => collect_exidx_rows(source, endian, only, &mut covered, &mut rows, &mut stats),
        }
    }

    let mut builder = SectionsBuilder::new(arch);
    let mut previous_end: Option<u64> = None;
    for (start, row) in &rows {
        if let Some(end) = previous_end.filter(|end| end < start) {
            builder.push_gap(end);
        }
        let encoded = row
            .instructions
            .as_ref()
            .and_then(|list| match encode(arch, list) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    trace!(start = format_args!("{start:#x}"), "unencodable row: {err}");
                    stats.unencodable_rows += 1;
                    None
                }
            });
        builder.push(*start, encoded.as_ref().map(|entry| entry.bytes.as_slice()));
        previous_end = Some(row.end);
    }
    if let Some(end) = previous_end {
        builder.push_gap(end);
    }

    let sections = builder.finish();
    stats.entries = sections.entry_count();
    stats.table_rows = sections.tbl().len();
    (sections, stats, covered)
}

fn outside(only: Option<u64>, start: u64, end: u64) -> bool
{
    only.is_some_and(|pc| !(start..end).contains(&pc))
}

/// Address ranges claimed by higher-priority sources, kept disjoint.
#[derive(Debug, Default)]
struct Coverage(BTreeMap<u64, u64>);

impl Coverage
{
    fn overlaps(&self, start: u64, end: u64) -> bool
    {
        self.0
            .range(..end)
            .next_back()
            .is_some_and(|(_, covered_end)| *covered_end > start)
    }

    /// The claimed range holding `pc`.
    fn containing(&self, pc: u64) -> Option<(u64, u64)>
    {
        self.0
            .range(..=pc)
            .next_back()
            .filter(|(_, end)| **end > pc)
            .map(|(start, end)| (*start, *end))
    }

    /// Add `start..end`, merging it with every range it touches.
    fn claim(&mut self, mut start: u64, mut end: u64)
    {
        while let Some((&claimed_start, &claimed_end)) =
            self.0.range(..=end).next_back().filter(|(_, claimed_end)| **claimed_end >= start)
        {
            self.0.remove(&claimed_start);
            start = start.min(claimed_start);
            end = end.max(claimed_end);
        }
        self.0.insert(start, end);
    }
}

fn collect_exidx_rows(
    source: &CfiSource<'_>,
    endian: RunTimeEndian,
    only: Option<u64>,
    covered: &mut Coverage,
    rows: &mut BTreeMap<u64, RowEntry>,
    stats: &mut GenerationStats,
)
{
    let entries = exidx::decode_entries(source.section, source.extab, endian == RunTimeEndian::Big);
    let mut claimed = Vec::new();

    for pair in entries.windows(2) {
        let (entry, end) = (&pair[0], pair[1].start);
        if entry.start >= end || outside(only, entry.start, end) {
            continue;
        }
        if covered.overlaps(entry.start, end) {
            stats.shadowed_fdes += 1;
            continue;
        }
        let instructions = match &entry.instructions {
            Ok(list) => Some(list.clone()),
            Err(ExidxError::CantUnwind) => Some(smallvec![QutInstruction::new(QutOp::Finish, 0)]),
            Err(err) => {
                trace!(start = format_args!("{:#x}", entry.start), "untranslatable exidx entry: {err}");
                stats.broken_exidx_entries += 1;
                None
            }
        };
        stats.exidx_entries += 1;
        rows.insert(entry.start, RowEntry { end, instructions });
        claimed.push((entry.start, end));
    }

    for (start, end) in claimed {
        covered.claim(start, end);
    }
}

fn collect_rows<'d, S>(
    section: &S,
    bases: &BaseAddresses,
    arch: Arch,
    only: Option<u64>,
    covered: &mut Coverage,
    rows: &mut BTreeMap<u64, RowEntry>,
    stats: &mut GenerationStats,
) where
    S: UnwindSection<EndianSlice<'d, RunTimeEndian>>,
{
    let mut ctx = UnwindContext::<usize>::new();
    let mut entries = section.entries(bases);
    let mut claimed = Vec::new();

    loop {
        let entry = match entries.next() {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!("stopping CFI walk: {err}");
                break;
            }
        };
        let gimli::CieOrFde::Fde(partial) = entry else {
            continue;
        };
        let fde = match partial.parse(|unwind_section, base_addresses, cie_offset| {
            unwind_section.cie_from_offset(base_addresses, cie_offset)
        }) {
            Ok(fde) => fde,
            Err(err) => {
                debug!("skipping unparsable FDE: {err}");
                stats.broken_fdes += 1;
                continue;
            }
        };

        let (start, end) = (fde.initial_address(), fde.end_address());
        if start >= end || outside(only, start, end) {
            continue;
        }
        if covered.overlaps(start, end) {
            stats.shadowed_fdes += 1;
            continue;
        }

        let return_address = fde.cie().return_address_register();
        let mut table = match fde.rows(section, bases, &mut ctx) {
            Ok(table) => table,
            Err(err) => {
                debug!(start = format_args!("{start:#x}"), "skipping FDE: {err}");
                stats.broken_fdes += 1;
                continue;
            }
        };

        let mut fde_rows = Vec::new();
        let complete = loop {
            match table.next_row() {
                Ok(Some(row)) => {
                    let instructions = translate_row(arch, section, row, return_address);
                    if instructions.is_none() {
                        stats.unsupported_rows += 1;
                    }
                    fde_rows.push((
                        row.start_address(),
                        RowEntry {
                            end: row.end_address(),
                            instructions,
                        },
                    ));
                }
                Ok(None) => break true,
                Err(err) => {
                    debug!(start = format_args!("{start:#x}"), "abandoning FDE: {err}");
                    break false;
                }
            }
        };
        if !complete {
            stats.broken_fdes += 1;
            continue;
        }

        stats.fdes += 1;
        stats.rows += fde_rows.len();
        rows.extend(fde_rows);
        claimed.push((start, end));
    }

    for (start, end) in claimed {
        covered.claim(start, end);
    }
}

/// Register operation for restoring `register` from the stack.
fn restore_op(arch: Arch, register: u16) -> Option<QutOp>
{
    let op = match (arch, register) {
        (Arch::Arm64, 20) => QutOp::X20,
        (Arch::Arm64, 28) => QutOp::X28,
        (Arch::Arm64, 29) => QutOp::X29,
        (Arch::Arm64, 30) | (Arch::Arm, 14) => QutOp::Lr,
        (Arch::Arm64, 31) | (Arch::Arm, 13) => QutOp::SpOffset,
        (Arch::Arm64, 32) | (Arch::Arm, 15) => QutOp::Pc,
        (Arch::Arm, 4) => QutOp::R4,
        (Arch::Arm, 7) => QutOp::R7,
        (Arch::Arm, 10) => QutOp::R10,
        (Arch::Arm, 11) => QutOp::R11,
        _ => return None,
    };
    Some(op)
}

/// Registers whose rules influence the table. Rules of all others are
/// ignored.
fn is_tracked(arch: Arch, register: u16) -> bool
{
    match arch {
        Arch::Arm64 => matches!(register, 0 | 20 | 28) || register >= 29,
        Arch::Arm => matches!(register, 0 | 4 | 7 | 10 | 11) || register >= 13,
        Arch::X86 | Arch::X86_64 => false,
    }
}

/// Whether `expr` is the marker the managed runtime emits for the register
/// holding the dex pc: `DW_OP_const4u "DEX1"; DW_OP_drop; DW_OP_breg<dex> 0`.
fn is_dex_pc_marker(arch: Arch, expr: &[u8]) -> bool
{
    let dex_register: u8 = match arch {
        Arch::Arm64 => 20,
        Arch::Arm => 4,
        Arch::X86 | Arch::X86_64 => return false,
    };
    matches!(
        expr,
        [0x0c, b'D', b'E', b'X', b'1', 0x13, breg, ..] if *breg == 0x70 + dex_register
    )
}

/// Ordering of instructions inside an entry: cfa first, then dex pc capture
/// (before the dex register is overwritten), then restores, with the frame
/// pointer restore last.
fn rank(op: QutOp) -> u8
{
    match op {
        QutOp::VspOffset
        | QutOp::VspSetImm
        | QutOp::VspSetByR7
        | QutOp::VspSetByR11
        | QutOp::VspSetByX29
        | QutOp::VspSetBySp
        | QutOp::VspSetByJniSp => 0,
        QutOp::DexPcSet => 1,
        QutOp::X29 | QutOp::R7 | QutOp::R11 => 3,
        QutOp::Finish | QutOp::EndOfIns => 4,
        _ => 2,
    }
}

fn translate_row<'d, S>(
    arch: Arch,
    section: &S,
    row: &gimli::UnwindTableRow<usize>,
    return_address: Register,
) -> Option<InstructionList>
where
    S: UnwindSection<EndianSlice<'d, RunTimeEndian>>,
{
    let mut list = InstructionList::new();

    let cfa = match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => {
            let offset = i32::try_from(*offset).ok()?;
            let op = match (arch, register.0) {
                (_, reg) if reg == RegisterContext::stack_pointer_register(arch) => QutOp::VspOffset,
                (Arch::Arm64, 28) | (Arch::Arm, 10) => QutOp::VspSetByJniSp,
                (Arch::Arm64, 29) => QutOp::VspSetByX29,
                (Arch::Arm, 7) => QutOp::VspSetByR7,
                (Arch::Arm, 11) => QutOp::VspSetByR11,
                _ => return None,
            };
            QutInstruction::new(op, offset)
        }
        CfaRule::Expression(_) => return None,
    };
    list.push(cfa);

    for (register, rule) in row.registers() {
        let number = register.0;
        if !is_tracked(arch, number) {
            continue;
        }
        match rule {
            RegisterRule::SameValue => {}
            RegisterRule::Offset(offset) => {
                if let Some(op) = restore_op(arch, number) {
                    let imm = i32::try_from(offset.checked_neg()?).ok()?;
                    list.push(QutInstruction::new(op, imm));
                }
            }
            RegisterRule::Undefined if *register == return_address => {
                list.push(QutInstruction::new(QutOp::Finish, 0));
            }
            RegisterRule::ValExpression(expr) => {
                let expression = expr.get(section).ok()?;
                if !is_dex_pc_marker(arch, expression.0.slice()) {
                    return None;
                }
                list.push(QutInstruction::new(QutOp::DexPcSet, 0));
            }
            _ => return None,
        }
    }

    list.sort_by_key(|ins| rank(ins.op));
    Some(list)
}
