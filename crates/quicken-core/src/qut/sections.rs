//! Packed QUT sections and their on-disk form.
//!
//! A table is two word arrays:
//!
//! - `idx`: pairs of `[fn_start, command]` sorted by `fn_start`.
//! - `tbl`: rows of bytecode shared by non-compact commands.
//!
//! A command with its top bit set carries up to `ROW` bytecode bytes inline,
//! most significant byte first. Otherwise it is
//! `row_count << (ROW * 8) | row_offset` and the bytecode lives in
//! `tbl[row_offset..row_offset + row_count]`, each row read from its most
//! significant byte down. Unused bytes are padded with `END_OF_INSTRUCTIONS`.
//! A command of zero marks a gap: no unwind information for the range.
//!
//! On disk a table is a header of seven words
//! `[version, arch, idx_size, tbl_size, idx_offset, tbl_offset, checksum]`
//! followed by `idx` and `tbl`, all little-endian words of the table's
//! architecture.

use std::collections::HashMap;

use smallvec::SmallVec;

use super::instructions::opcode;
use crate::{
    error::{QutFileError, UnwindError},
    types::Arch,
};

/// Format version written into table headers.
pub const QUT_VERSION: u64 = 2;

const HEADER_WORDS: usize = 7;
const MAX_ROW_COUNT: usize = 0x7f;
const MAX_ROW_OFFSET: usize = 0x00ff_ffff;

/// Where the bytecode of one entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryBytes<'a>
{
    /// No unwind information.
    Gap,
    /// Bytecode packed into the command word itself.
    Inline(u64),
    /// Bytecode stored in table rows.
    Rows(&'a [u64]),
}

/// Index and table words of one library (or one JIT region).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QutSections
{
    arch: Arch,
    idx: Vec<u64>,
    tbl: Vec<u64>,
}

/// Bytes of bytecode a command word can hold inline.
pub(crate) const fn row_bytes(arch: Arch) -> usize
{
    arch.word_size() - 1
}

impl QutSections
{
    /// Sections from raw words.
    ///
    /// `idx` must hold `[fn_start, command]` pairs in ascending `fn_start`
    /// order. Nothing else is validated; stepping rejects bad commands.
    pub fn from_raw(arch: Arch, idx: Vec<u64>, tbl: Vec<u64>) -> Self
    {
        Self { arch, idx, tbl }
    }

    pub fn arch(&self) -> Arch
    {
        self.arch
    }

    pub fn idx(&self) -> &[u64]
    {
        &self.idx
    }

    pub fn tbl(&self) -> &[u64]
    {
        &self.tbl
    }

    /// Number of `[fn_start, command]` pairs.
    pub fn entry_count(&self) -> usize
    {
        self.idx.len() / 2
    }

    /// Whether the table has no entries at all.
    pub fn is_empty(&self) -> bool
    {
        self.entry_count() == 0
    }

    /// Command of the last entry whose `fn_start <= rel_pc`.
    pub fn find_command(&self, rel_pc: u64) -> Option<u64>
    {
        let count = self.entry_count();
        let pos = partition_point(count, |i| self.idx[i * 2] <= rel_pc);
        if pos == 0 {
            return None;
        }
        Some(self.idx[(pos - 1) * 2 + 1])
    }

    /// Resolve a command to its bytecode.
    ///
    /// ## Errors
    ///
    /// `TableIndexOverflow` if the command references rows past the table.
    pub fn entry_bytes(&self, command: u64) -> Result<EntryBytes<'_>, UnwindError>
    {
        let bits = self.arch.word_size() * 8;
        let command = self.arch.mask(command);
        if command >> (bits - 1) != 0 {
            return Ok(EntryBytes::Inline(command));
        }
        let row_count = ((command >> (row_bytes(self.arch) * 8)) & 0x7f) as usize;
        if row_count == 0 {
            return Ok(EntryBytes::Gap);
        }
        let row_offset = (command & 0x00ff_ffff) as usize;
        self.tbl
            .get(row_offset..row_offset + row_count)
            .map(EntryBytes::Rows)
            .ok_or(UnwindError::TableIndexOverflow)
    }

    /// Checksum stored in the file header: the first word of the blake3 hash
    /// of the serialized index and table.
    pub fn checksum(&self) -> u64
    {
        let word = self.arch.word_size();
        let mut hasher = blake3::Hasher::new();
        for value in self.idx.iter().chain(&self.tbl) {
            hasher.update(&value.to_le_bytes()[..word]);
        }
        let hash = hasher.finalize();
        let mut first = [0u8; 8];
        first[..word].copy_from_slice(&hash.as_bytes()[..word]);
        u64::from_le_bytes(first)
    }

    /// Serialize into the versioned file format.
    pub fn to_bytes(&self) -> Vec<u8>
    {
        let word = self.arch.word_size();
        let idx_offset = (HEADER_WORDS * word) as u64;
        let tbl_offset = idx_offset + (self.idx.len() * word) as u64;
        let header = [
            QUT_VERSION,
            self.arch.tag(),
            self.idx.len() as u64,
            self.tbl.len() as u64,
            idx_offset,
            tbl_offset,
            self.checksum(),
        ];

        let mut out = Vec::with_capacity((HEADER_WORDS + self.idx.len() + self.tbl.len()) * word);
        for value in header.iter().chain(&self.idx).chain(&self.tbl) {
            out.extend_from_slice(&value.to_le_bytes()[..word]);
        }
        out
    }

    /// Parse and validate a table file.
    ///
    /// ## Errors
    ///
    /// Every rejection is a content error (see [`QutFileError::is_corrupt`]).
    pub fn from_bytes(bytes: &[u8], expected: Arch) -> Result<Self, QutFileError>
    {
        let word = expected.word_size();
        let header_len = HEADER_WORDS * word;
        if bytes.len() < header_len {
            return Err(QutFileError::FileTooShort { len: bytes.len() });
        }
        let read = |i: usize| read_word(&bytes[i * word..(i + 1) * word]);

        let version = read(0);
        if version != QUT_VERSION {
            return Err(QutFileError::VersionMismatch {
                expected: QUT_VERSION,
                found: version,
            });
        }
        let tag = read(1);
        if tag != expected.tag() {
            return Err(QutFileError::ArchMismatch { expected, found: tag });
        }

        let (idx_size, tbl_size, idx_offset, tbl_offset, checksum) = (read(2), read(3), read(4), read(5), read(6));
        let word64 = word as u64;
        let declared = idx_size
            .checked_mul(word64)
            .and_then(|idx_len| idx_offset.checked_add(idx_len))
            .filter(|end| *end == tbl_offset && idx_offset == header_len as u64 && idx_size % 2 == 0)
            .and_then(|_| tbl_size.checked_mul(word64))
            .and_then(|tbl_len| tbl_offset.checked_add(tbl_len))
            .unwrap_or(u64::MAX);
        let actual = bytes.len() as u64;
        if declared != actual {
            return Err(QutFileError::FileLengthMismatch { declared, actual });
        }

        let words = |start: u64, count: u64| -> Vec<u64> {
            let start = start as usize;
            bytes[start..start + count as usize * word]
                .chunks_exact(word)
                .map(read_word)
                .collect()
        };
        let sections = Self {
            arch: expected,
            idx: words(idx_offset, idx_size),
            tbl: words(tbl_offset, tbl_size),
        };
        if sections.checksum() != checksum {
            return Err(QutFileError::ChecksumMismatch);
        }
        Ok(sections)
    }
}

fn read_word(bytes: &[u8]) -> u64
{
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn partition_point(len: usize, pred: impl Fn(usize) -> bool) -> usize
{
    let (mut lo, mut hi) = (0, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Packs encoded entries into [`QutSections`].
///
/// Entries must be pushed in ascending `fn_start` order. Consecutive entries
/// with the same command collapse into one, and identical bytecode shares
/// table rows.
#[derive(Debug)]
pub struct SectionsBuilder
{
    arch: Arch,
    idx: Vec<u64>,
    tbl: Vec<u64>,
    shared: HashMap<SmallVec<[u8; 16]>, u64>,
}

impl SectionsBuilder
{
    pub fn new(arch: Arch) -> Self
    {
        Self {
            arch,
            idx: Vec::new(),
            tbl: Vec::new(),
            shared: HashMap::new(),
        }
    }

    /// Add an entry covering `fn_start` up to the next entry. `None` (or
    /// bytecode too long to address) records a gap.
    pub fn push(&mut self, fn_start: u64, bytes: Option<&[u8]>)
    {
        let command = bytes.and_then(|b| self.command_for(b)).unwrap_or(0);

        if let [.., last_start, last_command] = self.idx[..] {
            if last_start == fn_start {
                self.idx.truncate(self.idx.len() - 2);
                return self.push_command(fn_start, command);
            }
            if last_command == command {
                return;
            }
        } else if command == 0 {
            // leading gaps carry no information
            return;
        }
        self.push_command(fn_start, command);
    }

    /// Record that `fn_start` onwards has no unwind information.
    pub fn push_gap(&mut self, fn_start: u64)
    {
        self.push(fn_start, None);
    }

    pub fn finish(self) -> QutSections
    {
        QutSections {
            arch: self.arch,
            idx: self.idx,
            tbl: self.tbl,
        }
    }

    fn push_command(&mut self, fn_start: u64, command: u64)
    {
        if let [.., last_command] = self.idx[..] {
            if last_command == command {
                return;
            }
        } else if command == 0 {
            return;
        }
        self.idx.push(fn_start);
        self.idx.push(command);
    }

    fn command_for(&mut self, bytes: &[u8]) -> Option<u64>
    {
        let row = row_bytes(self.arch);
        let word = self.arch.word_size();

        if bytes.len() <= row {
            let mut command = 1u64 << (word * 8 - 1);
            for pos in 0..row {
                let byte = bytes.get(pos).copied().unwrap_or(opcode::END_OF_INSTRUCTIONS);
                command |= u64::from(byte) << ((row - 1 - pos) * 8);
            }
            return Some(command);
        }

        if let Some(command) = self.shared.get(bytes) {
            return Some(*command);
        }
        let size_ceil = (bytes.len() + row) & !row;
        let row_count = size_ceil / word;
        let row_offset = self.tbl.len();
        if row_count > MAX_ROW_COUNT || row_offset + row_count > MAX_ROW_OFFSET {
            return None;
        }
        for chunk in 0..row_count {
            let mut value = 0u64;
            for pos in 0..word {
                let byte = bytes
                    .get(chunk * word + pos)
                    .copied()
                    .unwrap_or(opcode::END_OF_INSTRUCTIONS);
                value |= u64::from(byte) << ((word - 1 - pos) * 8);
            }
            self.tbl.push(value);
        }
        let command = ((row_count as u64) << (row * 8)) | row_offset as u64;
        self.shared.insert(SmallVec::from_slice(bytes), command);
        Some(command)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_compact_command_layout()
    {
        let mut builder = SectionsBuilder::new(Arch::Arm64);
        builder.push(0x100, Some(&[0x81]));
        let sections = builder.finish();
        assert_eq!(sections.idx(), &[0x100, 0x8081_9999_9999_9999]);
        assert_eq!(sections.find_command(0x100), Some(0x8081_9999_9999_9999));
        assert_eq!(sections.find_command(0xff), None);
    }

    #[test]
    fn test_arm_rows_are_shared()
    {
        let long = [0x0c, 0xdc, 0xea, 0xa2, 0x97];
        let mut builder = SectionsBuilder::new(Arch::Arm);
        builder.push(0x10, Some(&long));
        builder.push(0x20, Some(&[0x84]));
        builder.push(0x30, Some(&long));
        let sections = builder.finish();

        // five bytes round up to two 4-byte rows
        assert_eq!(sections.tbl(), &[0x0cdc_eaa2, 0x9799_9999]);
        assert_eq!(sections.idx()[1], 2 << 24);
        assert_eq!(sections.idx()[5], 2 << 24);
        assert_eq!(
            sections.entry_bytes(sections.idx()[1]),
            Ok(EntryBytes::Rows(&[0x0cdc_eaa2, 0x9799_9999][..]))
        );
    }

    #[test]
    fn test_merging_and_gaps()
    {
        let mut builder = SectionsBuilder::new(Arch::Arm64);
        builder.push_gap(0x0);
        builder.push(0x10, Some(&[0x84]));
        builder.push(0x18, Some(&[0x84]));
        builder.push_gap(0x20);
        builder.push(0x20, Some(&[0x80]));
        builder.push_gap(0x40);
        let sections = builder.finish();

        assert_eq!(sections.entry_count(), 3);
        let gap = sections.find_command(0x44).unwrap();
        assert_eq!(sections.entry_bytes(gap), Ok(EntryBytes::Gap));
        let at_0x18 = sections.find_command(0x18).unwrap();
        assert_eq!(at_0x18 >> 63, 1);
    }

    #[test]
    fn test_row_reference_past_table_overflows()
    {
        let sections = QutSections::from_raw(Arch::Arm64, vec![0, (3 << 56) | 1], vec![0; 2]);
        assert_eq!(sections.entry_bytes(sections.idx()[1]), Err(UnwindError::TableIndexOverflow));
    }

    #[test]
    fn test_file_round_trip_and_rejections()
    {
        let mut builder = SectionsBuilder::new(Arch::Arm64);
        builder.push(0x1000, Some(&[0x0c, 0xdc, 0xea, 0xa2, 0x97, 0xff, 0x80, 0x20]));
        builder.push(0x2000, Some(&[0x81]));
        let sections = builder.finish();
        let bytes = sections.to_bytes();
        assert_eq!(QutSections::from_bytes(&bytes, Arch::Arm64).unwrap(), sections);

        assert!(matches!(
            QutSections::from_bytes(&bytes[..20], Arch::Arm64),
            Err(QutFileError::FileTooShort { len: 20 })
        ));
        assert!(matches!(
            QutSections::from_bytes(&bytes, Arch::X86_64),
            Err(QutFileError::ArchMismatch { found: 2, .. })
        ));
        assert!(matches!(
            QutSections::from_bytes(&bytes[..bytes.len() - 8], Arch::Arm64),
            Err(QutFileError::FileLengthMismatch { .. })
        ));

        let mut flipped = bytes.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        assert!(matches!(
            QutSections::from_bytes(&flipped, Arch::Arm64),
            Err(QutFileError::ChecksumMismatch)
        ));

        let mut old = bytes;
        old[0] = 1;
        assert!(matches!(
            QutSections::from_bytes(&old, Arch::Arm64),
            Err(QutFileError::VersionMismatch { found: 1, .. })
        ));
    }
}
