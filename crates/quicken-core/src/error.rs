//! # Error Types
//!
//! Error handling for table generation, the table cache and stack unwinding.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and readable messages. There are three families:
//!
//! - [`UnwindError`]: the status code of a single unwind. It is `Copy` so the
//!   stepping loop can carry it around without allocating.
//! - [`QutFileError`]: why a cached table file was rejected or could not be
//!   written.
//! - [`QuickenError`]: everything else (ELF parsing, DWARF decoding, I/O).

use std::path::PathBuf;

use thiserror::Error;

use crate::types::Arch;

/// Why an unwind stopped early.
///
/// A successful unwind has no error. Frames collected before the error are
/// kept; the code only explains why the walk ended where it did.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnwindError
{
    /// No maps snapshot is available to resolve program counters.
    #[error("memory maps are unavailable")]
    MapsIsNull,

    /// The program counter does not fall inside any mapped segment.
    #[error("pc is not inside a mapped segment")]
    InvalidMap,

    /// The segment has no usable ELF image behind it.
    #[error("segment has no usable ELF image")]
    InvalidElf,

    /// The caller's frame buffer was filled before the walk finished.
    #[error("maximum frame count exceeded")]
    MaxFramesExceeded,

    /// A step left both pc and sp unchanged.
    #[error("repeated frame: pc and sp unchanged after a step")]
    RepeatedFrame,

    /// The table has no entry covering the program counter.
    #[error("no unwind info for pc")]
    UnwindInfo,

    /// No table is resident for the library yet.
    #[error("quicken table for library is not available")]
    RequestQutFileFailed,

    /// No in-memory table is available for JIT code.
    #[error("in-memory quicken table for JIT code is not available")]
    RequestQutInMemFailed,

    /// A stack read fell outside the thread's stack or could not be performed.
    #[error("stack read failed")]
    ReadStackFailed,

    /// The bytecode contains an opcode the decoder does not understand.
    #[error("invalid quicken instruction")]
    InvalidQutInstr,

    /// The bytecode or its row reference runs past the end of the table.
    #[error("quicken table index overflow")]
    TableIndexOverflow,

    /// The register context belongs to an architecture this strategy cannot step.
    #[error("architecture is not supported by this unwind strategy")]
    UnsupportedArch,
}

/// Why a cached table file was rejected or could not be saved.
///
/// Rejections caused by file content (everything except `OpenFailed`, `Io`
/// and `InsertFailed`) quarantine the file.
#[derive(Error, Debug)]
pub enum QutFileError
{
    /// The cache file could not be opened.
    #[error("failed to open {path}: {source}")]
    OpenFailed
    {
        /// File that could not be opened
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The file is shorter than the fixed header.
    #[error("table file is too short: {len} bytes")]
    FileTooShort
    {
        /// Observed file length
        len: usize,
    },

    /// The header's format version differs from this build's.
    #[error("table format version {found} does not match {expected}")]
    VersionMismatch
    {
        /// Version this build reads and writes
        expected: u64,
        /// Version recorded in the file
        found: u64,
    },

    /// The header's architecture tag differs from the expected architecture.
    #[error("table architecture tag {found} does not match {expected}")]
    ArchMismatch
    {
        /// Expected architecture
        expected: Arch,
        /// Raw tag recorded in the file
        found: u64,
    },

    /// Declared section sizes and offsets do not add up to the file length.
    #[error("declared table layout ends at {declared} but file has {actual} bytes")]
    FileLengthMismatch
    {
        /// Length implied by the header
        declared: u64,
        /// Actual file length
        actual: u64,
    },

    /// The content checksum does not match the index and table bytes.
    #[error("table checksum mismatch")]
    ChecksumMismatch,

    /// The table could not be published into the resident cache.
    #[error("failed to insert table for build id {0:?}")]
    InsertFailed(String),

    /// I/O error while reading or writing cache files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QutFileError
{
    /// Whether the rejection was caused by the file's content, in which case
    /// the file should be quarantined rather than read again.
    pub fn is_corrupt(&self) -> bool
    {
        matches!(
            self,
            QutFileError::FileTooShort { .. }
                | QutFileError::VersionMismatch { .. }
                | QutFileError::ArchMismatch { .. }
                | QutFileError::FileLengthMismatch { .. }
                | QutFileError::ChecksumMismatch
        )
    }
}

/// Main error type for library operations outside the unwind hot path.
#[derive(Error, Debug)]
pub enum QuickenError
{
    /// The ELF image could not be parsed.
    #[error("Invalid ELF image {path}: {details}")]
    InvalidElf
    {
        /// Path of the image
        path: PathBuf,
        /// Parser message
        details: String,
    },

    /// The image or request targets an architecture without table support.
    #[error("Unsupported architecture: {0}")]
    UnsupportedArch(String),

    /// The image's architecture differs from the one tables are built for.
    #[error("Architecture mismatch: expected {expected}, found {found}")]
    ArchMismatch
    {
        /// Architecture requested
        expected: Arch,
        /// Architecture of the image
        found: Arch,
    },

    /// DWARF call frame information could not be decoded.
    #[error("DWARF error: {0}")]
    Dwarf(String),

    /// The embedded `.gnu_debugdata` image could not be decompressed.
    #[error("Failed to decompress embedded debug data: {0}")]
    Decompress(String),

    /// The memory map text could not be parsed.
    #[error("Malformed maps line {line}: {text:?}")]
    MalformedMaps
    {
        /// One-based line number
        line: usize,
        /// Offending line
        text: String,
    },

    /// The table cache has not been given a directory.
    #[error("Table cache directory {0} is not usable")]
    CacheDirUnavailable(PathBuf),

    /// A table file operation failed.
    #[error(transparent)]
    QutFile(#[from] QutFileError),

    /// I/O error (for file operations, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for `Result<T, QuickenError>`
///
/// ```rust
/// use quicken_core::error::QuickenResult;
/// fn foo() -> QuickenResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type QuickenResult<T> = std::result::Result<T, QuickenError>;

/// Attach context to a gimli error.
pub(crate) fn map_gimli_error(context: &str, err: gimli::Error) -> QuickenError
{
    QuickenError::Dwarf(format!("{context}: {err}"))
}
