//! # ELF Images
//!
//! The parts of a shared library the unwinder needs: architecture, build id,
//! load bias, the call frame sections (DWARF CFI and the ARM exception
//! index) and, lazily, symbols and line tables.
//!
//! Space-constrained builds strip `.symtab` and `.debug_frame` but embed an
//! xz-compressed ELF in `.gnu_debugdata` that carries them. When present it
//! is decompressed and parsed as a nested [`ElfImage`].

use std::borrow::Cow;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use addr2line::Context;
use gimli::{Dwarf, EndianArcSlice, RunTimeEndian, SectionId};
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol, SegmentFlags, SymbolKind};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{QuickenError, QuickenResult};
use crate::types::Arch;

type OwnedReader = EndianArcSlice<RunTimeEndian>;

/// Bytes and link-time address of one section.
#[derive(Debug, Clone)]
pub struct SectionBlob
{
    /// Link-time virtual address of the section
    pub address: u64,
    /// Section contents, decompressed
    pub data: Arc<[u8]>,
}

/// A function symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry
{
    /// Link-time start address
    pub address: u64,
    /// Size in bytes, zero if unknown
    pub size: u64,
    /// Raw (mangled) name
    pub name: String,
}

/// A source position resolved from line tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation
{
    /// Source file
    pub file: String,
    /// One-based line, if known
    pub line: Option<u32>,
}

/// A parsed ELF image.
pub struct ElfImage
{
    path: PathBuf,
    elf_start_offset: u64,
    data: Arc<[u8]>,
    arch: Arch,
    endian: RunTimeEndian,
    build_id: Option<String>,
    load_bias: u64,
    eh_frame: Option<SectionBlob>,
    eh_frame_hdr: Option<SectionBlob>,
    debug_frame: Option<SectionBlob>,
    arm_exidx: Option<SectionBlob>,
    arm_extab: Option<SectionBlob>,
    embedded: Option<Box<ElfImage>>,
    symbols: OnceCell<Vec<SymbolEntry>>,
    line_context: Mutex<Option<Context<OwnedReader>>>,
    line_context_tried: OnceCell<()>,
}

impl std::fmt::Debug for ElfImage
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("ElfImage")
            .field("path", &self.path)
            .field("elf_start_offset", &self.elf_start_offset)
            .field("arch", &self.arch)
            .field("build_id", &self.build_id)
            .field("load_bias", &self.load_bias)
            .field("embedded", &self.embedded.is_some())
            .finish_non_exhaustive()
    }
}

/// Whether an ELF header starts at `offset` in `path`.
pub fn has_elf_header_at(path: &Path, offset: u64) -> bool
{
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut file| {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut magic)
        })
        .is_ok()
        && &magic == b"\x7fELF"
}

fn load_section_blob(file: &object::File<'_>, name: &str) -> QuickenResult<Option<SectionBlob>>
{
    let Some(section) = file.section_by_name(name) else {
        return Ok(None);
    };
    let data = section
        .uncompressed_data()
        .map_err(|err| QuickenError::Dwarf(format!("failed to read {name}: {err}")))?;
    let data = match data {
        Cow::Borrowed(bytes) => Arc::<[u8]>::from(bytes),
        Cow::Owned(vec) => vec.into(),
    };
    Ok(Some(SectionBlob {
        address: section.address(),
        data,
    }))
}

impl ElfImage
{
    /// Open the image whose header is at `elf_start_offset` in `path`.
    ///
    /// ## Errors
    ///
    /// Returns an I/O error if the file cannot be read, or
    /// `QuickenError::InvalidElf` / `UnsupportedArch` if it is not a usable ELF.
    pub fn open(path: &Path, elf_start_offset: u64) -> QuickenResult<Self>
    {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(elf_start_offset))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Self::parse(path.to_path_buf(), elf_start_offset, bytes.into())
    }

    /// Parse an image already held in memory.
    ///
    /// ## Errors
    ///
    /// Returns `QuickenError::InvalidElf` if the bytes are not an ELF image,
    /// or `QuickenError::UnsupportedArch` for architectures we cannot unwind.
    pub fn parse(path: PathBuf, elf_start_offset: u64, data: Arc<[u8]>) -> QuickenResult<Self>
    {
        let invalid = |details: String| QuickenError::InvalidElf {
            path: path.clone(),
            details,
        };
        let file = object::File::parse(&*data).map_err(|err| invalid(err.to_string()))?;
        if file.format() != object::BinaryFormat::Elf {
            return Err(invalid(format!("{:?} is not ELF", file.format())));
        }

        let arch = Arch::from_object(file.architecture())
            .ok_or_else(|| QuickenError::UnsupportedArch(format!("{:?}", file.architecture())))?;
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let build_id = file
            .build_id()
            .map_err(|err| invalid(err.to_string()))?
            .filter(|id| !id.is_empty())
            .map(hex::encode);

        let load_bias = compute_load_bias(&file);
        let eh_frame = load_section_blob(&file, ".eh_frame")?;
        let eh_frame_hdr = load_section_blob(&file, ".eh_frame_hdr")?;
        let debug_frame = load_section_blob(&file, ".debug_frame")?;
        let arm_exidx = load_section_blob(&file, ".ARM.exidx")?;
        let arm_extab = load_section_blob(&file, ".ARM.extab")?;
        let embedded = load_section_blob(&file, ".gnu_debugdata")?
            .and_then(|blob| match decompress_embedded(&path, &blob.data) {
                Ok(image) => Some(Box::new(image)),
                Err(err) => {
                    warn!(path = %path.display(), "ignoring .gnu_debugdata: {err}");
                    None
                }
            });

        debug!(
            path = %path.display(),
            %arch,
            load_bias,
            eh_frame = eh_frame.is_some(),
            debug_frame = debug_frame.is_some(),
            arm_exidx = arm_exidx.is_some(),
            embedded = embedded.is_some(),
            "parsed ELF image"
        );

        drop(file);
        Ok(Self {
            path,
            elf_start_offset,
            data,
            arch,
            endian,
            build_id,
            load_bias,
            eh_frame,
            eh_frame_hdr,
            debug_frame,
            arm_exidx,
            arm_extab,
            embedded,
            symbols: OnceCell::new(),
            line_context: Mutex::new(None),
            line_context_tried: OnceCell::new(),
        })
    }

    /// File the image was read from.
    pub fn path(&self) -> &Path
    {
        &self.path
    }

    /// File offset of the ELF header.
    pub fn elf_start_offset(&self) -> u64
    {
        self.elf_start_offset
    }

    /// Architecture from the ELF header.
    pub fn arch(&self) -> Arch
    {
        self.arch
    }

    /// Byte order of the image.
    pub fn endian(&self) -> RunTimeEndian
    {
        self.endian
    }

    /// Hex-encoded GNU build id, if present.
    pub fn build_id(&self) -> Option<&str>
    {
        self.build_id.as_deref()
    }

    /// `p_vaddr - p_offset` of the first executable load segment.
    pub fn load_bias(&self) -> u64
    {
        self.load_bias
    }

    /// `.eh_frame`, if present.
    pub fn eh_frame(&self) -> Option<&SectionBlob>
    {
        self.eh_frame.as_ref()
    }

    /// `.eh_frame_hdr`, if present.
    pub fn eh_frame_hdr(&self) -> Option<&SectionBlob>
    {
        self.eh_frame_hdr.as_ref()
    }

    /// `.debug_frame`, if present.
    pub fn debug_frame(&self) -> Option<&SectionBlob>
    {
        self.debug_frame.as_ref()
    }

    /// `.ARM.exidx`, if present.
    pub fn arm_exidx(&self) -> Option<&SectionBlob>
    {
        self.arm_exidx.as_ref()
    }

    /// `.ARM.extab`, if present.
    pub fn arm_extab(&self) -> Option<&SectionBlob>
    {
        self.arm_extab.as_ref()
    }

    /// The image decompressed from `.gnu_debugdata`, if present.
    pub fn embedded(&self) -> Option<&ElfImage>
    {
        self.embedded.as_deref()
    }

    /// Function symbols from `.symtab`, `.dynsym` and the embedded image,
    /// sorted by address.
    pub fn symbols(&self) -> &[SymbolEntry]
    {
        self.symbols.get_or_init(|| {
            let mut symbols = Vec::new();
            if let Ok(file) = object::File::parse(&*self.data) {
                for symbol in file.symbols().chain(file.dynamic_symbols()) {
                    if symbol.kind() != SymbolKind::Text || symbol.address() == 0 {
                        continue;
                    }
                    if let Ok(name) = symbol.name() {
                        symbols.push(SymbolEntry {
                            address: symbol.address(),
                            size: symbol.size(),
                            name: name.to_string(),
                        });
                    }
                }
            }
            if let Some(embedded) = &self.embedded {
                symbols.extend_from_slice(embedded.symbols());
            }
            symbols.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| b.size.cmp(&a.size)));
            symbols.dedup_by(|a, b| a.address == b.address);
            symbols
        })
    }

    /// The function containing `address` and the offset into it.
    pub fn symbol_for(&self, address: u64) -> Option<(&SymbolEntry, u64)>
    {
        let symbols = self.symbols();
        let idx = symbols.partition_point(|s| s.address <= address).checked_sub(1)?;
        let symbol = &symbols[idx];
        let offset = address - symbol.address;
        (symbol.size == 0 || offset < symbol.size).then_some((symbol, offset))
    }

    /// Source position of `address`, if the image carries line tables.
    pub fn source_location(&self, address: u64) -> Option<SourceLocation>
    {
        let mut guard = self.line_context.lock();
        if guard.is_none() && self.line_context_tried.set(()).is_ok() {
            *guard = self.build_line_context();
        }
        let context = guard.as_ref()?;
        let location = context.find_location(address).ok().flatten()?;
        Some(SourceLocation {
            file: location.file?.to_string(),
            line: location.line,
        })
    }

    fn build_line_context(&self) -> Option<Context<OwnedReader>>
    {
        let file = object::File::parse(&*self.data).ok()?;
        file.section_by_name(".debug_info")?;
        let dwarf = Dwarf::load(|id: SectionId| -> Result<OwnedReader, gimli::Error> {
            let data = file
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .map_or_else(|| Arc::<[u8]>::from(Vec::new()), |bytes| Arc::<[u8]>::from(bytes.as_ref()));
            Ok(EndianArcSlice::new(data, self.endian))
        })
        .ok()?;
        Context::from_dwarf(dwarf).ok()
    }
}

fn compute_load_bias(file: &object::File<'_>) -> u64
{
    let mut first_load = None;
    for segment in file.segments() {
        let (file_offset, _) = segment.file_range();
        let bias = segment.address().wrapping_sub(file_offset);
        if let SegmentFlags::Elf { p_flags } = segment.flags() {
            if p_flags & object::elf::PF_X != 0 {
                return bias;
            }
        }
        first_load.get_or_insert(bias);
    }
    first_load.unwrap_or(0)
}

fn decompress_embedded(path: &Path, compressed: &[u8]) -> QuickenResult<ElfImage>
{
    let mut decompressed = Vec::new();
    lzma_rs::xz_decompress(&mut Cursor::new(compressed), &mut decompressed)
        .map_err(|err| QuickenError::Decompress(err.to_string()))?;
    let mut embedded_path = path.as_os_str().to_owned();
    embedded_path.push("!.gnu_debugdata");
    ElfImage::parse(PathBuf::from(embedded_path), 0, decompressed.into())
}

/// The file name component of a library path, used as its soname in cache
/// file names.
pub fn soname_from_path(path: &Path) -> String
{
    path.file_name()
        .map_or_else(|| path.to_string_lossy().into_owned(), |name| name.to_string_lossy().into_owned())
}
