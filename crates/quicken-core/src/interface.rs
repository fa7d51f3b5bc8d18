//! # Quicken Interface
//!
//! One [`QuickenInterface`] exists per executable mapping of a library. It
//! knows where the library's ELF image starts, how to turn an absolute pc
//! into the link-time address tables are keyed by, and holds the library's
//! table once the manager has one.
//!
//! The table is stored in a `OnceCell` so the stepping path reads it without
//! taking a lock; everything that may block (asking the manager, running a
//! generation delegate) happens in [`QuickenInterface::try_init_table`].
//!
//! Until a file table is attached, steps use small in-memory tables built
//! for the one CFI entry covering the pc and cached per entry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    elf::{has_elf_header_at, soname_from_path, ElfImage},
    error::{QuickenError, QuickenResult, UnwindError},
    generator::{generate_for_pc, FunctionTable},
    manager::{fake_build_id, library_hash, QutTableManager, TableRequest},
    maps::{MapFlags, MapSegment, MapsSnapshot},
    qut::{decode, QutSections, StepContext, StepOutcome},
    types::{Arch, RegisterContext},
};

/// Supplies tables for JIT-generated code.
///
/// JIT code has no file behind it, so its tables are produced in memory by
/// the runtime and keyed by absolute pc.
pub trait JitTableProvider: Send + Sync
{
    /// The table covering `pc`, if the runtime has one.
    fn sections_for(&self, pc: u64) -> Option<Arc<QutSections>>;
}

/// Generates the table of a library on request. Receives the library path
/// and ELF start offset; returns whether a table is now available.
pub type GenerateDelegate = Arc<dyn Fn(&Path, u64) -> bool + Send + Sync>;

/// Per-library stepping state.
pub struct QuickenInterface
{
    image: Arc<ElfImage>,
    soname: String,
    hash: String,
    build_id: String,
    start: u64,
    end: u64,
    elf_offset: u64,
    sections: OnceCell<Arc<QutSections>>,
    failed_generations: AtomicU32,
    in_memory_tables: bool,
    function_tables: Mutex<BTreeMap<u64, Arc<FunctionTable>>>,
}

impl std::fmt::Debug for QuickenInterface
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("QuickenInterface")
            .field("path", &self.image.path())
            .field("build_id", &self.build_id)
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("elf_offset", &self.elf_offset)
            .field("has_table", &self.sections.get().is_some())
            .field("function_tables", &self.function_tables.lock().len())
            .finish_non_exhaustive()
    }
}

impl QuickenInterface
{
    /// Build the interface for `segment`.
    ///
    /// ## Errors
    ///
    /// Fails for device mappings, unnamed or empty segments, segments whose
    /// ELF header cannot be located or parsed, and images built for an
    /// architecture other than `arch`.
    pub fn create(snapshot: &MapsSnapshot, segment: &MapSegment, arch: Arch) -> QuickenResult<Self>
    {
        if segment.flags.contains(MapFlags::DEVICE) || segment.name.is_empty() || segment.end <= segment.start {
            return Err(QuickenError::InvalidElf {
                path: PathBuf::from(&segment.name),
                details: "segment cannot hold an ELF image".to_string(),
            });
        }
        let location = snapshot
            .elf_location(segment, has_elf_header_at)
            .ok_or_else(|| QuickenError::InvalidElf {
                path: PathBuf::from(&segment.name),
                details: "no ELF header found for segment".to_string(),
            })?;

        let image = ElfImage::open(&location.path, location.elf_start_offset)?;
        if image.arch() != arch {
            return Err(QuickenError::ArchMismatch {
                expected: arch,
                found: image.arch(),
            });
        }
        let file_size = std::fs::metadata(&location.path)?.len();
        Ok(Self::from_image(
            Arc::new(image),
            segment,
            location.elf_offset,
            library_hash(&location.path, file_size, location.elf_start_offset),
        ))
    }

    /// Wrap an already parsed image mapped by `segment`.
    pub fn from_image(image: Arc<ElfImage>, segment: &MapSegment, elf_offset: u64, hash: String) -> Self
    {
        let build_id = image
            .build_id()
            .map_or_else(|| fake_build_id(image.path()), str::to_string);
        Self {
            soname: soname_from_path(image.path()),
            image,
            hash,
            build_id,
            start: segment.start,
            end: segment.end,
            elf_offset,
            sections: OnceCell::new(),
            failed_generations: AtomicU32::new(0),
            in_memory_tables: true,
            function_tables: Mutex::new(BTreeMap::new()),
        }
    }

    /// Whether steps without a file table may build in-memory tables.
    #[must_use]
    pub fn with_in_memory_tables(mut self, enabled: bool) -> Self
    {
        self.in_memory_tables = enabled;
        self
    }

    pub fn image(&self) -> &Arc<ElfImage>
    {
        &self.image
    }

    pub fn path(&self) -> &Path
    {
        self.image.path()
    }

    pub fn soname(&self) -> &str
    {
        &self.soname
    }

    pub fn build_id(&self) -> &str
    {
        &self.build_id
    }

    pub fn hash(&self) -> &str
    {
        &self.hash
    }

    pub fn load_bias(&self) -> u64
    {
        self.image.load_bias()
    }

    /// Distance from the ELF header to the first byte of the mapping.
    pub fn elf_offset(&self) -> u64
    {
        self.elf_offset
    }

    /// Whether the interface was built for the mapping `[start, end)` of `path`.
    pub fn matches(&self, path: &Path, start: u64, end: u64) -> bool
    {
        self.start == start && self.end == end && self.image.path() == path
    }

    /// Link-time address of the absolute `pc`.
    pub fn rel_pc(&self, pc: u64) -> u64
    {
        pc.wrapping_sub(self.start)
            .wrapping_add(self.elf_offset)
            .wrapping_add(self.image.load_bias())
    }

    /// The resident table, if one has been attached.
    pub fn sections(&self) -> Option<&Arc<QutSections>>
    {
        self.sections.get()
    }

    /// Attach a table directly. Returns `false` if one is already attached.
    pub fn set_sections(&self, sections: Arc<QutSections>) -> bool
    {
        self.sections.set(sections).is_ok()
    }

    /// Make sure a table is attached, asking the manager and, when the
    /// manager has nothing, the generation delegate.
    ///
    /// The delegate is skipped once it has failed `retry_limit` times in a
    /// row for this library.
    pub fn try_init_table(
        &self,
        manager: &QutTableManager,
        delegate: Option<&GenerateDelegate>,
        retry_limit: u32,
    ) -> bool
    {
        if self.sections.get().is_some() {
            return true;
        }
        let request = || {
            manager.request_sections(
                &self.soname,
                self.image.path(),
                &self.hash,
                &self.build_id,
                self.image.elf_start_offset(),
            )
        };
        if let TableRequest::Ready(sections) = request() {
            let _ = self.sections.set(sections);
            return true;
        }

        let Some(delegate) = delegate else {
            return false;
        };
        if self.failed_generations.load(Ordering::Relaxed) >= retry_limit {
            return false;
        }
        if delegate(self.image.path(), self.image.elf_start_offset()) {
            if let TableRequest::Ready(sections) = request() {
                debug!(soname = %self.soname, build_id = %self.build_id, "generated quicken table");
                self.failed_generations.store(0, Ordering::Relaxed);
                let _ = self.sections.set(sections);
                return true;
            }
        }
        let failures = self.failed_generations.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(soname = %self.soname, failures, "quicken table generation did not produce a table");
        false
    }

    /// Step one frame with the attached table, or with an in-memory table
    /// for the function at `rel_pc` while no table is attached.
    ///
    /// ## Errors
    ///
    /// - `UnwindInfo` when `rel_pc` lies below the load bias.
    /// - `RequestQutFileFailed` when no table is attached and in-memory
    ///   tables are disabled.
    /// - `RequestQutInMemFailed` when no CFI entry covers `rel_pc`.
    /// - Otherwise whatever the decoder reports.
    pub fn step(&self, regs: &mut RegisterContext, rel_pc: u64, ctx: &StepContext<'_>) -> Result<StepOutcome, UnwindError>
    {
        if rel_pc < self.load_bias() {
            return Err(UnwindError::UnwindInfo);
        }
        if let Some(sections) = self.sections.get() {
            return decode::step(sections, rel_pc, regs, ctx);
        }
        if !self.in_memory_tables {
            return Err(UnwindError::RequestQutFileFailed);
        }
        let table = self.function_table(rel_pc).ok_or(UnwindError::RequestQutInMemFailed)?;
        decode::step(&table.sections, rel_pc, regs, ctx)
    }

    /// The cached in-memory table covering `rel_pc`, built on a miss.
    fn function_table(&self, rel_pc: u64) -> Option<Arc<FunctionTable>>
    {
        let mut tables = self.function_tables.lock();
        if let Some((_, table)) = tables.range(..=rel_pc).next_back() {
            if table.contains(rel_pc) {
                return Some(Arc::clone(table));
            }
        }
        let table = Arc::new(generate_for_pc(&self.image, rel_pc)?);
        debug!(
            soname = %self.soname,
            start = format_args!("{:#x}", table.start),
            end = format_args!("{:#x}", table.end),
            "cached in-memory table"
        );
        tables.insert(table.start, Arc::clone(&table));
        Some(table)
    }

    /// Number of in-memory tables built so far.
    pub fn in_memory_table_count(&self) -> usize
    {
        self.function_tables.lock().len()
    }
}

/// Step one frame of JIT code, whose tables are keyed by absolute pc.
///
/// ## Errors
///
/// `RequestQutInMemFailed` when there is no provider or it has no table for
/// `pc`; otherwise whatever the decoder reports.
pub fn step_jit(
    provider: Option<&dyn JitTableProvider>,
    regs: &mut RegisterContext,
    pc: u64,
    ctx: &StepContext<'_>,
) -> Result<StepOutcome, UnwindError>
{
    let sections = provider
        .and_then(|p| p.sections_for(pc))
        .ok_or(UnwindError::RequestQutInMemFailed)?;
    decode::step(&sections, pc, regs, ctx)
}
