//! # Unwind Modes
//!
//! [`Unwinder`] is the process-wide entry point. It owns the maps, the
//! table manager and the interface cache, and dispatches each unwind to one
//! of three strategies:
//!
//! - [`UnwindMode::FramePointer`]: follow the frame-pointer chain. Cheapest,
//!   needs no maps, wrong for code built without frame pointers.
//! - [`UnwindMode::DwarfBased`]: evaluate CFI from each library's ELF image.
//!   Accurate, but allocates; never use it from a signal handler.
//! - [`UnwindMode::Quicken`]: step precomputed QUT tables. Accurate and
//!   allocation-free once tables are resident.
//!
//! The mode and the JIT flag are atomics and can be flipped at any time;
//! an unwind in progress keeps the mode it started with.
//!
//! ## Quicken fallbacks
//!
//! Until the manager has been warmed up (or the mode is forced with
//! [`Unwinder::set_quicken_always_enabled`]) Quicken unwinds use the
//! frame-pointer chain. When a library has no table yet its frames are
//! stepped with in-memory tables built per function; with
//! `in_memory_tables` disabled the walk instead continues from that frame
//! along the frame-pointer chain. Architectures without QUT support use
//! DWARF-based unwinding.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::QuickenConfig,
    detail::{restore_frame_detail, FrameDetail},
    error::{QuickenResult, UnwindError},
    interface::{GenerateDelegate, JitTableProvider, QuickenInterface},
    manager::{GenerateOutcome, QutTableManager},
    maps::{MapSegment, Maps, MapsSnapshot},
    memory::{MemoryAccess, StackRange},
    qut::StepContext,
    types::{Frame, RegisterContext},
    unwind::{frame_pointer, DwarfStepper, FrameStepper, StepperResolver, UnwindEngine, UnwindReport},
};

/// Unwind strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnwindMode
{
    /// Frame-pointer chain walking
    FramePointer = 0,
    /// CFI evaluated from ELF images
    DwarfBased = 1,
    /// Precomputed QUT tables
    Quicken = 2,
}

impl UnwindMode
{
    const fn from_u8(value: u8) -> Self
    {
        match value {
            0 => UnwindMode::FramePointer,
            1 => UnwindMode::DwarfBased,
            _ => UnwindMode::Quicken,
        }
    }
}

impl fmt::Display for UnwindMode
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(match self {
            UnwindMode::FramePointer => "fp",
            UnwindMode::DwarfBased => "dwarf",
            UnwindMode::Quicken => "quicken",
        })
    }
}

impl FromStr for UnwindMode
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "fp" | "frame-pointer" | "framepointer" => Ok(UnwindMode::FramePointer),
            "dwarf" | "dwarf-based" => Ok(UnwindMode::DwarfBased),
            "quicken" | "qut" => Ok(UnwindMode::Quicken),
            _ => Err(format!("Unknown unwind mode: {s}. Use 'fp', 'dwarf' or 'quicken'")),
        }
    }
}

type InterfaceKey = (PathBuf, u64, u64);

/// Process-wide unwinder.
pub struct Unwinder
{
    config: QuickenConfig,
    maps: Maps,
    manager: Arc<QutTableManager>,
    interfaces: Mutex<HashMap<InterfaceKey, Option<Arc<QuickenInterface>>>>,
    mode: AtomicU8,
    jit_enabled: AtomicBool,
    quicken_always_enabled: AtomicBool,
    jit_provider: OnceCell<Arc<dyn JitTableProvider>>,
    generate_delegate: OnceCell<GenerateDelegate>,
}

impl fmt::Debug for Unwinder
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Unwinder")
            .field("mode", &self.mode())
            .field("jit_enabled", &self.jit_unwind_enabled())
            .field("maps", &self.maps)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl Unwinder
{
    /// An unwinder over the current process's maps.
    ///
    /// ## Errors
    ///
    /// `QuickenError::CacheDirUnavailable` if the cache directory cannot be
    /// created.
    pub fn new(config: QuickenConfig) -> QuickenResult<Self>
    {
        let manager = Arc::new(QutTableManager::new(&config.cache_dir, config.arch));
        Self::with_parts(config, Maps::for_current_process(), manager)
    }

    /// An unwinder over explicit maps and manager.
    ///
    /// ## Errors
    ///
    /// As [`Unwinder::new`].
    pub fn with_parts(config: QuickenConfig, maps: Maps, manager: Arc<QutTableManager>) -> QuickenResult<Self>
    {
        config.ensure_cache_dir()?;
        if let Err(err) = maps.parse() {
            warn!("initial maps parse failed: {err}");
        }
        let unwinder = Self {
            jit_enabled: AtomicBool::new(config.jit_unwind),
            config,
            maps,
            manager,
            interfaces: Mutex::new(HashMap::new()),
            mode: AtomicU8::new(UnwindMode::Quicken as u8),
            quicken_always_enabled: AtomicBool::new(false),
            jit_provider: OnceCell::new(),
            generate_delegate: OnceCell::new(),
        };
        info!(arch = %unwinder.config.arch, cache_dir = %unwinder.config.cache_dir.display(), "unwinder ready");
        Ok(unwinder)
    }

    pub fn config(&self) -> &QuickenConfig
    {
        &self.config
    }

    pub fn maps(&self) -> &Maps
    {
        &self.maps
    }

    pub fn manager(&self) -> &Arc<QutTableManager>
    {
        &self.manager
    }

    pub fn set_mode(&self, mode: UnwindMode)
    {
        self.mode.store(mode as u8, Ordering::Release);
    }

    pub fn mode(&self) -> UnwindMode
    {
        UnwindMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub fn set_jit_unwind_enabled(&self, enabled: bool)
    {
        self.jit_enabled.store(enabled, Ordering::Release);
    }

    pub fn jit_unwind_enabled(&self) -> bool
    {
        self.jit_enabled.load(Ordering::Acquire)
    }

    /// Use tables even before the manager has been warmed up.
    pub fn set_quicken_always_enabled(&self, enabled: bool)
    {
        self.quicken_always_enabled.store(enabled, Ordering::Release);
    }

    /// Install the provider of JIT tables. Only the first call succeeds.
    pub fn set_jit_provider(&self, provider: Arc<dyn JitTableProvider>) -> bool
    {
        self.jit_provider.set(provider).is_ok()
    }

    /// Install the delegate that generates missing tables. Only the first
    /// call succeeds.
    ///
    /// The delegate runs on the unwinding thread; a delegate that generates
    /// synchronously makes the first unwind through each library slow.
    pub fn set_generate_delegate(&self, delegate: GenerateDelegate) -> bool
    {
        self.generate_delegate.set(delegate).is_ok()
    }

    /// The set of loaded libraries changed.
    pub fn notify_maps_changed(&self)
    {
        match self.mode() {
            UnwindMode::FramePointer => {}
            UnwindMode::DwarfBased | UnwindMode::Quicken => {
                if let Err(err) = self.maps.parse() {
                    warn!("maps reparse after change failed: {err}");
                }
            }
        }
    }

    /// The interface of `segment`, shared across snapshots.
    pub fn interface_for(&self, snapshot: &MapsSnapshot, segment: &MapSegment) -> Option<Arc<QuickenInterface>>
    {
        segment
            .interface_or_init(|| {
                let key = (PathBuf::from(&segment.name), segment.start, segment.end);
                let mut interfaces = self.interfaces.lock();
                interfaces
                    .entry(key)
                    .or_insert_with(|| match QuickenInterface::create(snapshot, segment, self.config.arch) {
                        Ok(interface) => Some(Arc::new(interface.with_in_memory_tables(self.config.in_memory_tables))),
                        Err(err) => {
                            debug!(name = %segment.name, "no interface for segment: {err}");
                            None
                        }
                    })
                    .clone()
            })
            .cloned()
    }

    /// Unwind from `regs` in the current mode.
    pub fn unwind(
        &self,
        regs: &RegisterContext,
        memory: &dyn MemoryAccess,
        stack: StackRange,
        frames: &mut [Frame],
    ) -> UnwindReport
    {
        let ctx = StepContext::new(memory, stack);
        match self.mode() {
            UnwindMode::FramePointer => frame_pointer::frame_pointer_unwind(regs, memory, stack, frames),
            UnwindMode::DwarfBased => self.unwind_dwarf(regs, &ctx, frames),
            UnwindMode::Quicken => {
                if !regs.arch.has_quicken_tables() {
                    return self.unwind_dwarf(regs, &ctx, frames);
                }
                if !self.quicken_always_enabled.load(Ordering::Acquire) && !self.manager.is_warmed_up() {
                    return frame_pointer::frame_pointer_unwind(regs, memory, stack, frames);
                }
                self.unwind_quicken(regs, &ctx, frames)
            }
        }
    }

    /// Unwind the calling thread.
    #[cfg(all(
        any(target_os = "linux", target_os = "android"),
        any(target_arch = "aarch64", target_arch = "x86_64")
    ))]
    #[inline(never)]
    pub fn unwind_current_thread(&self, frames: &mut [Frame]) -> UnwindReport
    {
        let regs = RegisterContext::capture();
        let Some(stack) = StackRange::current_thread() else {
            return UnwindReport::failed(0, UnwindError::ReadStackFailed);
        };
        self.unwind(&regs, &crate::memory::LocalMemory, stack, frames)
    }

    /// Symbolicate recorded frames.
    pub fn restore_frame_detail(&self, frames: &[Frame]) -> Vec<FrameDetail>
    {
        let snapshot = self.maps.current();
        restore_frame_detail(snapshot.as_deref(), self.config.arch, frames, |snapshot, segment| {
            self.interface_for(snapshot, segment)
        })
    }

    /// Generate tables for every library that was asked for while missing,
    /// then mark the manager warmed up.
    pub fn warm_up(&self) -> Vec<QuickenResult<GenerateOutcome>>
    {
        let results = self
            .manager
            .requesting()
            .into_iter()
            .map(|request| {
                let result = self
                    .manager
                    .generate_for_library(&request.path, request.elf_start_offset, false);
                if let Err(err) = &result {
                    warn!(path = %request.path.display(), "warm-up generation failed: {err}");
                }
                result
            })
            .collect();
        self.manager.mark_warmed_up();
        results
    }

    fn unwind_dwarf(&self, regs: &RegisterContext, ctx: &StepContext<'_>, frames: &mut [Frame]) -> UnwindReport
    {
        let resolver = DwarfResolver(self);
        let mut regs = *regs;
        self.engine(&resolver).unwind(&mut regs, ctx, frames)
    }

    fn unwind_quicken(&self, regs: &RegisterContext, ctx: &StepContext<'_>, frames: &mut [Frame]) -> UnwindReport
    {
        let resolver = QuickenResolver(self);
        let mut regs = *regs;
        let report = self.engine(&resolver).unwind(&mut regs, ctx, frames);
        if report.error == Some(UnwindError::RequestQutFileFailed) {
            return frame_pointer::walk_chain(regs.arch, regs.fp, ctx.memory, ctx.stack, frames, report.frame_count);
        }
        report
    }

    fn engine<'a>(&'a self, resolver: &'a dyn StepperResolver) -> UnwindEngine<'a>
    {
        UnwindEngine {
            maps: &self.maps,
            resolver,
            jit: self.jit_provider.get().map(|provider| &**provider),
            jit_enabled: self.jit_unwind_enabled(),
            update_maps_as_needed: self.config.update_maps_as_needed,
        }
    }
}

struct QuickenResolver<'u>(&'u Unwinder);

impl StepperResolver for QuickenResolver<'_>
{
    fn resolve(&self, snapshot: &MapsSnapshot, segment: &MapSegment) -> Option<Arc<dyn FrameStepper>>
    {
        let unwinder = self.0;
        let interface = unwinder.interface_for(snapshot, segment)?;
        interface.try_init_table(
            &unwinder.manager,
            unwinder.generate_delegate.get(),
            unwinder.config.generate_retry_limit,
        );
        Some(interface)
    }
}

struct DwarfResolver<'u>(&'u Unwinder);

impl StepperResolver for DwarfResolver<'_>
{
    fn resolve(&self, snapshot: &MapsSnapshot, segment: &MapSegment) -> Option<Arc<dyn FrameStepper>>
    {
        let interface = self.0.interface_for(snapshot, segment)?;
        Some(Arc::new(DwarfStepper::new(interface)))
    }
}

#[cfg(test)]
mod tests
{
    use std::io;

    use super::*;
    use crate::memory::SliceMemory;
    use crate::types::Arch;

    fn unwinder(dir: &std::path::Path) -> Unwinder
    {
        let config = QuickenConfig::with_arch(dir, Arch::Arm64);
        let maps = Maps::new(Box::new(|| -> io::Result<String> {
            Ok("1000-2000 r-xp 00000000 00:00 0 /lib/a.so\n".to_string())
        }));
        let manager = Arc::new(QutTableManager::new(dir, Arch::Arm64));
        Unwinder::with_parts(config, maps, manager).expect("unwinder")
    }

    #[test]
    fn test_mode_round_trip()
    {
        let dir = tempfile::tempdir().expect("tempdir");
        let unwinder = unwinder(dir.path());
        assert_eq!(unwinder.mode(), UnwindMode::Quicken);
        unwinder.set_mode(UnwindMode::FramePointer);
        assert_eq!(unwinder.mode(), UnwindMode::FramePointer);
        assert_eq!("dwarf".parse::<UnwindMode>(), Ok(UnwindMode::DwarfBased));
        assert!("bogus".parse::<UnwindMode>().is_err());
    }

    #[test]
    fn test_quicken_before_warm_up_walks_frame_pointers()
    {
        let dir = tempfile::tempdir().expect("tempdir");
        let unwinder = unwinder(dir.path());
        let mut memory = SliceMemory::new(0x8000, vec![0; 0x100]);
        memory.write_word(0x8010, 0, Arch::Arm64);
        memory.write_word(0x8018, 0x1800, Arch::Arm64);
        let mut regs = RegisterContext::new(Arch::Arm64);
        regs.pc = 0x1400;
        regs.fp = 0x8010;

        let mut frames = [Frame::default(); 8];
        let report = unwinder.unwind(&regs, &memory, StackRange::new(0x8000, 0x8100), &mut frames);
        assert_eq!(report, UnwindReport::complete(2));
        assert_eq!(frames[1].pc, 0x1800);
    }

    #[test]
    fn test_quicken_without_image_reports_invalid_elf()
    {
        let dir = tempfile::tempdir().expect("tempdir");
        let unwinder = unwinder(dir.path());
        unwinder.set_quicken_always_enabled(true);
        let memory = SliceMemory::new(0x8000, vec![0; 0x100]);
        let mut regs = RegisterContext::new(Arch::Arm64);
        regs.pc = 0x1400;

        let mut frames = [Frame::default(); 8];
        let report = unwinder.unwind(&regs, &memory, StackRange::new(0x8000, 0x8100), &mut frames);
        assert_eq!(report, UnwindReport::failed(1, UnwindError::InvalidElf));
        assert_eq!(frames[0].pc, 0x1400 - 4);
    }

    #[test]
    fn test_warm_up_does_not_retry_failed_generation()
    {
        let dir = tempfile::tempdir().expect("tempdir");
        let unwinder = unwinder(dir.path());
        let library = dir.path().join("libbad.so");
        std::fs::write(&library, b"garbage").expect("write");
        unwinder.manager().request_sections("libbad.so", &library, "h1", "b1", 0);

        let first = unwinder.warm_up();
        assert_eq!(first.len(), 1);
        assert!(first[0].is_err());
        assert!(unwinder.warm_up().is_empty());
    }
}
