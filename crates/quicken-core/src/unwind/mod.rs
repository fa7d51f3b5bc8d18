//! # Unwind Engine
//!
//! The per-call driver that turns a register snapshot into a list of frames.
//!
//! For every frame the engine:
//!
//! 1. resolves the segment holding the pc (reusing the previous frame's
//!    segment when the pc is still inside it, and reparsing the maps once per
//!    call when a readable pc is not in the snapshot);
//! 2. resolves the segment's [`FrameStepper`];
//! 3. moves return addresses back into the call instruction;
//! 4. records the frame, preceded by a dex frame if the previous step left one;
//! 5. steps to the caller.
//!
//! Frames go into a caller-supplied slice. Nothing on this path allocates
//! once the segment's stepper has been resolved.
//!
//! ## Termination
//!
//! The walk always ends: either the stepper reports the outermost frame, a
//! step fails, the frame slice is full, or a step leaves pc and sp unchanged.

pub mod dwarf;
pub mod frame_pointer;
pub mod pc_adjust;

use std::sync::Arc;

pub use dwarf::DwarfStepper;
pub use frame_pointer::frame_pointer_unwind;
pub use pc_adjust::{default_adjustment, pc_adjustment};

use crate::{
    error::UnwindError,
    interface::{step_jit, JitTableProvider, QuickenInterface},
    maps::{MapSegment, Maps, MapsSnapshot},
    qut::{StepContext, StepOutcome},
    types::{Frame, FrameFlags, RegisterContext},
};

/// Outcome of one unwind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnwindReport
{
    /// Number of frames written to the front of the caller's slice
    pub frame_count: usize,
    /// Why the walk stopped early, `None` if it reached the outermost frame
    pub error: Option<UnwindError>,
}

impl UnwindReport
{
    pub const fn complete(frame_count: usize) -> Self
    {
        Self {
            frame_count,
            error: None,
        }
    }

    pub const fn failed(frame_count: usize, error: UnwindError) -> Self
    {
        Self {
            frame_count,
            error: Some(error),
        }
    }

    /// Whether the walk reached the outermost frame.
    pub const fn is_complete(&self) -> bool
    {
        self.error.is_none()
    }
}

/// Steps frames of one library.
pub trait FrameStepper: Send + Sync
{
    /// Link-time address of the absolute `pc`.
    fn rel_pc(&self, pc: u64) -> u64;

    /// Load bias of the library.
    fn load_bias(&self) -> u64;

    /// Replace `regs` with the caller's registers.
    ///
    /// ## Errors
    ///
    /// Any [`UnwindError`]; the walk stops with it.
    fn step(&self, regs: &mut RegisterContext, rel_pc: u64, ctx: &StepContext<'_>) -> Result<StepOutcome, UnwindError>;
}

impl FrameStepper for QuickenInterface
{
    fn rel_pc(&self, pc: u64) -> u64
    {
        QuickenInterface::rel_pc(self, pc)
    }

    fn load_bias(&self) -> u64
    {
        QuickenInterface::load_bias(self)
    }

    fn step(&self, regs: &mut RegisterContext, rel_pc: u64, ctx: &StepContext<'_>) -> Result<StepOutcome, UnwindError>
    {
        QuickenInterface::step(self, regs, rel_pc, ctx)
    }
}

/// Finds the stepper for a segment.
pub trait StepperResolver
{
    /// The stepper for `segment`, or `None` if it has no usable image.
    fn resolve(&self, snapshot: &MapsSnapshot, segment: &MapSegment) -> Option<Arc<dyn FrameStepper>>;
}

/// The driver, borrowing everything one unwind needs.
pub struct UnwindEngine<'a>
{
    /// Maps used to resolve program counters
    pub maps: &'a Maps,
    /// Supplies a stepper per segment
    pub resolver: &'a dyn StepperResolver,
    /// Tables for JIT code
    pub jit: Option<&'a dyn JitTableProvider>,
    /// Step JIT segments with in-memory tables instead of their (absent) ELF
    pub jit_enabled: bool,
    /// Reparse the maps once per call when a readable pc is not mapped
    pub update_maps_as_needed: bool,
}

impl UnwindEngine<'_>
{
    /// Unwind from `regs`, writing frames into `frames`.
    ///
    /// On return `regs` holds the registers of the last frame the walk
    /// reached.
    pub fn unwind(&self, regs: &mut RegisterContext, ctx: &StepContext<'_>, frames: &mut [Frame]) -> UnwindReport
    {
        let Some(mut snapshot) = self.maps.current() else {
            return UnwindReport::failed(0, UnwindError::MapsIsNull);
        };
        let arch = regs.arch;
        let mut count = 0;
        let mut pending_dex: Option<u64> = None;
        let mut current: Option<(usize, Option<Arc<dyn FrameStepper>>)> = None;
        let mut reparsed = false;

        loop {
            if count >= frames.len() {
                return UnwindReport::failed(count, UnwindError::MaxFramesExceeded);
            }
            let pc = regs.pc;
            let terminal_pc = pc.wrapping_sub(default_adjustment(arch));

            let reuse = current
                .as_ref()
                .map(|(index, _)| *index)
                .filter(|index| snapshot.get(*index).is_some_and(|s| s.contains(pc)));
            let index = match reuse.or_else(|| snapshot.find(pc).map(MapSegment::index)) {
                Some(index) => index,
                None => {
                    if self.update_maps_as_needed && !reparsed && ctx.memory.probe(pc) {
                        reparsed = true;
                        if let Ok(fresh) = self.maps.parse() {
                            snapshot = fresh;
                            current = None;
                        }
                    }
                    match snapshot.find(pc) {
                        Some(segment) => segment.index(),
                        None => {
                            frames[count] = Frame::native(terminal_pc, FrameFlags::NONE);
                            return UnwindReport::failed(count + 1, UnwindError::InvalidMap);
                        }
                    }
                }
            };
            let Some(segment) = snapshot.get(index) else {
                return UnwindReport::failed(count, UnwindError::InvalidMap);
            };

            let jit = self.jit_enabled && segment.is_jit();
            let stepper = if jit {
                None
            } else {
                if current.as_ref().map(|(i, _)| *i) != Some(index) {
                    current = Some((index, self.resolver.resolve(&snapshot, segment)));
                }
                match current.as_ref().and_then(|(_, stepper)| stepper.clone()) {
                    Some(stepper) => Some(stepper),
                    None => {
                        frames[count] = Frame::native(terminal_pc, FrameFlags::NONE);
                        return UnwindReport::failed(count + 1, UnwindError::InvalidElf);
                    }
                }
            };

            let (rel_pc, load_bias) = match &stepper {
                Some(stepper) => (stepper.rel_pc(pc), stepper.load_bias()),
                None => (pc, 0),
            };
            let adjust = if count == 0 {
                0
            } else {
                let readable = segment.is_readable().then(|| segment.start..segment.end);
                pc_adjustment(arch, rel_pc, load_bias, pc, readable, ctx.memory)
            };
            let flags = if jit || segment.maybe_java() {
                FrameFlags::MAYBE_JAVA
            } else {
                FrameFlags::NONE
            };

            if let Some(dex_pc) = pending_dex.take() {
                frames[count] = Frame::dex(dex_pc);
                count += 1;
                if count >= frames.len() {
                    return UnwindReport::failed(count, UnwindError::MaxFramesExceeded);
                }
            }
            frames[count] = Frame::native(pc.wrapping_sub(adjust), flags);
            count += 1;

            let (previous_pc, previous_sp) = (regs.pc, regs.sp);
            let result = match &stepper {
                Some(stepper) => stepper.step(regs, rel_pc.wrapping_sub(adjust), ctx),
                None => step_jit(self.jit, regs, pc.wrapping_sub(adjust), ctx),
            };
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) => return UnwindReport::failed(count, err),
            };
            if outcome.finished {
                if let (Some(dex_pc), Some(slot)) = (outcome.dex_pc, frames.get_mut(count)) {
                    *slot = Frame::dex(dex_pc);
                    count += 1;
                }
                return UnwindReport::complete(count);
            }
            pending_dex = outcome.dex_pc;
            if regs.pc == previous_pc && regs.sp == previous_sp {
                return UnwindReport::failed(count, UnwindError::RepeatedFrame);
            }
        }
    }
}
