//! # Frame Detail
//!
//! Lazy symbolication of recorded frames.
//!
//! Unwinding only records program counters. Names, build ids and source
//! positions are resolved here, on demand, for the frames that are actually
//! reported. This is the expensive half of a backtrace (symbol tables are
//! parsed and sorted on first use, line tables are loaded through
//! `addr2line`), so it never runs on the unwind path.

use std::fmt;
use std::sync::Arc;

use rustc_demangle::try_demangle;

use crate::{
    elf::SourceLocation,
    interface::QuickenInterface,
    maps::{MapSegment, MapsSnapshot},
    types::{Arch, Frame},
};

/// A frame with everything known about where its pc lies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDetail
{
    /// Position in the backtrace
    pub index: usize,
    /// Architecture, used to size the printed pc
    pub arch: Arch,
    /// Absolute pc, or dex pc for managed frames
    pub pc: u64,
    /// Link-time address inside the library
    pub rel_pc: u64,
    /// Whether `pc` is a dex pc
    pub is_dex_pc: bool,
    /// Mapped file or pseudo name
    pub map_name: Option<String>,
    /// Offset of the ELF image inside the mapped file (APK-embedded libraries)
    pub map_offset: u64,
    /// Demangled function name
    pub function_name: Option<String>,
    /// Offset of the pc into the function
    pub function_offset: u64,
    /// Build id of the library
    pub build_id: Option<String>,
    /// Source position, if line tables are available
    pub location: Option<SourceLocation>,
}

impl fmt::Display for FrameDetail
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let width = self.arch.word_size() * 2;
        if self.is_dex_pc {
            return write!(f, "  #{:02} dex pc {:0width$x}", self.index, self.pc);
        }
        write!(f, "  #{:02} pc {:0width$x}", self.index, self.rel_pc)?;
        match &self.map_name {
            Some(name) => write!(f, "  {name}")?,
            None => write!(f, "  <unknown>")?,
        }
        if self.map_offset != 0 {
            write!(f, " (offset {:#x})", self.map_offset)?;
        }
        if let Some(name) = &self.function_name {
            if self.function_offset == 0 {
                write!(f, " ({name})")?;
            } else {
                write!(f, " ({name}+{})", self.function_offset)?;
            }
        }
        if let Some(build_id) = &self.build_id {
            write!(f, " (BuildId: {build_id})")?;
        }
        if let Some(location) = &self.location {
            match location.line {
                Some(line) => write!(f, " [{}:{line}]", location.file)?,
                None => write!(f, " [{}]", location.file)?,
            }
        }
        Ok(())
    }
}

/// Human-readable form of a raw symbol name.
pub fn demangle(raw: &str) -> String
{
    try_demangle(raw).map_or_else(|_| raw.to_string(), |name| format!("{name:#}"))
}

/// Resolve `frames` against `snapshot`.
///
/// `interface_for` supplies the library of a segment; segments without one
/// still report their map name and file-relative pc.
pub fn restore_frame_detail<F>(
    snapshot: Option<&MapsSnapshot>,
    arch: Arch,
    frames: &[Frame],
    interface_for: F,
) -> Vec<FrameDetail>
where
    F: Fn(&MapsSnapshot, &MapSegment) -> Option<Arc<QuickenInterface>>,
{
    frames
        .iter()
        .enumerate()
        .map(|(index, frame)| {
            let mut detail = FrameDetail {
                index,
                arch,
                pc: frame.pc,
                rel_pc: frame.pc,
                is_dex_pc: frame.is_dex_pc,
                map_name: None,
                map_offset: 0,
                function_name: None,
                function_offset: 0,
                build_id: None,
                location: None,
            };
            if frame.is_dex_pc {
                return detail;
            }
            let Some((snapshot, segment)) = snapshot.and_then(|s| s.find(frame.pc).map(|seg| (s, seg))) else {
                return detail;
            };
            detail.map_name = (!segment.name.is_empty()).then(|| segment.name.clone());
            detail.rel_pc = frame.pc - segment.start + segment.offset;

            let Some(interface) = interface_for(snapshot, segment) else {
                return detail;
            };
            let image = interface.image();
            detail.rel_pc = interface.rel_pc(frame.pc);
            detail.map_offset = image.elf_start_offset();
            detail.build_id = image.build_id().map(str::to_string);
            if let Some((symbol, offset)) = image.symbol_for(detail.rel_pc) {
                detail.function_name = Some(demangle(&symbol.name));
                detail.function_offset = offset;
            }
            detail.location = image.source_location(detail.rel_pc);
            detail
        })
        .collect()
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::FrameFlags;

    fn detail(arch: Arch) -> FrameDetail
    {
        FrameDetail {
            index: 3,
            arch,
            pc: 0x7000_1234,
            rel_pc: 0x1234,
            is_dex_pc: false,
            map_name: Some("/system/lib64/libc.so".to_string()),
            map_offset: 0,
            function_name: Some("abort".to_string()),
            function_offset: 164,
            build_id: Some("abc123".to_string()),
            location: None,
        }
    }

    #[test]
    fn test_display_pads_pc_by_word_size()
    {
        assert_eq!(
            detail(Arch::Arm64).to_string(),
            "  #03 pc 0000000000001234  /system/lib64/libc.so (abort+164) (BuildId: abc123)"
        );
        let mut arm = detail(Arch::Arm);
        arm.map_offset = 0x4000;
        arm.build_id = None;
        assert_eq!(
            arm.to_string(),
            "  #03 pc 00001234  /system/lib64/libc.so (offset 0x4000) (abort+164)"
        );
    }

    #[test]
    fn test_demangle_rust_symbols()
    {
        assert_eq!(demangle("_ZN4core3fmt5write17h0123456789abcdefE"), "core::fmt::write");
        assert_eq!(demangle("abort"), "abort");
    }

    #[test]
    fn test_unmapped_and_dex_frames()
    {
        let snapshot = MapsSnapshot::parse("1000-2000 r-xp 00003000 00:00 0\n").expect("maps");
        let frames = [
            Frame::native(0x1100, FrameFlags::NONE),
            Frame::dex(0x42),
            Frame::native(0x9000, FrameFlags::NONE),
        ];
        let details = restore_frame_detail(Some(&snapshot), Arch::Arm64, &frames, |_, _| None);
        assert_eq!(details[0].rel_pc, 0x3100);
        assert_eq!(details[0].map_name, None);
        assert!(details[1].is_dex_pc);
        assert_eq!(details[2].rel_pc, 0x9000);
        assert!(details[2].to_string().contains("<unknown>"));
    }
}
