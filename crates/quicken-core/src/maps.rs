//! # Memory Maps
//!
//! A parsed, immutable view of the process's memory segments.
//!
//! [`Maps`] publishes a [`MapsSnapshot`] through an `ArcSwapOption`: unwinding
//! threads load the current snapshot without locking, while a reparse builds
//! a complete new snapshot and swaps it in atomically. A snapshot that an
//! unwinder already holds stays valid for as long as it holds it.
//!
//! ## Segment flags
//!
//! Besides protection bits each segment records whether it is a device
//! mapping (never unwound), JIT-generated code, or code that may belong to
//! the managed runtime.
//!
//! ## ELF placement
//!
//! A library may be mapped as several segments (`r--` then `r-x`), or stored
//! uncompressed inside an archive at a non-zero file offset.
//! [`MapsSnapshot::elf_location`] works out where the ELF header lives for a
//! given executable segment.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{QuickenError, QuickenResult};
use crate::interface::QuickenInterface;

/// Protection and classification bits of a segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MapFlags(u16);

impl MapFlags
{
    /// Readable
    pub const READ: Self = Self(0x1);
    /// Writable
    pub const WRITE: Self = Self(0x2);
    /// Executable
    pub const EXEC: Self = Self(0x4);
    /// Shared mapping
    pub const SHARED: Self = Self(0x8);
    /// Device mapping; reading it may have side effects
    pub const DEVICE: Self = Self(0x100);
    /// JIT-generated code
    pub const JIT: Self = Self(0x200);
    /// Code that may belong to the managed runtime
    pub const MAYBE_JAVA: Self = Self(0x400);

    /// Whether all bits of `other` are set.
    pub const fn contains(self, other: Self) -> bool
    {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: Self)
    {
        self.0 |= other.0;
    }

    /// Whether no protection bit is set.
    pub const fn no_access(self) -> bool
    {
        self.0 & 0x7 == 0
    }
}

/// One line of the memory map.
#[derive(Debug)]
pub struct MapSegment
{
    /// First address (inclusive)
    pub start: u64,
    /// End address (exclusive)
    pub end: u64,
    /// Offset into the mapped file
    pub offset: u64,
    /// Protection and classification bits
    pub flags: MapFlags,
    /// Mapped path or pseudo name (`[stack]`, `[anon:...]`), possibly empty
    pub name: String,
    index: usize,
    prev_real: Option<usize>,
    interface: OnceCell<Option<Arc<QuickenInterface>>>,
}

impl MapSegment
{
    /// Whether `pc` falls inside `[start, end)`.
    pub const fn contains(&self, pc: u64) -> bool
    {
        self.start <= pc && pc < self.end
    }

    /// Position of the segment in its snapshot.
    pub const fn index(&self) -> usize
    {
        self.index
    }

    /// Whether the segment is readable.
    pub const fn is_readable(&self) -> bool
    {
        self.flags.contains(MapFlags::READ)
    }

    /// Whether the segment holds JIT-generated code.
    pub const fn is_jit(&self) -> bool
    {
        self.flags.contains(MapFlags::JIT)
    }

    /// Whether frames in this segment may be managed-runtime frames.
    pub const fn maybe_java(&self) -> bool
    {
        self.flags.contains(MapFlags::MAYBE_JAVA)
    }

    /// Whether the segment carries no information at all.
    fn is_blank(&self) -> bool
    {
        self.offset == 0 && self.flags.no_access() && self.name.is_empty()
    }

    /// The segment's interface, creating it with `create` on first use.
    ///
    /// A failed creation is remembered too, so it is attempted once per
    /// snapshot.
    pub fn interface_or_init<F>(&self, create: F) -> Option<&Arc<QuickenInterface>>
    where
        F: FnOnce() -> Option<Arc<QuickenInterface>>,
    {
        self.interface.get_or_init(create).as_ref()
    }

    /// The interface if it has already been resolved.
    pub fn cached_interface(&self) -> Option<&Arc<QuickenInterface>>
    {
        self.interface.get().and_then(Option::as_ref)
    }
}

/// Where the ELF image backing a segment starts inside its file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfLocation
{
    /// File holding the image
    pub path: PathBuf,
    /// File offset of the ELF header
    pub elf_start_offset: u64,
    /// Distance from the ELF header to the segment's first byte
    pub elf_offset: u64,
}

/// An immutable, sorted list of segments.
#[derive(Debug, Default)]
pub struct MapsSnapshot
{
    segments: Vec<MapSegment>,
}

impl MapsSnapshot
{
    /// Parse `/proc/<pid>/maps` formatted text.
    ///
    /// ## Errors
    ///
    /// Returns `QuickenError::MalformedMaps` for the first line that does not
    /// parse; nothing is returned for the other lines.
    pub fn parse(text: &str) -> QuickenResult<Self>
    {
        let mut segments = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let segment = parse_line(line).ok_or_else(|| QuickenError::MalformedMaps {
                line: line_no + 1,
                text: line.to_string(),
            })?;
            segments.push(segment);
        }

        segments.sort_by_key(|s| s.start);
        let mut prev_real = None;
        for (index, segment) in segments.iter_mut().enumerate() {
            segment.index = index;
            segment.prev_real = prev_real;
            if !segment.is_blank() {
                prev_real = Some(index);
            }
        }

        Ok(Self { segments })
    }

    /// The segment containing `pc`.
    pub fn find(&self, pc: u64) -> Option<&MapSegment>
    {
        let idx = self.segments.partition_point(|s| s.end <= pc);
        self.segments.get(idx).filter(|s| s.start <= pc)
    }

    /// The first segment whose name ends with `suffix`.
    pub fn find_by_name(&self, suffix: &str) -> Option<&MapSegment>
    {
        self.segments.iter().find(|s| s.name.ends_with(suffix))
    }

    /// The closest preceding segment that is not blank.
    pub fn prev_real(&self, segment: &MapSegment) -> Option<&MapSegment>
    {
        segment.prev_real.and_then(|i| self.segments.get(i))
    }

    /// Segment at `index`.
    pub fn get(&self, index: usize) -> Option<&MapSegment>
    {
        self.segments.get(index)
    }

    /// All segments in address order.
    pub fn iter(&self) -> impl Iterator<Item = &MapSegment>
    {
        self.segments.iter()
    }

    /// Number of segments.
    pub fn len(&self) -> usize
    {
        self.segments.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool
    {
        self.segments.is_empty()
    }

    /// Locate the ELF header for `segment`.
    ///
    /// `has_elf_at(path, offset)` reports whether an ELF header starts at
    /// `offset` in `path`.
    pub fn elf_location<F>(&self, segment: &MapSegment, has_elf_at: F) -> Option<ElfLocation>
    where
        F: Fn(&Path, u64) -> bool,
    {
        if segment.name.is_empty() || segment.flags.contains(MapFlags::DEVICE) {
            return None;
        }
        let path = PathBuf::from(&segment.name);
        let at = |elf_start_offset, elf_offset| ElfLocation {
            path: path.clone(),
            elf_start_offset,
            elf_offset,
        };

        if segment.offset == 0 {
            return Some(at(0, 0));
        }

        // Library stored uncompressed inside an archive.
        if has_elf_at(&path, segment.offset) {
            return Some(at(segment.offset, 0));
        }

        let prev = self
            .prev_real(segment)
            .filter(|p| p.name == segment.name && p.flags.contains(MapFlags::READ) && !p.flags.contains(MapFlags::EXEC));

        if has_elf_at(&path, 0) {
            return Some(at(0, segment.offset));
        }

        // Split mapping of an embedded library: the read-only segment holds the header.
        let prev = prev?;
        if prev.offset < segment.offset && has_elf_at(&path, prev.offset) {
            return Some(at(prev.offset, segment.offset - prev.offset));
        }
        None
    }
}

/// Supplies memory map text.
pub trait MapsSource: Send + Sync
{
    /// Read the complete map table.
    ///
    /// ## Errors
    ///
    /// Returns the underlying I/O error.
    fn read_maps(&self) -> io::Result<String>;
}

/// Reads `/proc/<pid>/maps`.
#[derive(Debug, Clone)]
pub struct ProcMaps
{
    path: PathBuf,
}

impl ProcMaps
{
    /// Maps of the current process.
    pub fn current() -> Self
    {
        Self {
            path: PathBuf::from("/proc/self/maps"),
        }
    }

    /// Maps of another process.
    pub fn for_pid(pid: u32) -> Self
    {
        Self {
            path: PathBuf::from(format!("/proc/{pid}/maps")),
        }
    }
}

impl MapsSource for ProcMaps
{
    fn read_maps(&self) -> io::Result<String>
    {
        std::fs::read_to_string(&self.path)
    }
}

impl<F> MapsSource for F
where
    F: Fn() -> io::Result<String> + Send + Sync,
{
    fn read_maps(&self) -> io::Result<String>
    {
        self()
    }
}

/// The process's current memory maps.
pub struct Maps
{
    current: ArcSwapOption<MapsSnapshot>,
    source: Box<dyn MapsSource>,
    parse_lock: Mutex<()>,
}

impl Maps
{
    /// Maps read from `source`. Nothing is parsed until [`Maps::parse`].
    pub fn new(source: Box<dyn MapsSource>) -> Self
    {
        Self {
            current: ArcSwapOption::empty(),
            source,
            parse_lock: Mutex::new(()),
        }
    }

    /// Maps of the current process.
    pub fn for_current_process() -> Self
    {
        Self::new(Box::new(ProcMaps::current()))
    }

    /// Re-read the map table and publish a new snapshot.
    ///
    /// On failure the previous snapshot stays published.
    ///
    /// ## Errors
    ///
    /// Returns an I/O error if the source cannot be read, or
    /// `QuickenError::MalformedMaps` if any line is malformed.
    pub fn parse(&self) -> QuickenResult<Arc<MapsSnapshot>>
    {
        let _guard = self.parse_lock.lock();
        let text = self.source.read_maps()?;
        let snapshot = match MapsSnapshot::parse(&text) {
            Ok(snapshot) => Arc::new(snapshot),
            Err(err) => {
                warn!("keeping previous maps snapshot: {err}");
                return Err(err);
            }
        };
        debug!(segments = snapshot.len(), "published maps snapshot");
        self.current.store(Some(Arc::clone(&snapshot)));
        Ok(snapshot)
    }

    /// The published snapshot, if any parse has succeeded.
    pub fn current(&self) -> Option<Arc<MapsSnapshot>>
    {
        self.current.load_full()
    }
}

impl std::fmt::Debug for Maps
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        let current = self.current.load_full();
        f.debug_struct("Maps")
            .field("segments", &current.as_ref().map(|s| s.len()))
            .finish_non_exhaustive()
    }
}

fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str>
{
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
    let (field, tail) = trimmed.split_at(end);
    *rest = tail;
    Some(field)
}

fn parse_line(line: &str) -> Option<MapSegment>
{
    let mut rest = line;
    let range = next_field(&mut rest)?;
    let perms = next_field(&mut rest)?;
    let offset = next_field(&mut rest)?;
    let device = next_field(&mut rest)?;
    let inode = next_field(&mut rest)?;
    let name = rest.trim().to_string();

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;
    let (major, minor) = device.split_once(':')?;
    u32::from_str_radix(major, 16).ok()?;
    u32::from_str_radix(minor, 16).ok()?;
    inode.parse::<u64>().ok()?;
    if end < start {
        return None;
    }

    let perms = perms.as_bytes();
    if perms.len() < 4 {
        return None;
    }
    let mut flags = MapFlags::default();
    if perms[0] == b'r' {
        flags.insert(MapFlags::READ);
    }
    if perms[1] == b'w' {
        flags.insert(MapFlags::WRITE);
    }
    if perms[2] == b'x' {
        flags.insert(MapFlags::EXEC);
    }
    if perms[3] == b's' {
        flags.insert(MapFlags::SHARED);
    }
    if name.starts_with("/dev/") && !name.starts_with("/dev/ashmem/") {
        flags.insert(MapFlags::DEVICE);
    }
    if name.contains("jit-cache") || name.contains("jit-code-cache") {
        flags.insert(MapFlags::JIT);
        flags.insert(MapFlags::MAYBE_JAVA);
    }
    let managed_suffix = [".oat", ".odex", ".vdex", ".art", ".dex", ".jar", ".apk"]
        .iter()
        .any(|suffix| name.ends_with(suffix));
    if managed_suffix || name.starts_with("[anon:dalvik-") || name.starts_with("/dev/ashmem/dalvik-") {
        flags.insert(MapFlags::MAYBE_JAVA);
    }

    Some(MapSegment {
        start,
        end,
        offset,
        flags,
        name,
        index: 0,
        prev_real: None,
        interface: OnceCell::new(),
    })
}

#[cfg(test)]
mod tests
{
    use super::*;

    const TWO_SEGMENTS: &str =
        "1000-2000 r-xp 00000000 00:00 0 /lib/a.so\n2000-3000 rw-p 00001000 00:00 0 /lib/a.so\n";

    #[test]
    fn test_parse_and_find()
    {
        let snapshot = MapsSnapshot::parse(TWO_SEGMENTS).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.find(0x1500).map(|s| s.start), Some(0x1000));
        assert_eq!(snapshot.find(0x2500).map(|s| s.start), Some(0x2000));
        assert!(snapshot.find(0x500).is_none());
        assert!(snapshot.find(0x3000).is_none());
        let second = snapshot.find(0x2000).unwrap();
        assert_eq!(second.offset, 0x1000);
        assert!(second.flags.contains(MapFlags::WRITE));
        assert!(!second.flags.contains(MapFlags::EXEC));
    }

    #[test]
    fn test_malformed_line_fails_whole_parse()
    {
        let text = format!("{TWO_SEGMENTS}zzzz-3000 r-xp 0 00:00 0 /lib/b.so\n");
        let err = MapsSnapshot::parse(&text).unwrap_err();
        assert!(matches!(err, QuickenError::MalformedMaps { line: 3, .. }));
    }

    #[test]
    fn test_names_with_spaces_and_flags()
    {
        let text = "\
7000-8000 r-xp 00000000 fd:01 12 /data/app/my app/base.odex
8000-9000 r-xp 00000000 00:05 3 /memfd:jit-cache (deleted)
9000-a000 rw-s 00000000 00:06 4 /dev/binder
a000-b000 rw-p 00000000 00:00 0
";
        let snapshot = MapsSnapshot::parse(text).unwrap();
        let odex = snapshot.find(0x7000).unwrap();
        assert_eq!(odex.name, "/data/app/my app/base.odex");
        assert!(odex.maybe_java());
        let jit = snapshot.find(0x8000).unwrap();
        assert!(jit.is_jit());
        assert!(snapshot.find(0x9000).unwrap().flags.contains(MapFlags::DEVICE));
        assert!(snapshot.find(0xa000).unwrap().name.is_empty());
        assert_eq!(snapshot.find_by_name("base.odex").map(MapSegment::index), Some(0));
    }

    #[test]
    fn test_find_unique_over_disjoint_segments()
    {
        let mut text = String::new();
        for i in 0..64u64 {
            let start = 0x10_000 + i * 0x3000;
            text.push_str(&format!("{:x}-{:x} r--p 00000000 00:00 0 /lib/l{i}.so\n", start, start + 0x1000));
        }
        let snapshot = MapsSnapshot::parse(&text).unwrap();
        for pc in (0x10_000u64..0x10_000 + 64 * 0x3000).step_by(0x400) {
            let expected: Vec<_> = snapshot.iter().filter(|s| s.contains(pc)).map(MapSegment::index).collect();
            let found = snapshot.find(pc).map(MapSegment::index);
            assert_eq!(found, expected.first().copied());
            assert!(expected.len() <= 1);
        }
    }

    #[test]
    fn test_prev_real_skips_blank_segments()
    {
        let text = "\
1000-2000 r--p 00000000 00:00 0 /lib/a.so
2000-3000 ---p 00000000 00:00 0
3000-4000 r-xp 00001000 00:00 0 /lib/a.so
";
        let snapshot = MapsSnapshot::parse(text).unwrap();
        let exec = snapshot.find(0x3000).unwrap();
        assert_eq!(snapshot.prev_real(exec).map(|s| s.start), Some(0x1000));
    }

    #[test]
    fn test_elf_location_for_split_library()
    {
        let text = "\
1000-2000 r--p 00000000 00:00 0 /lib/a.so
2000-3000 r-xp 00001000 00:00 0 /lib/a.so
";
        let snapshot = MapsSnapshot::parse(text).unwrap();
        let exec = snapshot.find(0x2000).unwrap();
        let location = snapshot.elf_location(exec, |_, offset| offset == 0).unwrap();
        assert_eq!(location.elf_start_offset, 0);
        assert_eq!(location.elf_offset, 0x1000);
    }

    #[test]
    fn test_elf_location_inside_archive()
    {
        let text = "\
1000-2000 r--p 00040000 00:00 0 /data/app/base.apk
2000-3000 r-xp 00041000 00:00 0 /data/app/base.apk
";
        let snapshot = MapsSnapshot::parse(text).unwrap();
        let exec = snapshot.find(0x2000).unwrap();
        let location = snapshot.elf_location(exec, |_, offset| offset == 0x40000).unwrap();
        assert_eq!(location.elf_start_offset, 0x40000);
        assert_eq!(location.elf_offset, 0x1000);

        let direct = snapshot.elf_location(exec, |_, offset| offset == 0x41000).unwrap();
        assert_eq!(direct.elf_start_offset, 0x41000);
        assert_eq!(direct.elf_offset, 0);
    }

    #[test]
    fn test_failed_reparse_keeps_snapshot()
    {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let maps = Maps::new(Box::new(move || {
            if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Ok(TWO_SEGMENTS.to_string())
            } else {
                Ok("garbage\n".to_string())
            }
        }));
        assert!(maps.current().is_none());
        maps.parse().unwrap();
        assert!(maps.parse().is_err());
        assert_eq!(maps.current().unwrap().len(), 2);
    }
}
