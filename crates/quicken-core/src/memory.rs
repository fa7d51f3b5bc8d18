//! # Memory Access
//!
//! Guarded reads of the current process's memory.
//!
//! Unwinding reads saved registers from the stack and, on ARM, instruction
//! bytes from code pages. A wild pointer must never fault the unwinding
//! thread, so [`LocalMemory`] goes through `process_vm_readv(2)` on the
//! process itself: an unmapped address yields `EFAULT` instead of `SIGSEGV`.
//!
//! [`SliceMemory`] serves copied stacks (and tests) from a plain buffer.

use crate::types::Arch;

/// Minimal memory accessor required by the unwinders.
///
/// Implementations must be safe to call from a signal handler: no locks, no
/// allocation.
pub trait MemoryAccess: Send + Sync
{
    /// Fill `buf` with the bytes at `address`. Returns `false` if any byte is
    /// unreadable.
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> bool;

    /// Read a little-endian 32-bit value.
    fn read_u32(&self, address: u64) -> Option<u32>
    {
        let mut buf = [0u8; 4];
        self.read_bytes(address, &mut buf).then(|| u32::from_le_bytes(buf))
    }

    /// Read a little-endian 64-bit value.
    fn read_u64(&self, address: u64) -> Option<u64>
    {
        let mut buf = [0u8; 8];
        self.read_bytes(address, &mut buf).then(|| u64::from_le_bytes(buf))
    }

    /// Read one machine word of `arch`, zero-extended.
    fn read_word(&self, address: u64, arch: Arch) -> Option<u64>
    {
        match arch.word_size() {
            4 => self.read_u32(address).map(u64::from),
            _ => self.read_u64(address),
        }
    }

    /// Whether a single byte at `address` is readable.
    fn probe(&self, address: u64) -> bool
    {
        let mut byte = [0u8; 1];
        self.read_bytes(address, &mut byte)
    }
}

/// Reads the current process's memory without risking a fault.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMemory;

impl MemoryAccess for LocalMemory
{
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> bool
    {
        if buf.is_empty() {
            return true;
        }
        let Ok(remote_base) = usize::try_from(address) else {
            return false;
        };
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: remote_base as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: `local` describes a live, exclusively borrowed buffer. The
        // kernel validates `remote` and reports EFAULT instead of faulting.
        let copied = unsafe {
            libc::syscall(
                libc::SYS_process_vm_readv,
                libc::getpid(),
                &local as *const libc::iovec,
                1 as libc::c_ulong,
                &remote as *const libc::iovec,
                1 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        usize::try_from(copied).is_ok_and(|n| n == buf.len())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn read_bytes(&self, _address: u64, _buf: &mut [u8]) -> bool
    {
        false
    }
}

/// A copy of a memory range, such as a stack snapshot taken in a signal
/// handler and unwound later.
#[derive(Debug, Clone, Default)]
pub struct SliceMemory
{
    base: u64,
    bytes: Vec<u8>,
}

impl SliceMemory
{
    /// Memory whose first byte lives at `base`.
    pub fn new(base: u64, bytes: Vec<u8>) -> Self
    {
        Self { base, bytes }
    }

    /// Address one past the last byte.
    pub fn end(&self) -> u64
    {
        self.base + self.bytes.len() as u64
    }

    /// First address covered.
    pub fn base(&self) -> u64
    {
        self.base
    }

    /// Overwrite a word in place. Out-of-range writes are ignored.
    pub fn write_word(&mut self, address: u64, value: u64, arch: Arch)
    {
        let word = arch.word_size();
        let Some(start) = address.checked_sub(self.base).and_then(|o| usize::try_from(o).ok()) else {
            return;
        };
        if let Some(slot) = self.bytes.get_mut(start..start + word) {
            slot.copy_from_slice(&value.to_le_bytes()[..word]);
        }
    }
}

impl MemoryAccess for SliceMemory
{
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> bool
    {
        let Some(start) = address.checked_sub(self.base).and_then(|o| usize::try_from(o).ok()) else {
            return false;
        };
        match self.bytes.get(start..start + buf.len()) {
            Some(src) => {
                buf.copy_from_slice(src);
                true
            }
            None => false,
        }
    }
}

/// Bounds of a thread's stack, `[bottom, top)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRange
{
    /// Lowest address of the stack
    pub bottom: u64,
    /// One past the highest address of the stack
    pub top: u64,
}

impl StackRange
{
    /// A range covering `[bottom, top)`.
    pub const fn new(bottom: u64, top: u64) -> Self
    {
        Self { bottom, top }
    }

    /// Whether a `len`-byte read at `address` stays inside the stack.
    pub const fn contains(&self, address: u64, len: u64) -> bool
    {
        address >= self.bottom && address <= self.top.saturating_sub(len)
    }

    /// Stack bounds of the calling thread.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn current_thread() -> Option<Self>
    {
        // SAFETY: `attr` is initialised by pthread_getattr_np before use and
        // destroyed exactly once; out-pointers refer to live locals.
        unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
                return None;
            }
            let mut addr: *mut libc::c_void = std::ptr::null_mut();
            let mut size: libc::size_t = 0;
            let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
            libc::pthread_attr_destroy(&mut attr);
            if rc != 0 || addr.is_null() {
                return None;
            }
            let bottom = addr as u64;
            Some(Self::new(bottom, bottom + size as u64))
        }
    }

    /// Stack bounds of the calling thread.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn current_thread() -> Option<Self>
    {
        None
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_slice_memory_bounds()
    {
        let mut mem = SliceMemory::new(0x1000, vec![0; 16]);
        mem.write_word(0x1008, 0xdead_beef_cafe_f00d, Arch::Arm64);
        assert_eq!(mem.read_u64(0x1008), Some(0xdead_beef_cafe_f00d));
        assert_eq!(mem.read_u32(0x1008), Some(0xcafe_f00d));
        assert_eq!(mem.read_u64(0x1009), None);
        assert_eq!(mem.read_u32(0x0ffc), None);
        assert!(mem.probe(0x100f));
        assert!(!mem.probe(0x1010));
    }

    #[test]
    fn test_stack_range_contains()
    {
        let range = StackRange::new(0x1000, 0x2000);
        assert!(range.contains(0x1000, 8));
        assert!(range.contains(0x1ff8, 8));
        assert!(!range.contains(0x1ffc, 8));
        assert!(!range.contains(0x0ff8, 8));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_local_memory_reads_own_stack_and_rejects_null()
    {
        let value: u64 = 0x0123_4567_89ab_cdef;
        let address = std::ptr::addr_of!(value) as u64;
        assert_eq!(LocalMemory.read_u64(address), Some(value));
        assert_eq!(LocalMemory.read_u64(0), None);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_current_thread_stack_contains_local()
    {
        let marker = 7u32;
        let address = std::ptr::addr_of!(marker) as u64;
        let range = StackRange::current_thread().expect("stack bounds");
        assert!(range.contains(address, 4));
    }
}
