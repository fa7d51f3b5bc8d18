//! Frame-pointer chain walking.
//!
//! The cheapest strategy: every frame record is `[saved fp, return address]`
//! at the address held by the frame pointer. It needs no maps and no tables,
//! only code built with frame pointers.

use super::UnwindReport;
use crate::{
    error::UnwindError,
    memory::{MemoryAccess, StackRange},
    types::{Arch, Frame, FrameFlags, RegisterContext},
};

/// Return addresses below this are treated as the end of the chain.
const MIN_RETURN_ADDRESS: u64 = 4096;

/// Walk the frame-pointer chain starting at `regs`.
///
/// Frame 0 is `regs.pc`. The walk stops when a record leaves the stack, is
/// misaligned, does not lie above the previous record, or holds a return
/// address below 4096. A return address equal to frame 0's pc is skipped;
/// repeated return addresses further up (recursion) are all kept.
pub fn frame_pointer_unwind(
    regs: &RegisterContext,
    memory: &dyn MemoryAccess,
    stack: StackRange,
    frames: &mut [Frame],
) -> UnwindReport
{
    let Some(first) = frames.first_mut() else {
        return UnwindReport::failed(0, UnwindError::MaxFramesExceeded);
    };
    *first = Frame::native(regs.pc, FrameFlags::NONE);
    walk_chain(regs.arch, regs.fp, memory, stack, frames, 1)
}

/// Continue a walk from the record at `fp`, writing after the first `count`
/// frames of `frames`.
pub(crate) fn walk_chain(
    arch: Arch,
    fp: u64,
    memory: &dyn MemoryAccess,
    stack: StackRange,
    frames: &mut [Frame],
    mut count: usize,
) -> UnwindReport
{
    let word = arch.word_size() as u64;
    let mut record = fp;
    let mut previous: Option<u64> = None;
    let first_pc = frames.first().filter(|_| count > 0).map(|f| f.pc);

    loop {
        if !stack.contains(record, 2 * word) || record % word != 0 || previous.is_some_and(|p| record <= p) {
            break;
        }
        let Some(return_address) = memory.read_word(record + word, arch) else {
            break;
        };
        if return_address < MIN_RETURN_ADDRESS {
            break;
        }
        // A leaf that has not pushed its record yet still sees its caller's.
        if first_pc != Some(return_address) {
            let Some(slot) = frames.get_mut(count) else {
                return UnwindReport::failed(count, UnwindError::MaxFramesExceeded);
            };
            *slot = Frame::native(return_address, FrameFlags::NONE);
            count += 1;
        }
        let Some(next) = memory.read_word(record, arch) else {
            break;
        };
        previous = Some(record);
        record = next;
    }
    UnwindReport::complete(count)
}
