//! Stack frame types.

use std::ops::BitOr;

/// Attribute bits attached to a recorded frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameFlags(u8);

impl FrameFlags
{
    /// No attributes.
    pub const NONE: Self = Self(0);
    /// The pc lies in code that may belong to the managed runtime
    /// (compiled app code, boot images, JIT cache).
    pub const MAYBE_JAVA: Self = Self(1);

    /// Whether all bits of `other` are set.
    pub const fn contains(self, other: Self) -> bool
    {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u8
    {
        self.0
    }
}

impl BitOr for FrameFlags
{
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self
    {
        Self(self.0 | rhs.0)
    }
}

/// One recorded frame. Index 0 of a backtrace is the innermost frame.
///
/// For native frames `pc` is the adjusted absolute address (pointing into the
/// call instruction). For dex frames it is the interpreter's dex pc.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Frame
{
    /// Program counter or dex pc
    pub pc: u64,
    /// Whether `pc` is a dex pc rather than a native address
    pub is_dex_pc: bool,
    /// Frame attributes
    pub flags: FrameFlags,
}

impl Frame
{
    /// A native frame.
    pub const fn native(pc: u64, flags: FrameFlags) -> Self
    {
        Self {
            pc,
            is_dex_pc: false,
            flags,
        }
    }

    /// A managed-runtime frame carrying a dex pc.
    pub const fn dex(dex_pc: u64) -> Self
    {
        Self {
            pc: dex_pc,
            is_dex_pc: true,
            flags: FrameFlags::MAYBE_JAVA,
        }
    }

    /// Whether the frame may belong to managed code.
    pub const fn maybe_java(&self) -> bool
    {
        self.flags.contains(FrameFlags::MAYBE_JAVA)
    }
}
