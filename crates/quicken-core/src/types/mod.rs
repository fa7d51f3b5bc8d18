//! # Types
//!
//! Architecture-aware value types shared by every unwind strategy.
//!
//! These types keep the rest of the crate free of `cfg(target_arch)` noise:
//! the register context knows which physical registers its generic slots
//! stand for, and [`Arch`] carries word sizes and table tags.

pub mod arch;
pub mod frame;
pub mod registers;

// Re-export all public types
pub use arch::Arch;
pub use frame::{Frame, FrameFlags};
pub use registers::RegisterContext;
