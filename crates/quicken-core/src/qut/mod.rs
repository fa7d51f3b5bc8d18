//! # Quicken Unwind Tables
//!
//! A compact, precomputed encoding of DWARF call frame information.
//!
//! A table has two word arrays:
//!
//! - `quidx`: pairs `[function_start, command]` sorted by relative pc.
//! - `qutbl`: rows of bytecode for entries too long to inline in `quidx`.
//!
//! Each entry is a short bytecode program that recovers the caller's cfa, pc
//! and a handful of callee-saved registers. [`instructions`] defines the
//! opcodes and compiles intermediate instructions into bytes, [`sections`]
//! packs entries into words and (de)serializes table files, and [`decode`]
//! evaluates an entry against a register context.

pub mod decode;
pub mod instructions;
pub mod sections;

pub use decode::{StepContext, StepOutcome};
pub use instructions::{encode, EncodeError, EncodedEntry, InstructionList, QutInstruction, QutOp};
pub use sections::{QutSections, QUT_VERSION};
