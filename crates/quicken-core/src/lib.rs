//! # quicken-core
//!
//! On-device stack unwinding for Android-style processes.
//!
//! This crate provides:
//! - Memory map parsing and pc-to-library resolution ([`maps`])
//! - Generation of compact Quicken Unwind Tables (QUT) from DWARF CFI
//!   ([`generator`], [`qut`])
//! - A file cache for those tables with quarantine of corrupt files
//!   ([`manager`])
//! - An unwind driver with frame-pointer, DWARF-based and table-based
//!   stepping ([`unwind`], [`modes`])
//! - Lazy symbolication of recorded frames ([`detail`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use quicken_core::{QuickenConfig, Unwinder, UnwindMode};
//!
//! let unwinder = Unwinder::new(QuickenConfig::from_env()?)?;
//! unwinder.set_mode(UnwindMode::DwarfBased);
//! # Ok::<(), quicken_core::QuickenError>(())
//! ```
//!
//! ## Why unsafe code is needed
//!
//! Guarded memory reads go through `process_vm_readv(2)`, thread stack bounds
//! come from pthread attributes, and register capture uses inline assembly.
//! Each use is wrapped in a safe function.

#![allow(unsafe_code)] // Required for libc calls and register capture

pub mod config;
pub mod detail;
pub mod elf;
pub mod error;
pub mod exidx;
pub mod generator;
pub mod interface;
pub mod manager;
pub mod maps;
pub mod memory;
pub mod modes;
pub mod qut;
pub mod types;
pub mod unwind;

// Re-export commonly used types
pub use config::QuickenConfig;
pub use detail::FrameDetail;
pub use error::{QuickenError, QuickenResult, QutFileError, UnwindError};
pub use manager::QutTableManager;
pub use maps::Maps;
pub use modes::{UnwindMode, Unwinder};
pub use qut::QutSections;
pub use types::{Arch, Frame, FrameFlags, RegisterContext};
pub use unwind::UnwindReport;
