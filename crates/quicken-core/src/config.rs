//! Runtime configuration.
//!
//! ## Environment Variables
//!
//! - `QUICKEN_CACHE_DIR`: directory holding table files (default: `quicken`
//!   under the system temp directory)
//! - `QUICKEN_MAX_FRAMES`: frame buffer size used by convenience unwinds
//!   (default: 256)

use std::env;
use std::path::PathBuf;

use tracing::warn;

use crate::error::{QuickenError, QuickenResult};
use crate::types::Arch;

/// Default frame budget of one unwind.
pub const DEFAULT_MAX_FRAMES: usize = 256;

/// Default number of consecutive failed generations before a library is
/// left without a table.
pub const DEFAULT_GENERATE_RETRY_LIMIT: u32 = 3;

/// Settings shared by the table manager and the unwinder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickenConfig
{
    /// Writable directory for table files
    pub cache_dir: PathBuf,
    /// Architecture tables are built and loaded for
    pub arch: Arch,
    /// Frame buffer size used by convenience unwinds
    pub max_frames: usize,
    /// Reparse the maps when a readable pc is not mapped
    pub update_maps_as_needed: bool,
    /// Step JIT code with in-memory tables
    pub jit_unwind: bool,
    /// Consecutive failed generations tolerated per library
    pub generate_retry_limit: u32,
    /// Step libraries without a file table using per-function in-memory
    /// tables instead of the frame-pointer chain
    pub in_memory_tables: bool,
}

impl QuickenConfig
{
    /// Defaults for the running architecture.
    ///
    /// ## Errors
    ///
    /// `QuickenError::UnsupportedArch` if the process runs on an architecture
    /// this crate does not know.
    pub fn new(cache_dir: impl Into<PathBuf>) -> QuickenResult<Self>
    {
        let arch = Arch::current().ok_or_else(|| QuickenError::UnsupportedArch(env::consts::ARCH.to_string()))?;
        Ok(Self::with_arch(cache_dir, arch))
    }

    /// Defaults for an explicit architecture.
    pub fn with_arch(cache_dir: impl Into<PathBuf>, arch: Arch) -> Self
    {
        Self {
            cache_dir: cache_dir.into(),
            arch,
            max_frames: DEFAULT_MAX_FRAMES,
            update_maps_as_needed: true,
            jit_unwind: false,
            generate_retry_limit: DEFAULT_GENERATE_RETRY_LIMIT,
            in_memory_tables: true,
        }
    }

    /// Read the configuration from the environment.
    ///
    /// An unparsable `QUICKEN_MAX_FRAMES` is ignored with a warning.
    ///
    /// ## Errors
    ///
    /// As [`QuickenConfig::new`].
    pub fn from_env() -> QuickenResult<Self>
    {
        let cache_dir = env::var_os("QUICKEN_CACHE_DIR")
            .map_or_else(|| env::temp_dir().join("quicken"), PathBuf::from);
        let mut config = Self::new(cache_dir)?;
        if let Ok(value) = env::var("QUICKEN_MAX_FRAMES") {
            match value.parse::<usize>() {
                Ok(frames) if frames > 0 => config.max_frames = frames,
                _ => warn!("ignoring invalid QUICKEN_MAX_FRAMES={value:?}"),
            }
        }
        Ok(config)
    }

    /// Create the cache directory if it does not exist yet.
    ///
    /// ## Errors
    ///
    /// `QuickenError::CacheDirUnavailable` if it cannot be created.
    pub fn ensure_cache_dir(&self) -> QuickenResult<()>
    {
        std::fs::create_dir_all(&self.cache_dir).map_err(|_| QuickenError::CacheDirUnavailable(self.cache_dir.clone()))
    }
}
