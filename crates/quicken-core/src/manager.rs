//! # Table Manager
//!
//! Persistent, content-addressed cache of QUT tables.
//!
//! Tables are stored in one directory:
//!
//! - `<soname>.<build_id>`: the canonical table file.
//! - `<soname>.hash.<hash>`: symlink to the canonical file, where `hash`
//!   identifies `(path, file size, elf start offset)` and can be checked
//!   without parsing the library.
//! - `<name>_malformed_<secs>`: quarantined files, kept for diagnosis.
//!
//! Each build id is in exactly one state: absent, requesting (a table must
//! be generated off the unwind path) or resident (loaded and shared).
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use quicken_core::manager::QutTableManager;
//! use quicken_core::types::Arch;
//!
//! let manager = QutTableManager::new("/data/local/tmp/qut", Arch::Arm64);
//! manager.generate_for_library(Path::new("/system/lib64/libc.so"), 0, false)?;
//! # Ok::<(), quicken_core::error::QuickenError>(())
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    elf::{soname_from_path, ElfImage},
    error::{QuickenError, QuickenResult, QutFileError},
    generator::{CfiTableGenerator, GenerationStats, TableGenerator},
    qut::QutSections,
    types::Arch,
};

/// Answer to a table request.
#[derive(Debug, Clone)]
pub enum TableRequest
{
    /// The table is resident.
    Ready(Arc<QutSections>),
    /// Generation has already been requested and not finished.
    Pending,
    /// No table exists; the library is now marked as requesting.
    NeedsGeneration,
}

/// A library waiting for its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest
{
    pub build_id: String,
    pub path: PathBuf,
    pub elf_start_offset: u64,
    pub hash: String,
}

/// Result of [`QutTableManager::generate_for_library`].
#[derive(Debug, Clone)]
pub struct GenerateOutcome
{
    /// Build id (possibly synthesized) the table is keyed by
    pub build_id: String,
    /// Statistics, if a new table was generated
    pub stats: Option<GenerationStats>,
}

impl GenerateOutcome
{
    /// Whether the generator ran.
    pub fn generated(&self) -> bool
    {
        self.stats.is_some()
    }
}

#[derive(Debug, Default)]
struct CacheState
{
    resident: HashMap<String, Arc<QutSections>>,
    requesting: HashMap<String, PendingRequest>,
    hash_to_build_id: HashMap<String, String>,
}

/// Owner of the table cache directory and the resident tables.
pub struct QutTableManager
{
    cache_dir: PathBuf,
    arch: Arch,
    state: Mutex<CacheState>,
    generate_lock: Mutex<()>,
    generator: Arc<dyn TableGenerator>,
    warmed_up: AtomicBool,
}

impl std::fmt::Debug for QutTableManager
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("QutTableManager")
            .field("cache_dir", &self.cache_dir)
            .field("arch", &self.arch)
            .field("warmed_up", &self.is_warmed_up())
            .finish_non_exhaustive()
    }
}

/// Key identifying a library file without parsing it.
pub fn library_hash(path: &Path, file_size: u64, elf_start_offset: u64) -> String
{
    let mut hasher = blake3::Hasher::new();
    hasher.update(path.as_os_str().as_encoded_bytes());
    hasher.update(&file_size.to_le_bytes());
    hasher.update(&elf_start_offset.to_le_bytes());
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

/// Build id used for images that carry none.
pub fn fake_build_id(path: &Path) -> String
{
    let hash = blake3::hash(path.as_os_str().as_encoded_bytes());
    format!("fake-{}", hex::encode(&hash.as_bytes()[..16]))
}

fn unix_seconds() -> u64
{
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl QutTableManager
{
    /// A manager for tables of `arch`, stored in `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>, arch: Arch) -> Self
    {
        Self::with_generator(cache_dir, arch, Arc::new(CfiTableGenerator))
    }

    /// Like [`QutTableManager::new`] with a custom table producer.
    pub fn with_generator(cache_dir: impl Into<PathBuf>, arch: Arch, generator: Arc<dyn TableGenerator>) -> Self
    {
        Self {
            cache_dir: cache_dir.into(),
            arch,
            state: Mutex::new(CacheState::default()),
            generate_lock: Mutex::new(()),
            generator,
            warmed_up: AtomicBool::new(false),
        }
    }

    pub fn cache_dir(&self) -> &Path
    {
        &self.cache_dir
    }

    pub fn arch(&self) -> Arch
    {
        self.arch
    }

    /// Path of the canonical table file.
    pub fn canonical_path(&self, soname: &str, build_id: &str) -> PathBuf
    {
        self.cache_dir.join(format!("{soname}.{build_id}"))
    }

    /// Path of the hash alias symlink.
    pub fn alias_path(&self, soname: &str, hash: &str) -> PathBuf
    {
        self.cache_dir.join(format!("{soname}.hash.{hash}"))
    }

    /// Whether a table is published under the hash alias.
    pub fn exists_with_hash(&self, soname: &str, hash: &str) -> bool
    {
        self.alias_path(soname, hash).exists()
    }

    /// Whether a canonical table file exists.
    pub fn exists_with_build_id(&self, soname: &str, build_id: &str) -> bool
    {
        self.canonical_path(soname, build_id).is_file()
    }

    /// Ask for the table of a library.
    ///
    /// Resident tables are returned directly. Otherwise the cached file is
    /// loaded and validated; a corrupt file is quarantined. Without a usable
    /// file the library is marked as requesting and `NeedsGeneration` is
    /// returned; generation itself is left to the caller.
    pub fn request_sections(
        &self,
        soname: &str,
        path: &Path,
        hash: &str,
        build_id: &str,
        elf_start_offset: u64,
    ) -> TableRequest
    {
        let mut state = self.state.lock();
        if let Some(sections) = state.resident.get(build_id) {
            return TableRequest::Ready(Arc::clone(sections));
        }
        if state.requesting.contains_key(build_id) {
            return TableRequest::Pending;
        }

        let canonical = self.canonical_path(soname, build_id);
        match self.load_file(&canonical) {
            Ok(sections) => {
                let sections = Arc::new(sections);
                state.resident.insert(build_id.to_string(), Arc::clone(&sections));
                debug!(path = %canonical.display(), entries = sections.entry_count(), "loaded quicken table");
                return TableRequest::Ready(sections);
            }
            Err(err) if err.is_corrupt() => self.quarantine(&canonical, &err),
            Err(QutFileError::OpenFailed { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %canonical.display(), "cannot read quicken table: {err}"),
        }

        state.requesting.insert(
            build_id.to_string(),
            PendingRequest {
                build_id: build_id.to_string(),
                path: path.to_path_buf(),
                elf_start_offset,
                hash: hash.to_string(),
            },
        );
        state
            .hash_to_build_id
            .insert(hash.to_string(), build_id.to_string());
        TableRequest::NeedsGeneration
    }

    /// Persist a table under its canonical name and publish the hash alias.
    ///
    /// A previous canonical file is quarantined, never deleted. On success
    /// the library leaves the requesting state.
    ///
    /// ## Errors
    ///
    /// Any I/O failure; the temporary file is removed.
    pub fn save_sections(
        &self,
        soname: &str,
        hash: &str,
        build_id: &str,
        sections: &QutSections,
    ) -> Result<PathBuf, QutFileError>
    {
        let mut state = self.state.lock();
        fs::create_dir_all(&self.cache_dir)?;

        let canonical = self.canonical_path(soname, build_id);
        let mut temp = canonical.clone().into_os_string();
        temp.push(format!("_temp_{}", unix_seconds()));
        let temp = PathBuf::from(temp);

        if let Err(err) = fs::write(&temp, sections.to_bytes()) {
            error!(path = %temp.display(), "failed to write quicken table: {err}");
            let _ = fs::remove_file(&temp);
            return Err(err.into());
        }

        if canonical.exists() {
            let retired = malformed_path(&canonical);
            if let Err(err) = fs::rename(&canonical, &retired) {
                let _ = fs::remove_file(&temp);
                return Err(err.into());
            }
        }
        if let Err(err) = fs::rename(&temp, &canonical) {
            let _ = fs::remove_file(&temp);
            return Err(err.into());
        }
        restrict_permissions(&canonical)?;
        self.publish_alias(soname, hash, build_id)?;

        state.requesting.remove(build_id);
        state.hash_to_build_id.insert(hash.to_string(), build_id.to_string());
        info!(
            path = %canonical.display(),
            entries = sections.entry_count(),
            table_rows = sections.tbl().len(),
            "saved quicken table"
        );
        Ok(canonical)
    }

    /// Make a table resident.
    ///
    /// ## Errors
    ///
    /// `InsertFailed` if a different table is already resident under the
    /// same build id. Resident tables are never replaced.
    pub fn publish(&self, build_id: &str, sections: Arc<QutSections>) -> Result<Arc<QutSections>, QutFileError>
    {
        let mut state = self.state.lock();
        if let Some(existing) = state.resident.get(build_id) {
            if **existing != *sections {
                return Err(QutFileError::InsertFailed(build_id.to_string()));
            }
            return Ok(Arc::clone(existing));
        }
        state.resident.insert(build_id.to_string(), Arc::clone(&sections));
        state.requesting.remove(build_id);
        Ok(sections)
    }

    /// Drop the requesting entry registered under `hash`.
    pub fn erase_requesting_by_hash(&self, hash: &str)
    {
        let mut state = self.state.lock();
        if let Some(build_id) = state.hash_to_build_id.remove(hash) {
            state.requesting.remove(&build_id);
        }
    }

    /// Libraries currently waiting for a table.
    pub fn requesting(&self) -> Vec<PendingRequest>
    {
        let state = self.state.lock();
        let mut pending: Vec<_> = state.requesting.values().cloned().collect();
        pending.sort_by(|a, b| a.path.cmp(&b.path).then(a.elf_start_offset.cmp(&b.elf_start_offset)));
        pending
    }

    /// Take every waiting library as `"path:offset"` and clear the set.
    pub fn consume_requesting(&self) -> Vec<String>
    {
        let mut state = self.state.lock();
        let mut consumed: Vec<_> = state
            .requesting
            .drain()
            .map(|(_, request)| format!("{}:{}", request.path.display(), request.elf_start_offset))
            .collect();
        consumed.sort();
        consumed
    }

    /// Generate and save the table for a library, unless one exists.
    ///
    /// Calls are serialized. With `only_save_file` the table is written to
    /// disk but not made resident.
    ///
    /// ## Errors
    ///
    /// Fails if the library cannot be parsed, its architecture differs from
    /// the manager's, generation is unsupported, or the table cannot be
    /// saved.
    pub fn generate_for_library(
        &self,
        sopath: &Path,
        elf_start_offset: u64,
        only_save_file: bool,
    ) -> QuickenResult<GenerateOutcome>
    {
        let _serialized = self.generate_lock.lock();
        let mut abandon = AbandonOnFailure {
            manager: self,
            path: sopath,
            elf_start_offset,
            active: true,
        };
        let outcome = self.generate_serialized(sopath, elf_start_offset, only_save_file)?;
        abandon.active = false;
        Ok(outcome)
    }

    fn generate_serialized(
        &self,
        sopath: &Path,
        elf_start_offset: u64,
        only_save_file: bool,
    ) -> QuickenResult<GenerateOutcome>
    {
        let soname = soname_from_path(sopath);
        let file_size = fs::metadata(sopath)?.len();
        let hash = library_hash(sopath, file_size, elf_start_offset);

        if only_save_file && self.exists_with_hash(&soname, &hash) {
            let known = self.state.lock().hash_to_build_id.get(&hash).cloned();
            if let Some(build_id) = known {
                self.erase_requesting_by_hash(&hash);
                return Ok(GenerateOutcome { build_id, stats: None });
            }
        }

        let image = ElfImage::open(sopath, elf_start_offset)?;
        if image.arch() != self.arch {
            return Err(QuickenError::ArchMismatch {
                expected: self.arch,
                found: image.arch(),
            });
        }
        let build_id = image
            .build_id()
            .map_or_else(|| fake_build_id(sopath), str::to_string);

        if self.exists_with_build_id(&soname, &build_id) {
            let canonical = self.canonical_path(&soname, &build_id);
            match self.load_file(&canonical) {
                Ok(sections) => {
                    self.publish_alias(&soname, &hash, &build_id)?;
                    {
                        let mut state = self.state.lock();
                        state.requesting.remove(&build_id);
                        state.hash_to_build_id.insert(hash, build_id.clone());
                    }
                    if !only_save_file {
                        self.publish(&build_id, Arc::new(sections))?;
                    }
                    debug!(path = %canonical.display(), "quicken table already cached");
                    return Ok(GenerateOutcome { build_id, stats: None });
                }
                Err(err) if err.is_corrupt() => self.quarantine(&canonical, &err),
                Err(err) => return Err(err.into()),
            }
        }

        let (sections, stats) = self.generator.generate(&image)?;
        self.save_sections(&soname, &hash, &build_id, &sections)?;
        if !only_save_file {
            self.publish(&build_id, Arc::new(sections))?;
        }
        Ok(GenerateOutcome {
            build_id,
            stats: Some(stats),
        })
    }

    /// Return every requesting entry of `(path, elf_start_offset)` to absent.
    fn abandon_requesting(&self, path: &Path, elf_start_offset: u64)
    {
        let mut state = self.state.lock();
        let CacheState {
            requesting,
            hash_to_build_id,
            ..
        } = &mut *state;
        let mut abandoned = Vec::new();
        requesting.retain(|build_id, request| {
            let keep = request.path != path || request.elf_start_offset != elf_start_offset;
            if !keep {
                abandoned.push(build_id.clone());
            }
            keep
        });
        hash_to_build_id.retain(|_, build_id| !abandoned.contains(build_id));
    }

    /// Load and validate the cached table of a library without making it
    /// resident.
    ///
    /// ## Errors
    ///
    /// Fails if the library cannot be parsed or the cached file is missing
    /// or invalid. Invalid files are left in place.
    pub fn test_load(&self, sopath: &Path, elf_start_offset: u64) -> QuickenResult<QutSections>
    {
        let image = ElfImage::open(sopath, elf_start_offset)?;
        let build_id = image
            .build_id()
            .map_or_else(|| fake_build_id(sopath), str::to_string);
        let canonical = self.canonical_path(&soname_from_path(sopath), &build_id);
        Ok(self.load_file(&canonical)?)
    }

    /// A background warm-up finished generating the table of a library.
    pub fn notify_warmed_up(&self, sopath: &Path, elf_start_offset: u64)
    {
        let Ok(metadata) = fs::metadata(sopath) else {
            return;
        };
        let hash = library_hash(sopath, metadata.len(), elf_start_offset);
        if self.exists_with_hash(&soname_from_path(sopath), &hash) {
            self.erase_requesting_by_hash(&hash);
        }
    }

    /// Record that the process-wide warm-up pass has completed.
    pub fn mark_warmed_up(&self)
    {
        self.warmed_up.store(true, Ordering::Release);
    }

    pub fn is_warmed_up(&self) -> bool
    {
        self.warmed_up.load(Ordering::Acquire)
    }

    /// Read and validate a table file.
    pub fn load_file(&self, path: &Path) -> Result<QutSections, QutFileError>
    {
        let bytes = fs::read(path).map_err(|source| QutFileError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        QutSections::from_bytes(&bytes, self.arch)
    }

    fn quarantine(&self, path: &Path, reason: &QutFileError)
    {
        let target = malformed_path(path);
        match fs::rename(path, &target) {
            Ok(()) => warn!(path = %path.display(), quarantined = %target.display(), "rejected quicken table: {reason}"),
            Err(err) => error!(path = %path.display(), "failed to quarantine quicken table: {err}"),
        }
    }

    fn publish_alias(&self, soname: &str, hash: &str, build_id: &str) -> Result<(), QutFileError>
    {
        let alias = self.alias_path(soname, hash);
        if fs::symlink_metadata(&alias).is_ok() {
            fs::remove_file(&alias)?;
        }
        link_alias(Path::new(&format!("{soname}.{build_id}")), &self.canonical_path(soname, build_id), &alias)?;
        Ok(())
    }
}

/// Clears the requesting state of a library unless generation succeeded, so
/// a failed generation can be requested again later.
struct AbandonOnFailure<'m>
{
    manager: &'m QutTableManager,
    path: &'m Path,
    elf_start_offset: u64,
    active: bool,
}

impl Drop for AbandonOnFailure<'_>
{
    fn drop(&mut self)
    {
        if self.active {
            debug!(path = %self.path.display(), "table generation failed, request abandoned");
            self.manager.abandon_requesting(self.path, self.elf_start_offset);
        }
    }
}

fn malformed_path(path: &Path) -> PathBuf
{
    let mut name = path.as_os_str().to_owned();
    name.push(format!("_malformed_{}", unix_seconds()));
    PathBuf::from(name)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()>
{
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()>
{
    Ok(())
}

#[cfg(unix)]
fn link_alias(relative_target: &Path, _canonical: &Path, alias: &Path) -> std::io::Result<()>
{
    std::os::unix::fs::symlink(relative_target, alias)
}

#[cfg(not(unix))]
fn link_alias(_relative_target: &Path, canonical: &Path, alias: &Path) -> std::io::Result<()>
{
    fs::copy(canonical, alias).map(|_| ())
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::qut::sections::SectionsBuilder;

    fn sample_sections() -> QutSections
    {
        let mut builder = SectionsBuilder::new(Arch::Arm64);
        builder.push(0x1000, Some(&[0x81]));
        builder.push(0x1100, Some(&[0x0c, 0xdc, 0xea, 0xa2, 0x97, 0xff, 0x80, 0x20, 0x42]));
        builder.push_gap(0x1200);
        builder.finish()
    }

    #[test]
    fn test_request_then_save_then_resident()
    {
        let dir = tempfile::tempdir().unwrap();
        let manager = QutTableManager::new(dir.path(), Arch::Arm64);
        let lib = Path::new("/lib/liba.so");

        assert!(matches!(
            manager.request_sections("liba.so", lib, "h1", "b1", 0),
            TableRequest::NeedsGeneration
        ));
        assert!(matches!(
            manager.request_sections("liba.so", lib, "h1", "b1", 0),
            TableRequest::Pending
        ));
        assert_eq!(manager.requesting().len(), 1);

        let sections = sample_sections();
        manager.save_sections("liba.so", "h1", "b1", &sections).unwrap();
        assert!(manager.requesting().is_empty());
        assert!(manager.exists_with_build_id("liba.so", "b1"));
        assert!(manager.exists_with_hash("liba.so", "h1"));

        match manager.request_sections("liba.so", lib, "h1", "b1", 0) {
            TableRequest::Ready(loaded) => assert_eq!(*loaded, sections),
            other => panic!("expected resident table, got {other:?}"),
        }
    }

    #[test]
    fn test_resave_retires_previous_file()
    {
        let dir = tempfile::tempdir().unwrap();
        let manager = QutTableManager::new(dir.path(), Arch::Arm64);
        manager.save_sections("liba.so", "h1", "b1", &sample_sections()).unwrap();
        manager.save_sections("liba.so", "h1", "b1", &sample_sections()).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.starts_with("liba.so.b1_malformed_")));
        assert!(names.iter().any(|n| n == "liba.so.b1"));
        assert!(!names.iter().any(|n| n.contains("_temp_")));
    }

    #[test]
    fn test_consume_and_erase_requesting()
    {
        let dir = tempfile::tempdir().unwrap();
        let manager = QutTableManager::new(dir.path(), Arch::Arm64);
        manager.request_sections("liba.so", Path::new("/lib/liba.so"), "h1", "b1", 0);
        manager.request_sections("libb.so", Path::new("/app/base.apk"), "h2", "b2", 4096);

        manager.erase_requesting_by_hash("h1");
        assert_eq!(manager.consume_requesting(), vec!["/app/base.apk:4096".to_string()]);
        assert!(manager.requesting().is_empty());
    }

    #[test]
    fn test_failed_generation_returns_to_absent()
    {
        let dir = tempfile::tempdir().unwrap();
        let library = dir.path().join("libbad.so");
        fs::write(&library, b"not an elf image").unwrap();
        let manager = QutTableManager::new(dir.path().join("cache"), Arch::Arm64);

        assert!(matches!(
            manager.request_sections("libbad.so", &library, "h1", "b1", 0),
            TableRequest::NeedsGeneration
        ));
        assert!(manager.generate_for_library(&library, 0, false).is_err());
        assert!(manager.requesting().is_empty());
        assert!(matches!(
            manager.request_sections("libbad.so", &library, "h1", "b1", 0),
            TableRequest::NeedsGeneration
        ));
    }

    #[test]
    fn test_failed_generation_keeps_other_requests()
    {
        let dir = tempfile::tempdir().unwrap();
        let library = dir.path().join("libbad.so");
        fs::write(&library, b"not an elf image").unwrap();
        let manager = QutTableManager::new(dir.path().join("cache"), Arch::Arm64);
        manager.request_sections("libbad.so", &library, "h1", "b1", 0);
        manager.request_sections("libbad.so", &library, "h2", "b2", 4096);

        assert!(manager.generate_for_library(&library, 0, false).is_err());
        let pending = manager.requesting();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].elf_start_offset, 4096);
    }

    #[test]
    fn test_publish_refuses_conflicting_table()
    {
        let dir = tempfile::tempdir().unwrap();
        let manager = QutTableManager::new(dir.path(), Arch::Arm64);
        manager.publish("b1", Arc::new(sample_sections())).unwrap();
        manager.publish("b1", Arc::new(sample_sections())).unwrap();
        let other = QutSections::from_raw(Arch::Arm64, vec![0, 0], vec![]);
        assert!(matches!(
            manager.publish("b1", Arc::new(other)),
            Err(QutFileError::InsertFailed(_))
        ));
    }

    #[test]
    fn test_hash_and_fake_build_id_shapes()
    {
        let hash = library_hash(Path::new("/lib/liba.so"), 100, 0);
        assert_eq!(hash.len(), 32);
        assert_ne!(hash, library_hash(Path::new("/lib/liba.so"), 100, 4096));
        let fake = fake_build_id(Path::new("/lib/liba.so"));
        assert!(fake.starts_with("fake-"));
        assert_eq!(fake.len(), 37);
    }
}
