//! Tests for the table cache

mod common;

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use quicken_core::elf::ElfImage;
use quicken_core::generator::{CfiTableGenerator, GenerationStats, TableGenerator};
use quicken_core::manager::{fake_build_id, library_hash, TableRequest};
use quicken_core::{Arch, QuickenError, QuickenResult, QutSections, QutTableManager};

#[derive(Default)]
struct CountingGenerator
{
    calls: AtomicUsize,
}

impl TableGenerator for CountingGenerator
{
    fn generate(&self, image: &ElfImage) -> QuickenResult<(QutSections, GenerationStats)>
    {
        self.calls.fetch_add(1, Ordering::SeqCst);
        CfiTableGenerator.generate(image)
    }
}

fn hash_of(path: &Path) -> String
{
    let size = fs::metadata(path).unwrap().len();
    library_hash(path, size, 0)
}

fn malformed_files(dir: &Path) -> Vec<String>
{
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains("_malformed_"))
        .collect()
}

#[test]
fn test_generation_is_idempotent()
{
    let libs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let library = common::write_arm64_library(libs.path(), "liba.so", true);

    let generator = Arc::new(CountingGenerator::default());
    let manager = QutTableManager::with_generator(cache.path(), Arch::Arm64, generator.clone());

    let first = manager.generate_for_library(&library, 0, false).unwrap();
    assert!(first.generated());
    let second = manager.generate_for_library(&library, 0, false).unwrap();
    assert!(!second.generated());
    assert_eq!(first.build_id, second.build_id);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

    // A new process finds the file on disk.
    let generator = Arc::new(CountingGenerator::default());
    let restarted = QutTableManager::with_generator(cache.path(), Arch::Arm64, generator.clone());
    let third = restarted.generate_for_library(&library, 0, true).unwrap();
    assert!(!third.generated());
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_generated_table_is_resident_and_aliased()
{
    let libs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let library = common::write_arm64_library(libs.path(), "liba.so", true);
    let manager = QutTableManager::new(cache.path(), Arch::Arm64);

    let outcome = manager.generate_for_library(&library, 0, false).unwrap();
    let hash = hash_of(&library);
    assert!(manager.exists_with_build_id("liba.so", &outcome.build_id));
    assert!(manager.exists_with_hash("liba.so", &hash));

    match manager.request_sections("liba.so", &library, &hash, &outcome.build_id, 0) {
        TableRequest::Ready(sections) => {
            assert_eq!(sections.arch(), Arch::Arm64);
            assert!(sections.find_command(common::FUNCTION_START + 0x10).is_some());
        }
        _ => panic!("expected a resident table"),
    }
    assert!(manager.requesting().is_empty());
}

#[test]
fn test_saved_file_round_trips()
{
    let libs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let library = common::write_arm64_library(libs.path(), "liba.so", true);
    let manager = QutTableManager::new(cache.path(), Arch::Arm64);

    let outcome = manager.generate_for_library(&library, 0, true).unwrap();
    let canonical = manager.canonical_path("liba.so", &outcome.build_id);
    let loaded = manager.load_file(&canonical).unwrap();

    assert_eq!(fs::read(&canonical).unwrap(), loaded.to_bytes());
    assert_eq!(manager.test_load(&library, 0).unwrap(), loaded);
}

#[test]
fn test_truncated_file_is_quarantined()
{
    let libs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let library = common::write_arm64_library(libs.path(), "liba.so", true);

    let build_id = QutTableManager::new(cache.path(), Arch::Arm64)
        .generate_for_library(&library, 0, true)
        .unwrap()
        .build_id;

    let manager = QutTableManager::new(cache.path(), Arch::Arm64);
    let canonical = manager.canonical_path("liba.so", &build_id);
    let bytes = fs::read(&canonical).unwrap();
    fs::write(&canonical, &bytes[..10]).unwrap();

    let hash = hash_of(&library);
    assert!(matches!(
        manager.request_sections("liba.so", &library, &hash, &build_id, 0),
        TableRequest::NeedsGeneration
    ));
    assert!(!canonical.exists());
    assert_eq!(malformed_files(cache.path()).len(), 1);
    assert_eq!(manager.requesting().len(), 1);

    // Regeneration replaces the quarantined file and clears the request.
    let outcome = manager.generate_for_library(&library, 0, false).unwrap();
    assert!(outcome.generated());
    assert!(manager.requesting().is_empty());
    assert!(matches!(
        manager.request_sections("liba.so", &library, &hash, &build_id, 0),
        TableRequest::Ready(_)
    ));
}

#[test]
fn test_checksum_mismatch_is_quarantined()
{
    let libs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let library = common::write_arm64_library(libs.path(), "liba.so", true);
    let manager = QutTableManager::new(cache.path(), Arch::Arm64);

    let build_id = manager.generate_for_library(&library, 0, true).unwrap().build_id;
    let canonical = manager.canonical_path("liba.so", &build_id);
    let mut bytes = fs::read(&canonical).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&canonical, &bytes).unwrap();

    let err = manager.load_file(&canonical).unwrap_err();
    assert!(err.is_corrupt());
    assert!(matches!(
        manager.request_sections("liba.so", &library, &hash_of(&library), &build_id, 0),
        TableRequest::NeedsGeneration
    ));
    assert_eq!(malformed_files(cache.path()).len(), 1);
}

#[test]
fn test_rejects_library_of_other_arch()
{
    let libs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let library = common::write_arm64_library(libs.path(), "liba.so", true);
    let manager = QutTableManager::new(cache.path(), Arch::Arm);

    let err = manager.generate_for_library(&library, 0, false).unwrap_err();
    assert!(matches!(
        err,
        QuickenError::ArchMismatch {
            expected: Arch::Arm,
            found: Arch::Arm64
        }
    ));
}

#[test]
fn test_exidx_only_library_gets_a_table()
{
    let libs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let library = common::write_arm_library(libs.path(), "libarm.so");
    let manager = QutTableManager::new(cache.path(), Arch::Arm);

    let outcome = manager.generate_for_library(&library, 0, false).unwrap();
    let stats = outcome.stats.unwrap();
    assert_eq!(stats.fdes, 0);
    assert_eq!(stats.exidx_entries, 2);

    let sections = manager.test_load(&library, 0).unwrap();
    assert!(sections.find_command(common::FUNCTION_START + 4).is_some());
}

#[test]
fn test_library_without_build_id_is_keyed_by_path()
{
    let libs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let library = common::write_arm64_library(libs.path(), "libnoid.so", true);
    assert!(ElfImage::open(&library, 0).unwrap().build_id().is_none());
    let manager = QutTableManager::new(cache.path(), Arch::Arm64);

    let outcome = manager.generate_for_library(&library, 0, false).unwrap();
    assert_eq!(outcome.build_id, fake_build_id(&library));
    assert!(manager.exists_with_build_id("libnoid.so", &outcome.build_id));
}
