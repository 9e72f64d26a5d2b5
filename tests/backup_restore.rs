use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Error;

use frost::progress::LogProgress;
use frost::restore::{OverwritePolicy, RestoreOptions};
use frost::{backup, restore, ExcludeList};
use frost_datastore::compression::Compressor;
use frost_datastore::index_file::IndexFile;
use frost_key_config::KeyFactory;

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("frost-it-{}-{}", std::process::id(), name));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

// small deterministic generator, so runs are reproducible
fn pseudo_random(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        out.extend_from_slice(&seed.to_le_bytes());
    }
    out.truncate(len);
    out
}

fn build_source_tree(source: &Path) {
    std::fs::write(
        source.join("basicFile.txt"),
        b"This is a very basic file content",
    )
    .unwrap();
    std::fs::write(source.join("smallFile.txt"), pseudo_random(1024, 1)).unwrap();

    // a larger file whose second half is a shifted copy of its first half
    let half = pseudo_random(1024 * 1024, 2);
    let mut big = half.clone();
    big.extend_from_slice(&half[3..]);
    big.extend_from_slice(&half[..3]);
    std::fs::write(source.join("bigFile.bin"), &big).unwrap();

    std::os::unix::fs::symlink("basicFile.txt", source.join("symLink.txt")).unwrap();

    std::fs::create_dir(source.join("subDir")).unwrap();
    std::fs::write(source.join("subDir/nested.txt"), b"nested content").unwrap();
    std::fs::hard_link(source.join("basicFile.txt"), source.join("subDir/hardLink.txt")).unwrap();
}

fn default_options() -> backup::BackupOptions {
    backup::BackupOptions {
        compressor: Compressor::Zlib,
        multichunk_size: 64 * 1024, // small, to force several multichunks
        entropy_threshold: 1.0,
        excludes: ExcludeList::default(),
    }
}

fn run_backup(
    index_path: &Path,
    keys: &KeyFactory,
    source: &Path,
    remote: &Path,
    options: &backup::BackupOptions,
) -> backup::BackupStats {
    let mut index = if index_path.exists() {
        IndexFile::open(index_path, true).unwrap()
    } else {
        IndexFile::create_new(index_path, &[7u8; 108], &source.display().to_string()).unwrap()
    };
    backup::backup_folder(&mut index, keys, source, remote, options, &mut LogProgress).unwrap()
}

fn run_restore(index_path: &Path, keys: &KeyFactory, remote: &Path, dest: &Path, revision: u32) {
    let index = IndexFile::open(index_path, false).unwrap();
    let options = RestoreOptions {
        overwrite: OverwritePolicy::Yes,
        cache_size: 8 * 1024 * 1024,
    };
    restore::restore_backup(&index, keys, remote, dest, revision, &options, &mut LogProgress)
        .unwrap();
}

#[derive(Debug, PartialEq, Eq)]
enum Snapshot {
    File { content: Vec<u8>, mode: u32, mtime: (i64, i64) },
    Dir { mode: u32 },
    Link { target: PathBuf },
}

// everything `diff -ur` would see, plus mode and mtime
fn snapshot_tree(root: &Path) -> BTreeMap<PathBuf, Snapshot> {
    use std::os::unix::fs::MetadataExt;
    let mut map = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.unwrap();
        let rel = entry.path().strip_prefix(root).unwrap().to_path_buf();
        if rel.as_os_str().is_empty() {
            continue;
        }
        let meta = std::fs::symlink_metadata(entry.path()).unwrap();
        let snap = if meta.file_type().is_symlink() {
            Snapshot::Link {
                target: std::fs::read_link(entry.path()).unwrap(),
            }
        } else if meta.is_dir() {
            Snapshot::Dir {
                mode: meta.mode() & 0o7777,
            }
        } else {
            Snapshot::File {
                content: std::fs::read(entry.path()).unwrap(),
                mode: meta.mode() & 0o7777,
                mtime: (meta.mtime(), meta.mtime_nsec()),
            }
        };
        map.insert(rel, snap);
    }
    map
}

#[test]
fn round_trip_preserves_the_tree() -> Result<(), Error> {
    let base = scratch("roundtrip");
    let source = base.join("source");
    let remote = base.join("remote");
    let dest = base.join("restored");
    std::fs::create_dir_all(&source)?;
    std::fs::create_dir_all(&remote)?;
    build_source_tree(&source);

    let keys = KeyFactory::with_master_key([11u8; 32]);
    let index_path = remote.join("index.frost");

    let stats = run_backup(&index_path, &keys, &source, &remote, &default_options());
    assert!(stats.committed);
    assert_eq!(stats.revision, 1);
    assert!(stats.file_count >= 5);
    assert!(stats.output_bytes > 0);

    run_restore(&index_path, &keys, &remote, &dest, 1);

    assert_eq!(snapshot_tree(&source), snapshot_tree(&dest));

    std::fs::remove_dir_all(&base)?;
    Ok(())
}

#[test]
fn unchanged_backup_records_no_revision() -> Result<(), Error> {
    let base = scratch("idempotent");
    let source = base.join("source");
    let remote = base.join("remote");
    std::fs::create_dir_all(&source)?;
    std::fs::create_dir_all(&remote)?;
    build_source_tree(&source);

    let keys = KeyFactory::with_master_key([12u8; 32]);
    let index_path = remote.join("index.frost");

    let first = run_backup(&index_path, &keys, &source, &remote, &default_options());
    assert!(first.committed);

    let second = run_backup(&index_path, &keys, &source, &remote, &default_options());
    assert!(!second.committed);

    let index = IndexFile::open(&index_path, false)?;
    assert_eq!(index.current_revision(), 1);
    assert_eq!(index.catalogs().len(), 1);

    std::fs::remove_dir_all(&base)?;
    Ok(())
}

#[test]
fn identical_content_is_stored_once() -> Result<(), Error> {
    let base = scratch("dedup");
    let source = base.join("source");
    let remote = base.join("remote");
    std::fs::create_dir_all(&source)?;
    std::fs::create_dir_all(&remote)?;

    let payload = pseudo_random(200 * 1024, 5);
    std::fs::write(source.join("file_a.bin"), &payload)?;
    std::fs::write(source.join("file_b.bin"), &payload)?;

    let keys = KeyFactory::with_master_key([13u8; 32]);
    let index_path = remote.join("index.frost");

    // no compression, so on-disk size shows deduplication directly
    let options = backup::BackupOptions {
        compressor: Compressor::None,
        multichunk_size: 64 * 1024,
        entropy_threshold: 1.0,
        excludes: ExcludeList::default(),
    };
    run_backup(&index_path, &keys, &source, &remote, &options);

    let multichunk_bytes: u64 = std::fs::read_dir(&remote)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".#"))
        .map(|entry| entry.metadata().unwrap().len())
        .sum();

    // both files reference the same chunks: one physical copy plus headers
    assert!(
        multichunk_bytes < payload.len() as u64 + 32 * 1024,
        "multichunks hold {} bytes for a {} byte payload",
        multichunk_bytes,
        payload.len()
    );

    let dest = base.join("restored");
    run_restore(&index_path, &keys, &remote, &dest, 1);
    assert_eq!(std::fs::read(dest.join("file_a.bin"))?, payload);
    assert_eq!(std::fs::read(dest.join("file_b.bin"))?, payload);

    std::fs::remove_dir_all(&base)?;
    Ok(())
}

#[test]
fn revisions_track_deletions() -> Result<(), Error> {
    let base = scratch("revisions");
    let source = base.join("source");
    let remote = base.join("remote");
    std::fs::create_dir_all(&source)?;
    std::fs::create_dir_all(&remote)?;
    build_source_tree(&source);

    let keys = KeyFactory::with_master_key([14u8; 32]);
    let index_path = remote.join("index.frost");

    run_backup(&index_path, &keys, &source, &remote, &default_options());

    std::fs::remove_file(source.join("smallFile.txt"))?;
    let second = run_backup(&index_path, &keys, &source, &remote, &default_options());
    assert!(second.committed);
    assert_eq!(second.revision, 2);

    let index = IndexFile::open(&index_path, false)?;
    assert_eq!(index.catalogs().len(), 2);

    let mut listing = Vec::new();
    let count = frost::list_backups(
        &index,
        frost::TimeRange::default(),
        false,
        &mut listing,
    )?;
    assert_eq!(count, 2);
    let listing = String::from_utf8(listing)?;
    assert!(listing.contains("Revision 1"));
    assert!(listing.contains("Revision 2"));
    drop(index);

    let dest1 = base.join("restored1");
    run_restore(&index_path, &keys, &remote, &dest1, 1);
    assert!(dest1.join("smallFile.txt").exists());

    let dest2 = base.join("restored2");
    run_restore(&index_path, &keys, &remote, &dest2, 2);
    assert!(!dest2.join("smallFile.txt").exists());

    std::fs::remove_dir_all(&base)?;
    Ok(())
}

#[test]
fn zstd_round_trip_compresses_structured_data() -> Result<(), Error> {
    let base = scratch("zstd");
    let source = base.join("source");
    let remote = base.join("remote");
    std::fs::create_dir_all(&source)?;
    std::fs::create_dir_all(&remote)?;

    // half random, half derived from it: compressible but not trivial
    let random_half = pseudo_random(8 * 1024 * 1024, 21);
    let mut payload = random_half.clone();
    for chunk in random_half.chunks(4096) {
        payload.extend_from_slice(&chunk[..chunk.len() / 2]);
        payload.extend_from_slice(&chunk[..chunk.len() / 2]);
    }
    std::fs::write(source.join("structured.bin"), &payload)?;

    let keys = KeyFactory::with_master_key([15u8; 32]);
    let index_path = remote.join("index.frost");

    let options = backup::BackupOptions {
        compressor: Compressor::Zstd,
        multichunk_size: 25 * 1024 * 1024,
        entropy_threshold: 1.0,
        excludes: ExcludeList::default(),
    };
    let stats = run_backup(&index_path, &keys, &source, &remote, &options);
    assert!(stats.committed);
    // compressed and encrypted output is smaller than the input
    assert!(
        stats.output_bytes < payload.len() as u64,
        "{} >= {}",
        stats.output_bytes,
        payload.len()
    );

    let dest = base.join("restored");
    run_restore(&index_path, &keys, &remote, &dest, 1);
    assert_eq!(std::fs::read(dest.join("structured.bin"))?, payload);

    std::fs::remove_dir_all(&base)?;
    Ok(())
}

#[test]
fn overwrite_policy_no_keeps_existing_files() -> Result<(), Error> {
    let base = scratch("overwrite");
    let source = base.join("source");
    let remote = base.join("remote");
    let dest = base.join("restored");
    std::fs::create_dir_all(&source)?;
    std::fs::create_dir_all(&remote)?;
    std::fs::create_dir_all(&dest)?;
    std::fs::write(source.join("keep.txt"), b"backed up")?;

    let keys = KeyFactory::with_master_key([16u8; 32]);
    let index_path = remote.join("index.frost");
    run_backup(&index_path, &keys, &source, &remote, &default_options());

    std::fs::write(dest.join("keep.txt"), b"local version")?;

    let index = IndexFile::open(&index_path, false)?;
    let options = RestoreOptions {
        overwrite: OverwritePolicy::No,
        cache_size: 1024 * 1024,
    };
    restore::restore_backup(&index, &keys, &remote, &dest, 1, &options, &mut LogProgress)?;
    assert_eq!(std::fs::read(dest.join("keep.txt"))?, b"local version");

    let options = RestoreOptions {
        overwrite: OverwritePolicy::Yes,
        cache_size: 1024 * 1024,
    };
    restore::restore_backup(&index, &keys, &remote, &dest, 1, &options, &mut LogProgress)?;
    assert_eq!(std::fs::read(dest.join("keep.txt"))?, b"backed up");

    std::fs::remove_dir_all(&base)?;
    Ok(())
}

#[test]
fn exclusion_rules_shape_the_revision() -> Result<(), Error> {
    let base = scratch("exclude");
    let source = base.join("source");
    let remote = base.join("remote");
    std::fs::create_dir_all(&source)?;
    std::fs::create_dir_all(&remote)?;

    std::fs::create_dir(source.join("subDir"))?;
    std::fs::write(source.join("keep.txt"), b"keep me")?;
    std::fs::write(source.join("scratch.tmp"), b"drop me")?;
    std::fs::write(source.join("subDir/other.txt"), b"drop me too")?;
    std::fs::write(source.join("subDir/important"), b"rescued by the include list")?;

    let exclude_file = base.join("rules.exc");
    std::fs::write(&exclude_file, "subDir/\nr/\\.tmp$\n")?;
    let include_file = base.join("rules.inc");
    std::fs::write(&include_file, "subDir/important\n")?;

    let keys = KeyFactory::with_master_key([19u8; 32]);
    let index_path = remote.join("index.frost");
    let options = backup::BackupOptions {
        compressor: Compressor::Zlib,
        multichunk_size: 64 * 1024,
        entropy_threshold: 1.0,
        excludes: ExcludeList::load(Some(&exclude_file), Some(&include_file))?,
    };
    run_backup(&index_path, &keys, &source, &remote, &options);

    let dest = base.join("restored");
    run_restore(&index_path, &keys, &remote, &dest, 1);

    assert!(dest.join("keep.txt").exists());
    assert!(dest.join("subDir/important").exists());
    assert!(!dest.join("scratch.tmp").exists());
    assert!(!dest.join("subDir/other.txt").exists());

    std::fs::remove_dir_all(&base)?;
    Ok(())
}

#[test]
fn chunking_realigns_on_shifted_content() -> Result<(), Error> {
    let base = scratch("shifted");
    let source = base.join("source");
    let remote = base.join("remote");
    std::fs::create_dir_all(&source)?;
    std::fs::create_dir_all(&remote)?;

    let body = pseudo_random(512 * 1024, 42);
    std::fs::write(source.join("original.bin"), &body)?;
    // same content behind a small prefix: content-defined cuts re-align,
    // so almost everything deduplicates against the first file
    let mut shifted = b"tiny prefix".to_vec();
    shifted.extend_from_slice(&body);
    std::fs::write(source.join("shifted.bin"), &shifted)?;

    let keys = KeyFactory::with_master_key([20u8; 32]);
    let index_path = remote.join("index.frost");
    let options = backup::BackupOptions {
        compressor: Compressor::None,
        multichunk_size: 64 * 1024,
        entropy_threshold: 1.0,
        excludes: ExcludeList::default(),
    };
    let stats = run_backup(&index_path, &keys, &source, &remote, &options);

    // ~1 MiB of input, but the stored bytes stay close to one copy
    assert!(stats.input_bytes > 1024 * 1024);
    assert!(
        stats.output_bytes < 640 * 1024,
        "stored {} bytes for {} bytes of input",
        stats.output_bytes,
        stats.input_bytes
    );

    let dest = base.join("restored");
    run_restore(&index_path, &keys, &remote, &dest, 1);
    assert_eq!(std::fs::read(dest.join("original.bin"))?, body);
    assert_eq!(std::fs::read(dest.join("shifted.bin"))?, shifted);

    std::fs::remove_dir_all(&base)?;
    Ok(())
}

#[test]
fn cat_extracts_one_file() -> Result<(), Error> {
    let base = scratch("cat");
    let source = base.join("source");
    let remote = base.join("remote");
    std::fs::create_dir_all(&source)?;
    std::fs::create_dir_all(&remote)?;
    build_source_tree(&source);

    let keys = KeyFactory::with_master_key([17u8; 32]);
    let index_path = remote.join("index.frost");
    run_backup(&index_path, &keys, &source, &remote, &default_options());

    let index = IndexFile::open(&index_path, false)?;
    let mut sink = Vec::new();
    restore::restore_single_file(
        &index,
        &keys,
        &remote,
        Path::new("subDir/nested.txt"),
        1,
        1024 * 1024,
        &mut sink,
        &mut LogProgress,
    )?;
    assert_eq!(sink, b"nested content");

    // symlinks cannot be cat'ed
    let mut devnull: Vec<u8> = Vec::new();
    assert!(restore::restore_single_file(
        &index,
        &keys,
        &remote,
        Path::new("symLink.txt"),
        1,
        1024 * 1024,
        &mut devnull,
        &mut LogProgress,
    )
    .is_err());

    std::fs::remove_dir_all(&base)?;
    Ok(())
}
