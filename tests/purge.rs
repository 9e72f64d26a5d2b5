use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Error;

use frost::progress::LogProgress;
use frost::restore::{OverwritePolicy, RestoreOptions};
use frost::{backup, purge, restore, ExcludeList};
use frost_datastore::compression::Compressor;
use frost_datastore::index_file::IndexFile;
use frost_key_config::KeyFactory;

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("frost-purge-{}-{}", std::process::id(), name));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

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

fn options() -> backup::BackupOptions {
    backup::BackupOptions {
        compressor: Compressor::Zlib,
        multichunk_size: 32 * 1024,
        entropy_threshold: 1.0,
        excludes: ExcludeList::default(),
    }
}

fn run_backup(index_path: &Path, keys: &KeyFactory, source: &Path, remote: &Path) -> u32 {
    let mut index = if index_path.exists() {
        IndexFile::open(index_path, true).unwrap()
    } else {
        IndexFile::create_new(index_path, &[9u8; 108], &source.display().to_string()).unwrap()
    };
    let stats =
        backup::backup_folder(&mut index, keys, source, remote, &options(), &mut LogProgress)
            .unwrap();
    assert!(stats.committed);
    stats.revision
}

fn restored_files(
    index_path: &Path,
    keys: &KeyFactory,
    remote: &Path,
    dest: &Path,
    revision: u32,
) -> BTreeMap<String, Vec<u8>> {
    let index = IndexFile::open(index_path, false).unwrap();
    let opts = RestoreOptions {
        overwrite: OverwritePolicy::Yes,
        cache_size: 4 * 1024 * 1024,
    };
    restore::restore_backup(&index, keys, remote, dest, revision, &opts, &mut LogProgress).unwrap();

    let mut map = BTreeMap::new();
    for entry in walkdir::WalkDir::new(dest).sort_by_file_name() {
        let entry = entry.unwrap();
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dest).unwrap();
        map.insert(
            rel.display().to_string(),
            std::fs::read(entry.path()).unwrap(),
        );
    }
    map
}

fn multichunk_files(remote: &Path) -> HashSet<String> {
    std::fs::read_dir(remote)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".#"))
        .collect()
}

#[test]
fn purge_renumbers_and_keeps_restorable_history() -> Result<(), Error> {
    let base = scratch("slow");
    let source = base.join("source");
    let remote = base.join("remote");
    std::fs::create_dir_all(&source)?;
    std::fs::create_dir_all(&remote)?;

    let keys = KeyFactory::with_master_key([23u8; 32]);
    let index_path = remote.join("index.frost");

    // revision 1: two files
    std::fs::write(source.join("a.txt"), pseudo_random(80 * 1024, 1))?;
    std::fs::write(source.join("b.bin"), pseudo_random(200 * 1024, 2))?;
    assert_eq!(run_backup(&index_path, &keys, &source, &remote), 1);

    // revision 2: a.txt gone, c.txt added
    std::fs::remove_file(source.join("a.txt"))?;
    std::fs::write(source.join("c.txt"), pseudo_random(60 * 1024, 3))?;
    assert_eq!(run_backup(&index_path, &keys, &source, &remote), 2);

    // revision 3: d.txt added
    std::fs::write(source.join("d.txt"), pseudo_random(40 * 1024, 4))?;
    assert_eq!(run_backup(&index_path, &keys, &source, &remote), 3);

    // what revisions 2 and 3 look like before the purge
    let before_rev2 = restored_files(&index_path, &keys, &remote, &base.join("pre2"), 2);
    let before_rev3 = restored_files(&index_path, &keys, &remote, &base.join("pre3"), 3);

    // purge revision 1 with the slow strategy (always repack)
    let index = IndexFile::open(&index_path, false)?;
    let purge_options = purge::PurgeOptions {
        threshold: purge::STRATEGY_SLOW,
        compressor: Compressor::Zlib,
        multichunk_size: 32 * 1024,
        cache_size: 4 * 1024 * 1024,
    };
    let stats = purge::purge_backup(index, &keys, &remote, 1, &purge_options, &mut LogProgress)?;
    assert!(stats.removed_chunks > 0);
    assert_eq!(stats.revisions_kept, 2);

    // revisions are renumbered from 1
    let index = IndexFile::open(&index_path, false)?;
    assert_eq!(index.current_revision(), 2);
    assert_eq!(index.catalogs().len(), 2);

    // every multichunk file on disk is referenced by the surviving index
    let referenced: HashSet<String> = index
        .multichunk_uids()
        .into_iter()
        .map(|uid| index.multichunk(uid).unwrap().file_name())
        .collect();
    let on_disk = multichunk_files(&remote);
    assert_eq!(on_disk, referenced);

    // every chunk a surviving revision needs still resolves
    for revision in 1..=2 {
        let tree = index.get_file_tree(revision)?;
        for item in &tree.items {
            if item.chunk_list_id == 0 {
                continue;
            }
            let list = index
                .chunk_list(item.chunk_list_id)
                .expect("chunk list survives the purge");
            for &uid in &list.chunk_uids {
                let chunk = index.chunk_by_uid(uid).expect("chunk survives the purge");
                assert!(index.multichunk(chunk.multichunk_id).is_some());
            }
        }
    }
    drop(index);

    // renumbered revision 1 == old revision 2, renumbered 2 == old 3
    let after_rev1 = restored_files(&index_path, &keys, &remote, &base.join("post1"), 1);
    let after_rev2 = restored_files(&index_path, &keys, &remote, &base.join("post2"), 2);
    assert_eq!(after_rev1, before_rev2);
    assert_eq!(after_rev2, before_rev3);

    std::fs::remove_dir_all(&base)?;
    Ok(())
}

#[test]
fn fast_purge_deletes_only_fully_dead_multichunks() -> Result<(), Error> {
    let base = scratch("fast");
    let source = base.join("source");
    let remote = base.join("remote");
    std::fs::create_dir_all(&source)?;
    std::fs::create_dir_all(&remote)?;

    let keys = KeyFactory::with_master_key([24u8; 32]);
    let index_path = remote.join("index.frost");

    std::fs::write(source.join("only_rev1.bin"), pseudo_random(120 * 1024, 7))?;
    assert_eq!(run_backup(&index_path, &keys, &source, &remote), 1);

    std::fs::remove_file(source.join("only_rev1.bin"))?;
    std::fs::write(source.join("later.bin"), pseudo_random(90 * 1024, 8))?;
    assert_eq!(run_backup(&index_path, &keys, &source, &remote), 2);

    let files_before = multichunk_files(&remote);

    let index = IndexFile::open(&index_path, false)?;
    let purge_options = purge::PurgeOptions {
        threshold: purge::STRATEGY_FAST,
        compressor: Compressor::Zlib,
        multichunk_size: 32 * 1024,
        cache_size: 4 * 1024 * 1024,
    };
    let stats = purge::purge_backup(index, &keys, &remote, 1, &purge_options, &mut LogProgress)?;

    // rev 1's content is referenced nowhere else: its multichunks die
    assert!(stats.deleted_multichunks > 0);
    assert_eq!(stats.repacked_multichunks, 0);

    let files_after = multichunk_files(&remote);
    assert!(files_after.len() < files_before.len());

    // the remaining revision still restores
    let restored = restored_files(&index_path, &keys, &remote, &base.join("post"), 1);
    assert_eq!(restored.len(), 1);
    assert!(restored.contains_key("later.bin"));

    std::fs::remove_dir_all(&base)?;
    Ok(())
}
