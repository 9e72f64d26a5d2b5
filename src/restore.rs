//! The restore engine.
//!
//! Directories are created first in lexicographic order, then every file,
//! symlink and device node is rebuilt from its chunk list, then directory
//! metadata is applied deepest-first so child writes cannot disturb parent
//! timestamps. Existing destination entries are handled by the overwrite
//! policy; files present in the destination but absent from the revision
//! may be deleted under the same policy.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

use frost_datastore::error::{io_err, not_found, FrostError};
use frost_datastore::file_meta::ItemMetadata;
use frost_datastore::index_file::{FileTree, IndexFile};
use frost_key_config::KeyFactory;

use crate::chunk_reader::ChunkReader;
use crate::progress::{Action, Progress};
use crate::signals;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwritePolicy {
    /// Never overwrite or delete; warn instead.
    No,
    /// Always overwrite, delete files missing from the revision.
    Yes,
    /// Overwrite only when the destination is older than the backup.
    Update,
}

impl OverwritePolicy {
    pub fn parse(value: &str) -> Result<Self, Error> {
        Ok(match value {
            "no" => OverwritePolicy::No,
            "yes" => OverwritePolicy::Yes,
            "update" => OverwritePolicy::Update,
            other => anyhow::bail!("unknown overwrite policy '{}'", other),
        })
    }
}

pub struct RestoreOptions {
    pub overwrite: OverwritePolicy,
    pub cache_size: usize,
}

#[derive(Debug, Default)]
pub struct RestoreStats {
    pub file_count: u32,
    pub dir_count: u32,
    pub bytes_written: u64,
}

/// Restore one revision into `dest`.
pub fn restore_backup(
    index: &IndexFile,
    keys: &KeyFactory,
    remote: &Path,
    dest: &Path,
    revision: u32,
    options: &RestoreOptions,
    progress: &mut dyn Progress,
) -> Result<RestoreStats, Error> {
    let tree = index.get_file_tree(revision)?;
    if tree.items.is_empty() {
        return Err(not_found(format!("revision {} has an empty file tree", revision)));
    }

    let mut stats = RestoreStats::default();
    let mut reader = ChunkReader::new(index, keys, remote, options.cache_size);

    // decode every item once, paths included
    let mut entries: Vec<(PathBuf, usize, ItemMetadata)> = Vec::with_capacity(tree.items.len());
    for (pos, item) in tree.items.iter().enumerate() {
        let meta = ItemMetadata::decode(&item.metadata)
            .with_context(|| format!("metadata of item {} in revision {}", pos, revision))?;
        entries.push((tree.item_full_path(pos), pos, meta));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let total = entries.len() as u32;

    // pass 1: directories, parents first
    for (rel, _, meta) in entries.iter().filter(|(_, _, meta)| meta.is_dir()) {
        let target = dest.join(rel);
        std::fs::create_dir_all(&target)
            .with_context(|| format!("creating directory {:?}", target))?;
        stats.dir_count += 1;
    }

    // pass 2: file content, links, devices
    let mut current = 0u32;
    for (rel, pos, meta) in entries.iter().filter(|(_, _, meta)| !meta.is_dir()) {
        if signals::exit_requested() {
            return Err(FrostError::Interrupted.into());
        }
        current += 1;
        let rel_str = rel.display().to_string();
        let target = dest.join(rel);

        if !progress.progressed(Action::Restore, &rel_str, 0, meta.size, current, total) {
            return Err(FrostError::Interrupted.into());
        }

        if let Ok(existing) = ItemMetadata::capture(&target) {
            if existing != *meta {
                match options.overwrite {
                    OverwritePolicy::No => {
                        if !progress.warn(
                            Action::Restore,
                            &rel_str,
                            "already exists and differs, no overwrite allowed",
                        ) {
                            return Err(FrostError::Interrupted.into());
                        }
                        continue;
                    }
                    OverwritePolicy::Update => {
                        if (existing.mtime_sec, existing.mtime_nsec)
                            > (meta.mtime_sec, meta.mtime_nsec)
                        {
                            if !progress.warn(
                                Action::Restore,
                                &rel_str,
                                "already exists and is newer than the backup",
                            ) {
                                return Err(FrostError::Interrupted.into());
                            }
                            continue;
                        }
                    }
                    OverwritePolicy::Yes => {}
                }
            }
            std::fs::remove_file(&target)
                .with_context(|| format!("removing old {:?}", target))?;
        }

        if meta.is_symlink() {
            use std::os::unix::ffi::OsStrExt;
            let link_target = PathBuf::from(std::ffi::OsStr::from_bytes(&meta.link_target));
            std::os::unix::fs::symlink(&link_target, &target)
                .with_context(|| format!("creating symlink {:?}", target))?;
        } else if meta.is_device() {
            let kind = nix::sys::stat::SFlag::from_bits_truncate(meta.mode & libc::S_IFMT);
            let perm = nix::sys::stat::Mode::from_bits_truncate(meta.mode & 0o7777);
            if let Err(err) = nix::sys::stat::mknod(&target, kind, perm, meta.rdev) {
                if !progress.warn(
                    Action::Restore,
                    &rel_str,
                    &format!("cannot recreate device node - {}", err),
                ) {
                    return Err(FrostError::Interrupted.into());
                }
                continue;
            }
        } else if meta.is_file() {
            let item = &tree.items[*pos];
            let mut file = std::fs::File::create(&target)
                .with_context(|| format!("creating {:?}", target))?;
            let written = write_file_chunks(
                index,
                &mut reader,
                item.chunk_list_id,
                &mut file,
                &rel_str,
                meta.size,
                current,
                total,
                progress,
            )?;
            file.flush()?;
            stats.bytes_written += written;
            stats.file_count += 1;
        } else {
            if !progress.warn(Action::Restore, &rel_str, "unsupported file type, skipped") {
                return Err(FrostError::Interrupted.into());
            }
            continue;
        }

        if let Err(err) = meta.apply(&target) {
            if !progress.warn(Action::Restore, &rel_str, &err.to_string()) {
                return Err(FrostError::Interrupted.into());
            }
        }
    }

    // pass 3: delete what the revision does not contain (policy permitting)
    delete_extraneous(&tree, dest, options.overwrite, progress)?;

    // pass 4: directory metadata, deepest first so children are final
    for (rel, _, meta) in entries
        .iter()
        .rev()
        .filter(|(_, _, meta)| meta.is_dir())
    {
        let target = dest.join(rel);
        if let Err(err) = meta.apply(&target) {
            if !progress.warn(Action::Restore, &target.display().to_string(), &err.to_string())
            {
                return Err(FrostError::Interrupted.into());
            }
        }
    }

    Ok(stats)
}

fn delete_extraneous(
    tree: &FileTree,
    dest: &Path,
    policy: OverwritePolicy,
    progress: &mut dyn Progress,
) -> Result<(), Error> {
    let known: HashSet<PathBuf> = (0..tree.items.len())
        .map(|pos| tree.item_full_path(pos))
        .collect();

    for entry in walkdir::WalkDir::new(dest).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = match entry.path().strip_prefix(dest) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        if known.contains(&rel) {
            continue;
        }
        let rel_str = rel.display().to_string();
        match policy {
            OverwritePolicy::Yes => {
                std::fs::remove_file(entry.path())
                    .with_context(|| format!("deleting {:?}", entry.path()))?;
                log::debug!("deleted {} (not in the restored revision)", rel_str);
            }
            OverwritePolicy::No => {
                if !progress.warn(
                    Action::Restore,
                    &rel_str,
                    "not part of the restored revision, kept (no overwrite allowed)",
                ) {
                    return Err(FrostError::Interrupted.into());
                }
            }
            OverwritePolicy::Update => {
                log::debug!("{} is not part of the restored revision, kept", rel_str);
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_file_chunks(
    index: &IndexFile,
    reader: &mut ChunkReader,
    chunk_list_id: u32,
    sink: &mut dyn Write,
    rel_str: &str,
    total_size: u64,
    current: u32,
    total: u32,
    progress: &mut dyn Progress,
) -> Result<u64, Error> {
    let list = index
        .chunk_list(chunk_list_id)
        .ok_or_else(|| not_found(format!("chunk list {} for file {}", chunk_list_id, rel_str)))?;

    let mut written = 0u64;
    for &uid in &list.chunk_uids {
        let data = reader.read_chunk(uid)?;
        sink.write_all(&data)
            .map_err(|err| io_err(format!("writing {} (disk full?)", rel_str), err))?;
        written += data.len() as u64;
        if !progress.progressed(Action::Restore, rel_str, written, total_size, current, total) {
            return Err(FrostError::Interrupted.into());
        }
    }
    Ok(written)
}

/// Stream a single file's content to a sink (the `cat` action).
pub fn restore_single_file(
    index: &IndexFile,
    keys: &KeyFactory,
    remote: &Path,
    file_path: &Path,
    revision: u32,
    cache_size: usize,
    sink: &mut dyn Write,
    progress: &mut dyn Progress,
) -> Result<u64, Error> {
    let tree = index.get_file_tree(revision)?;
    let map = tree.path_map();
    let pos = *map
        .get(file_path)
        .ok_or_else(|| not_found(format!("{:?} in revision {}", file_path, revision)))? as usize;

    let item = &tree.items[pos];
    let meta = ItemMetadata::decode(&item.metadata)?;
    if !meta.is_file() {
        anyhow::bail!("{:?} is not a regular file, only files can be extracted", file_path);
    }

    let mut reader = ChunkReader::new(index, keys, remote, cache_size);
    write_file_chunks(
        index,
        &mut reader,
        item.chunk_list_id,
        sink,
        &file_path.display().to_string(),
        meta.size,
        1,
        1,
        progress,
    )
}
