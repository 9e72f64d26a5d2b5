//! The backup engine.
//!
//! Walks the source tree in directory order, reuses the previous
//! revision's record for unchanged files, chunks everything else and packs
//! new chunks into at most two open multichunks (one compressed, one
//! encrypt-only for high-entropy data). Nothing touches the index file on
//! disk until the final commit; an aborted backup therefore never happened
//! as far as the index is concerned, and any multichunk files it left
//! behind are orphans for the next purge to clean.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};

use frost_datastore::chunker::ChunkStream;
use frost_datastore::compression::{Compressor, FilterArg};
use frost_datastore::file_meta::ItemMetadata;
use frost_datastore::index_file::{IndexFile, MultichunkEntry};
use frost_datastore::multichunk::{write_multichunk, MultiChunk};
use frost_key_config::KeyFactory;

use crate::exclude::ExcludeList;
use crate::progress::{Action, Progress};
use crate::signals;

/// Default average chunk size fed to the content-defined chunker.
pub const DEFAULT_CHUNK_SIZE_AVG: usize = 8 * 1024;

pub struct BackupOptions {
    pub compressor: Compressor,
    pub multichunk_size: usize,
    /// Chunks at or below this normalized entropy go to the compressed
    /// multichunk; 1.0 compresses everything.
    pub entropy_threshold: f64,
    pub excludes: ExcludeList,
}

#[derive(Debug, Default)]
pub struct BackupStats {
    pub revision: u32,
    pub file_count: u32,
    pub dir_count: u32,
    pub input_bytes: u64,
    pub output_bytes: u64,
    /// False when nothing changed and no revision was recorded.
    pub committed: bool,
    pub interrupted: bool,
}

// One of the two concurrently open multichunks.
struct Packer {
    multichunk: MultiChunk,
    filter: FilterArg,
    uid: Option<u16>,
    chunk_uids: Vec<u32>,
    offsets: Vec<u32>,
}

impl Packer {
    fn new(filter: FilterArg) -> Self {
        Self {
            multichunk: MultiChunk::new(filter.max_size),
            filter,
            uid: None,
            chunk_uids: Vec::new(),
            offsets: Vec::new(),
        }
    }

    fn close(
        &mut self,
        index: &mut IndexFile,
        keys: &KeyFactory,
        remote: &Path,
        stats: &mut BackupStats,
    ) -> Result<(), Error> {
        if self.multichunk.is_empty() {
            return Ok(());
        }
        let uid = self
            .uid
            .take()
            .ok_or_else(|| format_err!("closing a multichunk that was never assigned a UID"))?;

        let (digest, written) = write_multichunk(remote, &self.multichunk, &self.filter, keys)?;
        stats.output_bytes += written;

        let filter_arg_index = index.filter_arg_index(&self.filter.descriptor());
        index.append_multichunk(
            MultichunkEntry {
                list_id: 0,
                uid,
                filter_arg_index,
                checksum: digest,
            },
            std::mem::take(&mut self.chunk_uids),
            std::mem::take(&mut self.offsets),
        )?;

        self.multichunk = MultiChunk::new(self.filter.max_size);
        Ok(())
    }
}

/// Back up `source` into `remote`, recording a new revision in `index`.
///
/// The index must be open read-write. Commits only when something
/// observable changed; an unchanged tree does not produce a revision.
pub fn backup_folder(
    index: &mut IndexFile,
    keys: &KeyFactory,
    source: &Path,
    remote: &Path,
    options: &BackupOptions,
    progress: &mut dyn Progress,
) -> Result<BackupStats, Error> {
    let source = source
        .canonicalize()
        .with_context(|| format!("backup source {:?}", source))?;

    let mut stats = BackupStats {
        revision: index.building_revision(),
        ..Default::default()
    };

    let created = proxmox_time::epoch_to_rfc3339_utc(proxmox_time::epoch_i64())?;
    if stats.revision > 1 {
        index.reset_metadata();
        index.append_metadata(format!("Revision {} created on {}", stats.revision, created));
    } else if index.metadata_lines().is_empty() {
        // an index created by an earlier run that never committed
        index.append_metadata(source.display().to_string());
        index.append_metadata(format!("Initial backup started on {}", created));
    }

    let prev_tree = if index.current_revision() > 0 {
        Some(index.get_file_tree(index.current_revision())?)
    } else {
        None
    };
    let prev_paths: HashMap<PathBuf, u32> = prev_tree
        .as_ref()
        .map(|tree| tree.path_map())
        .unwrap_or_default();

    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut dir_ids: HashMap<PathBuf, u32> = HashMap::new();
    let mut worth_saving = false;

    let mut comp_packer = Packer::new(FilterArg::new(options.multichunk_size, options.compressor));
    let mut enc_packer = Packer::new(FilterArg::new(options.multichunk_size, Compressor::None));

    let walker = walkdir::WalkDir::new(&source)
        .follow_links(false)
        .sort_by_file_name();

    let mut entry_index = 0u32;
    for entry in walker {
        if signals::exit_requested() {
            progress.warn(
                Action::Backup,
                "",
                "stop requested, committing what is consistent",
            );
            stats.interrupted = true;
            break;
        }
        if signals::take_dump_request() {
            log::info!(
                "memory stats: {} chunks consolidated, {} items in the new tree",
                index.chunk_count(),
                index.building_tree().items.len()
            );
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let name = err
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                if !progress.warn(Action::Backup, &name, &format!("cannot read entry - {}", err))
                {
                    stats.interrupted = true;
                    break;
                }
                continue;
            }
        };
        entry_index += 1;

        let rel = entry
            .path()
            .strip_prefix(&source)
            .expect("walkdir yields paths under its root")
            .to_path_buf();

        if rel.as_os_str().is_empty() {
            // the backup root itself is item 0 of every tree
            let meta = ItemMetadata::capture(entry.path())?;
            let item = index.append_file_item(0, Vec::new(), meta.encode(), None)?;
            dir_ids.insert(PathBuf::new(), item);
            stats.dir_count += 1;
            continue;
        }

        let rel_str = rel.to_string_lossy().into_owned();
        let mut was_excluded = false;
        if options.excludes.is_excluded(&rel_str, &mut was_excluded) {
            log::debug!("excluded: {}", rel_str);
            continue;
        } else if was_excluded {
            log::debug!("excluded at first then reincluded: {}", rel_str);
        }

        if !progress.progressed(Action::Backup, &rel_str, 0, 1, entry_index, 0) {
            stats.interrupted = true;
            break;
        }

        let parent_rel = rel.parent().map(|p| p.to_path_buf()).unwrap_or_default();
        let parent_index = match dir_ids.get(&parent_rel) {
            Some(index) => *index,
            None => {
                // parent was excluded or unreadable; nothing to attach to
                if !progress.warn(
                    Action::Backup,
                    &rel_str,
                    "parent directory was not recorded, skipping",
                ) {
                    stats.interrupted = true;
                    break;
                }
                continue;
            }
        };
        let parent_id = parent_index + 1;

        let meta = match ItemMetadata::capture(entry.path()) {
            Ok(meta) => meta,
            Err(err) => {
                if !progress.warn(Action::Backup, &rel_str, &err.to_string()) {
                    stats.interrupted = true;
                    break;
                }
                continue;
            }
        };
        seen.insert(rel.clone());

        let base_name = rel
            .file_name()
            .map(|name| std::os::unix::ffi::OsStrExt::as_bytes(name).to_vec())
            .unwrap_or_default();

        // unchanged since the previous revision? reuse its chunk list
        if let (Some(tree), Some(&prev_index)) = (prev_tree.as_ref(), prev_paths.get(&rel)) {
            let prev_item = &tree.items[prev_index as usize];
            if prev_item.metadata == meta.encode() {
                let item = index.append_reused_file_item(
                    parent_id,
                    base_name,
                    prev_item.metadata.clone(),
                    prev_item.chunk_list_id,
                )?;
                if meta.is_dir() {
                    dir_ids.insert(rel, item);
                    stats.dir_count += 1;
                } else if meta.is_file() {
                    stats.file_count += 1;
                }
                continue;
            }
        }

        worth_saving = true;

        if meta.is_symlink() {
            warn_on_external_symlink(&source, entry.path(), &meta, &rel_str, progress);
            index.append_file_item(parent_id, base_name, meta.encode(), None)?;
        } else if meta.is_dir() {
            let item = index.append_file_item(parent_id, base_name, meta.encode(), None)?;
            dir_ids.insert(rel, item);
            stats.dir_count += 1;
        } else if meta.is_device() {
            index.append_file_item(parent_id, base_name, meta.encode(), None)?;
        } else if meta.is_file() {
            match store_file_content(
                index,
                keys,
                remote,
                options,
                entry.path(),
                &rel_str,
                &meta,
                &mut comp_packer,
                &mut enc_packer,
                &mut stats,
                entry_index,
                progress,
            ) {
                Ok(chunks) => {
                    index.append_file_item(parent_id, base_name, meta.encode(), Some(chunks))?;
                    stats.file_count += 1;
                }
                Err(err) => {
                    if !progress.warn(Action::Backup, &rel_str, &err.to_string()) {
                        stats.interrupted = true;
                        break;
                    }
                }
            }
        } else {
            // fifos, sockets and other specials are not backed up
            if !progress.warn(
                Action::Backup,
                &rel_str,
                "non regular type (fifo or socket) is not backed up",
            ) {
                stats.interrupted = true;
                break;
            }
        }
    }

    comp_packer.close(index, keys, remote, &mut stats)?;
    enc_packer.close(index, keys, remote, &mut stats)?;

    // anything recorded before but unseen now was deleted (or excluded)
    for path in prev_paths.keys() {
        if !path.as_os_str().is_empty() && !seen.contains(path) {
            log::debug!("gone since the last revision: {:?}", path);
            worth_saving = true;
        }
    }

    if !worth_saving {
        log::info!(
            "no observable changes, not recording revision {}",
            stats.revision
        );
        return Ok(stats);
    }

    if stats.input_bytes > 0 {
        index.append_metadata(format!("FileCount: {}", stats.file_count));
        index.append_metadata(format!("DirCount: {}", stats.dir_count));
        index.append_metadata(format!("InitialSize: {}", stats.input_bytes));
        index.append_metadata(format!("BackupSize: {}", stats.output_bytes));
    }
    let finished = proxmox_time::epoch_to_rfc3339_utc(proxmox_time::epoch_i64())?;
    index.amend_last_metadata(&format!(" finished on {}", finished));

    index.commit()?;
    stats.committed = true;
    Ok(stats)
}

fn warn_on_external_symlink(
    source: &Path,
    path: &Path,
    meta: &ItemMetadata,
    rel_str: &str,
    progress: &mut dyn Progress,
) {
    use std::os::unix::ffi::OsStrExt;
    let target = PathBuf::from(std::ffi::OsStr::from_bytes(&meta.link_target));
    let resolved = if target.is_absolute() {
        target
    } else {
        match path.parent() {
            Some(parent) => parent.join(target),
            None => return,
        }
    };
    if let Ok(resolved) = resolved.canonicalize() {
        if !resolved.starts_with(source) {
            progress.warn(
                Action::Backup,
                rel_str,
                "symbolic link points outside of the backup folder, only the link is saved",
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn store_file_content(
    index: &mut IndexFile,
    keys: &KeyFactory,
    remote: &Path,
    options: &BackupOptions,
    path: &Path,
    rel_str: &str,
    meta: &ItemMetadata,
    comp_packer: &mut Packer,
    enc_packer: &mut Packer,
    stats: &mut BackupStats,
    entry_index: u32,
    progress: &mut dyn Progress,
) -> Result<Vec<u32>, Error> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {:?}", path))?;
    let mut stream = ChunkStream::new(file, DEFAULT_CHUNK_SIZE_AVG);

    let mut file_chunks = Vec::new();
    let mut offset_in_file = 0u64;
    stats.input_bytes += meta.size;

    loop {
        let (data, digest) = match stream.next_chunk()? {
            Some(chunk) => chunk,
            None => break,
        };
        offset_in_file += data.len() as u64;

        if let Some(uid) = index.find_chunk_uid(&digest) {
            // deduplicated: the bytes are already in some multichunk
            file_chunks.push(uid);
            continue;
        }

        // route by entropy: incompressible data skips the compressor
        let compress = match options.compressor {
            Compressor::Zstd => true,
            _ if options.entropy_threshold >= 1.0 => true,
            _ => MultiChunk::chunk_entropy(data) <= options.entropy_threshold,
        };
        let packer = if compress {
            &mut *comp_packer
        } else {
            &mut *enc_packer
        };

        if !packer.multichunk.can_fit(data.len()) {
            packer.close(index, keys, remote, stats)?;
        }
        let mc_uid = match packer.uid {
            Some(uid) => uid,
            None => {
                let uid = index.allocate_multichunk_uid();
                packer.uid = Some(uid);
                uid
            }
        };

        let offset = packer.multichunk.append_chunk(data, &digest);
        let uid = index.append_chunk(digest, data.len() as u16, mc_uid)?;
        packer.chunk_uids.push(uid);
        packer.offsets.push(offset);
        file_chunks.push(uid);

        if !progress.progressed(
            Action::Backup,
            rel_str,
            offset_in_file,
            meta.size,
            entry_index,
            0,
        ) {
            return Err(frost_datastore::FrostError::Interrupted.into());
        }
    }

    Ok(file_chunks)
}
