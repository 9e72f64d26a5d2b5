//! The purge engine.
//!
//! Removes revisions `1..=up_to` from the backup set. Chunks referenced
//! only by purged revisions die; multichunks whose chunks all died are
//! deleted, multichunks whose dead-chunk ratio exceeds the strategy
//! threshold are repacked (their live chunks re-read and written into
//! fresh multichunks). A brand new index containing the surviving
//! revisions, renumbered from 1, is written next to the old one and
//! atomically renamed over it; only then are the obsolete multichunk
//! files deleted. Failure at any earlier point leaves the original index
//! untouched, and a guard removes whatever new multichunk files were
//! already written.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};

use frost_datastore::compression::{Compressor, FilterArg};
use frost_datastore::index_file::{ChunkList, IndexFile, MultichunkEntry};
use frost_datastore::multichunk::{write_multichunk, MultiChunk};
use frost_key_config::KeyFactory;

use crate::chunk_reader::ChunkReader;
use crate::progress::{Action, Progress};

/// Strategy as a dead-chunk percentage threshold: multichunks with a
/// higher ratio get repacked. 100 ("fast") never repacks, 0 ("slow")
/// always does.
pub const STRATEGY_FAST: u32 = 100;
pub const STRATEGY_SLOW: u32 = 0;

pub struct PurgeOptions {
    pub threshold: u32,
    pub compressor: Compressor,
    pub multichunk_size: usize,
    pub cache_size: usize,
}

#[derive(Debug, Default)]
pub struct PurgeStats {
    pub removed_chunks: usize,
    pub deleted_multichunks: usize,
    pub repacked_multichunks: usize,
    pub revisions_kept: u32,
}

// Deletes the files it still owns when the purge aborts early.
struct CleanupGuard {
    files: Vec<PathBuf>,
}

impl CleanupGuard {
    fn track(&mut self, path: PathBuf) {
        self.files.push(path);
    }

    fn defuse(&mut self) {
        self.files.clear();
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        for path in &self.files {
            if let Err(err) = std::fs::remove_file(path) {
                log::warn!("cleanup of {:?} failed - {}", path, err);
            }
        }
    }
}

struct RepackPacker {
    multichunk: MultiChunk,
    filter: FilterArg,
    uid: Option<u16>,
    chunk_uids: Vec<u32>,
    offsets: Vec<u32>,
}

impl RepackPacker {
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
        keys: &KeyFactory,
        remote: &Path,
        guard: &mut CleanupGuard,
        finished: &mut Vec<(MultichunkEntry, ChunkList, String)>,
        redirects: &mut Vec<(u32, u16)>,
    ) -> Result<(), Error> {
        if self.multichunk.is_empty() {
            return Ok(());
        }
        let uid = self
            .uid
            .take()
            .ok_or_else(|| format_err!("closing a repack multichunk without a UID"))?;
        let (digest, _) = write_multichunk(remote, &self.multichunk, &self.filter, keys)?;
        guard.track(remote.join(frost_datastore::multichunk::multichunk_file_name(&digest)));

        for &chunk_uid in &self.chunk_uids {
            redirects.push((chunk_uid, uid));
        }
        finished.push((
            MultichunkEntry {
                list_id: 0, // patched when adopted into the new index
                uid,
                filter_arg_index: 0,
                checksum: digest,
            },
            ChunkList {
                uid: 0, // assigned when adopted into the new index
                chunk_uids: std::mem::take(&mut self.chunk_uids),
                offsets: Some(std::mem::take(&mut self.offsets)),
            },
            self.filter.descriptor(),
        ));
        self.multichunk = MultiChunk::new(self.filter.max_size);
        Ok(())
    }
}

/// Purge revisions `1..=up_to`, rewriting the index at `index_path`.
pub fn purge_backup(
    mut index: IndexFile,
    keys: &KeyFactory,
    remote: &Path,
    up_to: u32,
    options: &PurgeOptions,
    progress: &mut dyn Progress,
) -> Result<PurgeStats, Error> {
    let current = index.current_revision();
    if up_to == 0 {
        bail!("no revision given; refusing to purge the whole backup set");
    }
    if up_to >= current {
        bail!(
            "cannot purge up to revision {}, the newest revision is {}",
            up_to,
            current
        );
    }

    let mut stats = PurgeStats {
        revisions_kept: current - up_to,
        ..Default::default()
    };

    progress.progressed(Action::Purge, "scanning revisions", 0, 1, 0, 1);

    // chunk sets referenced before and after the cut
    let chunks_in_prev = collect_chunks(&index, 1, up_to, true)?;
    if chunks_in_prev.is_empty() {
        log::info!("no chunks referenced by revisions 1..={}, nothing to do", up_to);
    }
    let chunks_in_next = collect_chunks(&index, up_to + 1, current, false)?;

    let remove_chunks: BTreeSet<u32> = chunks_in_prev
        .difference(&chunks_in_next)
        .copied()
        .collect();
    stats.removed_chunks = remove_chunks.len();

    // chunks the surviving revisions need but record in no surviving
    // Chunks block (first seen before the cut); they move into the new
    // first revision's block
    let mut surviving_first_seen: BTreeSet<u32> = BTreeSet::new();
    for rev in up_to + 1..=current {
        for chunk in index.revision_chunks(rev)? {
            surviving_first_seen.insert(chunk.uid);
        }
    }
    let carried_chunks: BTreeSet<u32> = chunks_in_next
        .difference(&surviving_first_seen)
        .copied()
        .collect();

    // dead-chunk ratio per affected multichunk
    let mut affected: BTreeMap<u16, usize> = BTreeMap::new();
    for &uid in &remove_chunks {
        let chunk = index
            .chunk_by_uid(uid)
            .ok_or_else(|| format_err!("chunk with UID {} vanished from the index", uid))?;
        *affected.entry(chunk.multichunk_id).or_default() += 1;
    }

    let mut deleted_mcs: HashSet<u16> = HashSet::new();
    let mut repack_order: Vec<(u16, f64)> = Vec::new();
    for (&mc_uid, &removed) in &affected {
        let entry = index
            .multichunk(mc_uid)
            .ok_or_else(|| format_err!("multichunk {} vanished from the index", mc_uid))?;
        let list = index
            .chunk_list(entry.list_id)
            .ok_or_else(|| format_err!("chunk list {} of multichunk {} is missing", entry.list_id, mc_uid))?;
        let ratio = removed as f64 / list.chunk_uids.len() as f64;
        if ratio >= 1.0 {
            deleted_mcs.insert(mc_uid);
        } else if ratio > options.threshold as f64 / 100.0 {
            repack_order.push((mc_uid, ratio));
        }
    }
    repack_order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then(a.0.cmp(&b.0)));

    progress.progressed(
        Action::Purge,
        "found orphan chunks",
        0,
        0,
        remove_chunks.len() as u32,
        index.chunk_count() as u32,
    );

    let mut guard = CleanupGuard { files: Vec::new() };

    // repack multichunks that keep too little live data
    let mut finished_new: Vec<(MultichunkEntry, ChunkList, String)> = Vec::new();
    let mut redirects: Vec<(u32, u16)> = Vec::new();
    let repacked_mcs: HashSet<u16> = repack_order.iter().map(|(uid, _)| *uid).collect();
    {
        let mut next_mc_uid = index
            .multichunk_uids()
            .last()
            .copied()
            .unwrap_or(0);
        let mut reader = ChunkReader::new(&index, keys, remote, options.cache_size);
        let mut comp_packer = RepackPacker::new(FilterArg::new(
            options.multichunk_size,
            options.compressor,
        ));
        let mut enc_packer = RepackPacker::new(FilterArg::new(
            frost_datastore::compression::DEFAULT_MULTICHUNK_SIZE,
            Compressor::None,
        ));

        for (pos, (mc_uid, ratio)) in repack_order.iter().enumerate() {
            let entry = index.multichunk(*mc_uid).unwrap().clone();
            let descriptor = index.filter_arg(entry.filter_arg_index).ok_or_else(|| {
                format_err!("multichunk {} has no filter argument", mc_uid)
            })?;
            let src_filter = FilterArg::parse(descriptor)?;
            let list = index
                .chunk_list(entry.list_id)
                .ok_or_else(|| format_err!("chunk list {} is missing", entry.list_id))?
                .clone();

            for &chunk_uid in &list.chunk_uids {
                if remove_chunks.contains(&chunk_uid) {
                    continue;
                }
                let data = reader.read_chunk(chunk_uid)?;
                let chunk = index
                    .chunk_by_uid(chunk_uid)
                    .ok_or_else(|| format_err!("chunk {} is missing", chunk_uid))?;

                let packer = if src_filter.compressor == Compressor::None {
                    &mut enc_packer
                } else {
                    &mut comp_packer
                };
                if !packer.multichunk.can_fit(data.len()) {
                    packer.close(keys, remote, &mut guard, &mut finished_new, &mut redirects)?;
                }
                if packer.uid.is_none() {
                    next_mc_uid = next_mc_uid
                        .checked_add(1)
                        .ok_or_else(|| format_err!("out of multichunk UIDs"))?;
                    packer.uid = Some(next_mc_uid);
                }
                let offset = packer.multichunk.append_chunk(&data, &chunk.checksum);
                packer.chunk_uids.push(chunk_uid);
                packer.offsets.push(offset);
            }

            if !progress.progressed(
                Action::Purge,
                &format!("repacked multichunk {} (ratio {:.2})", entry.file_name(), ratio),
                0,
                0,
                pos as u32 + 1,
                repack_order.len() as u32,
            ) {
                bail!("interrupted while repacking");
            }
        }

        comp_packer.close(keys, remote, &mut guard, &mut finished_new, &mut redirects)?;
        enc_packer.close(keys, remote, &mut guard, &mut finished_new, &mut redirects)?;
    }
    stats.repacked_multichunks = repacked_mcs.len();
    stats.deleted_multichunks = deleted_mcs.len();

    // point the surviving chunks at their new homes
    for &(chunk_uid, mc_uid) in &redirects {
        index.set_chunk_multichunk(chunk_uid, mc_uid)?;
    }

    // lists owned by multichunks that disappear are dropped with them
    let dropped_lists: HashSet<u32> = deleted_mcs
        .iter()
        .chain(repacked_mcs.iter())
        .filter_map(|uid| index.multichunk(*uid).map(|entry| entry.list_id))
        .collect();

    // multichunk runs of the surviving catalogs (before any filtering)
    let mut surviving_run_ids: HashSet<u16> = HashSet::new();
    for rev in up_to + 1..=current {
        for entry in index.revision_multichunks(rev)? {
            surviving_run_ids.insert(entry.uid);
        }
    }

    // build the replacement index next to the old one
    let tmp_path = remote.join("__purgeIndex.frost");
    let _ = std::fs::remove_file(&tmp_path);
    let backup_path = index.initial_backup_path().unwrap_or_default();
    let mut new_index = IndexFile::create_new(&tmp_path, index.ciphered_master_key(), &backup_path)?;
    guard.track(tmp_path.clone());
    new_index.set_filter_args(index.filter_args().to_vec());

    // files to remove once the new index is in place
    let mut obsolete_files: Vec<PathBuf> = Vec::new();
    for uid in deleted_mcs.iter().chain(repacked_mcs.iter()) {
        if let Some(entry) = index.multichunk(*uid) {
            obsolete_files.push(remote.join(entry.file_name()));
        }
    }

    for (n, old_rev) in (up_to + 1..=current).enumerate() {
        let new_rev = n as u32 + 1;
        if new_rev > 1 {
            new_index = IndexFile::open(&tmp_path, true)?;
        }

        if new_rev == 1 {
            // chunks surviving from purged revisions land in the first block
            for &uid in &carried_chunks {
                let chunk = *index
                    .chunk_by_uid(uid)
                    .ok_or_else(|| format_err!("chunk {} is missing", uid))?;
                new_index.adopt_chunk(chunk)?;
            }
        }
        for chunk in index.revision_chunks(old_rev)? {
            // re-read through the consolidated array to pick up redirects
            let chunk = *index
                .chunk_by_uid(chunk.uid)
                .ok_or_else(|| format_err!("chunk {} is missing", chunk.uid))?;
            new_index.adopt_chunk(chunk)?;
        }

        for list in index.revision_chunk_lists(old_rev)? {
            if !dropped_lists.contains(&list.uid) && new_index.chunk_list(list.uid).is_none() {
                new_index.adopt_chunk_list(list)?;
            }
        }
        for entry in index.revision_multichunks(old_rev)? {
            if !deleted_mcs.contains(&entry.uid) && !repacked_mcs.contains(&entry.uid) {
                new_index.adopt_multichunk(entry)?;
            }
        }

        if new_rev == 1 {
            adopt_carried_multichunks(
                &index,
                &mut new_index,
                &carried_chunks,
                &surviving_run_ids,
                &deleted_mcs,
                &repacked_mcs,
            )?;
            // the freshly repacked multichunks and their offset lists; new
            // list UIDs start above everything the old index ever used
            let mut next_list_uid = index.max_chunk_list_uid();
            for (mut entry, mut list, descriptor) in finished_new.drain(..) {
                entry.filter_arg_index = new_index.filter_arg_index(&descriptor);
                next_list_uid += 1;
                list.uid = next_list_uid;
                entry.list_id = list.uid;
                new_index.adopt_chunk_list(list)?;
                new_index.adopt_multichunk(entry)?;
            }
        }

        let tree = index.get_file_tree(old_rev)?;
        for item in &tree.items {
            if item.chunk_list_id != 0 && new_index.chunk_list(item.chunk_list_id).is_none() {
                let list = index
                    .chunk_list(item.chunk_list_id)
                    .ok_or_else(|| {
                        format_err!("chunk list {} referenced by revision {} is missing",
                            item.chunk_list_id, old_rev)
                    })?
                    .clone();
                new_index.adopt_chunk_list(list)?;
            }
            new_index.append_reused_file_item(
                item.parent_id,
                item.base_name.clone(),
                item.metadata.clone(),
                item.chunk_list_id,
            )?;
        }

        let old_lines = index.revision_metadata(old_rev)?;
        if new_rev > 1 {
            new_index.reset_metadata();
        }
        for line in old_lines {
            new_index.append_metadata(line);
        }

        new_index.commit().with_context(|| {
            format!("writing revision {} of the purged index", new_rev)
        })?;

        if !progress.progressed(
            Action::Purge,
            "saved revision",
            0,
            0,
            new_rev,
            current - up_to,
        ) {
            bail!("interrupted while writing the purged index");
        }
    }

    // swap the new index in; the old multichunk files die only after this
    let index_path = index.path().to_owned();
    drop(new_index);
    drop(index);
    std::fs::rename(&tmp_path, &index_path)
        .map_err(|err| format_err!("atomic rename of the purged index failed - {}", err))?;
    guard.defuse();

    for path in obsolete_files {
        if let Err(err) = std::fs::remove_file(&path) {
            log::warn!("unable to delete obsolete multichunk {:?} - {}", path, err);
        }
    }

    progress.progressed(Action::Purge, "purge finished", 0, 0, 1, 1);
    Ok(stats)
}

// Union of chunk UIDs referenced by the file trees of a revision range.
fn collect_chunks(
    index: &IndexFile,
    from: u32,
    to: u32,
    tolerate_missing: bool,
) -> Result<BTreeSet<u32>, Error> {
    let mut chunks = BTreeSet::new();
    for rev in from..=to {
        let tree = match index.get_file_tree(rev) {
            Ok(tree) => tree,
            // earlier purges may already have removed the low revisions
            Err(err) if tolerate_missing => {
                log::debug!("revision {} not present ({}), skipping", rev, err);
                continue;
            }
            Err(err) => return Err(err),
        };
        for item in &tree.items {
            if item.chunk_list_id == 0 {
                continue;
            }
            let list = index.chunk_list(item.chunk_list_id).ok_or_else(|| {
                format_err!(
                    "chunk list {} referenced by revision {} is missing",
                    item.chunk_list_id,
                    rev
                )
            })?;
            chunks.extend(list.chunk_uids.iter().copied());
        }
    }
    Ok(chunks)
}

// Multichunks created in purged revisions but still holding live chunks
// have no surviving catalog run; carry them into the first new revision.
fn adopt_carried_multichunks(
    index: &IndexFile,
    new_index: &mut IndexFile,
    carried_chunks: &BTreeSet<u32>,
    surviving_run_ids: &HashSet<u16>,
    deleted_mcs: &HashSet<u16>,
    repacked_mcs: &HashSet<u16>,
) -> Result<(), Error> {
    let mut carried: BTreeSet<u16> = BTreeSet::new();
    for &uid in carried_chunks {
        let chunk = index
            .chunk_by_uid(uid)
            .ok_or_else(|| format_err!("chunk {} is missing", uid))?;
        carried.insert(chunk.multichunk_id);
    }
    for mc_uid in carried {
        if surviving_run_ids.contains(&mc_uid)
            || deleted_mcs.contains(&mc_uid)
            || repacked_mcs.contains(&mc_uid)
        {
            continue;
        }
        // redirect targets (fresh repack multichunks) are adopted separately
        let entry = match index.multichunk(mc_uid) {
            Some(entry) => entry.clone(),
            None => continue,
        };
        if new_index.chunk_list(entry.list_id).is_none() {
            let list = index
                .chunk_list(entry.list_id)
                .ok_or_else(|| format_err!("chunk list {} is missing", entry.list_id))?
                .clone();
            new_index.adopt_chunk_list(list)?;
        }
        new_index.adopt_multichunk(entry)?;
    }
    Ok(())
}
