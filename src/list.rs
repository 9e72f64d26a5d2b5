//! Revision and file listing.

use std::io::Write;

use anyhow::Error;

use frost_datastore::file_meta::ItemMetadata;
use frost_datastore::index_file::IndexFile;

/// Optional time range filter, seconds since the epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl TimeRange {
    /// Parse a `YYYYMMDDhhmmss` bound (shorter prefixes allowed).
    pub fn parse_bound(text: &str) -> Result<i64, Error> {
        if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit()) || text.len() > 14 {
            anyhow::bail!("bad time bound '{}', expected YYYYMMDDhhmmss", text);
        }
        let mut padded = text.to_string();
        padded.push_str(&"00000101000000"[text.len()..]);
        let get = |range: std::ops::Range<usize>| -> i64 { padded[range].parse().unwrap() };

        let mut tm = proxmox_time::TmEditor::new(true);
        tm.set_year(get(0..4) as libc::c_int)?;
        tm.set_mon(get(4..6) as libc::c_int)?;
        tm.set_mday(get(6..8) as libc::c_int)?;
        tm.set_hour(get(8..10) as libc::c_int)?;
        tm.set_min(get(10..12) as libc::c_int)?;
        tm.set_sec(get(12..14) as libc::c_int)?;
        tm.into_epoch()
    }

    fn contains(&self, time: i64) -> bool {
        self.start.map_or(true, |start| time >= start) && self.end.map_or(true, |end| time <= end)
    }
}

fn metadata_value(lines: &[String], key: &str) -> Option<String> {
    lines
        .iter()
        .find(|line| line.starts_with(key) && line[key.len()..].starts_with(':'))
        .map(|line| line[key.len() + 1..].trim().to_string())
}

fn legible_size(size: u64) -> String {
    const SUFFIX: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
    let mut size = size;
    let mut remainder = 0;
    let mut pos = 0;
    while size >= 1024 && pos < SUFFIX.len() - 1 {
        remainder = size % 1024;
        size /= 1024;
        pos += 1;
    }
    format!("{}.{}{}", size, remainder * 10 / 1024, SUFFIX[pos])
}

/// Print the revisions in `range`, newest last; with `with_files`, list
/// every recorded path of each revision. Returns how many were printed.
pub fn list_backups(
    index: &IndexFile,
    range: TimeRange,
    with_files: bool,
    out: &mut dyn Write,
) -> Result<u32, Error> {
    let mut count = 0;

    for info in index.catalogs().iter().rev() {
        let revision = info.catalog.revision;
        let time = info.catalog.time as i64;
        if !range.contains(time) {
            continue;
        }
        count += 1;

        let date = proxmox_time::epoch_to_rfc3339_utc(time)?;
        let lines = index.revision_metadata(revision)?;
        match (
            metadata_value(&lines, "InitialSize"),
            metadata_value(&lines, "BackupSize"),
        ) {
            (Some(initial), Some(backup)) => {
                let initial: u64 = initial
                    .split_whitespace()
                    .next()
                    .unwrap_or("0")
                    .parse()
                    .unwrap_or(0);
                let backup: u64 = backup
                    .split_whitespace()
                    .next()
                    .unwrap_or("0")
                    .parse()
                    .unwrap_or(0);
                let saved = if initial > 0 {
                    100u64.saturating_sub(backup * 100 / initial)
                } else {
                    0
                };
                writeln!(
                    out,
                    "Revision {} created on {}, {} files and {} directories, cumulative size {} (backup is {}, saved {}%)",
                    revision,
                    date,
                    metadata_value(&lines, "FileCount").unwrap_or_else(|| "0".into()),
                    metadata_value(&lines, "DirCount").unwrap_or_else(|| "0".into()),
                    legible_size(initial),
                    legible_size(backup),
                    saved,
                )?;
            }
            _ => {
                writeln!(out, "Revision {} created on {}", revision, date)?;
            }
        }

        if with_files {
            let tree = index.get_file_tree(revision)?;
            let mut paths: Vec<(String, usize)> = (0..tree.items.len())
                .map(|pos| (tree.item_full_path(pos).display().to_string(), pos))
                .collect();
            paths.sort();
            for (path, pos) in paths {
                if path.is_empty() {
                    continue;
                }
                match ItemMetadata::decode(&tree.items[pos].metadata) {
                    Ok(meta) => writeln!(
                        out,
                        "\t{:o} {}:{} {:>12} {} [rev{}:id{}]",
                        meta.mode & 0o7777,
                        meta.uid,
                        meta.gid,
                        meta.size,
                        path,
                        revision,
                        pos,
                    )?,
                    Err(_) => writeln!(out, "\t{} [rev{}:id{}]", path, revision, pos)?,
                }
            }
        }
    }

    if count == 0 {
        writeln!(out, "No revision found")?;
    }
    Ok(count)
}

/// Dump the index structure for inspection (`--dump`).
pub fn dump_index(index: &IndexFile, out: &mut dyn Write) -> Result<(), Error> {
    writeln!(
        out,
        "Index {:?}: {} revisions, {} chunks",
        index.path(),
        index.catalogs().len(),
        index.chunk_count(),
    )?;
    for info in index.catalogs().iter().rev() {
        let cat = &info.catalog;
        writeln!(
            out,
            "Catalog rev {} at offset {} (time {}, {} chunk lists, {} multichunks)",
            cat.revision,
            info.offset,
            proxmox_time::epoch_to_rfc3339_utc(cat.time as i64)?,
            cat.chunk_lists_count,
            cat.multichunks_count,
        )?;
        writeln!(
            out,
            "  previous: {}, chunks: {}, file tree: {}, filter args: {}, metadata: {}",
            cat.previous.file_offset(),
            cat.chunks.file_offset(),
            cat.file_tree.file_offset(),
            cat.filter_args.file_offset(),
            cat.metadata.file_offset(),
        )?;
        let tree = index.get_file_tree(cat.revision)?;
        writeln!(out, "  file tree: {} items", tree.items.len())?;
        for line in index.revision_metadata(cat.revision)? {
            writeln!(out, "  metadata: {}", line)?;
        }
    }
    for uid in index.multichunk_uids() {
        let entry = index.multichunk(uid).unwrap();
        writeln!(
            out,
            "Multichunk {} list {} filter {} file {}",
            entry.uid,
            entry.list_id,
            index.filter_arg(entry.filter_arg_index).unwrap_or("?"),
            entry.file_name(),
        )?;
    }
    Ok(())
}
