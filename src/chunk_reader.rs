//! Chunk extraction: index record → multichunk file → chunk bytes.
//!
//! Every read goes through the multichunk cache so that consecutive chunks
//! of a file (which usually share a multichunk) cost one decode.

use std::path::{Path, PathBuf};

use anyhow::Error;

use frost_datastore::compression::FilterArg;
use frost_datastore::error::{bad_format, not_found};
use frost_datastore::index_file::IndexFile;
use frost_datastore::multichunk::read_multichunk;
use frost_datastore::multichunk_cache::MultichunkCache;
use frost_key_config::KeyFactory;

pub struct ChunkReader<'a> {
    index: &'a IndexFile,
    keys: &'a KeyFactory,
    remote: PathBuf,
    cache: MultichunkCache,
}

impl<'a> ChunkReader<'a> {
    pub fn new(index: &'a IndexFile, keys: &'a KeyFactory, remote: &Path, cache_size: usize) -> Self {
        Self {
            index,
            keys,
            remote: remote.to_owned(),
            cache: MultichunkCache::new(cache_size),
        }
    }

    /// Fetch one chunk's plaintext by UID.
    pub fn read_chunk(&mut self, uid: u32) -> Result<Vec<u8>, Error> {
        let chunk = self
            .index
            .chunk_by_uid(uid)
            .ok_or_else(|| not_found(format!("chunk with UID {} in the consolidated array", uid)))?;
        let entry = self.index.multichunk(chunk.multichunk_id).ok_or_else(|| {
            not_found(format!(
                "multichunk {} holding chunk {}",
                chunk.multichunk_id, uid
            ))
        })?;
        let descriptor = self
            .index
            .filter_arg(entry.filter_arg_index)
            .ok_or_else(|| {
                bad_format(format!(
                    "multichunk {} references filter argument {} which does not exist",
                    entry.uid, entry.filter_arg_index
                ))
            })?;
        let filter = FilterArg::parse(descriptor)?;

        // the multichunk's own chunk list gives O(1) access by offset
        let offset = self
            .index
            .chunk_list(entry.list_id)
            .and_then(|list| list.chunk_offset(uid));

        if !self.cache.contains(entry.uid) {
            let path = self.remote.join(entry.file_name());
            let multichunk = read_multichunk(&path, &filter, self.keys)?;
            self.cache.insert(entry.uid, multichunk);
        }
        let multichunk = self.cache.get(entry.uid).expect("just inserted");
        Ok(multichunk.find_chunk(&chunk.checksum, offset)?.to_vec())
    }
}
