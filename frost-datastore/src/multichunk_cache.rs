//! Decoded multichunk cache for restore and purge.
//!
//! Reading one chunk costs a full multichunk decrypt+decompress, and files
//! tend to reference neighbouring chunks, so keeping the last few decoded
//! multichunks around avoids most of that work. The cache is bounded by
//! total plaintext bytes; eviction drops the least recently accessed entry
//! until the incoming one fits.

use std::collections::HashMap;

use crate::multichunk::MultiChunk;

/// Default cache budget (64 MiB of plaintext).
pub const DEFAULT_CACHE_SIZE: usize = 64 * 1024 * 1024;

struct CacheEntry {
    multichunk: MultiChunk,
    last_access: u64,
}

pub struct MultichunkCache {
    entries: HashMap<u16, CacheEntry>,
    max_bytes: usize,
    total_bytes: usize,
    clock: u64,
}

impl MultichunkCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_bytes,
            total_bytes: 0,
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, uid: u16) -> bool {
        self.entries.contains_key(&uid)
    }

    /// Look up a decoded multichunk, refreshing its access stamp.
    pub fn get(&mut self, uid: u16) -> Option<&MultiChunk> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(&uid).map(|entry| {
            entry.last_access = clock;
            &entry.multichunk
        })
    }

    /// Store a decoded multichunk, evicting the oldest entries as needed.
    pub fn insert(&mut self, uid: u16, multichunk: MultiChunk) {
        let size = multichunk.size();

        while !self.entries.is_empty() && self.total_bytes + size > self.max_bytes {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(uid, _)| *uid)
                .unwrap();
            if let Some(evicted) = self.entries.remove(&oldest) {
                self.total_bytes -= evicted.multichunk.size();
                log::debug!("evicting multichunk {} from cache", oldest);
            }
        }

        self.clock += 1;
        self.total_bytes += size;
        if let Some(old) = self.entries.insert(
            uid,
            CacheEntry {
                multichunk,
                last_access: self.clock,
            },
        ) {
            self.total_bytes -= old.multichunk.size();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn chunk_of(size: usize, fill: u8) -> MultiChunk {
        let mut mc = MultiChunk::new(size * 2 + 64);
        let data = vec![fill; size];
        let checksum = openssl::sha::sha1(&data);
        mc.append_chunk(&data, &checksum);
        mc
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = MultichunkCache::new(3000);
        cache.insert(1, chunk_of(800, 1));
        cache.insert(2, chunk_of(800, 2));
        cache.insert(3, chunk_of(800, 3));

        // touch 1 so 2 becomes the eviction candidate
        assert!(cache.get(1).is_some());
        cache.insert(4, chunk_of(800, 4));

        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
        assert!(cache.contains(4));
    }

    #[test]
    fn oversized_entry_still_cached_alone() {
        let mut cache = MultichunkCache::new(1000);
        cache.insert(1, chunk_of(400, 1));
        cache.insert(2, chunk_of(5000, 2));
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert_eq!(cache.len(), 1);
    }
}
