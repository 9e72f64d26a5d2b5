//! Robin Hood hash map from chunk checksum to consolidated array index.
//!
//! This is the hot structure of deduplication: one lookup per chunk of
//! every file backed up. To keep it compact the buckets store only the
//! 32-bit hash and the 32-bit index; key comparisons fetch the checksum
//! from the consolidated chunk array, which the caller passes into every
//! operation. Robin Hood probing keeps the probe distance variance low, so
//! lookups stay short even near the load ceiling.
//!
//! A checksum is already uniformly distributed, so the "hash" is simply its
//! first four bytes; zero marks an empty bucket and a real hash of zero is
//! remapped to one.

use crate::index_file::Chunk;

/// Insertions are refused beyond this fill ratio.
const LOAD_FACTOR: f64 = 0.80;

const MIN_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Default)]
struct Bucket {
    hash: u32,
    value: u32,
}

/// Signals that the table must be grown before the insert is retried.
#[derive(Debug)]
pub struct MapFull;

pub struct ChunkIndexMap {
    buckets: Vec<Bucket>,
    count: usize,
}

fn hash_checksum(checksum: &[u8; 20]) -> u32 {
    let hash = u32::from_le_bytes(checksum[..4].try_into().unwrap());
    if hash == 0 {
        1
    } else {
        hash
    }
}

impl ChunkIndexMap {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(MIN_CAPACITY);
        Self {
            buckets: vec![Bucket::default(); capacity],
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the next insert would exceed the load factor.
    pub fn should_resize(&self) -> bool {
        (self.count + 1) as f64 >= self.buckets.len() as f64 * LOAD_FACTOR
    }

    fn displacement(&self, hash: u32, position: usize) -> usize {
        let ideal = hash as usize & (self.buckets.len() - 1);
        (position + self.buckets.len() - ideal) & (self.buckets.len() - 1)
    }

    /// Find the consolidated array index for a checksum.
    pub fn find(&self, checksum: &[u8; 20], chunks: &[Chunk]) -> Option<u32> {
        let hash = hash_checksum(checksum);
        let mask = self.buckets.len() - 1;
        let mut pos = hash as usize & mask;
        let mut probes = 0;

        loop {
            let bucket = self.buckets[pos];
            if bucket.hash == 0 {
                return None;
            }
            if bucket.hash == hash {
                if let Some(chunk) = chunks.get(bucket.value as usize) {
                    if chunk.checksum == *checksum {
                        return Some(bucket.value);
                    }
                }
            }
            // a richer bucket would have displaced this entry
            if self.displacement(bucket.hash, pos) < probes {
                return None;
            }
            pos = (pos + 1) & mask;
            probes += 1;
        }
    }

    /// Insert `checksum -> index`. Fails with [`MapFull`] at the load
    /// ceiling; the caller grows the table and retries.
    pub fn insert(&mut self, checksum: &[u8; 20], index: u32) -> Result<(), MapFull> {
        if self.should_resize() {
            return Err(MapFull);
        }

        let mask = self.buckets.len() - 1;
        let mut hash = hash_checksum(checksum);
        let mut value = index;
        let mut pos = hash as usize & mask;
        let mut probes = 0;

        loop {
            let bucket = self.buckets[pos];
            if bucket.hash == 0 {
                self.buckets[pos] = Bucket { hash, value };
                self.count += 1;
                return Ok(());
            }
            let their_probes = self.displacement(bucket.hash, pos);
            if their_probes < probes {
                // take from the rich: swap and continue with the displaced entry
                self.buckets[pos] = Bucket { hash, value };
                hash = bucket.hash;
                value = bucket.value;
                probes = their_probes;
            }
            pos = (pos + 1) & mask;
            probes += 1;
        }
    }

    /// Rebuild with twice the capacity from the consolidated array.
    pub fn resize(&mut self, chunks: &[Chunk]) -> Result<(), MapFull> {
        let mut grown = ChunkIndexMap::new(self.buckets.len() * 2);
        for (index, chunk) in chunks.iter().enumerate() {
            grown.insert(&chunk.checksum, index as u32)?;
        }
        *self = grown;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn chunk_with_checksum(seed: u32) -> Chunk {
        let mut checksum = [0u8; 20];
        checksum[..4].copy_from_slice(&seed.to_le_bytes());
        checksum[4] = (seed >> 3) as u8;
        Chunk {
            checksum,
            size: 100,
            multichunk_id: 1,
            uid: seed,
        }
    }

    #[test]
    fn insert_and_find() {
        let chunks: Vec<Chunk> = (1..500).map(chunk_with_checksum).collect();
        let mut map = ChunkIndexMap::new(chunks.len() * 2);

        for (i, chunk) in chunks.iter().enumerate() {
            map.insert(&chunk.checksum, i as u32).unwrap();
        }
        assert_eq!(map.len(), chunks.len());

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(map.find(&chunk.checksum, &chunks), Some(i as u32));
        }
        assert_eq!(map.find(&[0xffu8; 20], &chunks), None);
    }

    #[test]
    fn zero_hash_is_remapped() {
        let mut checksum = [0u8; 20];
        checksum[10] = 7; // first four bytes zero
        let chunk = Chunk {
            checksum,
            size: 1,
            multichunk_id: 1,
            uid: 1,
        };
        let chunks = vec![chunk];
        let mut map = ChunkIndexMap::new(16);
        map.insert(&checksum, 0).unwrap();
        assert_eq!(map.find(&checksum, &chunks), Some(0));
    }

    #[test]
    fn refuses_beyond_load_factor_then_resizes() {
        let chunks: Vec<Chunk> = (1..=2000).map(chunk_with_checksum).collect();
        let mut map = ChunkIndexMap::new(4); // rounds up to MIN_CAPACITY

        let mut inserted = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            match map.insert(&chunk.checksum, i as u32) {
                Ok(()) => inserted += 1,
                Err(MapFull) => {
                    map.resize(&chunks[..inserted]).unwrap();
                    map.insert(&chunk.checksum, i as u32).unwrap();
                    inserted += 1;
                }
            }
        }
        assert_eq!(map.len(), chunks.len());
        assert!((map.len() as f64) < map.capacity() as f64 * LOAD_FACTOR + 1.0);

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(map.find(&chunk.checksum, &chunks), Some(i as u32));
        }
    }
}
