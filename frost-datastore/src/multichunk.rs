//! Multichunk containers.
//!
//! Chunks are not stored one file each; they are appended to a multichunk
//! buffer which, once full, is compressed, encrypted and written out as a
//! single file named by the SHA-256 of its plaintext. The plaintext is a
//! sequence of self-describing records:
//!
//! ```text
//! size: u16 LE ‖ sha1: [u8; 20] ‖ data[size]     (repeated)
//! ```
//!
//! The on-disk file is `salt[32] ‖ AES-256-CTR(compress(plaintext))`, the
//! session key derived from the master key and the salt, the CTR nonce
//! seeded by the first 8 bytes of the plaintext SHA-256.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Error};

use frost_key_config::{aes_ctr, KeyFactory};
use proxmox_io::ReadExt;

use crate::compression::FilterArg;
use crate::error::{bad_format, crypto_err, io_err, not_found};

/// Bytes of bookkeeping per stored chunk.
pub const CHUNK_HEADER_SIZE: usize = 2 + 20;

/// Suffix of multichunk files in the backup directory.
pub const MULTICHUNK_SUFFIX: &str = ".#";

/// File base name for a multichunk with the given plaintext digest.
pub fn multichunk_file_name(digest: &[u8; 32]) -> String {
    format!("{}{}", hex::encode(digest), MULTICHUNK_SUFFIX)
}

/// In-memory multichunk plaintext.
pub struct MultiChunk {
    data: Vec<u8>,
    max_size: usize,
}

impl MultiChunk {
    pub fn new(max_size: usize) -> Self {
        Self {
            data: Vec::new(),
            max_size,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Whether a chunk of `chunk_size` bytes still fits.
    pub fn can_fit(&self, chunk_size: usize) -> bool {
        self.data.len() + CHUNK_HEADER_SIZE + chunk_size <= self.max_size
    }

    /// Append a chunk record, returning its byte offset in the plaintext.
    pub fn append_chunk(&mut self, data: &[u8], checksum: &[u8; 20]) -> u32 {
        debug_assert!(data.len() <= u16::MAX as usize);
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(&(data.len() as u16).to_le_bytes());
        self.data.extend_from_slice(checksum);
        self.data.extend_from_slice(data);
        offset
    }

    /// Locate a chunk by checksum.
    ///
    /// With an offset from the multichunk's chunk list this is O(1);
    /// without one the records are scanned.
    pub fn find_chunk(&self, checksum: &[u8; 20], offset: Option<u32>) -> Result<&[u8], Error> {
        if let Some(offset) = offset {
            let (cs, data) = self.record_at(offset as usize)?;
            if cs != *checksum {
                return Err(crypto_err(format!(
                    "chunk at offset {} has checksum {}, expected {}",
                    offset,
                    hex::encode(cs),
                    hex::encode(checksum)
                )));
            }
            return Ok(data);
        }

        let mut pos = 0;
        while pos < self.data.len() {
            let (cs, data) = self.record_at(pos)?;
            if cs == *checksum {
                return Ok(data);
            }
            pos += CHUNK_HEADER_SIZE + data.len();
        }
        Err(not_found(format!(
            "chunk {} not present in multichunk",
            hex::encode(checksum)
        )))
    }

    fn record_at(&self, pos: usize) -> Result<([u8; 20], &[u8]), Error> {
        if pos + CHUNK_HEADER_SIZE > self.data.len() {
            return Err(bad_format(format!(
                "multichunk record header at {} exceeds payload size {}",
                pos,
                self.data.len()
            )));
        }
        let size = u16::from_le_bytes(self.data[pos..pos + 2].try_into().unwrap()) as usize;
        let mut checksum = [0u8; 20];
        checksum.copy_from_slice(&self.data[pos + 2..pos + CHUNK_HEADER_SIZE]);
        let start = pos + CHUNK_HEADER_SIZE;
        if start + size > self.data.len() {
            return Err(bad_format(format!(
                "multichunk record at {} ({} bytes) exceeds payload size {}",
                pos,
                size,
                self.data.len()
            )));
        }
        Ok((checksum, &self.data[start..start + size]))
    }

    /// Re-hash every record and check it against its stored checksum.
    pub fn verify_records(&self) -> Result<(), Error> {
        let mut pos = 0;
        while pos < self.data.len() {
            let (checksum, data) = self.record_at(pos)?;
            if openssl::sha::sha1(data) != checksum {
                return Err(crypto_err(format!(
                    "chunk record at offset {} fails its checksum",
                    pos
                )));
            }
            pos += CHUNK_HEADER_SIZE + data.len();
        }
        Ok(())
    }

    /// SHA-256 of the plaintext, the multichunk's identity.
    pub fn digest(&self) -> [u8; 32] {
        openssl::sha::sha256(&self.data)
    }

    /// Normalized Shannon entropy (0.0 .. 1.0) of a chunk's bytes.
    ///
    /// High-entropy data will not compress; the packer routes it to an
    /// encrypt-only multichunk when a threshold below 1.0 is configured.
    pub fn chunk_entropy(data: &[u8]) -> f64 {
        if data.is_empty() {
            return 0.0;
        }
        let mut histogram = [0u64; 256];
        for &byte in data {
            histogram[byte as usize] += 1;
        }
        let len = data.len() as f64;
        let mut entropy = 0.0;
        for &count in histogram.iter() {
            if count > 0 {
                let p = count as f64 / len;
                entropy -= p * p.log2();
            }
        }
        entropy / 8.0
    }

    /// Compress, encrypt and serialize the plaintext.
    ///
    /// Returns the file content (`salt ‖ ciphertext`) and the plaintext
    /// digest the file must be named after.
    pub fn pack(
        &self,
        filter: &FilterArg,
        keys: &KeyFactory,
    ) -> Result<(Vec<u8>, [u8; 32]), Error> {
        let digest = self.digest();
        let mut payload = filter.compressor.compress(&self.data)?;

        let session = keys.derive_session_key()?;
        let mut nonce_seed = [0u8; 8];
        nonce_seed.copy_from_slice(&digest[..8]);
        aes_ctr::process(&session.key, &nonce_seed, &mut payload)?;

        let mut out = Vec::with_capacity(32 + payload.len());
        out.extend_from_slice(&session.salt);
        out.extend_from_slice(&payload);
        Ok((out, digest))
    }

    /// Reverse of [`pack`]: decrypt, decompress, verify.
    pub fn unpack(
        file_data: &[u8],
        filter: &FilterArg,
        expected_digest: &[u8; 32],
        keys: &KeyFactory,
    ) -> Result<Self, Error> {
        if file_data.len() < 32 {
            return Err(bad_format(format!(
                "multichunk file too small ({} bytes)",
                file_data.len()
            )));
        }
        let mut salt = [0u8; 32];
        salt.copy_from_slice(&file_data[..32]);
        let key = keys.derive_with_salt(&salt);

        let mut payload = file_data[32..].to_vec();
        let mut nonce_seed = [0u8; 8];
        nonce_seed.copy_from_slice(&expected_digest[..8]);
        aes_ctr::process(&key, &nonce_seed, &mut payload)?;

        let data = filter
            .compressor
            .decompress(&payload)
            .map_err(|err| crypto_err(format!("multichunk does not decompress - {}", err)))?;

        let multichunk = Self {
            data,
            max_size: filter.max_size,
        };
        multichunk.verify_records()?;
        if multichunk.digest() != *expected_digest {
            return Err(crypto_err(
                "multichunk plaintext does not match its file name hash".to_string(),
            ));
        }
        Ok(multichunk)
    }
}

/// Read and decode one multichunk file.
///
/// The expected plaintext hash is decoded from the file's base name.
pub fn read_multichunk(
    path: &Path,
    filter: &FilterArg,
    keys: &KeyFactory,
) -> Result<MultiChunk, Error> {
    let stem = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(MULTICHUNK_SUFFIX))
        .ok_or_else(|| bad_format(format!("not a multichunk file name: {:?}", path)))?;
    let digest_vec = hex::decode(stem)
        .map_err(|_| bad_format(format!("multichunk name is not base16: {:?}", path)))?;
    let digest: [u8; 32] = digest_vec
        .try_into()
        .map_err(|_| bad_format(format!("multichunk name has the wrong length: {:?}", path)))?;

    let mut file = std::fs::File::open(path)
        .map_err(|err| not_found(format!("missing multichunk file {:?} - {}", path, err)))?;
    let mut data = Vec::new();
    // salt first; this also rejects empty files with a clean error
    let salt = file
        .read_exact_allocated(32)
        .map_err(|err| bad_format(format!("multichunk {:?} has no salt - {}", path, err)))?;
    data.extend_from_slice(&salt);
    file.read_to_end(&mut data)
        .map_err(|err| io_err(format!("reading multichunk {:?}", path), err))?;

    MultiChunk::unpack(&data, filter, &digest, keys)
        .with_context(|| format!("decoding multichunk {:?}", path))
}

/// Pack and write a multichunk into the backup directory.
///
/// Returns the plaintext digest and the encrypted file size.
pub fn write_multichunk(
    dir: &Path,
    multichunk: &MultiChunk,
    filter: &FilterArg,
    keys: &KeyFactory,
) -> Result<([u8; 32], u64), Error> {
    let (file_data, digest) = multichunk.pack(filter, keys)?;
    let path = dir.join(multichunk_file_name(&digest));
    std::fs::write(&path, &file_data)
        .map_err(|err| io_err(format!("unable to write multichunk {:?} (disk full?)", path), err))?;
    log::debug!(
        "wrote multichunk {} ({} -> {} bytes)",
        hex::encode(digest),
        multichunk.size(),
        file_data.len()
    );
    Ok((digest, file_data.len() as u64))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compression::Compressor;

    fn sample() -> (MultiChunk, Vec<(Vec<u8>, [u8; 20], u32)>) {
        let mut mc = MultiChunk::new(64 * 1024);
        let mut chunks = Vec::new();
        for i in 0..5u8 {
            let data: Vec<u8> = (0..600 + i as usize * 37).map(|j| (j as u8) ^ i).collect();
            let checksum = openssl::sha::sha1(&data);
            let offset = mc.append_chunk(&data, &checksum);
            chunks.push((data, checksum, offset));
        }
        (mc, chunks)
    }

    #[test]
    fn find_with_and_without_offsets() -> Result<(), Error> {
        let (mc, chunks) = sample();
        mc.verify_records()?;
        for (data, checksum, offset) in &chunks {
            assert_eq!(mc.find_chunk(checksum, Some(*offset))?, &data[..]);
            assert_eq!(mc.find_chunk(checksum, None)?, &data[..]);
        }
        assert!(mc.find_chunk(&[0u8; 20], None).is_err());
        Ok(())
    }

    #[test]
    fn pack_unpack_round_trip() -> Result<(), Error> {
        let keys = KeyFactory::with_master_key([3u8; 32]);
        for compressor in [Compressor::None, Compressor::Zlib, Compressor::Zstd] {
            let filter = FilterArg::new(64 * 1024, compressor);
            let (mc, chunks) = sample();
            let (file_data, digest) = mc.pack(&filter, &keys)?;

            let unpacked = MultiChunk::unpack(&file_data, &filter, &digest, &keys)?;
            assert_eq!(unpacked.digest(), digest);
            for (data, checksum, offset) in &chunks {
                assert_eq!(unpacked.find_chunk(checksum, Some(*offset))?, &data[..]);
            }
        }
        Ok(())
    }

    #[test]
    fn wrong_key_is_detected() -> Result<(), Error> {
        let keys = KeyFactory::with_master_key([3u8; 32]);
        let other = KeyFactory::with_master_key([4u8; 32]);
        let filter = FilterArg::new(64 * 1024, Compressor::Zlib);
        let (mc, _) = sample();
        let (file_data, digest) = mc.pack(&filter, &keys)?;
        assert!(MultiChunk::unpack(&file_data, &filter, &digest, &other).is_err());
        Ok(())
    }

    #[test]
    fn entropy_orders_data() {
        let flat = vec![0u8; 4096];
        let mixed: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        let low = MultiChunk::chunk_entropy(&flat);
        let high = MultiChunk::chunk_entropy(&mixed);
        assert!(low < 0.01);
        assert!(high > 0.9);
        assert!(high <= 1.0);
    }
}
