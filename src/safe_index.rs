//! Optional at-rest encryption of the index file itself (`--safeindex`).
//!
//! The clear index stays local; a ciphered copy `index.frost.aes` is kept
//! in the remote directory: a small header (magic, 16 byte nonce, SHA-256
//! of the plaintext) followed by the AES-CTR encrypted index. The key is
//! the password-derived key, not the master key, so the index can be
//! recovered with the password alone. The ciphered copy carries the clear
//! file's mtime; matching timestamps and sizes mean the local clear copy
//! is current and decryption can be skipped.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{bail, format_err, Error};

use frost_datastore::file_formats::{CipheredIndexHeader, CIPHERED_INDEX_HEADER_SIZE};
use frost_datastore::file_meta::copy_mtime;
use frost_key_config::aes_ctr;
use proxmox_io::ReadExt;
use proxmox_lang::try_block;

/// Encrypt the clear index into its `.aes` companion.
pub fn encrypt_index(index_path: &Path, aes_path: &Path, password_key: &[u8; 32]) -> Result<(), Error> {
    let mut input = std::fs::File::open(index_path)
        .map_err(|err| format_err!("unable to open index {:?} - {}", index_path, err))?;

    let mut nonce = [0u8; 16];
    proxmox_sys::linux::fill_with_random_data(&mut nonce)?;
    let mut header = CipheredIndexHeader::new(nonce);

    let mut output = std::fs::File::create(aes_path)
        .map_err(|err| format_err!("unable to create {:?} - {}", aes_path, err))?;
    output.write_all(header.as_bytes())?;

    // hash the plaintext while encrypting it
    let mut hasher = openssl::sha::Sha256::new();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&nonce[..8]);

    let mut hashing_input = HashingReader {
        inner: &mut input,
        hasher: &mut hasher,
    };
    aes_ctr::process_stream(password_key, &seed, &mut hashing_input, &mut output)?;

    header.hash = hasher.finish();
    output.seek(SeekFrom::Start(0))?;
    output.write_all(header.as_bytes())?;
    output.flush()?;
    drop(output);

    // pair the two files so the cache shortcut below works
    copy_mtime(index_path, aes_path)?;
    Ok(())
}

/// Make sure a clear index exists locally, decrypting the `.aes` copy when
/// needed. With `force`, the ciphered copy must exist and is always
/// decrypted.
pub fn ensure_valid_index(
    aes_path: &Path,
    index_path: &Path,
    password_key: &[u8; 32],
    force: bool,
) -> Result<(), Error> {
    if !aes_path.exists() {
        if force {
            bail!("encrypted index {:?} does not exist", aes_path);
        }
        if !index_path.exists() {
            bail!(
                "both the encrypted index {:?} and the local index {:?} are missing",
                aes_path,
                index_path
            );
        }
        return Ok(());
    }

    if !force && index_path.exists() {
        let enc = std::fs::metadata(aes_path)?;
        let dec = std::fs::metadata(index_path)?;
        let same_time = enc.modified().ok() == dec.modified().ok();
        if same_time && enc.len() == dec.len() + CIPHERED_INDEX_HEADER_SIZE as u64 {
            return Ok(()); // the cached clear copy is current
        }
    }

    log::info!("decrypting {:?} to {:?}", aes_path, index_path);
    let mut input = std::fs::File::open(aes_path)?;
    let header_bytes = input.read_exact_allocated(CIPHERED_INDEX_HEADER_SIZE)?;
    let header = CipheredIndexHeader::parse(&header_bytes)?;

    let mut seed = [0u8; 8];
    seed.copy_from_slice(&header.nonce[..8]);

    let mut hasher = openssl::sha::Sha256::new();
    try_block!({
        let mut output = std::fs::File::create(index_path)?;
        let mut hashing_output = HashingWriter {
            inner: &mut output,
            hasher: &mut hasher,
        };
        aes_ctr::process_stream(password_key, &seed, &mut input, &mut hashing_output)?;
        output.flush()?;
        Ok(())
    })
    .map_err(|err: Error| format_err!("error while decrypting {:?} - {}", aes_path, err))?;

    if hasher.finish() != header.hash {
        let _ = std::fs::remove_file(index_path);
        bail!(
            "the decrypted index does not match the hash recorded in {:?} (wrong password?)",
            aes_path
        );
    }

    copy_mtime(aes_path, index_path)?;
    Ok(())
}

struct HashingReader<'a, R: Read> {
    inner: &'a mut R,
    hasher: &'a mut openssl::sha::Sha256,
}

impl<R: Read> Read for HashingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

struct HashingWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: &'a mut openssl::sha::Sha256,
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
