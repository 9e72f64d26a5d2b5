//! AES-256 counter mode with Frost's nonce discipline.
//!
//! The counter block is `seed[0..8] ‖ u64 little-endian counter`, counting
//! from 1 and incremented once per 16-byte block. The seed is the first
//! 8 bytes of the owning container's SHA-256. Encryption and decryption are
//! the same XOR-with-keystream operation.

use anyhow::Error;
use openssl::symm::{Cipher, Crypter, Mode};

const BLOCK_SIZE: usize = 16;

/// Apply the AES-256-CTR keystream to `data` in place.
pub fn process(key: &[u8; 32], nonce_seed: &[u8; 8], data: &mut [u8]) -> Result<(), Error> {
    let mut ecb = Crypter::new(Cipher::aes_256_ecb(), Mode::Encrypt, key, None)?;
    ecb.pad(false);

    let mut counter: u64 = 0;
    let mut block = [0u8; BLOCK_SIZE];
    // Crypter::update needs room for one extra cipher block
    let mut keystream = [0u8; 2 * BLOCK_SIZE];

    for chunk in data.chunks_mut(BLOCK_SIZE) {
        counter += 1;
        block[..8].copy_from_slice(nonce_seed);
        block[8..].copy_from_slice(&counter.to_le_bytes());

        let n = ecb.update(&block, &mut keystream)?;
        debug_assert_eq!(n, BLOCK_SIZE);

        for (byte, ks) in chunk.iter_mut().zip(keystream.iter()) {
            *byte ^= ks;
        }
    }

    Ok(())
}

/// Streaming variant of [`process`] for whole-file transforms.
///
/// Reads `input` to its end, writing the transformed bytes to `output`.
/// Returns the number of bytes processed.
pub fn process_stream(
    key: &[u8; 32],
    nonce_seed: &[u8; 8],
    input: &mut dyn std::io::Read,
    output: &mut dyn std::io::Write,
) -> Result<u64, Error> {
    let mut ecb = Crypter::new(Cipher::aes_256_ecb(), Mode::Encrypt, key, None)?;
    ecb.pad(false);

    let mut counter: u64 = 0;
    let mut total: u64 = 0;
    let mut buf = [0u8; 64 * BLOCK_SIZE];
    let mut block = [0u8; BLOCK_SIZE];
    let mut keystream = [0u8; 2 * BLOCK_SIZE];

    loop {
        let got = read_up_to(input, &mut buf)?;
        if got == 0 {
            break;
        }
        for chunk in buf[..got].chunks_mut(BLOCK_SIZE) {
            counter += 1;
            block[..8].copy_from_slice(nonce_seed);
            block[8..].copy_from_slice(&counter.to_le_bytes());
            let n = ecb.update(&block, &mut keystream)?;
            debug_assert_eq!(n, BLOCK_SIZE);
            for (byte, ks) in chunk.iter_mut().zip(keystream.iter()) {
                *byte ^= ks;
            }
        }
        output.write_all(&buf[..got])?;
        total += got as u64;
    }

    Ok(total)
}

fn read_up_to(reader: &mut dyn std::io::Read, buf: &mut [u8]) -> Result<usize, Error> {
    let mut done = 0;
    while done < buf.len() {
        match reader.read(&mut buf[done..])? {
            0 => break,
            n => done += n,
        }
    }
    Ok(done)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() -> Result<(), Error> {
        let key = [7u8; 32];
        let seed = [3u8; 8];
        let mut data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let plain = data.clone();

        process(&key, &seed, &mut data)?;
        assert_ne!(data, plain);
        process(&key, &seed, &mut data)?;
        assert_eq!(data, plain);
        Ok(())
    }

    #[test]
    fn stream_matches_in_place() -> Result<(), Error> {
        let key = [1u8; 32];
        let seed = [9u8; 8];
        let plain: Vec<u8> = (0..4099u32).map(|i| (i * 17 % 256) as u8).collect();

        let mut buffered = plain.clone();
        process(&key, &seed, &mut buffered)?;

        let mut streamed = Vec::new();
        process_stream(&key, &seed, &mut &plain[..], &mut streamed)?;
        assert_eq!(buffered, streamed);
        Ok(())
    }
}
