//! Multichunk compressors and the filter descriptor string.
//!
//! Every multichunk records how it was written as a small text triple
//! `"<maxSize>:<compressor>:AES_CTR"`, deduplicated in the index's filter
//! argument table. The compressor set is closed: `none`, `zlib` (the
//! default, small multichunks) and `zstd` (high ratio, large multichunks).

use std::io::Write;

use anyhow::{bail, Error};

use crate::error::bad_format;

/// Default multichunk payload limit for `none`/`zlib` multichunks.
pub const DEFAULT_MULTICHUNK_SIZE: usize = 250 * 1024;
/// Default multichunk payload limit when packing with zstd.
pub const ZSTD_MULTICHUNK_SIZE: usize = 25 * 1024 * 1024;

const ZSTD_LEVEL: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    None,
    Zlib,
    Zstd,
}

impl Compressor {
    pub fn name(self) -> &'static str {
        match self {
            Compressor::None => "none",
            Compressor::Zlib => "zlib",
            Compressor::Zstd => "zstd",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, Error> {
        Ok(match name {
            "none" => Compressor::None,
            "zlib" => Compressor::Zlib,
            "zstd" => Compressor::Zstd,
            other => bail!("compressor not supported: {}", other),
        })
    }

    /// The multichunk size this compressor defaults to.
    pub fn default_multichunk_size(self) -> usize {
        match self {
            Compressor::Zstd => ZSTD_MULTICHUNK_SIZE,
            _ => DEFAULT_MULTICHUNK_SIZE,
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            Compressor::None => Ok(data.to_vec()),
            Compressor::Zlib => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            Compressor::Zstd => Ok(zstd::stream::encode_all(data, ZSTD_LEVEL)?),
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            Compressor::None => Ok(data.to_vec()),
            Compressor::Zlib => {
                let mut decoder = flate2::write::ZlibDecoder::new(Vec::new());
                decoder.write_all(data)?;
                Ok(decoder.finish()?)
            }
            Compressor::Zstd => Ok(zstd::stream::decode_all(data)?),
        }
    }
}

/// A parsed filter descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterArg {
    pub max_size: usize,
    pub compressor: Compressor,
}

impl FilterArg {
    pub fn new(max_size: usize, compressor: Compressor) -> Self {
        Self {
            max_size,
            compressor,
        }
    }

    /// Render the descriptor the way it is stored in the index.
    pub fn descriptor(&self) -> String {
        format!("{}:{}:AES_CTR", self.max_size, self.compressor.name())
    }

    pub fn parse(descriptor: &str) -> Result<Self, Error> {
        let mut parts = descriptor.split(':');
        let (size, name, cipher) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(size), Some(name), Some(cipher), None) => (size, name, cipher),
            _ => return Err(bad_format(format!("malformed filter argument '{}'", descriptor))),
        };
        if cipher != "AES_CTR" {
            return Err(bad_format(format!("cipher mode not supported: {}", cipher)));
        }
        let max_size: usize = size
            .parse()
            .map_err(|_| bad_format(format!("bad multichunk size in filter '{}'", descriptor)))?;
        Ok(Self {
            max_size,
            compressor: Compressor::from_name(name)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn descriptor_round_trip() {
        let arg = FilterArg::new(DEFAULT_MULTICHUNK_SIZE, Compressor::Zlib);
        assert_eq!(arg.descriptor(), "256000:zlib:AES_CTR");
        assert_eq!(FilterArg::parse(&arg.descriptor()).unwrap(), arg);

        assert!(FilterArg::parse("256000:zlib:XTS").is_err());
        assert!(FilterArg::parse("nonsense").is_err());
        assert!(FilterArg::parse("1:lzma:AES_CTR").is_err());
    }

    #[test]
    fn compressors_round_trip() -> Result<(), Error> {
        let data: Vec<u8> = std::iter::repeat(b"frost backup data ".as_ref())
            .take(500)
            .flatten()
            .copied()
            .collect();
        for comp in [Compressor::None, Compressor::Zlib, Compressor::Zstd] {
            let packed = comp.compress(&data)?;
            assert_eq!(comp.decompress(&packed)?, data);
            if comp != Compressor::None {
                assert!(packed.len() < data.len());
            }
        }
        Ok(())
    }
}
