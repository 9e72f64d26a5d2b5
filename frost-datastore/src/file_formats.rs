//! On-disk constants and primitive framing of the index file.
//!
//! The index is a binary, memory-mappable, append-only file. All integers
//! are native little-endian, all blocks are 4-byte aligned and all offsets
//! are stored in units of 4 bytes (capping the index at 16 GiB).

use crate::error::bad_format;
use anyhow::Error;

/// Index file magic, "Frst".
pub const INDEX_MAGIC: [u8; 4] = *b"Frst";
/// Current index format version.
pub const INDEX_VERSION: u32 = 2;
/// Default index file name inside the backup directory.
pub const DEFAULT_INDEX_NAME: &str = "index.frost";
/// Suffix of the optional ciphered index copy.
pub const CIPHERED_INDEX_SUFFIX: &str = ".aes";

/// Magic of the ciphered index header.
pub const CIPHERED_INDEX_MAGIC: [u8; 4] = *b"FrsE";

/// Size of the ECIES-wrapped master key in the main header.
pub const CIPHERED_MASTER_KEY_SIZE: usize = 108;
/// Fixed size of the main header.
pub const MAIN_HEADER_SIZE: usize = 148;
/// Fixed size of a catalog block.
pub const CATALOG_SIZE: usize = 48;
/// Size of one chunk entry inside a chunks block.
pub const CHUNK_ENTRY_SIZE: usize = 28;
/// Fixed size of a multichunk block.
pub const MULTICHUNK_ENTRY_SIZE: usize = 44;
/// Size of the block header (type + size word).
pub const DATA_HEADER_SIZE: usize = 4;
/// Size of the ciphered index header.
pub const CIPHERED_INDEX_HEADER_SIZE: usize = 52;

/// The closed set of block types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockType {
    Catalog = 0,
    Chunk = 1,
    ChunkList = 2,
    Multichunk = 3,
    FilterArgument = 4,
    FileTree = 5,
    Metadata = 6,
    Extended = 7,
}

impl BlockType {
    pub fn name(self) -> &'static str {
        match self {
            BlockType::Catalog => "Catalog",
            BlockType::Chunk => "Chunk",
            BlockType::ChunkList => "ChunkList",
            BlockType::Multichunk => "Multichunk",
            BlockType::FilterArgument => "FilterArgument",
            BlockType::FileTree => "FileTree",
            BlockType::Metadata => "Metadata",
            BlockType::Extended => "Extended",
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => BlockType::Catalog,
            1 => BlockType::Chunk,
            2 => BlockType::ChunkList,
            3 => BlockType::Multichunk,
            4 => BlockType::FilterArgument,
            5 => BlockType::FileTree,
            6 => BlockType::Metadata,
            _ => BlockType::Extended,
        }
    }
}

/// The 4 byte block header: 3 bits of type, 29 bits of size in words.
///
/// The size covers the whole block, header included.
#[derive(Debug, Clone, Copy)]
pub struct DataHeader {
    pub block_type: BlockType,
    size_words: u32,
}

impl DataHeader {
    pub fn new(block_type: BlockType, size_bytes: usize) -> Self {
        Self {
            block_type,
            size_words: ((size_bytes + 3) / 4) as u32,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_words as u64 * 4
    }

    pub fn encode(&self) -> [u8; 4] {
        ((self.block_type as u32) | (self.size_words << 3)).to_le_bytes()
    }

    /// Decode and bounds-check a block header at `offset` of a file of
    /// `file_size` bytes. `what` names the block for error reporting.
    pub fn parse(
        data: &[u8],
        offset: u64,
        file_size: u64,
        what: &str,
    ) -> Result<Self, Error> {
        if data.len() < DATA_HEADER_SIZE {
            return Err(bad_format(format!(
                "{} at offset {} is truncated",
                what, offset
            )));
        }
        let word = u32::from_le_bytes(data[..4].try_into().unwrap());
        let header = Self {
            block_type: BlockType::from_bits(word & 0x7),
            size_words: word >> 3,
        };
        if header.size_bytes() < DATA_HEADER_SIZE as u64
            || offset + header.size_bytes() > file_size
        {
            return Err(bad_format(format!(
                "{} at offset {} claims {} bytes, beyond the file end ({})",
                what,
                offset,
                header.size_bytes(),
                file_size
            )));
        }
        Ok(header)
    }

    /// Like [`parse`], additionally checking the block type.
    pub fn parse_expecting(
        data: &[u8],
        offset: u64,
        file_size: u64,
        expected: BlockType,
    ) -> Result<Self, Error> {
        let header = Self::parse(data, offset, file_size, expected.name())?;
        if header.block_type != expected {
            return Err(bad_format(format!(
                "expected a {} block at offset {}, found {}",
                expected.name(),
                offset,
                header.block_type.name()
            )));
        }
        Ok(header)
    }
}

/// A file offset stored in 4-byte units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Offset(pub u32);

impl Offset {
    pub fn from_file_offset(offset: u64) -> Self {
        debug_assert!(offset & 3 == 0, "offsets must be 4-byte aligned");
        Self((offset >> 2) as u32)
    }

    pub fn file_offset(self) -> u64 {
        self.0 as u64 * 4
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// The index file's fixed header, written exactly once at creation.
///
/// `catalog_offset == 0` means the most recent catalog is the last block in
/// the file; that is the normal, append-only case.
#[repr(C)]
pub struct MainHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub catalog_offset: u32,
    pub ciphered_master_key: [u8; CIPHERED_MASTER_KEY_SIZE],
    reserved: [u8; 28],
}
proxmox_lang::static_assert_size!(MainHeader, MAIN_HEADER_SIZE);

impl MainHeader {
    pub fn new(ciphered_master_key: [u8; CIPHERED_MASTER_KEY_SIZE]) -> Self {
        Self {
            magic: INDEX_MAGIC,
            version: INDEX_VERSION.to_le(),
            catalog_offset: 0,
            ciphered_master_key,
            reserved: [0u8; 28],
        }
    }

    pub fn check(&self, file_size: u64) -> Result<(), Error> {
        if self.magic != INDEX_MAGIC {
            return Err(bad_format("main header magic mismatch".to_string()));
        }
        if u32::from_le(self.version) != INDEX_VERSION {
            return Err(bad_format(format!(
                "unsupported index version {}",
                u32::from_le(self.version)
            )));
        }
        let catalog = Offset(u32::from_le(self.catalog_offset)).file_offset();
        if catalog != 0 && catalog + CATALOG_SIZE as u64 > file_size {
            return Err(bad_format(format!(
                "main header catalog offset {} out of range (file size {})",
                catalog, file_size
            )));
        }
        if self.ciphered_master_key.iter().all(|&b| b == 0) {
            return Err(bad_format("main header has no ciphered master key".to_string()));
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8; MAIN_HEADER_SIZE] {
        unsafe { &*(self as *const MainHeader as *const [u8; MAIN_HEADER_SIZE]) }
    }
}

/// Header of `index.frost.aes`, the optional encrypted index copy.
#[repr(C)]
pub struct CipheredIndexHeader {
    pub magic: [u8; 4],
    pub nonce: [u8; 16],
    /// SHA-256 of the plaintext index file.
    pub hash: [u8; 32],
}
proxmox_lang::static_assert_size!(CipheredIndexHeader, CIPHERED_INDEX_HEADER_SIZE);

impl CipheredIndexHeader {
    pub fn new(nonce: [u8; 16]) -> Self {
        Self {
            magic: CIPHERED_INDEX_MAGIC,
            nonce,
            hash: [0u8; 32],
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < CIPHERED_INDEX_HEADER_SIZE {
            return Err(bad_format("ciphered index header truncated".to_string()));
        }
        let mut header = Self::new([0u8; 16]);
        header.magic.copy_from_slice(&data[0..4]);
        header.nonce.copy_from_slice(&data[4..20]);
        header.hash.copy_from_slice(&data[20..52]);
        if header.magic != CIPHERED_INDEX_MAGIC {
            return Err(bad_format("ciphered index magic mismatch".to_string()));
        }
        Ok(header)
    }

    pub fn as_bytes(&self) -> &[u8; CIPHERED_INDEX_HEADER_SIZE] {
        unsafe { &*(self as *const CipheredIndexHeader as *const [u8; CIPHERED_INDEX_HEADER_SIZE]) }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn data_header_round_trip() {
        let header = DataHeader::new(BlockType::FileTree, 123);
        assert_eq!(header.size_bytes(), 124); // rounded to words
        let bytes = header.encode();
        let parsed = DataHeader::parse(&bytes, 0, 1024, "test block").unwrap();
        assert_eq!(parsed.block_type, BlockType::FileTree);
        assert_eq!(parsed.size_bytes(), 124);
    }

    #[test]
    fn data_header_rejects_oversized_blocks() {
        let bytes = DataHeader::new(BlockType::Chunk, 4096).encode();
        let err = DataHeader::parse(&bytes, 512, 1024, "chunks block").unwrap_err();
        assert!(err.to_string().contains("chunks block"));
    }

    #[test]
    fn main_header_checks() {
        let mut header = MainHeader::new([1u8; CIPHERED_MASTER_KEY_SIZE]);
        header.check(MAIN_HEADER_SIZE as u64).unwrap();

        header.magic = *b"Nope";
        assert!(header.check(1024).is_err());

        let header = MainHeader::new([0u8; CIPHERED_MASTER_KEY_SIZE]);
        assert!(header.check(1024).is_err());
    }
}
