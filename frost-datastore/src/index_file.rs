//! The index file: a single, self-describing, append-only record of the
//! entire backup history.
//!
//! After the fixed main header the file is a sequence of 4-byte aligned
//! blocks, each led by a [`DataHeader`]. One backup appends one group of
//! blocks (Chunks → ChunkLists → Multichunks → FileTree → FilterArguments →
//! Metadata → Catalog); the catalog closes the revision and points back at
//! the previous one, so the chain of catalogs is the table of contents of
//! the whole file. The main header is never rewritten: its catalog offset
//! stays 0, meaning "the newest catalog is the last block".
//!
//! Opening the file memory-maps it, walks the catalog chain and fuses every
//! revision's Chunks block into one consolidated array: chunks are recorded
//! only in the revision that first saw them, so the fusion is disjoint.
//! A crash mid-append leaves trailing bytes no catalog references; the
//! previous revision stays intact.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use proxmox_io::ReadExt;

use crate::chunk_index_map::ChunkIndexMap;
use crate::error::{bad_format, io_err, not_found};
use crate::file_formats::*;

/// One deduplicated slice of file content, 28 bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub checksum: [u8; 20],
    pub size: u16,
    /// The one multichunk physically storing this chunk's bytes.
    pub multichunk_id: u16,
    pub uid: u32,
}

impl Chunk {
    fn parse(data: &[u8]) -> Self {
        let mut checksum = [0u8; 20];
        checksum.copy_from_slice(&data[..20]);
        Self {
            checksum,
            size: u16::from_le_bytes(data[20..22].try_into().unwrap()),
            multichunk_id: u16::from_le_bytes(data[22..24].try_into().unwrap()),
            uid: u32::from_le_bytes(data[24..28].try_into().unwrap()),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.checksum);
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.multichunk_id.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
    }
}

/// An ordered sequence of chunk UIDs.
///
/// File chunk lists carry no offsets; multichunk chunk lists record each
/// chunk's byte offset inside the multichunk plaintext.
#[derive(Debug, Clone, Default)]
pub struct ChunkList {
    pub uid: u32,
    pub chunk_uids: Vec<u32>,
    /// Present iff this list describes a multichunk.
    pub offsets: Option<Vec<u32>>,
}

impl ChunkList {
    fn size_bytes(&self) -> usize {
        DATA_HEADER_SIZE
            + 4
            + self.chunk_uids.len() * 4
            + self.offsets.as_ref().map_or(0, |o| o.len() * 4)
    }

    fn parse(data: &[u8], offset: u64, file_size: u64, what: &str) -> Result<Self, Error> {
        let header = DataHeader::parse_expecting(data, offset, file_size, BlockType::ChunkList)
            .map_err(|err| bad_format(format!("{}: {}", what, err)))?;
        let size = header.size_bytes() as usize;
        if size < DATA_HEADER_SIZE + 4 {
            return Err(bad_format(format!("{} is too small", what)));
        }
        let word = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let uid = word & 0x7fff_ffff;
        let has_offsets = word & 0x8000_0000 != 0;

        let body = size - DATA_HEADER_SIZE - 4;
        let per_entry = if has_offsets { 8 } else { 4 };
        if body % per_entry != 0 {
            return Err(bad_format(format!("{} has a ragged entry array", what)));
        }
        let count = body / per_entry;

        let mut chunk_uids = Vec::with_capacity(count);
        let mut pos = 8;
        for _ in 0..count {
            chunk_uids.push(u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()));
            pos += 4;
        }
        let offsets = if has_offsets {
            let mut offsets = Vec::with_capacity(count);
            for _ in 0..count {
                offsets.push(u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()));
                pos += 4;
            }
            Some(offsets)
        } else {
            None
        };

        Ok(Self {
            uid,
            chunk_uids,
            offsets,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let header = DataHeader::new(BlockType::ChunkList, self.size_bytes());
        out.extend_from_slice(&header.encode());
        let mut word = self.uid & 0x7fff_ffff;
        if self.offsets.is_some() {
            word |= 0x8000_0000;
        }
        out.extend_from_slice(&word.to_le_bytes());
        for uid in &self.chunk_uids {
            out.extend_from_slice(&uid.to_le_bytes());
        }
        if let Some(offsets) = &self.offsets {
            for offset in offsets {
                out.extend_from_slice(&offset.to_le_bytes());
            }
        }
    }

    /// Byte offset of a chunk inside the owning multichunk (offset lists
    /// only; linear scan, the lists are short).
    pub fn chunk_offset(&self, chunk_uid: u32) -> Option<u32> {
        let offsets = self.offsets.as_ref()?;
        let pos = self.chunk_uids.iter().position(|&uid| uid == chunk_uid)?;
        offsets.get(pos).copied()
    }
}

/// Index record of one multichunk container, 44 bytes on disk.
#[derive(Debug, Clone)]
pub struct MultichunkEntry {
    pub list_id: u32,
    pub uid: u16,
    pub filter_arg_index: u16,
    /// SHA-256 of the plaintext; also the on-disk file name.
    pub checksum: [u8; 32],
}

impl MultichunkEntry {
    pub fn file_name(&self) -> String {
        crate::multichunk::multichunk_file_name(&self.checksum)
    }

    fn parse(data: &[u8], offset: u64, file_size: u64, what: &str) -> Result<Self, Error> {
        let header = DataHeader::parse_expecting(data, offset, file_size, BlockType::Multichunk)
            .map_err(|err| bad_format(format!("{}: {}", what, err)))?;
        if header.size_bytes() as usize != MULTICHUNK_ENTRY_SIZE {
            return Err(bad_format(format!("{} has an unexpected size", what)));
        }
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&data[12..44]);
        Ok(Self {
            list_id: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            uid: u16::from_le_bytes(data[8..10].try_into().unwrap()),
            filter_arg_index: u16::from_le_bytes(data[10..12].try_into().unwrap()),
            checksum,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let header = DataHeader::new(BlockType::Multichunk, MULTICHUNK_ENTRY_SIZE);
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.list_id.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.filter_arg_index.to_le_bytes());
        out.extend_from_slice(&self.checksum);
    }
}

/// One entry of a revision's file tree.
///
/// `parent_id` is 1-based (0 = no parent); the root directory item sits at
/// index 0 of every non-empty tree with an empty base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTreeItem {
    pub parent_id: u32,
    pub chunk_list_id: u32,
    pub metadata: Vec<u8>,
    pub base_name: Vec<u8>,
}

impl FileTreeItem {
    fn size_bytes(&self) -> usize {
        (12 + self.metadata.len() + self.base_name.len() + 3) & !3
    }
}

/// A complete snapshot of the source tree for one revision.
#[derive(Debug, Clone, Default)]
pub struct FileTree {
    pub revision: u32,
    pub items: Vec<FileTreeItem>,
}

impl FileTree {
    pub fn new(revision: u32) -> Self {
        Self {
            revision,
            items: Vec::new(),
        }
    }

    fn size_bytes(&self) -> usize {
        DATA_HEADER_SIZE + 8 + self.items.iter().map(|i| i.size_bytes()).sum::<usize>()
    }

    fn parse(data: &[u8], offset: u64, file_size: u64, what: &str) -> Result<Self, Error> {
        let header = DataHeader::parse_expecting(data, offset, file_size, BlockType::FileTree)
            .map_err(|err| bad_format(format!("{}: {}", what, err)))?;
        let size = header.size_bytes() as usize;
        if size < DATA_HEADER_SIZE + 8 {
            return Err(bad_format(format!("{} is too small", what)));
        }
        let revision = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let count = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;

        let mut items = Vec::with_capacity(count);
        let mut pos = 12;
        for index in 0..count {
            if pos + 12 > size {
                return Err(bad_format(format!(
                    "{}: item {} of {} is truncated",
                    what, index, count
                )));
            }
            let parent_id = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
            let chunk_list_id = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap());
            let metadata_size =
                u16::from_le_bytes(data[pos + 8..pos + 10].try_into().unwrap()) as usize;
            let base_name_size =
                u16::from_le_bytes(data[pos + 10..pos + 12].try_into().unwrap()) as usize;
            let item_size = (12 + metadata_size + base_name_size + 3) & !3;
            if pos + item_size > size {
                return Err(bad_format(format!(
                    "{}: item {} of {} overruns the block",
                    what, index, count
                )));
            }
            let meta_start = pos + 12;
            let name_start = meta_start + metadata_size;
            items.push(FileTreeItem {
                parent_id,
                chunk_list_id,
                metadata: data[meta_start..name_start].to_vec(),
                base_name: data[name_start..name_start + base_name_size].to_vec(),
            });
            pos += item_size;
        }

        Ok(Self { revision, items })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let header = DataHeader::new(BlockType::FileTree, self.size_bytes());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.revision.to_le_bytes());
        out.extend_from_slice(&(self.items.len() as u32).to_le_bytes());
        for item in &self.items {
            out.extend_from_slice(&item.parent_id.to_le_bytes());
            out.extend_from_slice(&item.chunk_list_id.to_le_bytes());
            out.extend_from_slice(&(item.metadata.len() as u16).to_le_bytes());
            out.extend_from_slice(&(item.base_name.len() as u16).to_le_bytes());
            out.extend_from_slice(&item.metadata);
            out.extend_from_slice(&item.base_name);
            let pad = item.size_bytes() - 12 - item.metadata.len() - item.base_name.len();
            out.extend_from_slice(&[0u8; 3][..pad]);
        }
    }

    /// Reassemble an item's path relative to the backup root.
    pub fn item_full_path(&self, index: usize) -> PathBuf {
        let mut segments: Vec<&[u8]> = Vec::new();
        let mut current = index;
        loop {
            let item = &self.items[current];
            if !item.base_name.is_empty() {
                segments.push(&item.base_name);
            }
            if item.parent_id == 0 {
                break;
            }
            current = (item.parent_id - 1) as usize;
        }
        let mut path = PathBuf::new();
        for segment in segments.iter().rev() {
            path.push(std::ffi::OsStr::from_bytes(segment));
        }
        path
    }

    /// Build a relative-path → item-index map for the whole tree.
    pub fn path_map(&self) -> HashMap<PathBuf, u32> {
        let mut map = HashMap::with_capacity(self.items.len());
        for index in 0..self.items.len() {
            map.insert(self.item_full_path(index), index as u32);
        }
        map
    }
}

/// A parsed catalog block plus the file offset it was read from.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub revision: u32,
    /// Creation time, seconds since the epoch, UTC.
    pub time: u32,
    pub previous: Offset,
    pub chunks: Offset,
    pub chunk_lists: Offset,
    pub chunk_lists_count: u32,
    pub multichunks: Offset,
    pub multichunks_count: u32,
    pub file_tree: Offset,
    pub filter_args: Offset,
    pub metadata: Offset,
}

impl Catalog {
    fn parse(data: &[u8], offset: u64, file_size: u64) -> Result<Self, Error> {
        let what = format!("catalog at offset {}", offset);
        let header = DataHeader::parse_expecting(data, offset, file_size, BlockType::Catalog)
            .map_err(|err| bad_format(format!("{}: {}", what, err)))?;
        if header.size_bytes() as usize != CATALOG_SIZE {
            return Err(bad_format(format!("{} has an unexpected size", what)));
        }
        let u32_at = |pos: usize| u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        let catalog = Self {
            revision: u32_at(4),
            time: u32_at(8),
            previous: Offset(u32_at(12)),
            chunks: Offset(u32_at(16)),
            chunk_lists: Offset(u32_at(20)),
            chunk_lists_count: u32_at(24),
            multichunks: Offset(u32_at(28)),
            multichunks_count: u32_at(32),
            file_tree: Offset(u32_at(36)),
            filter_args: Offset(u32_at(40)),
            metadata: Offset(u32_at(44)),
        };
        for (name, field) in [
            ("previous", catalog.previous),
            ("chunks", catalog.chunks),
            ("chunk lists", catalog.chunk_lists),
            ("multichunks", catalog.multichunks),
            ("file tree", catalog.file_tree),
            ("filter arguments", catalog.filter_args),
            ("metadata", catalog.metadata),
        ] {
            if field.file_offset() > file_size {
                return Err(bad_format(format!(
                    "{}: {} offset {} out of range",
                    what,
                    name,
                    field.file_offset()
                )));
            }
        }
        Ok(catalog)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let header = DataHeader::new(BlockType::Catalog, CATALOG_SIZE);
        out.extend_from_slice(&header.encode());
        for value in [
            self.revision,
            self.time,
            self.previous.0,
            self.chunks.0,
            self.chunk_lists.0,
            self.chunk_lists_count,
            self.multichunks.0,
            self.multichunks_count,
            self.file_tree.0,
            self.filter_args.0,
            self.metadata.0,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogInfo {
    pub catalog: Catalog,
    pub offset: u64,
}

// Read-only mapping of the whole index file.
struct Mmap {
    data: *mut u8,
    len: usize,
}

// the mapping is immutable and owned, so it can move across threads
unsafe impl Send for Mmap {}

impl Mmap {
    fn map(file: &std::fs::File, len: usize) -> Result<Self, Error> {
        let data = unsafe {
            nix::sys::mman::mmap(
                None,
                std::num::NonZeroUsize::new(len)
                    .ok_or_else(|| format_err!("cannot map an empty index file"))?,
                nix::sys::mman::ProtFlags::PROT_READ,
                nix::sys::mman::MapFlags::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        }
        .map_err(|err| io_err("unable to map the index file", err.into()))?
            as *mut u8;
        Ok(Self { data, len })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if let Err(err) =
            unsafe { nix::sys::mman::munmap(self.data as *mut std::ffi::c_void, self.len) }
        {
            log::error!("unable to unmap index file - {}", err);
        }
    }
}

fn parse_string_block(
    data: &[u8],
    offset: u64,
    file_size: u64,
    expected: BlockType,
    what: &str,
) -> Result<Vec<String>, Error> {
    let header = DataHeader::parse_expecting(data, offset, file_size, expected)
        .map_err(|err| bad_format(format!("{}: {}", what, err)))?;
    let body = &data[DATA_HEADER_SIZE..header.size_bytes() as usize];
    // trailing NUL padding closes the text
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    let text = std::str::from_utf8(&body[..end])
        .map_err(|_| bad_format(format!("{} is not valid UTF-8", what)))?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    Ok(text.lines().map(|line| line.to_string()).collect())
}

fn encode_string_block(lines: &[String], block_type: BlockType, out: &mut Vec<u8>) {
    let text = lines.join("\n");
    let padded = (text.len() + 1 + 3) & !3;
    let header = DataHeader::new(block_type, DATA_HEADER_SIZE + padded);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(text.as_bytes());
    out.extend(std::iter::repeat(0u8).take(padded - text.len()));
}

/// The open index file: mapped blocks fused into owned in-memory tables.
pub struct IndexFile {
    path: PathBuf,
    map: Option<Mmap>,
    file_size: u64,
    ciphered_master_key: [u8; CIPHERED_MASTER_KEY_SIZE],
    /// Newest first.
    catalogs: Vec<CatalogInfo>,

    consolidated: Vec<Chunk>,
    chunk_map: Option<ChunkIndexMap>,
    sorted_by_uid: bool,

    read_only: bool,
    max_chunk_uid: u32,
    prev_revision_max_chunk_uid: u32,
    max_chunk_list_uid: u32,
    max_multichunk_uid: u16,

    chunk_lists_ro: HashMap<u32, ChunkList>,
    chunk_lists_new: BTreeMap<u32, ChunkList>,
    multichunks_ro: HashMap<u16, MultichunkEntry>,
    multichunks_new: BTreeMap<u16, MultichunkEntry>,

    filter_args: Vec<String>,
    filter_args_modified: bool,
    filter_args_offset: Offset,

    metadata: Vec<String>,
    metadata_modified: bool,
    metadata_offset: Offset,

    /// The revision under construction (read-write only).
    file_tree: FileTree,
    /// The most recent committed revision's tree.
    file_tree_ro: FileTree,
}

impl IndexFile {
    /// Create a fresh index file, writing only the main header.
    pub fn create_new(
        path: &Path,
        ciphered_master_key: &[u8; CIPHERED_MASTER_KEY_SIZE],
        backup_path: &str,
    ) -> Result<Self, Error> {
        if path.exists() {
            bail!("index file {:?} already exists", path);
        }

        let header = MainHeader::new(*ciphered_master_key);
        let mut file = std::fs::File::create(path)
            .map_err(|err| io_err(format!("unable to create index file {:?}", path), err))?;
        std::io::Write::write_all(&mut file, header.as_bytes())
            .map_err(|err| io_err(format!("unable to write the main header of {:?}", path), err))?;
        file.sync_all()
            .map_err(|err| io_err(format!("unable to flush {:?}", path), err))?;

        let created = proxmox_time::epoch_to_rfc3339_utc(proxmox_time::epoch_i64())?;
        Ok(Self {
            path: path.to_owned(),
            map: None,
            file_size: MAIN_HEADER_SIZE as u64,
            ciphered_master_key: *ciphered_master_key,
            catalogs: Vec::new(),
            consolidated: Vec::new(),
            chunk_map: Some(ChunkIndexMap::new(65536)),
            sorted_by_uid: false,
            read_only: false,
            max_chunk_uid: 0,
            prev_revision_max_chunk_uid: 0,
            max_chunk_list_uid: 0,
            max_multichunk_uid: 0,
            chunk_lists_ro: HashMap::new(),
            chunk_lists_new: BTreeMap::new(),
            multichunks_ro: HashMap::new(),
            multichunks_new: BTreeMap::new(),
            filter_args: Vec::new(),
            filter_args_modified: false,
            filter_args_offset: Offset(0),
            metadata: vec![
                backup_path.to_string(),
                format!("Initial backup started on {}", created),
            ],
            metadata_modified: true,
            metadata_offset: Offset(0),
            file_tree: FileTree::new(1),
            file_tree_ro: FileTree::default(),
        })
    }

    /// Open an existing index and load the whole history into memory.
    pub fn open(path: &Path, read_write: bool) -> Result<Self, Error> {
        let mut file = std::fs::File::open(path)
            .map_err(|err| io_err(format!("unable to open index file {:?}", path), err))?;
        let stat = nix::sys::stat::fstat(file.as_raw_fd())
            .map_err(|err| io_err(format!("fstat on {:?} failed", path), err.into()))?;
        let file_size = stat.st_size as u64;

        if file_size < MAIN_HEADER_SIZE as u64 {
            return Err(bad_format(format!(
                "index file {:?} is shorter than its main header",
                path
            )));
        }

        let header: Box<MainHeader> = unsafe { file.read_host_value_boxed() }
            .map_err(|err| io_err(format!("unable to read the main header of {:?}", path), err))?;
        header.check(file_size)?;

        let mut index = Self {
            path: path.to_owned(),
            map: None,
            file_size,
            ciphered_master_key: header.ciphered_master_key,
            catalogs: Vec::new(),
            consolidated: Vec::new(),
            chunk_map: None,
            sorted_by_uid: false,
            read_only: !read_write,
            max_chunk_uid: 0,
            prev_revision_max_chunk_uid: 0,
            max_chunk_list_uid: 0,
            max_multichunk_uid: 0,
            chunk_lists_ro: HashMap::new(),
            chunk_lists_new: BTreeMap::new(),
            multichunks_ro: HashMap::new(),
            multichunks_new: BTreeMap::new(),
            filter_args: Vec::new(),
            filter_args_modified: false,
            filter_args_offset: Offset(0),
            metadata: Vec::new(),
            metadata_modified: false,
            metadata_offset: Offset(0),
            file_tree: FileTree::default(),
            file_tree_ro: FileTree::default(),
        };

        if file_size == MAIN_HEADER_SIZE as u64 {
            // created but never committed; an empty history is fine
            if read_write {
                index.chunk_map = Some(ChunkIndexMap::new(65536));
                index.file_tree = FileTree::new(1);
            }
            return Ok(index);
        }

        index.map = Some(Mmap::map(&file, file_size as usize)?);
        index.load_catalog_chain(Offset(u32::from_le(header.catalog_offset)))?;

        if read_write {
            let mut map = ChunkIndexMap::new(index.consolidated.len() * 2);
            for (pos, chunk) in index.consolidated.iter().enumerate() {
                while map.should_resize() {
                    map.resize(&index.consolidated[..pos])
                        .map_err(|_| format_err!("unable to grow the chunk index map"))?;
                }
                map.insert(&chunk.checksum, pos as u32)
                    .map_err(|_| format_err!("unable to fill the chunk index map"))?;
            }
            index.chunk_map = Some(map);
            index.prev_revision_max_chunk_uid = index.max_chunk_uid;
            index.file_tree = FileTree::new(index.current_revision() + 1);
        } else {
            index.consolidated.sort_unstable_by_key(|chunk| chunk.uid);
            index.sorted_by_uid = true;
        }

        Ok(index)
    }

    fn load_catalog_chain(&mut self, header_offset: Offset) -> Result<(), Error> {
        let file_size = self.file_size;

        let mut offset = if header_offset.is_zero() {
            file_size - CATALOG_SIZE as u64
        } else {
            header_offset.file_offset()
        };

        loop {
            if offset < MAIN_HEADER_SIZE as u64 || offset + (CATALOG_SIZE as u64) > file_size {
                return Err(bad_format(format!(
                    "catalog offset {} out of range (file size {})",
                    offset, file_size
                )));
            }
            let catalog = {
                let data = self.map.as_ref().unwrap().as_slice();
                Catalog::parse(&data[offset as usize..], offset, file_size)?
            };
            let previous = catalog.previous;

            self.load_revision_blocks(&catalog)?;
            self.catalogs.push(CatalogInfo { catalog, offset });

            if previous.is_zero() {
                break;
            }
            if previous.file_offset() >= offset {
                return Err(bad_format(format!(
                    "catalog at offset {} points forward to {}",
                    offset,
                    previous.file_offset()
                )));
            }
            offset = previous.file_offset();
        }

        // the newest catalog carries the current file tree
        let newest = self.catalogs[0].catalog.clone();
        let data = self.map.as_ref().unwrap().as_slice();
        self.file_tree_ro = FileTree::parse(
            &data[newest.file_tree.file_offset() as usize..],
            newest.file_tree.file_offset(),
            file_size,
            &format!("file tree of revision {}", newest.revision),
        )?;

        Ok(())
    }

    fn load_revision_blocks(&mut self, catalog: &Catalog) -> Result<(), Error> {
        let data = self.map.as_ref().unwrap().as_slice();
        let file_size = self.file_size;
        let revision = catalog.revision;

        // chunks: every revision adds only the chunks it first saw
        {
            let offset = catalog.chunks.file_offset();
            let what = format!("chunks block of revision {}", revision);
            let header = DataHeader::parse_expecting(
                &data[offset as usize..],
                offset,
                file_size,
                BlockType::Chunk,
            )
            .map_err(|err| bad_format(format!("{}: {}", what, err)))?;
            let size = header.size_bytes() as usize;
            if size < DATA_HEADER_SIZE + 4 || (size - DATA_HEADER_SIZE - 4) % CHUNK_ENTRY_SIZE != 0
            {
                return Err(bad_format(format!("{} has a ragged chunk array", what)));
            }
            let block = &data[offset as usize..offset as usize + size];
            let block_revision = u32::from_le_bytes(block[4..8].try_into().unwrap());
            if block_revision != revision {
                return Err(bad_format(format!(
                    "{} claims revision {}",
                    what, block_revision
                )));
            }
            let mut pos = 8;
            while pos < size {
                let chunk = Chunk::parse(&block[pos..pos + CHUNK_ENTRY_SIZE]);
                self.max_chunk_uid = self.max_chunk_uid.max(chunk.uid);
                self.consolidated.push(chunk);
                pos += CHUNK_ENTRY_SIZE;
            }
        }

        // chunk lists follow each other; the catalog records how many
        let mut offset = catalog.chunk_lists.file_offset();
        for i in 0..catalog.chunk_lists_count {
            let what = format!("chunk list {} of revision {}", i, revision);
            let list = ChunkList::parse(&data[offset as usize..], offset, file_size, &what)?;
            offset += list.size_bytes() as u64;
            self.max_chunk_list_uid = self.max_chunk_list_uid.max(list.uid);
            if self.chunk_lists_ro.insert(list.uid, list).is_some() {
                return Err(bad_format(format!("{} reuses an existing UID", what)));
            }
        }

        let mut offset = catalog.multichunks.file_offset();
        for i in 0..catalog.multichunks_count {
            let what = format!("multichunk {} of revision {}", i, revision);
            let entry = MultichunkEntry::parse(&data[offset as usize..], offset, file_size, &what)?;
            offset += MULTICHUNK_ENTRY_SIZE as u64;
            self.max_multichunk_uid = self.max_multichunk_uid.max(entry.uid);
            if self.multichunks_ro.insert(entry.uid, entry).is_some() {
                return Err(bad_format(format!("{} reuses an existing UID", what)));
            }
        }

        // the newest non-empty filter argument and metadata blocks win
        if self.filter_args.is_empty() && !catalog.filter_args.is_zero() {
            self.filter_args = parse_string_block(
                &data[catalog.filter_args.file_offset() as usize..],
                catalog.filter_args.file_offset(),
                file_size,
                BlockType::FilterArgument,
                &format!("filter arguments of revision {}", revision),
            )?;
            self.filter_args_offset = catalog.filter_args;
        }
        if self.metadata.is_empty() && !catalog.metadata.is_zero() {
            self.metadata = parse_string_block(
                &data[catalog.metadata.file_offset() as usize..],
                catalog.metadata.file_offset(),
                file_size,
                BlockType::Metadata,
                &format!("metadata of revision {}", revision),
            )?;
            self.metadata_offset = catalog.metadata;
        }

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ciphered_master_key(&self) -> &[u8; CIPHERED_MASTER_KEY_SIZE] {
        &self.ciphered_master_key
    }

    /// The most recent committed revision, 0 when the index is empty.
    pub fn current_revision(&self) -> u32 {
        self.catalogs.first().map_or(0, |info| info.catalog.revision)
    }

    /// The revision number a commit would create.
    pub fn building_revision(&self) -> u32 {
        self.file_tree.revision
    }

    pub fn catalogs(&self) -> &[CatalogInfo] {
        &self.catalogs
    }

    // ---- chunks -------------------------------------------------------

    pub fn chunk_count(&self) -> usize {
        self.consolidated.len()
    }

    /// Deduplication lookup: the UID of a chunk with this checksum.
    pub fn find_chunk_uid(&self, checksum: &[u8; 20]) -> Option<u32> {
        match &self.chunk_map {
            Some(map) => map
                .find(checksum, &self.consolidated)
                .map(|pos| self.consolidated[pos as usize].uid),
            None => self
                .consolidated
                .iter()
                .find(|chunk| chunk.checksum == *checksum)
                .map(|chunk| chunk.uid),
        }
    }

    /// Fetch a chunk record by UID.
    pub fn chunk_by_uid(&self, uid: u32) -> Option<&Chunk> {
        if self.sorted_by_uid {
            self.consolidated
                .binary_search_by_key(&uid, |chunk| chunk.uid)
                .ok()
                .map(|pos| &self.consolidated[pos])
        } else {
            self.consolidated.iter().find(|chunk| chunk.uid == uid)
        }
    }

    /// Redirect a chunk to another multichunk (purge repacking).
    pub fn set_chunk_multichunk(&mut self, uid: u32, multichunk_id: u16) -> Result<(), Error> {
        let pos = if self.sorted_by_uid {
            self.consolidated
                .binary_search_by_key(&uid, |chunk| chunk.uid)
                .map_err(|_| not_found(format!("chunk with UID {}", uid)))?
        } else {
            self.consolidated
                .iter()
                .position(|chunk| chunk.uid == uid)
                .ok_or_else(|| not_found(format!("chunk with UID {}", uid)))?
        };
        self.consolidated[pos].multichunk_id = multichunk_id;
        Ok(())
    }

    /// Record a newly stored chunk, assigning it the next UID.
    pub fn append_chunk(
        &mut self,
        checksum: [u8; 20],
        size: u16,
        multichunk_id: u16,
    ) -> Result<u32, Error> {
        if self.read_only {
            bail!("index {:?} is open read-only", self.path);
        }
        self.max_chunk_uid += 1;
        let chunk = Chunk {
            checksum,
            size,
            multichunk_id,
            uid: self.max_chunk_uid,
        };
        self.insert_chunk(chunk)?;
        Ok(chunk.uid)
    }

    /// Insert a chunk that already owns its UID (purge copy-forward).
    pub fn adopt_chunk(&mut self, chunk: Chunk) -> Result<(), Error> {
        if self.read_only {
            bail!("index {:?} is open read-only", self.path);
        }
        self.max_chunk_uid = self.max_chunk_uid.max(chunk.uid);
        self.insert_chunk(chunk)
    }

    fn insert_chunk(&mut self, chunk: Chunk) -> Result<(), Error> {
        let pos = self.consolidated.len() as u32;
        self.consolidated.push(chunk);
        let map = self
            .chunk_map
            .as_mut()
            .expect("writable index without a chunk map");
        while map.should_resize() {
            log::debug!("growing the chunk index map past {} entries", map.len());
            map.resize(&self.consolidated[..pos as usize])
                .map_err(|_| format_err!("unable to grow the chunk index map"))?;
        }
        map.insert(&chunk.checksum, pos)
            .map_err(|_| format_err!("unable to insert into the chunk index map"))?;
        Ok(())
    }

    // ---- chunk lists and multichunks ----------------------------------

    pub fn chunk_list(&self, uid: u32) -> Option<&ChunkList> {
        self.chunk_lists_ro
            .get(&uid)
            .or_else(|| self.chunk_lists_new.get(&uid))
    }

    pub fn multichunk(&self, uid: u16) -> Option<&MultichunkEntry> {
        self.multichunks_ro
            .get(&uid)
            .or_else(|| self.multichunks_new.get(&uid))
    }

    /// All multichunk UIDs present in the index.
    pub fn multichunk_uids(&self) -> Vec<u16> {
        let mut uids: Vec<u16> = self
            .multichunks_ro
            .keys()
            .chain(self.multichunks_new.keys())
            .copied()
            .collect();
        uids.sort_unstable();
        uids
    }

    /// The largest chunk list UID currently in use.
    pub fn max_chunk_list_uid(&self) -> u32 {
        self.max_chunk_list_uid
    }

    /// Reserve the UID the next new multichunk will use.
    pub fn allocate_multichunk_uid(&mut self) -> u16 {
        self.max_multichunk_uid += 1;
        self.max_multichunk_uid
    }

    /// Register a finished multichunk and its offset chunk list.
    pub fn append_multichunk(
        &mut self,
        mut entry: MultichunkEntry,
        chunk_uids: Vec<u32>,
        offsets: Vec<u32>,
    ) -> Result<(), Error> {
        if self.read_only {
            bail!("index {:?} is open read-only", self.path);
        }
        self.max_chunk_list_uid += 1;
        let list = ChunkList {
            uid: self.max_chunk_list_uid,
            chunk_uids,
            offsets: Some(offsets),
        };
        entry.list_id = list.uid;
        if self.multichunk(entry.uid).is_some() && !self.multichunks_new.contains_key(&entry.uid) {
            bail!("multichunk UID {} already recorded", entry.uid);
        }
        self.chunk_lists_new.insert(list.uid, list);
        self.multichunks_new.insert(entry.uid, entry);
        Ok(())
    }

    /// Insert a multichunk entry preserving its UIDs (purge copy-forward).
    pub fn adopt_multichunk(&mut self, entry: MultichunkEntry) -> Result<(), Error> {
        if self.read_only {
            bail!("index {:?} is open read-only", self.path);
        }
        self.max_multichunk_uid = self.max_multichunk_uid.max(entry.uid);
        self.multichunks_new.insert(entry.uid, entry);
        Ok(())
    }

    /// Insert a chunk list preserving its UID (purge copy-forward).
    pub fn adopt_chunk_list(&mut self, list: ChunkList) -> Result<(), Error> {
        if self.read_only {
            bail!("index {:?} is open read-only", self.path);
        }
        self.max_chunk_list_uid = self.max_chunk_list_uid.max(list.uid);
        self.chunk_lists_new.insert(list.uid, list);
        Ok(())
    }

    // ---- file tree ----------------------------------------------------

    /// Append an item to the revision under construction.
    ///
    /// Regular files pass their ordered chunk UIDs; everything else stores
    /// an empty chunk list ID. Returns the item's index in the tree.
    pub fn append_file_item(
        &mut self,
        parent_id: u32,
        base_name: Vec<u8>,
        metadata: Vec<u8>,
        file_chunks: Option<Vec<u32>>,
    ) -> Result<u32, Error> {
        if self.read_only {
            bail!("index {:?} is open read-only", self.path);
        }
        let chunk_list_id = match file_chunks {
            Some(chunk_uids) => {
                self.max_chunk_list_uid += 1;
                let list = ChunkList {
                    uid: self.max_chunk_list_uid,
                    chunk_uids,
                    offsets: None,
                };
                self.chunk_lists_new.insert(list.uid, list);
                self.max_chunk_list_uid
            }
            None => 0,
        };
        let index = self.file_tree.items.len() as u32;
        self.file_tree.items.push(FileTreeItem {
            parent_id,
            chunk_list_id,
            metadata,
            base_name,
        });
        Ok(index)
    }

    /// Append an item that reuses a previous revision's chunk list
    /// (the backup engine's "unchanged file" path).
    pub fn append_reused_file_item(
        &mut self,
        parent_id: u32,
        base_name: Vec<u8>,
        metadata: Vec<u8>,
        chunk_list_id: u32,
    ) -> Result<u32, Error> {
        if self.read_only {
            bail!("index {:?} is open read-only", self.path);
        }
        let index = self.file_tree.items.len() as u32;
        self.file_tree.items.push(FileTreeItem {
            parent_id,
            chunk_list_id,
            metadata,
            base_name,
        });
        Ok(index)
    }

    /// The tree being built by the current backup.
    pub fn building_tree(&self) -> &FileTree {
        &self.file_tree
    }

    /// The newest committed revision's tree.
    pub fn latest_tree(&self) -> &FileTree {
        &self.file_tree_ro
    }

    /// Load any revision's file tree.
    pub fn get_file_tree(&self, revision: u32) -> Result<FileTree, Error> {
        if revision == 0 {
            return Err(not_found("revision 0 does not exist".to_string()));
        }
        if revision == self.file_tree_ro.revision {
            return Ok(self.file_tree_ro.clone());
        }
        let info = self
            .catalogs
            .iter()
            .find(|info| info.catalog.revision == revision)
            .ok_or_else(|| not_found(format!("revision {}", revision)))?;
        let data = self
            .map
            .as_ref()
            .ok_or_else(|| not_found(format!("revision {}", revision)))?
            .as_slice();
        FileTree::parse(
            &data[info.catalog.file_tree.file_offset() as usize..],
            info.catalog.file_tree.file_offset(),
            self.file_size,
            &format!("file tree of revision {}", revision),
        )
    }

    fn catalog_for_revision(&self, revision: u32) -> Result<&CatalogInfo, Error> {
        self.catalogs
            .iter()
            .find(|info| info.catalog.revision == revision)
            .ok_or_else(|| not_found(format!("revision {}", revision)))
    }

    fn mapped(&self) -> Result<&[u8], Error> {
        Ok(self
            .map
            .as_ref()
            .ok_or_else(|| not_found("the index file holds no revisions".to_string()))?
            .as_slice())
    }

    /// The chunks first seen by one revision (its Chunks block).
    pub fn revision_chunks(&self, revision: u32) -> Result<Vec<Chunk>, Error> {
        let info = self.catalog_for_revision(revision)?;
        let data = self.mapped()?;
        let offset = info.catalog.chunks.file_offset();
        let what = format!("chunks block of revision {}", revision);
        let header =
            DataHeader::parse_expecting(&data[offset as usize..], offset, self.file_size, BlockType::Chunk)
                .map_err(|err| bad_format(format!("{}: {}", what, err)))?;
        let size = header.size_bytes() as usize;
        let block = &data[offset as usize..offset as usize + size];
        let mut chunks = Vec::new();
        let mut pos = DATA_HEADER_SIZE + 4;
        while pos + CHUNK_ENTRY_SIZE <= size {
            chunks.push(Chunk::parse(&block[pos..pos + CHUNK_ENTRY_SIZE]));
            pos += CHUNK_ENTRY_SIZE;
        }
        Ok(chunks)
    }

    /// The chunk lists recorded by one revision, in file order.
    pub fn revision_chunk_lists(&self, revision: u32) -> Result<Vec<ChunkList>, Error> {
        let info = self.catalog_for_revision(revision)?;
        let count = info.catalog.chunk_lists_count;
        let mut offset = info.catalog.chunk_lists.file_offset();
        let data = self.mapped()?;
        let mut lists = Vec::with_capacity(count as usize);
        for i in 0..count {
            let what = format!("chunk list {} of revision {}", i, revision);
            let list = ChunkList::parse(&data[offset as usize..], offset, self.file_size, &what)?;
            offset += list.size_bytes() as u64;
            lists.push(list);
        }
        Ok(lists)
    }

    /// The multichunk entries recorded by one revision, in file order.
    pub fn revision_multichunks(&self, revision: u32) -> Result<Vec<MultichunkEntry>, Error> {
        let info = self.catalog_for_revision(revision)?;
        let count = info.catalog.multichunks_count;
        let mut offset = info.catalog.multichunks.file_offset();
        let data = self.mapped()?;
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count {
            let what = format!("multichunk {} of revision {}", i, revision);
            let entry = MultichunkEntry::parse(&data[offset as usize..], offset, self.file_size, &what)?;
            offset += MULTICHUNK_ENTRY_SIZE as u64;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Load any revision's metadata lines.
    pub fn revision_metadata(&self, revision: u32) -> Result<Vec<String>, Error> {
        let info = self
            .catalogs
            .iter()
            .find(|info| info.catalog.revision == revision)
            .ok_or_else(|| not_found(format!("revision {}", revision)))?;
        if info.catalog.metadata.is_zero() {
            return Ok(Vec::new());
        }
        let data = self
            .map
            .as_ref()
            .ok_or_else(|| not_found(format!("revision {}", revision)))?
            .as_slice();
        parse_string_block(
            &data[info.catalog.metadata.file_offset() as usize..],
            info.catalog.metadata.file_offset(),
            self.file_size,
            BlockType::Metadata,
            &format!("metadata of revision {}", revision),
        )
    }

    // ---- filter arguments and metadata --------------------------------

    /// Index of a filter descriptor, appending it when new.
    pub fn filter_arg_index(&mut self, descriptor: &str) -> u16 {
        if let Some(pos) = self.filter_args.iter().position(|arg| arg == descriptor) {
            return pos as u16;
        }
        self.filter_args.push(descriptor.to_string());
        self.filter_args_modified = true;
        (self.filter_args.len() - 1) as u16
    }

    pub fn filter_arg(&self, index: u16) -> Option<&str> {
        self.filter_args.get(index as usize).map(|s| s.as_str())
    }

    /// Replace the filter table wholesale (purge copy-forward keeps the
    /// old indices valid this way).
    pub fn set_filter_args(&mut self, args: Vec<String>) {
        self.filter_args = args;
        self.filter_args_modified = true;
    }

    pub fn filter_args(&self) -> &[String] {
        &self.filter_args
    }

    pub fn metadata_lines(&self) -> &[String] {
        &self.metadata
    }

    pub fn reset_metadata(&mut self) {
        self.metadata.clear();
        self.metadata_modified = false;
    }

    pub fn append_metadata(&mut self, line: String) {
        self.metadata.push(line);
        self.metadata_modified = true;
    }

    /// Append a suffix to the last metadata line (the "finished on" note).
    pub fn amend_last_metadata(&mut self, suffix: &str) {
        if let Some(last) = self.metadata.last_mut() {
            last.push_str(suffix);
            self.metadata_modified = true;
        }
    }

    /// Line 0 of the oldest revision's metadata: the original backup path.
    pub fn initial_backup_path(&self) -> Option<String> {
        if self.catalogs.is_empty() {
            return self.metadata.first().cloned();
        }
        let oldest = self.catalogs.last()?.catalog.revision;
        self.revision_metadata(oldest)
            .ok()
            .and_then(|lines| lines.first().cloned())
    }

    // ---- commit -------------------------------------------------------

    /// Append the revision under construction to the file.
    ///
    /// Blocks land in dependency order, catalog last, so a crash at any
    /// point leaves the previous catalog as the newest complete one.
    pub fn commit(&mut self) -> Result<(), Error> {
        if self.read_only {
            bail!("index {:?} is open read-only", self.path);
        }

        let revision = self.file_tree.revision;
        let base = self.file_size;
        let mut buf: Vec<u8> = Vec::new();
        let mut catalog = Catalog {
            revision,
            time: proxmox_time::epoch_i64() as u32,
            previous: Offset::from_file_offset(self.catalogs.first().map_or(0, |c| c.offset)),
            chunks: Offset(0),
            chunk_lists: Offset(0),
            chunk_lists_count: self.chunk_lists_new.len() as u32,
            multichunks: Offset(0),
            multichunks_count: self.multichunks_new.len() as u32,
            file_tree: Offset(0),
            filter_args: self.filter_args_offset,
            metadata: self.metadata_offset,
        };

        // chunks first seen by this revision
        catalog.chunks = Offset::from_file_offset(base + buf.len() as u64);
        {
            let new_chunks: Vec<&Chunk> = self
                .consolidated
                .iter()
                .filter(|chunk| chunk.uid > self.prev_revision_max_chunk_uid)
                .collect();
            let size = DATA_HEADER_SIZE + 4 + new_chunks.len() * CHUNK_ENTRY_SIZE;
            buf.extend_from_slice(&DataHeader::new(BlockType::Chunk, size).encode());
            buf.extend_from_slice(&revision.to_le_bytes());
            for chunk in new_chunks {
                chunk.encode_into(&mut buf);
            }
        }

        catalog.chunk_lists = Offset::from_file_offset(base + buf.len() as u64);
        for list in self.chunk_lists_new.values() {
            list.encode_into(&mut buf);
        }

        catalog.multichunks = Offset::from_file_offset(base + buf.len() as u64);
        for entry in self.multichunks_new.values() {
            entry.encode_into(&mut buf);
        }

        catalog.file_tree = Offset::from_file_offset(base + buf.len() as u64);
        self.file_tree.encode_into(&mut buf);

        if self.filter_args_modified {
            catalog.filter_args = Offset::from_file_offset(base + buf.len() as u64);
            encode_string_block(&self.filter_args, BlockType::FilterArgument, &mut buf);
        }
        if self.metadata_modified {
            catalog.metadata = Offset::from_file_offset(base + buf.len() as u64);
            encode_string_block(&self.metadata, BlockType::Metadata, &mut buf);
        }

        let catalog_offset = base + buf.len() as u64;
        catalog.encode_into(&mut buf);

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|err| io_err(format!("unable to reopen index {:?}", self.path), err))?;
        std::io::Write::write_all(&mut file, &buf)
            .map_err(|err| io_err("cannot grow the index file (disk full?)", err))?;
        file.sync_all()
            .map_err(|err| io_err(format!("unable to flush {:?}", self.path), err))?;

        log::info!(
            "committed revision {} ({} bytes appended) to {:?}",
            revision,
            buf.len(),
            self.path
        );

        self.file_size = base + buf.len() as u64;
        self.catalogs.insert(
            0,
            CatalogInfo {
                catalog,
                offset: catalog_offset,
            },
        );
        self.file_tree_ro = std::mem::take(&mut self.file_tree);
        // further mutation requires a fresh open
        self.read_only = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::FrostError;

    fn temp_index(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "frost-index-test-{}-{}.frost",
            std::process::id(),
            name
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn checksum(seed: u8) -> [u8; 20] {
        let mut cs = [seed; 20];
        cs[0] = seed.wrapping_add(1);
        cs
    }

    fn build_one_revision(path: &Path) -> Result<(), Error> {
        let mut index = IndexFile::create_new(path, &[7u8; 108], "/src/tree")?;

        let mc_uid = index.allocate_multichunk_uid();
        let c1 = index.append_chunk(checksum(1), 100, mc_uid)?;
        let c2 = index.append_chunk(checksum(2), 200, mc_uid)?;
        let filter = index.filter_arg_index("256000:zlib:AES_CTR");
        index.append_multichunk(
            MultichunkEntry {
                list_id: 0,
                uid: mc_uid,
                filter_arg_index: filter,
                checksum: [0xabu8; 32],
            },
            vec![c1, c2],
            vec![0, 122],
        )?;

        let root_meta = vec![1u8; 40];
        index.append_file_item(0, Vec::new(), root_meta.clone(), None)?;
        index.append_file_item(1, b"file.txt".to_vec(), root_meta, Some(vec![c1, c2]))?;

        index.append_metadata("FileCount: 1".to_string());
        index.commit()
    }

    #[test]
    fn create_commit_reopen() -> Result<(), Error> {
        let path = temp_index("roundtrip");
        build_one_revision(&path)?;

        let index = IndexFile::open(&path, false)?;
        assert_eq!(index.current_revision(), 1);
        assert_eq!(index.chunk_count(), 2);
        assert_eq!(index.ciphered_master_key(), &[7u8; 108]);

        let chunk = index.chunk_by_uid(1).expect("chunk 1");
        assert_eq!(chunk.size, 100);
        let mc = index.multichunk(chunk.multichunk_id).expect("multichunk");
        assert_eq!(mc.checksum, [0xabu8; 32]);
        let list = index.chunk_list(mc.list_id).expect("multichunk list");
        assert_eq!(list.chunk_uids, vec![1, 2]);
        assert_eq!(list.chunk_offset(2), Some(122));

        let tree = index.latest_tree();
        assert_eq!(tree.revision, 1);
        assert_eq!(tree.items.len(), 2);
        assert_eq!(
            tree.item_full_path(1),
            PathBuf::from("file.txt")
        );

        // the file item's list has no offsets
        let file_list = index.chunk_list(tree.items[1].chunk_list_id).unwrap();
        assert!(file_list.offsets.is_none());

        assert_eq!(index.filter_arg(0), Some("256000:zlib:AES_CTR"));
        assert_eq!(index.metadata_lines().last().unwrap(), "FileCount: 1");

        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn second_revision_only_stores_the_delta() -> Result<(), Error> {
        let path = temp_index("delta");
        build_one_revision(&path)?;

        let mut index = IndexFile::open(&path, true)?;
        assert_eq!(index.building_revision(), 2);
        assert_eq!(index.find_chunk_uid(&checksum(1)), Some(1));

        let mc_uid = index.allocate_multichunk_uid();
        assert_eq!(mc_uid, 2);
        let c3 = index.append_chunk(checksum(3), 300, mc_uid)?;
        assert_eq!(c3, 3);
        let filter = index.filter_arg_index("256000:zlib:AES_CTR");
        assert_eq!(filter, 0);
        index.append_multichunk(
            MultichunkEntry {
                list_id: 0,
                uid: mc_uid,
                filter_arg_index: filter,
                checksum: [0xcdu8; 32],
            },
            vec![c3],
            vec![0],
        )?;
        index.append_file_item(0, Vec::new(), vec![1u8; 40], None)?;
        index.append_file_item(1, b"new.bin".to_vec(), vec![1u8; 40], Some(vec![c3, 1]))?;
        index.append_metadata("Revision 2".to_string());
        index.commit()?;

        let reopened = IndexFile::open(&path, false)?;
        assert_eq!(reopened.current_revision(), 2);
        assert_eq!(reopened.chunk_count(), 3);
        assert_eq!(reopened.catalogs().len(), 2);
        // the old revision's tree is still loadable
        let old_tree = reopened.get_file_tree(1)?;
        assert_eq!(old_tree.items.len(), 2);
        // chunks of revision 1 were not rewritten
        let rev2_cat = &reopened.catalogs()[0].catalog;
        let rev1_cat = &reopened.catalogs()[1].catalog;
        assert!(rev2_cat.previous.file_offset() > 0);
        assert_eq!(rev1_cat.previous.0, 0);

        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn empty_index_is_usable() -> Result<(), Error> {
        let path = temp_index("empty");
        drop(IndexFile::create_new(&path, &[9u8; 108], "/src")?);

        let index = IndexFile::open(&path, true)?;
        assert_eq!(index.current_revision(), 0);
        assert_eq!(index.building_revision(), 1);
        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn truncation_reports_the_failing_block() -> Result<(), Error> {
        let path = temp_index("truncated");
        build_one_revision(&path)?;

        let data = std::fs::read(&path)?;
        for cut in [data.len() - 1, data.len() - 20, data.len() - CATALOG_SIZE - 1] {
            std::fs::write(&path, &data[..cut])?;
            let err = IndexFile::open(&path, false).expect_err("truncated index must not open");
            match err.downcast_ref::<FrostError>() {
                Some(FrostError::BadFormat(msg)) => {
                    assert!(!msg.is_empty());
                }
                other => panic!("expected BadFormat, got {:?}", other),
            }
        }

        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn bad_magic_is_rejected() -> Result<(), Error> {
        let path = temp_index("magic");
        build_one_revision(&path)?;
        let mut data = std::fs::read(&path)?;
        data[0] = b'X';
        std::fs::write(&path, &data)?;

        let err = IndexFile::open(&path, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FrostError>(),
            Some(FrostError::BadFormat(_))
        ));
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
