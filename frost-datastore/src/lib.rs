//! Frost's storage engine.
//!
//! # Data flow
//!
//! Backup splits file contents into variable-size chunks with a
//! content-defined [chunker](chunker::Chunker); the SHA-1 of a chunk is its
//! identity, so identical content is stored once across the whole backup
//! set. Chunks accumulate in [multichunk](multichunk::MultiChunk)
//! containers which are compressed, encrypted and written to the backup
//! directory named by the SHA-256 of their plaintext. Every fact needed to
//! reconstruct the tree lives in a single append-only
//! [index file](index_file::IndexFile).
//!
//! Restore runs the pipeline backwards, with a byte-bounded
//! [cache](multichunk_cache::MultichunkCache) of decoded multichunks.

pub mod chunk_index_map;
pub mod chunker;
pub mod compression;
pub mod error;
pub mod file_formats;
pub mod file_meta;
pub mod index_file;
pub mod multichunk;
pub mod multichunk_cache;

pub use chunker::{ChunkStream, Chunker};
pub use compression::{Compressor, FilterArg};
pub use error::FrostError;
pub use file_meta::ItemMetadata;
pub use index_file::{Chunk, ChunkList, FileTree, FileTreeItem, IndexFile, MultichunkEntry};
pub use multichunk::{read_multichunk, write_multichunk, MultiChunk};
pub use multichunk_cache::MultichunkCache;
