//! Metacache Storage Engine
//!
//! This crate implements the local storage layer of Metacache:
//! - Tagged-item record codec for file metadata
//! - Memory-mapped content-key store with doubling growth
//! - File metadata database (flags, path, upload count, merkle leaves)
//! - FIFO and LRU eviction caches
//! - IPv4 interval map with a range text parser

pub mod cache;
pub mod file_db;
pub mod iplist;
pub mod mapped;
pub mod record;

// Re-exports
pub use cache::{FifoCache, LruCache};
pub use file_db::{FileDb, FileInfo};
pub use iplist::{IpList, ParseError, ParseOptions, ParsedRange, RangeError, parse_line, parse_range};
pub use mapped::{MappedStore, SnapshotState, StoreError, StoreStats};
pub use record::{ItemHeader, ItemParser, ItemType, Record, RecordHeader, RecordView, encode_item, upsert};
