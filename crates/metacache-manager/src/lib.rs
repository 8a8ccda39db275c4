//! Metacache Manager - metadata cache orchestration
//!
//! This crate ties the mapped file store, the in-memory caches and the
//! range tables together: per-address facet lookups with caching, file
//! metadata and merkle tree access, the IP trust list and the loaders
//! that fill the range tables from text files.

pub mod iptrust;
pub mod loaders;
pub mod manager;

// Re-exports
pub use iptrust::IpTrust;
pub use loaders::{LoadError, LoadOutcome, RangeLoader};
pub use manager::MetadataManager;
