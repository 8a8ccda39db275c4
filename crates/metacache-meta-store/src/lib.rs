//! Metacache Range Store - persistent IP range tables
//!
//! This crate stores country, location and P2P guard ranges plus a small
//! registry in redb, and answers per-address facet lookups from them.

pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use store::{RangeStore, RangeStoreError, RangeStoreResult};
pub use types::{
    CountryRow, LocationRow, P2PGuardRow, P2PGuardSource, RangeRow, RangeTable, RegistryKey,
};
