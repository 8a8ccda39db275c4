//! Core type definitions for Metacache
//!
//! This module defines the content key used to address file metadata,
//! the merkle tree carried alongside it, and IPv4 address helpers.

use derive_more::{AsRef, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Size of a content hash in bytes (Tiger tree hash)
pub const HASH_SIZE: usize = 24;

/// Smallest leaf block size of a merkle tree
pub const BASE_BLOCK_SIZE: u64 = 1024;

/// Fixed-size content hash identifying a metadata record
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into, AsRef)]
pub struct ContentKey([u8; HASH_SIZE]);

impl ContentKey {
    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, which must be exactly `HASH_SIZE` bytes
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Parse from a hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// True for the all-zero hash, which never names real content
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", hex::encode(self.0))
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Merkle hash tree of a file
///
/// The root is computed by the hashing subsystem; this type only carries
/// it together with the leaf level, which is what gets persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleTree {
    root: ContentKey,
    file_size: u64,
    block_size: u64,
    leaves: Vec<ContentKey>,
}

impl MerkleTree {
    /// Build a tree from its root and leaf hashes
    #[must_use]
    pub fn new(root: ContentKey, file_size: u64, leaves: Vec<ContentKey>) -> Self {
        let block_size = Self::block_size_for(file_size, leaves.len());
        Self {
            root,
            file_size,
            block_size,
            leaves,
        }
    }

    /// Tree of a file small enough to consist of its root only
    #[must_use]
    pub fn single(root: ContentKey, file_size: u64) -> Self {
        Self::new(root, file_size, vec![root])
    }

    /// Load a tree from concatenated leaf hashes
    ///
    /// Returns `None` unless `data` is a whole number of hashes.
    #[must_use]
    pub fn from_leaf_bytes(root: ContentKey, file_size: u64, data: &[u8]) -> Option<Self> {
        if data.is_empty() || data.len() % HASH_SIZE != 0 {
            return None;
        }
        let leaves = data
            .chunks_exact(HASH_SIZE)
            .filter_map(ContentKey::from_slice)
            .collect();
        Some(Self::new(root, file_size, leaves))
    }

    /// Leaf block size implied by the file size and leaf count
    #[must_use]
    pub fn block_size_for(file_size: u64, leaf_count: usize) -> u64 {
        let count = leaf_count.max(1) as u64;
        let mut block_size = BASE_BLOCK_SIZE;
        // Capped at 2^63 for sizes a single leaf cannot cover
        while block_size.saturating_mul(count) < file_size && block_size <= u64::MAX / 2 {
            block_size <<= 1;
        }
        block_size
    }

    #[must_use]
    pub const fn root(&self) -> &ContentKey {
        &self.root
    }

    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub fn leaves(&self) -> &[ContentKey] {
        &self.leaves
    }

    /// Concatenated leaf hashes, as stored on disk
    #[must_use]
    pub fn leaf_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.leaves.len() * HASH_SIZE);
        for leaf in &self.leaves {
            buf.extend_from_slice(leaf.as_bytes());
        }
        buf
    }
}

/// Check whether an IPv4 address (host byte order) is publicly routable
///
/// Private, loopback, link-local, carrier-grade NAT, multicast,
/// broadcast and unspecified addresses are not.
#[must_use]
pub fn is_public_ipv4(addr: u32) -> bool {
    let ip = Ipv4Addr::from(addr);
    let [a, b, ..] = ip.octets();
    let shared = a == 100 && (64..128).contains(&b);
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || shared
        || a == 0
        || a >= 240)
}
