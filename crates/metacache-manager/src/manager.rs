//! Metadata manager
//!
//! Answers per-address facet queries from an in-memory LRU cache backed
//! by a [`FacetSource`], and file metadata queries from the mapped store
//! with a small tree cache in front of it.

use metacache_common::config::{CacheConfig, GeoConfig};
use metacache_common::{
    Config, ContentKey, CountryInfo, Error, Facet, FacetSet, FacetSource, IpInfo, LocationInfo,
    MerkleTree, Result, is_public_ipv4,
};
use metacache_meta_store::RangeStore;
use metacache_storage::{FifoCache, FileDb, FileInfo, LruCache, StoreStats};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Metadata manager
///
/// The IP cache, the tree cache and the mapped store each have their own
/// lock, so cache hits never wait on disk I/O. Facet lookups run without
/// holding any cache lock.
pub struct MetadataManager {
    /// File records and trees
    file_db: FileDb,
    /// Facets per IPv4 address
    ip_cache: Mutex<LruCache<u32, IpInfo>>,
    /// Recently stored trees
    tree_cache: Mutex<FifoCache<ContentKey, MerkleTree>>,
    /// Backing facet lookups
    facets: Arc<dyn FacetSource>,
    /// Range tables for manual blocks, if the facets come from them
    ranges: Option<Arc<RangeStore>>,
    cache_config: CacheConfig,
    geo_config: GeoConfig,
}

impl MetadataManager {
    /// Create a manager over an already opened file database
    pub fn new(config: &Config, file_db: FileDb, facets: Arc<dyn FacetSource>) -> Self {
        Self {
            file_db,
            ip_cache: Mutex::new(LruCache::with_capacity(config.cache.ip_cache_size)),
            tree_cache: Mutex::new(FifoCache::with_capacity(config.cache.tree_cache_size)),
            facets,
            ranges: None,
            cache_config: config.cache.clone(),
            geo_config: config.geo.clone(),
        }
    }

    /// Open the mapped store and answer facets from `facets`
    ///
    /// A store that fails to open leaves the manager running with file
    /// metadata disabled.
    pub fn open(config: &Config, facets: Arc<dyn FacetSource>) -> Self {
        let manager = Self::new(config, FileDb::open(&config.store), facets);
        info!(
            "Metadata manager opened at {:?} (store available: {})",
            config.store.data_dir,
            manager.file_db.store().is_available()
        );
        manager
    }

    /// Open with facets answered from the range tables, enabling manual blocks
    pub fn open_with_ranges(config: &Config, ranges: Arc<RangeStore>) -> Self {
        let facets: Arc<dyn FacetSource> = ranges.clone();
        let mut manager = Self::open(config, facets);
        manager.ranges = Some(ranges);
        manager
    }

    /// Flush and close the store, and drop all cached entries
    pub fn shutdown(&self) {
        if let Err(e) = self.file_db.store().flush() {
            error!("Failed to flush metadata store: {}", e);
        }
        self.file_db.store().close();
        self.ip_cache.lock().clear();
        self.tree_cache.lock().clear();
        info!("Metadata manager shut down");
    }

    // ---- IP facets ----

    /// Get the requested facets of an address
    ///
    /// Facets already cached are answered from memory. With `allow_fetch`
    /// the rest are looked up and merged into the cache; otherwise they
    /// are left unknown in the result.
    pub fn get_ip_info(&self, ip: u32, facets: FacetSet, allow_fetch: bool) -> IpInfo {
        let mut result = IpInfo::default();
        let mut missing = facets;

        {
            let mut cache = self.ip_cache.lock();
            let mut found = FacetSet::EMPTY;
            if let Some(entry) = cache.get(&ip) {
                found = entry.known.intersection(missing);
                for facet in found.iter() {
                    result.copy_facet(entry, facet);
                }
            }
            if !found.is_empty() {
                cache.make_newest(&ip);
                missing = missing.difference(found);
            }
        }

        if missing.is_empty() || !allow_fetch {
            return result;
        }

        let fetched = self.fetch_facets(ip, missing);
        if fetched.known.is_empty() {
            return result;
        }

        let mut cache = self.ip_cache.lock();
        match cache.add(ip, fetched.clone()) {
            Ok(()) => {
                for facet in fetched.known.iter() {
                    result.copy_facet(&fetched, facet);
                }
            }
            Err(entry) => {
                // Keep whatever a concurrent fetch stored first
                for facet in fetched.known.iter() {
                    if !entry.known.contains(facet) {
                        entry.copy_facet(&fetched, facet);
                    }
                    result.copy_facet(entry, facet);
                }
            }
        }
        cache.remove_oldest(self.cache_config.ip_cache_size + 1);
        result
    }

    /// Look up each facet independently; failed ones stay unknown
    fn fetch_facets(&self, ip: u32, facets: FacetSet) -> IpInfo {
        let mut info = IpInfo::default();
        for facet in facets.iter() {
            match facet {
                Facet::Country => {
                    if !is_public_ipv4(ip) {
                        info.set_country(CountryInfo::default());
                        continue;
                    }
                    match self.facets.lookup_country(ip) {
                        Ok(country) => info.set_country(country.unwrap_or_default()),
                        Err(e) => log_lookup_failure(ip, facet, &e),
                    }
                }
                Facet::Location => {
                    if !self.geo_config.use_custom_locations {
                        info.set_location(LocationInfo::default());
                        continue;
                    }
                    match self.facets.lookup_location(ip) {
                        Ok(location) => info.set_location(location.unwrap_or_default()),
                        Err(e) => log_lookup_failure(ip, facet, &e),
                    }
                }
                Facet::P2PGuard => match self.facets.lookup_p2p_guard(ip) {
                    Ok(note) => info.set_p2p_guard(note.unwrap_or_default()),
                    Err(e) => log_lookup_failure(ip, facet, &e),
                },
            }
        }
        info
    }

    /// Forget one cached facet of an address
    pub fn clear_cached_facet(&self, ip: u32, facet: Facet) {
        if let Some(entry) = self.ip_cache.lock().get_mut(&ip) {
            entry.clear_facet(facet);
        }
    }

    pub fn clear_cached_p2p_guard(&self, ip: u32) {
        self.clear_cached_facet(ip, Facet::P2PGuard);
    }

    /// Drop all cached addresses
    pub fn clear_ip_cache(&self) {
        self.ip_cache.lock().clear();
    }

    /// Number of cached addresses
    pub fn ip_cache_len(&self) -> usize {
        self.ip_cache.lock().len()
    }

    /// Block a single address by hand
    pub fn block_ip(&self, ip: u32, note: &str) -> Result<()> {
        let ranges = self.ranges.as_ref().ok_or(Error::StorageUnavailable)?;
        ranges.add_manual_block(ip, note)?;
        self.clear_cached_p2p_guard(ip);
        info!("Blocked {} manually", Ipv4Addr::from(ip));
        Ok(())
    }

    /// Remove a manual block; returns whether one existed
    pub fn unblock_ip(&self, ip: u32) -> Result<bool> {
        let ranges = self.ranges.as_ref().ok_or(Error::StorageUnavailable)?;
        let removed = ranges.remove_manual_block(ip)?;
        self.clear_cached_p2p_guard(ip);
        Ok(removed)
    }

    // ---- File metadata ----

    pub fn get_file_info(&self, key: &ContentKey) -> Option<FileInfo> {
        debug_assert!(!key.is_zero(), "zero content key");
        self.file_db.get_file_info(key)
    }

    /// Merge file information into the stored record
    ///
    /// Returns false if the store rejected the write or nothing changed.
    pub fn put_file_info(
        &self,
        key: &ContentKey,
        flags: u16,
        file_size: u64,
        path: Option<&str>,
        inc_upload_count: bool,
    ) -> bool {
        debug_assert!(!key.is_zero(), "zero content key");
        match self
            .file_db
            .put_file_info(key, flags, file_size, path, inc_upload_count)
        {
            Ok(written) => written,
            Err(e) => {
                error!("Failed to store file info for {}: {}", key, e);
                false
            }
        }
    }

    /// Get a tree from the tree cache, falling back to the store
    pub fn get_tree(&self, root: &ContentKey) -> Option<MerkleTree> {
        debug_assert!(!root.is_zero(), "zero content key");
        if let Some(tree) = self.tree_cache.lock().get(root) {
            return Some(tree.clone());
        }
        self.file_db.get_tree(root)
    }

    /// Cache a tree and persist it if it has more than one leaf
    ///
    /// A tree already cached under the same root is only replaced by one
    /// with more leaves; otherwise nothing changes and false is returned.
    pub fn put_tree(&self, tree: &MerkleTree) -> bool {
        debug_assert!(!tree.root().is_zero(), "zero content key");
        {
            let mut cache = self.tree_cache.lock();
            cache.remove_oldest(self.cache_config.tree_cache_size);
            if let Err(existing) = cache.add(*tree.root(), tree.clone()) {
                if tree.leaves().len() <= existing.leaves().len() {
                    return false;
                }
                *existing = tree.clone();
            }
        }

        if tree.leaves().len() < 2 {
            debug!("Tree {} cached only", tree.root());
            return true;
        }
        match self.file_db.put_tree(tree) {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to store tree {}: {}", tree.root(), e);
                false
            }
        }
    }

    /// Mapped store statistics, `None` if the store is disabled
    pub fn store_stats(&self) -> Option<StoreStats> {
        self.file_db.store().stats()
    }
}

fn log_lookup_failure(ip: u32, facet: Facet, e: &Error) {
    warn!("Failed to look up {} for {}: {}", facet, Ipv4Addr::from(ip), e);
}
