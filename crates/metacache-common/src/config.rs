//! Configuration types for Metacache
//!
//! This module defines configuration structures used across components.
//! Every section has defaults, so a config file only needs to name the
//! values it changes.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix for environment variable overrides (`METACACHE_STORE__DATA_DIR`, ...)
pub const ENV_PREFIX: &str = "METACACHE";

/// Root configuration for Metacache
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mapped file-metadata store
    pub store: StoreConfig,
    /// In-process caches
    pub cache: CacheConfig,
    /// IP facet lookups
    pub geo: GeoConfig,
}

impl Config {
    /// Load configuration from an optional file plus environment overrides
    ///
    /// The file format is taken from its extension (TOML, JSON, YAML...).
    /// A missing file is not an error; defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Mapped store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the store file and the range database
    pub data_dir: PathBuf,
    /// Map size used when the store file is created or smaller
    pub initial_map_size: u64,
    /// Flush the written range of the map after every commit
    pub sync_on_commit: bool,
}

impl StoreConfig {
    /// Map size floor regardless of configuration
    pub const MIN_MAP_SIZE: u64 = 64 * 1024;

    #[cfg(target_pointer_width = "64")]
    pub const DEFAULT_MAP_SIZE: u64 = 1024 * 1024 * 1024; // 1 GB
    #[cfg(not(target_pointer_width = "64"))]
    pub const DEFAULT_MAP_SIZE: u64 = 400 * 1024 * 1024; // 400 MB

    /// Create config with data directory
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Configured map size, raised to the floor
    #[must_use]
    pub fn effective_map_size(&self) -> u64 {
        self.initial_map_size.max(Self::MIN_MAP_SIZE)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./metacache"),
            initial_map_size: Self::DEFAULT_MAP_SIZE,
            sync_on_commit: true,
        }
    }
}

/// Cache sizes
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of IP addresses with cached facets
    pub ip_cache_size: usize,
    /// Maximum number of merkle trees kept in memory
    pub tree_cache_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ip_cache_size: 3000,
            tree_cache_size: 300,
        }
    }
}

/// IP facet lookup configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Look up user-defined locations; when off the facet is always empty
    pub use_custom_locations: bool,
    /// Consult the IP trust list
    pub enable_ip_trust: bool,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            use_custom_locations: true,
            enable_ip_trust: true,
        }
    }
}
