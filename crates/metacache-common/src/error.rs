//! Error types for Metacache
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for Metacache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Metacache
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("storage unavailable")]
    StorageUnavailable,

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    // Lookup errors
    #[error("lookup failed: {0}")]
    Lookup(String),

    // Config errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a lookup error
    pub fn lookup(msg: impl Into<String>) -> Self {
        Self::Lookup(msg.into())
    }

    /// Check if the backing store is unusable rather than the request
    /// being bad
    #[must_use]
    pub const fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Self::DiskIo(_)
                | Self::Storage(_)
                | Self::StorageUnavailable
                | Self::DataCorruption(_)
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_storage_failure() {
        assert!(Error::StorageUnavailable.is_storage_failure());
        assert!(Error::storage("map full").is_storage_failure());
        assert!(!Error::lookup("no geo database").is_storage_failure());
        assert!(!Error::Configuration("bad map size".into()).is_storage_failure());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::Lookup("country".into()).to_string(),
            "lookup failed: country"
        );
        assert_eq!(Error::StorageUnavailable.to_string(), "storage unavailable");
    }
}
