//! Metacache Common - Shared types and utilities
//!
//! This crate provides the content key and merkle tree types, the IP
//! facet model, error definitions and configuration used across all
//! Metacache components.

pub mod config;
pub mod error;
pub mod facet;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use facet::{CountryInfo, Facet, FacetSet, FacetSource, IpInfo, LocationInfo};
pub use types::*;
