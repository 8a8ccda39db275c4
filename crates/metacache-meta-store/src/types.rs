//! Stored types for range persistence.
//!
//! Rows are serialized to redb via bincode, grouped per start address.

use serde::{Deserialize, Serialize};

/// Row with an inclusive end address
pub trait RangeRow {
    fn end(&self) -> u32;
}

/// Country of an address range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryRow {
    pub end: u32,
    pub name: String,
    /// Packed lowercase two-letter code
    pub code: u16,
}

/// User-defined location of an address range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRow {
    pub end: u32,
    pub location: String,
    pub image: u32,
}

/// P2P guard note for an address range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2PGuardRow {
    pub end: u32,
    pub note: String,
    pub source: P2PGuardSource,
}

impl RangeRow for CountryRow {
    fn end(&self) -> u32 {
        self.end
    }
}

impl RangeRow for LocationRow {
    fn end(&self) -> u32 {
        self.end
    }
}

impl RangeRow for P2PGuardRow {
    fn end(&self) -> u32 {
        self.end
    }
}

/// Where a P2P guard row came from
///
/// Reloading one source replaces only that source's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum P2PGuardSource {
    /// `P2PGuard.ini`
    P2PGuardIni,
    /// `iblocklist-com.ini`
    IBlockList,
    /// Blocked by hand
    Manual,
}

/// Range tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeTable {
    Country,
    Location,
    P2PGuard,
}

/// Registry entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKey {
    TimeStampCustomLocation,
    TimeStampIBlockList,
    TimeStampP2PGuard,
}

impl RegistryKey {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TimeStampCustomLocation => "timestamp.custom_location",
            Self::TimeStampIBlockList => "timestamp.iblocklist",
            Self::TimeStampP2PGuard => "timestamp.p2pguard",
        }
    }
}
