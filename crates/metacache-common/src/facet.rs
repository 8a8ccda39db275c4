//! IP address facets
//!
//! A facet is one independently cacheable attribute of an IP address:
//! its country, a user-defined location, or a P2P-guard note. Each
//! facet has its own backing lookup, exposed through [`FacetSource`].

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One cacheable attribute of an IP address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facet {
    Country,
    Location,
    P2PGuard,
}

impl Facet {
    pub const ALL: [Self; 3] = [Self::Country, Self::Location, Self::P2PGuard];

    const fn bit(self) -> u8 {
        match self {
            Self::Country => 0x01,
            Self::Location => 0x02,
            Self::P2PGuard => 0x04,
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Country => write!(f, "country"),
            Self::Location => write!(f, "location"),
            Self::P2PGuard => write!(f, "p2p-guard"),
        }
    }
}

/// Bitmask of facets
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FacetSet(u8);

impl FacetSet {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(0x07);

    #[must_use]
    pub const fn contains(self, facet: Facet) -> bool {
        self.0 & facet.bit() != 0
    }

    pub fn insert(&mut self, facet: Facet) {
        self.0 |= facet.bit();
    }

    pub fn remove(&mut self, facet: Facet) {
        self.0 &= !facet.bit();
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Iterate over the facets in this set
    pub fn iter(self) -> impl Iterator<Item = Facet> {
        Facet::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

impl From<Facet> for FacetSet {
    fn from(facet: Facet) -> Self {
        Self(facet.bit())
    }
}

impl FromIterator<Facet> for FacetSet {
    fn from_iter<I: IntoIterator<Item = Facet>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for facet in iter {
            set.insert(facet);
        }
        set
    }
}

impl fmt::Debug for FacetSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Country of an IP address
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryInfo {
    /// Country name
    pub name: String,
    /// Two-letter lowercase country code, packed as `(c0 << 8) | c1`
    pub code: u16,
}

impl CountryInfo {
    /// Build from a name and an ISO 3166 code
    ///
    /// Codes that are not two ASCII letters are stored as 0.
    #[must_use]
    pub fn new(name: impl Into<String>, iso_code: &str) -> Self {
        let code = match iso_code.as_bytes() {
            [a, b] if a.is_ascii_alphabetic() && b.is_ascii_alphabetic() => {
                (u16::from(a.to_ascii_lowercase()) << 8) | u16::from(b.to_ascii_lowercase())
            }
            _ => 0,
        };
        Self {
            name: name.into(),
            code,
        }
    }

    /// The two-letter code, if any
    #[must_use]
    pub fn iso_code(&self) -> Option<String> {
        if self.code == 0 {
            return None;
        }
        let [a, b] = self.code.to_be_bytes();
        Some(String::from_utf8_lossy(&[a, b]).into_owned())
    }
}

/// User-defined location of an IP address
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub location: String,
    pub image: u32,
}

/// Cached information about an IP address
///
/// Only facets present in `known` carry meaningful values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpInfo {
    pub known: FacetSet,
    pub country: String,
    pub country_code: u16,
    pub location: String,
    pub location_image: u32,
    pub p2p_guard: String,
}

impl IpInfo {
    pub fn set_country(&mut self, info: CountryInfo) {
        self.country = info.name;
        self.country_code = info.code;
        self.known.insert(Facet::Country);
    }

    pub fn set_location(&mut self, info: LocationInfo) {
        self.location = info.location;
        self.location_image = info.image;
        self.known.insert(Facet::Location);
    }

    pub fn set_p2p_guard(&mut self, note: String) {
        self.p2p_guard = note;
        self.known.insert(Facet::P2PGuard);
    }

    /// Copy one facet's value from `other` and mark it known
    pub fn copy_facet(&mut self, other: &Self, facet: Facet) {
        match facet {
            Facet::Country => {
                self.country.clone_from(&other.country);
                self.country_code = other.country_code;
            }
            Facet::Location => {
                self.location.clone_from(&other.location);
                self.location_image = other.location_image;
            }
            Facet::P2PGuard => self.p2p_guard.clone_from(&other.p2p_guard),
        }
        self.known.insert(facet);
    }

    /// Reset one facet to unknown and discard its value
    pub fn clear_facet(&mut self, facet: Facet) {
        match facet {
            Facet::Country => {
                self.country.clear();
                self.country_code = 0;
            }
            Facet::Location => {
                self.location.clear();
                self.location_image = 0;
            }
            Facet::P2PGuard => self.p2p_guard.clear(),
        }
        self.known.remove(facet);
    }

    /// Location if set, else the country name
    #[must_use]
    pub fn description(&self) -> &str {
        if self.location.is_empty() {
            &self.country
        } else {
            &self.location
        }
    }
}

/// Backing lookups for each facet
///
/// Every lookup is independent: a failure in one must not prevent the
/// others from being answered. `Ok(None)` means "looked up, nothing
/// recorded for this address", which is cached as a known empty facet.
pub trait FacetSource: Send + Sync {
    fn lookup_country(&self, addr: u32) -> Result<Option<CountryInfo>>;

    fn lookup_location(&self, addr: u32) -> Result<Option<LocationInfo>>;

    fn lookup_p2p_guard(&self, addr: u32) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facet_set_ops() {
        let mut set = FacetSet::EMPTY;
        assert!(set.is_empty());
        set.insert(Facet::Country);
        set.insert(Facet::P2PGuard);
        assert!(set.contains(Facet::Country));
        assert!(!set.contains(Facet::Location));
        assert_eq!(set.iter().count(), 2);

        let rest = FacetSet::ALL.difference(set);
        assert_eq!(rest, FacetSet::from(Facet::Location));
        assert_eq!(rest.union(set), FacetSet::ALL);
        assert_eq!(
            FacetSet::ALL.intersection(set),
            [Facet::Country, Facet::P2PGuard].into_iter().collect()
        );
    }

    #[test]
    fn test_country_code() {
        let info = CountryInfo::new("Germany", "DE");
        assert_eq!(info.iso_code().as_deref(), Some("de"));
        assert_eq!(CountryInfo::new("Nowhere", "X").code, 0);
    }

    #[test]
    fn test_ip_info_facets() {
        let mut info = IpInfo::default();
        info.set_location(LocationInfo {
            location: "Office".into(),
            image: 3,
        });
        info.set_country(CountryInfo::new("France", "fr"));
        assert_eq!(info.description(), "Office");

        info.clear_facet(Facet::Location);
        assert!(!info.known.contains(Facet::Location));
        assert_eq!(info.description(), "France");

        let mut other = IpInfo::default();
        other.copy_facet(&info, Facet::Country);
        assert_eq!(other.country, "France");
        assert_eq!(other.known, FacetSet::from(Facet::Country));
    }
}
