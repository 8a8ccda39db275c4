//! IPv4 interval map
//!
//! Maps inclusive `[start, end]` address ranges to opaque payloads. Ranges
//! may overlap or nest, and several ranges may share a start address.
//! Point queries prefer the tightest matching range.

mod parse;

pub use parse::{
    ParseError, ParseOptions, ParsedRange, is_valid_mask, parse_ipv4, parse_line, parse_range,
};

use std::collections::BTreeMap;
use thiserror::Error;

/// Reasons a range is not inserted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("Invalid range")]
    BadRange,
    #[error("Entry already exists")]
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range {
    end: u32,
    payload: u64,
}

/// Interval map from IPv4 ranges to payloads
#[derive(Debug, Default)]
pub struct IpList {
    ranges: BTreeMap<u32, Vec<Range>>,
    len: usize,
}

impl IpList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ranges
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
        self.len = 0;
    }

    /// Insert a range
    ///
    /// Only an identical `(start, end)` pair is rejected; other ranges
    /// sharing the start are kept side by side.
    pub fn add_range(&mut self, start: u32, end: u32, payload: u64) -> Result<(), RangeError> {
        if end < start {
            return Err(RangeError::BadRange);
        }
        let ranges = self.ranges.entry(start).or_default();
        if ranges.iter().any(|r| r.end == end) {
            return Err(RangeError::AlreadyExists);
        }
        ranges.push(Range { end, payload });
        self.len += 1;
        Ok(())
    }

    /// Payload of the tightest range containing `addr`
    ///
    /// Start addresses are visited from the greatest one `<= addr`
    /// downwards. At each start the narrowest range reaching `addr` wins,
    /// and the walk stops at the first start that has any match. A tighter
    /// range beginning further down is therefore not considered once a
    /// wider range with a closer start matches.
    pub fn find(&self, addr: u32) -> Option<u64> {
        for (&start, ranges) in self.ranges.range(..=addr).rev() {
            let best = ranges
                .iter()
                .filter(|r| addr <= r.end)
                .min_by_key(|r| r.end - start);
            if let Some(range) = best {
                return Some(range.payload);
            }
        }
        None
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.find(addr).is_some()
    }

    /// All ranges as `(start, end, payload)`, ordered by start
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, u64)> + '_ {
        self.ranges
            .iter()
            .flat_map(|(&start, ranges)| ranges.iter().map(move |r| (start, r.end, r.payload)))
    }
}
