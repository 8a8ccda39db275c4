//! IP trust list
//!
//! Lines prefixed with `-` block a range. Any other range is trusted, and
//! once a trusted range exists every address outside the list is blocked.

use metacache_common::config::GeoConfig;
use metacache_storage::{IpList, ParseError, ParseOptions, parse_line};
use parking_lot::RwLock;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};

const BLOCK_MARKER: u8 = b'-';
const TRUST_MARKER: u8 = b'+';

#[derive(Default)]
struct TrustList {
    ranges: IpList,
    has_white_list: bool,
}

/// Block and allow list of address ranges
pub struct IpTrust {
    list: RwLock<TrustList>,
    enabled: bool,
}

impl IpTrust {
    /// Standard file name inside the config directory
    pub const FILE_NAME: &'static str = "IPTrust.ini";

    pub fn new(enabled: bool) -> Self {
        Self {
            list: RwLock::new(TrustList::default()),
            enabled,
        }
    }

    /// Trust list switched on or off by `geo.enable_ip_trust`
    pub fn from_config(config: &GeoConfig) -> Self {
        Self::new(config.enable_ip_trust)
    }

    /// Replace the list with the ranges read from `reader`
    ///
    /// Bad lines are logged and skipped. Returns the number of ranges
    /// loaded; on a read error the list is left empty.
    pub fn load<R: BufRead>(&self, reader: R) -> io::Result<usize> {
        let list = match read_list(reader) {
            Ok(list) => list,
            Err(e) => {
                warn!("Could not load {}: {}", Self::FILE_NAME, e);
                self.clear();
                return Err(e);
            }
        };

        let count = list.ranges.len();
        *self.list.write() = list;
        info!("Loaded {} ranges from {}", count, Self::FILE_NAME);
        Ok(count)
    }

    /// Load from a file; a missing file leaves the list empty
    pub fn load_file(&self, path: impl AsRef<Path>) -> io::Result<usize> {
        match File::open(path.as_ref()) {
            Ok(file) => self.load(BufReader::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.clear();
                Ok(0)
            }
            Err(e) => {
                warn!("Could not load {}: {}", Self::FILE_NAME, e);
                self.clear();
                Err(e)
            }
        }
    }

    pub fn clear(&self) {
        *self.list.write() = TrustList::default();
    }

    /// Whether connections from `addr` should be refused
    pub fn is_blocked(&self, addr: u32) -> bool {
        if !self.enabled {
            return false;
        }
        let list = self.list.read();
        match list.ranges.find(addr) {
            Some(payload) => payload != 0,
            None => list.has_white_list,
        }
    }

    pub fn len(&self) -> usize {
        self.list.read().ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_list<R: BufRead>(reader: R) -> io::Result<TrustList> {
    let options = ParseOptions {
        special_chars: &[BLOCK_MARKER, TRUST_MARKER],
    };
    let mut list = TrustList::default();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        let range = match parse_line(line, &options, 0) {
            Ok(range) => range,
            Err(ParseError::LineSkipped) => continue,
            Err(e) => {
                warn!("Error parsing {}: {} [{}]", IpTrust::FILE_NAME, e, line);
                continue;
            }
        };
        let payload = if range.special == Some(BLOCK_MARKER) {
            1
        } else {
            list.has_white_list = true;
            0
        };
        if let Err(e) = list.ranges.add_range(range.start, range.end, payload) {
            warn!("Error adding data from {}: {} [{}]", IpTrust::FILE_NAME, e, line);
        }
    }
    Ok(list)
}
