//! Range file loaders
//!
//! Reads the P2P guard, iblocklist and custom location files from the
//! config directory into the range tables. Each file is reloaded only
//! when its modification time differs from the one recorded in the
//! registry.

use metacache_meta_store::{LocationRow, P2PGuardSource, RangeStore, RangeStoreError, RegistryKey};
use metacache_storage::{ParseError, ParseOptions, parse_line, parse_range};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tracing::{info, warn};

pub const P2P_GUARD_FILE: &str = "P2PGuard.ini";
pub const IBLOCKLIST_FILE: &str = "iblocklist-com.ini";
pub const CUSTOM_LOCATIONS_FILE: &str = "CustomLocations.ini";

/// Loader errors
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not read {file}: {source}")]
    Io {
        file: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("range store error: {0}")]
    Store(#[from] RangeStoreError),
}

/// Result of a load attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// File timestamp matches the registry, nothing was read
    Unchanged,
    /// File could not be opened; stored ranges were kept
    Missing,
    /// Number of ranges stored
    Loaded(usize),
}

/// P2P guard row as read from a file: start, end, note
pub type GuardRange = (u32, u32, String);

/// Loads range files into a [`RangeStore`]
pub struct RangeLoader {
    store: Arc<RangeStore>,
    config_dir: PathBuf,
}

impl RangeLoader {
    pub fn new(store: Arc<RangeStore>, config_dir: impl AsRef<Path>) -> Self {
        Self {
            store,
            config_dir: config_dir.as_ref().to_path_buf(),
        }
    }

    /// Load `P2PGuard.ini`, lines of `range note`
    pub fn load_p2p_guard(&self) -> Result<LoadOutcome, LoadError> {
        self.load_file(P2P_GUARD_FILE, RegistryKey::TimeStampP2PGuard, |reader| {
            let rows = parse_p2p_guard(reader)?;
            Ok(self.store.save_p2p_guard(P2PGuardSource::P2PGuardIni, rows)?)
        })
    }

    /// Load `iblocklist-com.ini`, lines of `note:range`
    pub fn load_iblocklist(&self) -> Result<LoadOutcome, LoadError> {
        self.load_file(IBLOCKLIST_FILE, RegistryKey::TimeStampIBlockList, |reader| {
            let rows = parse_iblocklist(reader)?;
            Ok(self.store.save_p2p_guard(P2PGuardSource::IBlockList, rows)?)
        })
    }

    /// Load `CustomLocations.ini`, lines of `range image,location`
    pub fn load_custom_locations(&self) -> Result<LoadOutcome, LoadError> {
        self.load_file(
            CUSTOM_LOCATIONS_FILE,
            RegistryKey::TimeStampCustomLocation,
            |reader| {
                let rows = parse_custom_locations(reader)?;
                Ok(self.store.save_locations(rows)?)
            },
        )
    }

    /// Load every range file, logging failures
    pub fn load_all(&self) {
        for (file, result) in [
            (P2P_GUARD_FILE, self.load_p2p_guard()),
            (IBLOCKLIST_FILE, self.load_iblocklist()),
            (CUSTOM_LOCATIONS_FILE, self.load_custom_locations()),
        ] {
            if let Err(e) = result {
                warn!("Failed to load {}: {}", file, e);
            }
        }
    }

    fn load_file(
        &self,
        file_name: &'static str,
        key: RegistryKey,
        save: impl FnOnce(BufReader<File>) -> Result<usize, LoadError>,
    ) -> Result<LoadOutcome, LoadError> {
        let path = self.config_dir.join(file_name);
        let stamp = file_timestamp(&path);
        let stored = self.store.get_registry(key)?.unwrap_or(0);
        if stamp == stored {
            return Ok(LoadOutcome::Unchanged);
        }

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!("Could not load {}: {}", file_name, e);
                return Ok(LoadOutcome::Missing);
            }
        };
        info!("Reading {:?}", path);
        let count = save(BufReader::new(file)).map_err(|e| match e {
            LoadError::Io { source, .. } => LoadError::Io {
                file: file_name,
                source,
            },
            other => other,
        })?;
        self.store.set_registry(key, stamp)?;
        Ok(LoadOutcome::Loaded(count))
    }
}

/// Modification time in nanoseconds, 0 if unavailable
fn file_timestamp(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| u64::try_from(d.as_nanos()).ok())
        .unwrap_or(0)
}

fn read_error(source: io::Error) -> LoadError {
    LoadError::Io { file: "", source }
}

/// Trimmed lines of a reader
fn trimmed_lines<R: BufRead>(reader: R) -> impl Iterator<Item = Result<String, LoadError>> {
    reader
        .lines()
        .map(|line| line.map(|l| l.trim().to_string()).map_err(read_error))
}

/// Parse `range note` lines
pub fn parse_p2p_guard<R: BufRead>(reader: R) -> Result<Vec<GuardRange>, LoadError> {
    let mut rows = Vec::new();
    for line in trimmed_lines(reader) {
        let line = line?;
        match parse_range(&line).and_then(|r| note_after(&line, r.pos).map(|note| (r, note))) {
            Ok((r, note)) => rows.push((r.start, r.end, note.to_string())),
            Err(ParseError::LineSkipped) => {}
            Err(e) => warn!("Error parsing {}: {} [{}]", P2P_GUARD_FILE, e, line),
        }
    }
    Ok(rows)
}

/// Parse `note:range` lines; the last colon separates the note
pub fn parse_iblocklist<R: BufRead>(reader: R) -> Result<Vec<GuardRange>, LoadError> {
    let mut rows = Vec::new();
    for line in trimmed_lines(reader) {
        let line = line?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed = match line.rfind(':') {
            Some(colon) if colon != 0 => parse_line(&line, &ParseOptions::default(), colon + 1)
                .map(|r| (r, &line[..colon])),
            _ => Err(ParseError::BadFormat),
        };
        match parsed {
            Ok((r, note)) => rows.push((r.start, r.end, note.to_string())),
            Err(e) => warn!("Error parsing {}: {} [{}]", IBLOCKLIST_FILE, e, line),
        }
    }
    Ok(rows)
}

/// Parse `range image,location` lines
pub fn parse_custom_locations<R: BufRead>(
    reader: R,
) -> Result<Vec<(u32, LocationRow)>, LoadError> {
    let mut rows = Vec::new();
    for line in trimmed_lines(reader) {
        let line = line?;
        let parsed = parse_range(&line).and_then(|r| {
            let rest = note_after(&line, r.pos)?;
            let image = leading_number(rest);
            match rest.find(',') {
                Some(comma) if comma + 1 < rest.len() => Ok((r, image, &rest[comma + 1..])),
                _ => Err(ParseError::BadFormat),
            }
        });
        match parsed {
            Ok((r, image, location)) => rows.push((
                r.start,
                LocationRow {
                    end: r.end,
                    location: location.to_string(),
                    image,
                },
            )),
            Err(ParseError::LineSkipped) => {}
            Err(e) => warn!("Error parsing {}: {} [{}]", CUSTOM_LOCATIONS_FILE, e, line),
        }
    }
    Ok(rows)
}

/// Text after the single space that must follow a range
fn note_after(line: &str, pos: usize) -> Result<&str, ParseError> {
    let bytes = line.as_bytes();
    if pos + 1 < bytes.len() && bytes[pos] == b' ' {
        Ok(&line[pos + 1..])
    } else {
        Err(ParseError::BadFormat)
    }
}

/// Leading decimal digits as a number, 0 if there are none
fn leading_number(s: &str) -> u32 {
    s.trim_start()
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u32, |acc, d| acc.wrapping_mul(10).wrapping_add(u32::from(d - b'0')))
}
