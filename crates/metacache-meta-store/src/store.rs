//! Persistent range store backed by redb.
//!
//! Each range table maps a start address to the rows beginning there. A
//! lookup takes the greatest start at or below the address and keeps the
//! rows whose end reaches it, so only the nearest start is consulted.
//! Writes replace whole tables (or one P2P guard source) in a single
//! write txn.

use crate::tables;
use crate::types::{
    CountryRow, LocationRow, P2PGuardRow, P2PGuardSource, RangeRow, RangeTable, RegistryKey,
};
use metacache_common::{CountryInfo, Error, FacetSource, LocationInfo, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{error, info};

/// Error type for range store operations
#[derive(Debug, thiserror::Error)]
pub enum RangeStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for RangeStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<RangeStoreError> for Error {
    fn from(e: RangeStoreError) -> Self {
        Self::Lookup(e.to_string())
    }
}

pub type RangeStoreResult<T> = std::result::Result<T, RangeStoreError>;

type RangeTableDef = TableDefinition<'static, u32, &'static [u8]>;

impl RangeTable {
    const fn definition(self) -> RangeTableDef {
        match self {
            Self::Country => tables::COUNTRY_IP,
            Self::Location => tables::LOCATION_IP,
            Self::P2PGuard => tables::P2PGUARD_IP,
        }
    }
}

/// Persistent range store backed by redb.
pub struct RangeStore {
    db: Database,
}

impl RangeStore {
    /// File name of the database inside a data directory
    pub const FILE_NAME: &'static str = "locations.redb";

    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> RangeStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::COUNTRY_IP)?;
            let _t = write_txn.open_table(tables::LOCATION_IP)?;
            let _t = write_txn.open_table(tables::P2PGUARD_IP)?;
            let _t = write_txn.open_table(tables::REGISTRY)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Open the database in a data directory
    pub fn open_in(data_dir: impl AsRef<Path>) -> RangeStoreResult<Self> {
        Self::open(data_dir.as_ref().join(Self::FILE_NAME))
    }

    // ---- Countries ----

    /// Replace all country ranges
    pub fn save_countries(&self, rows: Vec<(u32, CountryRow)>) -> RangeStoreResult<usize> {
        let count = self.replace_rows(tables::COUNTRY_IP, rows, |_: &CountryRow| false)?;
        info!("Saved {} country ranges", count);
        Ok(count)
    }

    pub fn find_country(&self, addr: u32) -> RangeStoreResult<Option<CountryRow>> {
        Ok(self
            .lookup_rows::<CountryRow>(tables::COUNTRY_IP, addr)?
            .into_iter()
            .next())
    }

    // ---- Custom locations ----

    /// Replace all custom location ranges
    pub fn save_locations(&self, rows: Vec<(u32, LocationRow)>) -> RangeStoreResult<usize> {
        let count = self.replace_rows(tables::LOCATION_IP, rows, |_: &LocationRow| false)?;
        info!("Saved {} custom location ranges", count);
        Ok(count)
    }

    pub fn find_location(&self, addr: u32) -> RangeStoreResult<Option<LocationRow>> {
        Ok(self
            .lookup_rows::<LocationRow>(tables::LOCATION_IP, addr)?
            .into_iter()
            .next())
    }

    // ---- P2P guard ----

    /// Replace the P2P guard ranges of one source, keeping the others
    pub fn save_p2p_guard(
        &self,
        source: P2PGuardSource,
        rows: Vec<(u32, u32, String)>,
    ) -> RangeStoreResult<usize> {
        let rows = rows
            .into_iter()
            .map(|(start, end, note)| (start, P2PGuardRow { end, note, source }))
            .collect();
        let count =
            self.replace_rows(tables::P2PGUARD_IP, rows, |row: &P2PGuardRow| row.source != source)?;
        info!("Saved {} P2P guard ranges from {:?}", count, source);
        Ok(count)
    }

    /// Notes of all rows at the nearest start that cover `addr`
    pub fn find_p2p_guard(&self, addr: u32) -> RangeStoreResult<Vec<String>> {
        Ok(self
            .lookup_rows::<P2PGuardRow>(tables::P2PGUARD_IP, addr)?
            .into_iter()
            .map(|row| row.note)
            .collect())
    }

    /// Block a single address by hand
    pub fn add_manual_block(&self, addr: u32, note: &str) -> RangeStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::P2PGUARD_IP)?;
            let mut rows: Vec<P2PGuardRow> = match table.get(addr)? {
                Some(val) => bincode::deserialize(val.value())?,
                None => Vec::new(),
            };
            rows.retain(|r| !(r.source == P2PGuardSource::Manual && r.end == addr));
            rows.push(P2PGuardRow {
                end: addr,
                note: note.to_string(),
                source: P2PGuardSource::Manual,
            });
            let bytes = bincode::serialize(&rows)?;
            table.insert(addr, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove the manual rows starting at `addr`
    pub fn remove_manual_block(&self, addr: u32) -> RangeStoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed;
        {
            let mut table = write_txn.open_table(tables::P2PGUARD_IP)?;
            let mut rows: Vec<P2PGuardRow> = match table.get(addr)? {
                Some(val) => bincode::deserialize(val.value())?,
                None => Vec::new(),
            };
            let before = rows.len();
            rows.retain(|r| r.source != P2PGuardSource::Manual);
            removed = rows.len() != before;
            if rows.is_empty() {
                table.remove(addr)?;
            } else if removed {
                let bytes = bincode::serialize(&rows)?;
                table.insert(addr, bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(removed)
    }

    /// Manually blocked addresses with their notes
    pub fn load_manual_blocks(&self) -> RangeStoreResult<Vec<(u32, String)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::P2PGUARD_IP)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (key, val) = entry?;
            let start = key.value();
            match bincode::deserialize::<Vec<P2PGuardRow>>(val.value()) {
                Ok(rows) => result.extend(
                    rows.into_iter()
                        .filter(|r| r.source == P2PGuardSource::Manual)
                        .map(|r| (start, r.note)),
                ),
                Err(e) => error!("Failed to decode P2P guard rows at {}: {}", start, e),
            }
        }
        Ok(result)
    }

    // ---- Registry ----

    pub fn get_registry(&self, key: RegistryKey) -> RangeStoreResult<Option<u64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::REGISTRY)?;
        Ok(table.get(key.as_str())?.map(|v| v.value()))
    }

    pub fn set_registry(&self, key: RegistryKey, value: u64) -> RangeStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::REGISTRY)?;
            table.insert(key.as_str(), value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Number of distinct start addresses in a table
    pub fn start_count(&self, table: RangeTable) -> RangeStoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table.definition())?;
        Ok(table.len()?)
    }

    // ---- Helpers ----

    /// Rows at the greatest start `<= addr` whose end reaches `addr`
    fn lookup_rows<T: DeserializeOwned + RangeRow>(
        &self,
        table_def: RangeTableDef,
        addr: u32,
    ) -> RangeStoreResult<Vec<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table_def)?;
        let Some(entry) = table.range(..=addr)?.next_back() else {
            return Ok(Vec::new());
        };
        let (_, val) = entry?;
        let rows: Vec<T> = bincode::deserialize(val.value())?;
        Ok(rows.into_iter().filter(|r| r.end() >= addr).collect())
    }

    /// Rewrite a table with `rows` plus the existing rows `keep` accepts
    fn replace_rows<T>(
        &self,
        table_def: RangeTableDef,
        rows: Vec<(u32, T)>,
        keep: impl Fn(&T) -> bool,
    ) -> RangeStoreResult<usize>
    where
        T: Serialize + DeserializeOwned + RangeRow,
    {
        let write_txn = self.db.begin_write()?;
        let mut grouped: BTreeMap<u32, Vec<T>> = BTreeMap::new();
        {
            let table = write_txn.open_table(table_def)?;
            for entry in table.iter()? {
                let (key, val) = entry?;
                let start = key.value();
                match bincode::deserialize::<Vec<T>>(val.value()) {
                    Ok(existing) => {
                        let kept: Vec<T> = existing.into_iter().filter(|r| keep(r)).collect();
                        if !kept.is_empty() {
                            grouped.entry(start).or_default().extend(kept);
                        }
                    }
                    Err(e) => error!("Dropping undecodable ranges at {}: {}", start, e),
                }
            }
        }

        let mut count = 0;
        for (start, row) in rows {
            if row.end() < start {
                continue;
            }
            grouped.entry(start).or_default().push(row);
            count += 1;
        }

        write_txn.delete_table(table_def)?;
        {
            let mut table = write_txn.open_table(table_def)?;
            for (start, rows) in &grouped {
                let bytes = bincode::serialize(rows)?;
                table.insert(*start, bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(count)
    }
}

impl FacetSource for RangeStore {
    fn lookup_country(&self, addr: u32) -> Result<Option<CountryInfo>> {
        Ok(self.find_country(addr)?.map(|row| CountryInfo {
            name: row.name,
            code: row.code,
        }))
    }

    fn lookup_location(&self, addr: u32) -> Result<Option<LocationInfo>> {
        Ok(self.find_location(addr)?.map(|row| LocationInfo {
            location: row.location,
            image: row.image,
        }))
    }

    fn lookup_p2p_guard(&self, addr: u32) -> Result<Option<String>> {
        let notes = self.find_p2p_guard(addr)?;
        Ok((!notes.is_empty()).then(|| notes.join(" + ")))
    }
}
