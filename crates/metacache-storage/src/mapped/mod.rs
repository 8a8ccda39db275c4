//! Memory-mapped key-value store
//!
//! Maps content keys to opaque value blobs in a single file mapped with
//! `memmap2`. Values are appended as checksummed frames (see [`layout`]);
//! an in-memory index of the newest frame per key is rebuilt on open.
//!
//! One mutex serializes every read and write. Reads go through a
//! long-lived [`ReadSnapshot`] that is renewed before each lookup and
//! reset afterwards. Writes that do not fit grow the map by doubling it,
//! exactly once per write.
//!
//! A store that fails to open stays disabled: lookups find nothing and
//! writes report [`StoreError::Unavailable`], so callers degrade instead
//! of failing.

pub mod layout;

use layout::{FRAME_PREFIX, HEADER_PAGE_SIZE, StoreHeader};
use memmap2::{MmapMut, MmapOptions};
use metacache_common::config::StoreConfig;
use metacache_common::ContentKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[cfg(target_pointer_width = "64")]
const PLATFORM_TAG: &str = "x64";
#[cfg(not(target_pointer_width = "64"))]
const PLATFORM_TAG: &str = "x32";

/// Mapped store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store corrupted: {0}")]
    Corrupt(String),

    #[error("map full: need {needed} bytes, map size is {map_size}")]
    MapFull { needed: u64, map_size: u64 },

    #[error("value too large: {0} bytes")]
    ValueTooLarge(usize),

    #[error("store unavailable")]
    Unavailable,
}

impl From<StoreError> for metacache_common::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(e) => Self::DiskIo(e),
            StoreError::Corrupt(msg) => Self::DataCorruption(msg),
            StoreError::Unavailable => Self::StorageUnavailable,
            other => Self::storage(other.to_string()),
        }
    }
}

/// Reader state between operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    /// In use by a lookup
    Active,
    /// Released, waiting to be renewed
    Reset,
}

/// The store's persistent read snapshot
///
/// The snapshot sees frames up to `watermark`. It is renewed (moved to
/// the current end of the log) before each lookup and reset afterwards,
/// so an idle reader never pins an old view of the file.
#[derive(Debug)]
pub struct ReadSnapshot {
    state: SnapshotState,
    watermark: usize,
    renewals: u64,
}

impl ReadSnapshot {
    fn begin(watermark: usize) -> Self {
        Self {
            state: SnapshotState::Active,
            watermark,
            renewals: 0,
        }
    }

    fn renew(&mut self, watermark: usize) {
        if self.state == SnapshotState::Reset {
            self.renewals += 1;
        }
        self.watermark = watermark;
        self.state = SnapshotState::Active;
    }

    fn reset(&mut self) {
        self.state = SnapshotState::Reset;
    }

    fn covers(&self, rec: RecordRef) -> bool {
        rec.offset + rec.len <= self.watermark
    }
}

/// Location of a value inside the map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordRef {
    offset: usize,
    len: usize,
}

/// Store statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Distinct keys
    pub keys: u64,
    /// Frames in the log, including superseded ones
    pub entries: u64,
    /// Bytes in use, header page included
    pub used: u64,
    /// Current map size
    pub map_size: u64,
    /// Number of times the map was grown since open
    pub resize_count: u64,
    /// Number of snapshot renewals since open
    pub renewals: u64,
}

struct StoreInner {
    path: PathBuf,
    file: File,
    map: MmapMut,
    header: StoreHeader,
    index: HashMap<ContentKey, RecordRef>,
    snapshot: ReadSnapshot,
    sync_on_commit: bool,
    resize_count: u64,
}

/// Memory-mapped content-key store
pub struct MappedStore {
    inner: Mutex<Option<StoreInner>>,
}

impl MappedStore {
    /// Path of the store file inside `data_dir`
    pub fn file_path(data_dir: &Path) -> PathBuf {
        data_dir.join(format!("hash-db.{PLATFORM_TAG}"))
    }

    /// Open the store, disabling it if that fails
    ///
    /// The failure is logged here once; later operations on a disabled
    /// store are silent no-ops.
    pub fn open(config: &StoreConfig) -> Self {
        match Self::try_open(config) {
            Ok(store) => store,
            Err(e) => {
                error!(
                    "Failed to open hash database in {:?}, store disabled: {}",
                    config.data_dir, e
                );
                Self::disabled()
            }
        }
    }

    /// Open the store, returning the error on failure
    pub fn try_open(config: &StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let path = Self::file_path(&config.data_dir);
        let inner = StoreInner::open(path, config)?;
        Ok(Self {
            inner: Mutex::new(Some(inner)),
        })
    }

    /// A store that never opened
    pub fn disabled() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Look up a value and pass it to `f` without copying it
    pub fn read<R>(&self, key: &ContentKey, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        debug_assert!(!key.is_zero(), "zero content key");
        let mut guard = self.inner.lock();
        let inner = guard.as_mut()?;
        inner.begin_read();
        let result = inner.lookup(key).map(f);
        inner.snapshot.reset();
        result
    }

    /// Look up a value
    pub fn get(&self, key: &ContentKey) -> Option<Vec<u8>> {
        self.read(key, <[u8]>::to_vec)
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        self.read(key, |_| ()).is_some()
    }

    /// Store a value, replacing any previous one
    pub fn put(&self, key: &ContentKey, value: &[u8]) -> Result<(), StoreError> {
        debug_assert!(!key.is_zero(), "zero content key");
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(StoreError::Unavailable)?;
        inner.write(key, value)
    }

    /// Read-modify-write of one value under the store lock
    ///
    /// `f` sees the current value, if any, and returns the replacement or
    /// `None` to leave the store untouched. Returns whether a value was
    /// written.
    pub fn update<F>(&self, key: &ContentKey, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(Option<&[u8]>) -> Option<Vec<u8>>,
    {
        debug_assert!(!key.is_zero(), "zero content key");
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(StoreError::Unavailable)?;

        inner.begin_read();
        let replacement = f(inner.lookup(key));
        inner.snapshot.reset();

        match replacement {
            Some(value) => inner.write(key, &value).map(|()| true),
            None => Ok(false),
        }
    }

    /// Flush the whole map to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        match self.inner.lock().as_ref() {
            Some(inner) => Ok(inner.map.flush()?),
            None => Err(StoreError::Unavailable),
        }
    }

    pub fn stats(&self) -> Option<StoreStats> {
        self.inner.lock().as_ref().map(StoreInner::stats)
    }

    /// State of the read snapshot, `None` when disabled
    pub fn snapshot_state(&self) -> Option<SnapshotState> {
        self.inner.lock().as_ref().map(|inner| inner.snapshot.state)
    }

    /// Flush and release the map; the store is disabled afterwards
    pub fn close(&self) {
        if let Some(inner) = self.inner.lock().take() {
            debug!("Closing hash database {:?}", inner.path);
        }
    }
}

impl StoreInner {
    fn open(path: PathBuf, config: &StoreConfig) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        let fresh = file_len == 0;
        // Validate before touching the file length
        let stored = if fresh {
            None
        } else {
            Some(read_header(&file, file_len)?)
        };

        let configured = config.effective_map_size().max(2 * HEADER_PAGE_SIZE as u64);
        let map_size = configured.max(file_len);
        if usize::try_from(map_size).is_err() {
            return Err(StoreError::Corrupt(format!(
                "map size {map_size} exceeds address space"
            )));
        }
        if map_size != file_len {
            file.set_len(map_size)?;
        }
        let map = map_file(&file)?;

        let mut header = stored.unwrap_or_else(|| StoreHeader::new(map_size));
        header.map_size = map_size;

        let (index, used, entries) = scan(&map, &header);
        if !fresh && used as u64 != header.used {
            warn!(
                "Hash database {:?}: discarding {} bytes of damaged log tail",
                path,
                header.used.saturating_sub(used as u64)
            );
        }
        header.used = used as u64;
        header.entries = entries;

        let mut inner = Self {
            path,
            file,
            map,
            header,
            index,
            snapshot: ReadSnapshot::begin(used),
            sync_on_commit: config.sync_on_commit,
            resize_count: 0,
        };
        inner.write_header();
        inner.map.flush_range(0, HEADER_PAGE_SIZE)?;

        if fresh {
            info!("Created hash database {:?} ({} bytes)", inner.path, map_size);
        } else {
            info!(
                "Opened hash database {:?}: {} keys, {} bytes used",
                inner.path,
                inner.index.len(),
                inner.header.used
            );
        }
        Ok(inner)
    }

    fn used(&self) -> usize {
        self.header.used as usize
    }

    fn begin_read(&mut self) {
        let used = self.used();
        self.snapshot.renew(used);
    }

    fn lookup(&self, key: &ContentKey) -> Option<&[u8]> {
        let rec = *self.index.get(key)?;
        if !self.snapshot.covers(rec) {
            return None;
        }
        self.map.get(rec.offset..rec.offset + rec.len)
    }

    /// Append with one grow-and-retry on a full map
    fn write(&mut self, key: &ContentKey, value: &[u8]) -> Result<(), StoreError> {
        match self.append(key, value) {
            Err(StoreError::MapFull { needed, map_size }) => {
                debug!(
                    "Hash database full ({} needed, map {}), growing",
                    needed, map_size
                );
                self.grow()?;
                self.append(key, value)
            }
            other => other,
        }
    }

    fn append(&mut self, key: &ContentKey, value: &[u8]) -> Result<(), StoreError> {
        if u32::try_from(value.len()).is_err() {
            return Err(StoreError::ValueTooLarge(value.len()));
        }

        let start = self.used();
        let frame_len = layout::frame_len(value.len());
        let end = start + frame_len;
        if end > self.map.len() {
            return Err(StoreError::MapFull {
                needed: end as u64,
                map_size: self.map.len() as u64,
            });
        }

        layout::write_frame(&mut self.map[start..end], key, value);
        self.index.insert(
            *key,
            RecordRef {
                offset: start + FRAME_PREFIX,
                len: value.len(),
            },
        );
        self.header.used = end as u64;
        self.header.entries += 1;

        if self.sync_on_commit {
            self.map.flush_range(start, frame_len)?;
        }
        self.write_header();
        if self.sync_on_commit {
            self.map.flush_range(0, HEADER_PAGE_SIZE)?;
        }
        Ok(())
    }

    /// Double the map size
    fn grow(&mut self) -> Result<(), StoreError> {
        let old_size = self.map.len() as u64;
        let new_size = old_size.checked_mul(2).ok_or(StoreError::MapFull {
            needed: u64::MAX,
            map_size: old_size,
        })?;
        if usize::try_from(new_size).is_err() {
            return Err(StoreError::MapFull {
                needed: new_size,
                map_size: old_size,
            });
        }

        self.map.flush()?;
        self.file.set_len(new_size)?;
        self.map = map_file(&self.file)?;
        self.header.map_size = new_size;
        self.write_header();
        self.resize_count += 1;

        info!(
            "Resized hash database {:?} from {} to {} bytes",
            self.path, old_size, new_size
        );
        Ok(())
    }

    fn write_header(&mut self) {
        let bytes = self.header.to_bytes();
        self.map[..bytes.len()].copy_from_slice(&bytes);
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            keys: self.index.len() as u64,
            entries: self.header.entries,
            used: self.header.used,
            map_size: self.map.len() as u64,
            resize_count: self.resize_count,
            renewals: self.snapshot.renewals,
        }
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Err(e) = self.map.flush() {
            warn!("Failed to flush hash database {:?}: {}", self.path, e);
        }
    }
}

fn read_header(mut file: &File, file_len: u64) -> Result<StoreHeader, StoreError> {
    if file_len < 2 * HEADER_PAGE_SIZE as u64 {
        return Err(StoreError::Corrupt(format!(
            "store file too small: {file_len} bytes"
        )));
    }
    let mut buf = [0u8; layout::HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;
    StoreHeader::from_bytes(&buf)
}

#[allow(unsafe_code)]
fn map_file(file: &File) -> Result<MmapMut, StoreError> {
    // SAFETY: the file is opened read-write by this process only and the
    // map is owned by `StoreInner`, which is only reachable through the
    // store mutex. The file length is never reduced while mapped.
    let map = unsafe { MmapOptions::new().map_mut(file)? };
    Ok(map)
}

/// Rebuild the key index by walking the frame log
///
/// Returns the index, the offset just past the last valid frame and the
/// number of valid frames.
fn scan(map: &[u8], header: &StoreHeader) -> (HashMap<ContentKey, RecordRef>, usize, u64) {
    let limit = usize::try_from(header.used)
        .unwrap_or(usize::MAX)
        .min(map.len());
    let mut index = HashMap::new();
    let mut offset = HEADER_PAGE_SIZE;
    let mut entries = 0u64;

    while offset < limit {
        let Some(frame) = layout::read_frame(&map[offset..limit]) else {
            break;
        };
        index.insert(
            frame.key,
            RecordRef {
                offset: offset + FRAME_PREFIX,
                len: frame.value.len(),
            },
        );
        offset += frame.total_len();
        entries += 1;
    }

    (index, offset, entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use tempfile::tempdir;

    fn key(b: u8) -> ContentKey {
        ContentKey::from_bytes([b; 24])
    }

    fn test_config(dir: &Path, map_size: u64) -> StoreConfig {
        StoreConfig {
            data_dir: dir.to_path_buf(),
            initial_map_size: map_size,
            sync_on_commit: false,
        }
    }

    fn random_value(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }

    #[test]
    fn test_put_get() {
        let dir = tempdir().unwrap();
        let store = MappedStore::try_open(&test_config(dir.path(), 1 << 20)).unwrap();

        assert!(store.get(&key(1)).is_none());
        store.put(&key(1), b"first").unwrap();
        store.put(&key(2), b"second").unwrap();
        store.put(&key(1), b"replaced").unwrap();

        assert_eq!(store.get(&key(1)).unwrap(), b"replaced");
        assert_eq!(store.get(&key(2)).unwrap(), b"second");
        assert_eq!(store.read(&key(2), <[u8]>::len), Some(6));

        let stats = store.stats().unwrap();
        assert_eq!(stats.keys, 2);
        assert_eq!(stats.entries, 3);
    }

    #[test]
    fn test_snapshot_reset_renew() {
        let dir = tempdir().unwrap();
        let store = MappedStore::try_open(&test_config(dir.path(), 1 << 20)).unwrap();
        assert_eq!(store.snapshot_state(), Some(SnapshotState::Active));

        store.put(&key(3), b"value").unwrap();
        assert_eq!(store.get(&key(3)).unwrap(), b"value");
        assert_eq!(store.snapshot_state(), Some(SnapshotState::Reset));

        // Written while the snapshot is reset, visible after renewal
        store.put(&key(4), b"later").unwrap();
        assert_eq!(store.get(&key(4)).unwrap(), b"later");
        assert_eq!(store.snapshot_state(), Some(SnapshotState::Reset));
        assert_eq!(store.stats().unwrap().renewals, 1);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 1 << 20);
        {
            let store = MappedStore::try_open(&config).unwrap();
            store.put(&key(1), b"one").unwrap();
            store.put(&key(2), b"two").unwrap();
            store.put(&key(1), b"uno").unwrap();
            store.close();
        }

        let store = MappedStore::try_open(&config).unwrap();
        assert_eq!(store.get(&key(1)).unwrap(), b"uno");
        assert_eq!(store.get(&key(2)).unwrap(), b"two");
        assert_eq!(store.stats().unwrap().keys, 2);
    }

    #[test]
    fn test_update() {
        let dir = tempdir().unwrap();
        let store = MappedStore::try_open(&test_config(dir.path(), 1 << 20)).unwrap();

        let written = store
            .update(&key(5), |old| {
                assert!(old.is_none());
                Some(b"a".to_vec())
            })
            .unwrap();
        assert!(written);

        let written = store
            .update(&key(5), |old| {
                let mut v = old.unwrap().to_vec();
                v.push(b'b');
                Some(v)
            })
            .unwrap();
        assert!(written);
        assert_eq!(store.get(&key(5)).unwrap(), b"ab");

        let before = store.stats().unwrap().entries;
        assert!(!store.update(&key(5), |_| None).unwrap());
        assert_eq!(store.stats().unwrap().entries, before);
    }

    #[test]
    fn test_map_full_grows_once() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), StoreConfig::MIN_MAP_SIZE);
        let store = MappedStore::try_open(&config).unwrap();
        let initial = store.stats().unwrap().map_size;
        assert_eq!(initial, StoreConfig::MIN_MAP_SIZE);

        let big = random_value(40 * 1024);
        store.put(&key(1), &big).unwrap();
        assert_eq!(store.stats().unwrap().resize_count, 0);

        // Second value does not fit: one doubling, then success
        store.put(&key(2), &big).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.resize_count, 1);
        assert_eq!(stats.map_size, initial * 2);
        assert_eq!(store.get(&key(1)).unwrap(), big);
        assert_eq!(store.get(&key(2)).unwrap(), big);
    }

    #[test]
    fn test_map_full_second_failure_propagates() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), StoreConfig::MIN_MAP_SIZE);
        let store = MappedStore::try_open(&config).unwrap();
        store.put(&key(1), b"small").unwrap();

        // Larger than twice the map: grown once, still does not fit
        let huge = random_value(3 * StoreConfig::MIN_MAP_SIZE as usize);
        let err = store.put(&key(2), &huge).unwrap_err();
        assert!(matches!(err, StoreError::MapFull { .. }));

        let stats = store.stats().unwrap();
        assert_eq!(stats.resize_count, 1);
        assert_eq!(stats.map_size, 2 * StoreConfig::MIN_MAP_SIZE);

        // Still usable for other keys
        assert!(store.get(&key(2)).is_none());
        assert_eq!(store.get(&key(1)).unwrap(), b"small");
        store.put(&key(3), b"after").unwrap();
        assert_eq!(store.get(&key(3)).unwrap(), b"after");
    }

    #[test]
    fn test_grown_map_survives_reopen() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), StoreConfig::MIN_MAP_SIZE);
        let big = random_value(50 * 1024);
        {
            let store = MappedStore::try_open(&config).unwrap();
            store.put(&key(1), &big).unwrap();
            store.put(&key(2), &big).unwrap();
        }

        let store = MappedStore::try_open(&config).unwrap();
        assert_eq!(store.stats().unwrap().map_size, 2 * StoreConfig::MIN_MAP_SIZE);
        assert_eq!(store.get(&key(2)).unwrap(), big);
    }

    #[test]
    fn test_corrupt_tail_truncated() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 1 << 20);
        let first_frame_end;
        {
            let store = MappedStore::try_open(&config).unwrap();
            store.put(&key(1), b"good").unwrap();
            first_frame_end = store.stats().unwrap().used;
            store.put(&key(2), b"damaged").unwrap();
        }

        // Flip a byte inside the second frame's value
        let path = MappedStore::file_path(dir.path());
        let mut data = std::fs::read(&path).unwrap();
        data[first_frame_end as usize + FRAME_PREFIX] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        let store = MappedStore::try_open(&config).unwrap();
        assert_eq!(store.get(&key(1)).unwrap(), b"good");
        assert!(store.get(&key(2)).is_none());
        assert_eq!(store.stats().unwrap().used, first_frame_end);

        // Appends continue after the last good frame
        store.put(&key(3), b"fresh").unwrap();
        assert_eq!(store.get(&key(3)).unwrap(), b"fresh");
    }

    #[test]
    fn test_bad_header_disables_store() {
        let dir = tempdir().unwrap();
        let path = MappedStore::file_path(dir.path());
        std::fs::write(&path, vec![0xaau8; 8192]).unwrap();

        let store = MappedStore::open(&test_config(dir.path(), 1 << 20));
        assert!(!store.is_available());
        assert!(store.get(&key(1)).is_none());
        assert!(matches!(
            store.put(&key(1), b"x"),
            Err(StoreError::Unavailable)
        ));
        assert!(matches!(
            store.update(&key(1), |_| Some(vec![1])),
            Err(StoreError::Unavailable)
        ));
        assert!(store.stats().is_none());
        assert!(store.snapshot_state().is_none());
    }

    #[test]
    fn test_close_disables() {
        let dir = tempdir().unwrap();
        let store = MappedStore::try_open(&test_config(dir.path(), 1 << 20)).unwrap();
        store.put(&key(1), b"v").unwrap();
        store.close();
        assert!(!store.is_available());
        assert!(store.get(&key(1)).is_none());
    }

    #[test]
    fn test_store_error_conversion() {
        let e: metacache_common::Error = StoreError::Unavailable.into();
        assert!(matches!(e, metacache_common::Error::StorageUnavailable));
        let e: metacache_common::Error = StoreError::MapFull {
            needed: 10,
            map_size: 5,
        }
        .into();
        assert!(e.is_storage_failure());
    }
}
