//! File metadata database
//!
//! Typed access to the records kept in the [`MappedStore`]: flags, file
//! size, local path, upload counter and merkle leaves of shared files,
//! keyed by their root hash.

use crate::mapped::{MappedStore, StoreError};
use crate::record::{ItemType, MAX_ITEM_PAYLOAD, RECORD_HEADER_SIZE, RecordHeader, RecordView, upsert};
use metacache_common::config::StoreConfig;
use metacache_common::{ContentKey, HASH_SIZE, MerkleTree};
use std::borrow::Cow;
use tracing::{debug, warn};

/// Decoded file record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub flags: u16,
    pub file_size: u64,
    pub path: Option<String>,
    /// Size in bytes of the stored leaf list, 0 if none
    pub tree_size: usize,
    pub upload_count: u32,
}

impl FileInfo {
    fn from_record(view: &RecordView<'_>) -> Self {
        let mut info = Self {
            flags: view.header.flags,
            file_size: view.header.file_size,
            ..Default::default()
        };
        for item in view.items() {
            match ItemType::from_u8(item.item_type) {
                Some(ItemType::TreeLeaves) => info.tree_size = item.payload.len(),
                Some(ItemType::LocalPath) => {
                    let path = String::from_utf8_lossy(item.payload);
                    if matches!(path, Cow::Owned(_)) {
                        debug!(
                            "Stored path is not valid UTF-8 ({} bytes), replacing bad sequences",
                            item.payload.len()
                        );
                    }
                    info.path = Some(path.into_owned());
                }
                Some(ItemType::UploadCount) => info.upload_count = decode_count(item.payload),
                None => {}
            }
        }
        info
    }
}

fn decode_count(payload: &[u8]) -> u32 {
    match *payload {
        [a, b] => u32::from(u16::from_le_bytes([a, b])),
        [a, b, c, d] => u32::from_le_bytes([a, b, c, d]),
        _ => 0,
    }
}

fn encode_count(count: u32) -> Vec<u8> {
    match u16::try_from(count) {
        Ok(short) => short.to_le_bytes().to_vec(),
        Err(_) => count.to_le_bytes().to_vec(),
    }
}

/// Replace the header of a record, keeping its items
fn with_header(existing: Option<&[u8]>, header: RecordHeader) -> Vec<u8> {
    let items = existing
        .filter(|blob| blob.len() >= RECORD_HEADER_SIZE)
        .map_or(&[][..], |blob| &blob[RECORD_HEADER_SIZE..]);
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + items.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(items);
    buf
}

/// File metadata database over a mapped store
pub struct FileDb {
    store: MappedStore,
}

impl FileDb {
    pub fn new(store: MappedStore) -> Self {
        Self { store }
    }

    /// Open the backing store; a store that fails to open is disabled
    pub fn open(config: &StoreConfig) -> Self {
        Self::new(MappedStore::open(config))
    }

    pub fn store(&self) -> &MappedStore {
        &self.store
    }

    /// Read the record for `key`
    pub fn get_file_info(&self, key: &ContentKey) -> Option<FileInfo> {
        self.store
            .read(key, |blob| RecordView::parse(blob).map(|view| FileInfo::from_record(&view)))
            .flatten()
    }

    /// Merge file information into the record for `key`
    ///
    /// Flags are OR-ed into the stored ones. The path is replaced only if
    /// it differs, and the upload counter is incremented on request.
    /// Returns whether anything was written; an unchanged record is left
    /// alone.
    pub fn put_file_info(
        &self,
        key: &ContentKey,
        flags: u16,
        file_size: u64,
        path: Option<&str>,
        inc_upload_count: bool,
    ) -> Result<bool, StoreError> {
        if let Some(path) = path {
            if path.len() > MAX_ITEM_PAYLOAD {
                return Err(StoreError::ValueTooLarge(path.len()));
            }
        }

        self.store.update(key, |existing| {
            let view = existing.and_then(RecordView::parse);
            let old = view.as_ref().map(FileInfo::from_record).unwrap_or_default();
            let existing = view.is_some().then_some(existing).flatten();

            let merged_flags = old.flags | flags;
            let update_flags = merged_flags != old.flags;
            let update_path = path.is_some_and(|p| old.path.as_deref() != Some(p));
            if !update_flags && !update_path && !inc_upload_count {
                return None;
            }

            let header = RecordHeader {
                flags: merged_flags,
                file_size,
            };
            let mut blob = with_header(existing, header);
            if let Some(path) = path.filter(|_| update_path) {
                blob = upsert(Some(&blob), header, ItemType::LocalPath.into(), path.as_bytes())?;
            }
            if inc_upload_count {
                let count = encode_count(old.upload_count.saturating_add(1));
                blob = upsert(Some(&blob), header, ItemType::UploadCount.into(), &count)?;
            }
            Some(blob)
        })
    }

    /// Load the merkle tree stored under its root hash
    ///
    /// A leaf list that is not a whole number of hashes, or has fewer than
    /// two of them, is treated as absent.
    pub fn get_tree(&self, root: &ContentKey) -> Option<MerkleTree> {
        self.store
            .read(root, |blob| {
                let view = RecordView::parse(blob)?;
                let item = view.find(ItemType::TreeLeaves.into())?;
                let size = item.payload.len();
                if size < 2 * HASH_SIZE || size % HASH_SIZE != 0 {
                    warn!("Invalid tree size {} for {}", size, root);
                    return None;
                }
                MerkleTree::from_leaf_bytes(*root, view.header.file_size, item.payload)
            })
            .flatten()
    }

    /// Store the leaves of a tree under its root hash
    ///
    /// Trees with fewer than two leaves are not stored. A stored tree with
    /// the same leaf count and file size is left untouched. Returns whether
    /// the record was written.
    pub fn put_tree(&self, tree: &MerkleTree) -> Result<bool, StoreError> {
        if tree.leaves().len() < 2 {
            return Ok(false);
        }
        let leaves = tree.leaf_bytes();
        if leaves.len() > MAX_ITEM_PAYLOAD {
            return Err(StoreError::ValueTooLarge(leaves.len()));
        }

        let written = self.store.update(tree.root(), |existing| {
            let view = existing.and_then(RecordView::parse);
            if let Some(view) = &view {
                let same = view.find(ItemType::TreeLeaves.into()).is_some_and(|item| {
                    item.payload.len() == leaves.len() && view.header.file_size == tree.file_size()
                });
                if same {
                    return None;
                }
            }

            let header = RecordHeader {
                flags: view.map_or(0, |v| v.header.flags),
                file_size: tree.file_size(),
            };
            upsert(existing, header, ItemType::TreeLeaves.into(), &leaves)
        })?;

        if written {
            debug!(
                "Stored tree {} ({} leaves, {} bytes)",
                tree.root(),
                tree.leaves().len(),
                tree.file_size()
            );
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use tempfile::tempdir;

    fn key(b: u8) -> ContentKey {
        ContentKey::from_bytes([b; HASH_SIZE])
    }

    fn test_db(dir: &std::path::Path) -> FileDb {
        let config = StoreConfig {
            data_dir: dir.to_path_buf(),
            initial_map_size: 1 << 20,
            sync_on_commit: false,
        };
        FileDb::new(MappedStore::try_open(&config).unwrap())
    }

    #[test]
    fn test_non_utf8_path_is_replaced() {
        let dir = tempdir().unwrap();
        let db = test_db(dir.path());
        let header = RecordHeader {
            flags: 0x02,
            file_size: 512,
        };
        let blob = upsert(None, header, ItemType::LocalPath.into(), b"/share/caf\xe9.txt").unwrap();
        db.store().put(&key(9), &blob).unwrap();

        let info = db.get_file_info(&key(9)).unwrap();
        assert_eq!(info.flags, 0x02);
        assert_eq!(info.path.as_deref(), Some("/share/caf\u{FFFD}.txt"));

        // A valid path replaces the damaged one
        assert!(db.put_file_info(&key(9), 0, 512, Some("/share/cafe.txt"), false).unwrap());
        let info = db.get_file_info(&key(9)).unwrap();
        assert_eq!(info.path.as_deref(), Some("/share/cafe.txt"));
    }

    fn tree(root: u8, leaves: u8, file_size: u64) -> MerkleTree {
        MerkleTree::new(key(root), file_size, (1..=leaves).map(key).collect())
    }

    #[test]
    fn test_file_info_roundtrip() {
        let dir = tempdir().unwrap();
        let db = test_db(dir.path());
        assert!(db.get_file_info(&key(1)).is_none());

        assert!(db.put_file_info(&key(1), 0x01, 4096, Some("/share/a.iso"), false).unwrap());
        let info = db.get_file_info(&key(1)).unwrap();
        assert_eq!(info.flags, 0x01);
        assert_eq!(info.file_size, 4096);
        assert_eq!(info.path.as_deref(), Some("/share/a.iso"));
        assert_eq!(info.upload_count, 0);
        assert_eq!(info.tree_size, 0);
    }

    #[test]
    fn test_flags_merge_and_no_op() {
        let dir = tempdir().unwrap();
        let db = test_db(dir.path());
        db.put_file_info(&key(1), 0x01, 10, Some("/p"), false).unwrap();

        assert!(db.put_file_info(&key(1), 0x04, 10, None, false).unwrap());
        assert_eq!(db.get_file_info(&key(1)).unwrap().flags, 0x05);

        // Nothing new: no write
        let entries = db.store().stats().unwrap().entries;
        assert!(!db.put_file_info(&key(1), 0x01, 10, Some("/p"), false).unwrap());
        assert_eq!(db.store().stats().unwrap().entries, entries);
        assert_eq!(db.get_file_info(&key(1)).unwrap().path.as_deref(), Some("/p"));
    }

    #[test]
    fn test_path_replaced_in_place() {
        let dir = tempdir().unwrap();
        let db = test_db(dir.path());
        db.put_file_info(&key(1), 0, 10, Some("/old"), true).unwrap();
        db.put_file_info(&key(1), 0, 10, Some("/new/and/longer"), false).unwrap();

        let blob = db.store().get(&key(1)).unwrap();
        let record = Record::decode(&blob).unwrap();
        let types: Vec<u8> = record.items.iter().map(|(t, _)| *t).collect();
        assert_eq!(types, vec![2, 3]);
        assert_eq!(record.items[0].1, b"/new/and/longer");
    }

    #[test]
    fn test_upload_count_widens() {
        let dir = tempdir().unwrap();
        let db = test_db(dir.path());
        for _ in 0..3 {
            db.put_file_info(&key(1), 0, 1, None, true).unwrap();
        }
        assert_eq!(db.get_file_info(&key(1)).unwrap().upload_count, 3);

        // Seed a counter at the u16 limit
        let mut blob = RecordHeader::default().to_bytes().to_vec();
        crate::record::put_item(&mut blob, 3, &u16::MAX.to_le_bytes());
        db.store().put(&key(2), &blob).unwrap();

        db.put_file_info(&key(2), 0, 1, None, true).unwrap();
        assert_eq!(db.get_file_info(&key(2)).unwrap().upload_count, 0x10000);
        let record = Record::decode(&db.store().get(&key(2)).unwrap()).unwrap();
        assert_eq!(record.items[0].1.len(), 4);
    }

    #[test]
    fn test_tree_roundtrip() {
        let dir = tempdir().unwrap();
        let db = test_db(dir.path());
        let t = tree(9, 4, 4000);

        assert!(db.put_tree(&t).unwrap());
        let loaded = db.get_tree(&key(9)).unwrap();
        assert_eq!(loaded, t);
        assert_eq!(loaded.block_size(), 1024);

        // Same shape again: untouched
        assert!(!db.put_tree(&t).unwrap());
    }

    #[test]
    fn test_tree_keeps_file_info() {
        let dir = tempdir().unwrap();
        let db = test_db(dir.path());
        db.put_file_info(&key(9), 0x02, 4000, Some("/f"), true).unwrap();
        db.put_tree(&tree(9, 3, 4000)).unwrap();

        let info = db.get_file_info(&key(9)).unwrap();
        assert_eq!(info.flags, 0x02);
        assert_eq!(info.path.as_deref(), Some("/f"));
        assert_eq!(info.upload_count, 1);
        assert_eq!(info.tree_size, 3 * HASH_SIZE);

        // A replacement tree takes the old tree's slot
        db.put_tree(&tree(9, 5, 9000)).unwrap();
        assert_eq!(db.get_tree(&key(9)).unwrap().leaves().len(), 5);
        assert_eq!(db.get_file_info(&key(9)).unwrap().file_size, 9000);
    }

    #[test]
    fn test_single_leaf_tree_not_stored() {
        let dir = tempdir().unwrap();
        let db = test_db(dir.path());
        assert!(!db.put_tree(&MerkleTree::single(key(5), 100)).unwrap());
        assert!(db.get_tree(&key(5)).is_none());
    }

    #[test]
    fn test_invalid_tree_size_is_absent() {
        let dir = tempdir().unwrap();
        let db = test_db(dir.path());
        let mut blob = RecordHeader::default().to_bytes().to_vec();
        crate::record::put_item(&mut blob, 1, &[0u8; HASH_SIZE + 5]);
        db.store().put(&key(6), &blob).unwrap();
        assert!(db.get_tree(&key(6)).is_none());

        let mut blob = RecordHeader::default().to_bytes().to_vec();
        crate::record::put_item(&mut blob, 1, &[1u8; HASH_SIZE]);
        db.store().put(&key(7), &blob).unwrap();
        assert!(db.get_tree(&key(7)).is_none());
    }

    #[test]
    fn test_short_record_is_absent() {
        let dir = tempdir().unwrap();
        let db = test_db(dir.path());
        db.store().put(&key(8), &[1, 2, 3]).unwrap();
        assert!(db.get_file_info(&key(8)).is_none());

        // Writing over it starts a fresh record
        db.put_file_info(&key(8), 1, 5, None, false).unwrap();
        assert_eq!(db.get_file_info(&key(8)).unwrap().file_size, 5);
    }

    #[test]
    fn test_disabled_store() {
        let db = FileDb::new(MappedStore::disabled());
        assert!(db.get_file_info(&key(1)).is_none());
        assert!(db.get_tree(&key(1)).is_none());
        assert!(matches!(
            db.put_file_info(&key(1), 1, 1, None, false),
            Err(StoreError::Unavailable)
        ));
        assert!(matches!(
            db.put_tree(&tree(1, 2, 10)),
            Err(StoreError::Unavailable)
        ));
    }
}
