//! On-disk layout of the mapped store file
//!
//! ```text
//! +-------------------+----------+----------+-----
//! | Header page (4KB) | Frame 0  | Frame 1  | ...
//! +-------------------+----------+----------+-----
//!
//! Header: | Magic | Version | Map size | Used | Entries | CRC32C |
//!         | 4B    | 4B      | 8B       | 8B   | 8B      | 4B     |
//!
//! Frame:  | Key | Length | Value | CRC32C |
//!         | 24B | 4B     | var   | 4B     |
//! ```
//!
//! Frames are append-only; a later frame for the same key supersedes an
//! earlier one. `Used` is the file offset just past the last committed
//! frame, so anything beyond it is ignored on open.

use super::StoreError;
use metacache_common::{ContentKey, HASH_SIZE};

/// Header magic number
pub const STORE_MAGIC: u32 = 0x4D43_4442; // "MCDB"

/// Current layout version
pub const STORE_VERSION: u32 = 1;

/// Size reserved for the header at the start of the file
pub const HEADER_PAGE_SIZE: usize = 4096;

/// Encoded header length
pub const HEADER_LEN: usize = 36;

/// Bytes before the value in a frame (key + length)
pub const FRAME_PREFIX: usize = HASH_SIZE + 4;

/// Bytes a frame adds around its value
pub const FRAME_OVERHEAD: usize = FRAME_PREFIX + 4;

/// Store header at offset 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    pub version: u32,
    pub map_size: u64,
    pub used: u64,
    pub entries: u64,
}

impl StoreHeader {
    pub fn new(map_size: u64) -> Self {
        Self {
            version: STORE_VERSION,
            map_size,
            used: HEADER_PAGE_SIZE as u64,
            entries: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&STORE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.map_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.used.to_le_bytes());
        buf[24..32].copy_from_slice(&self.entries.to_le_bytes());
        let checksum = crc32c::crc32c(&buf[0..32]);
        buf[32..36].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, StoreError> {
        let data = data
            .get(..HEADER_LEN)
            .ok_or_else(|| StoreError::Corrupt("store header too small".into()))?;

        let magic = read_u32(data, 0);
        if magic != STORE_MAGIC {
            return Err(StoreError::Corrupt(format!(
                "invalid store magic: {magic:#010x}"
            )));
        }

        let checksum = read_u32(data, 32);
        if crc32c::crc32c(&data[0..32]) != checksum {
            return Err(StoreError::Corrupt("store header checksum mismatch".into()));
        }

        let version = read_u32(data, 4);
        if version != STORE_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported store version {version}"
            )));
        }

        Ok(Self {
            version,
            map_size: read_u64(data, 8),
            used: read_u64(data, 16),
            entries: read_u64(data, 24),
        })
    }
}

/// Total size of the frame holding a value of `value_len` bytes
pub const fn frame_len(value_len: usize) -> usize {
    FRAME_OVERHEAD + value_len
}

/// Encode a frame into `dst`, which must be exactly `frame_len(value.len())`
/// bytes long
pub fn write_frame(dst: &mut [u8], key: &ContentKey, value: &[u8]) {
    debug_assert_eq!(dst.len(), frame_len(value.len()));
    let len = value.len() as u32;
    dst[..HASH_SIZE].copy_from_slice(key.as_bytes());
    dst[HASH_SIZE..FRAME_PREFIX].copy_from_slice(&len.to_le_bytes());
    let value_end = FRAME_PREFIX + value.len();
    dst[FRAME_PREFIX..value_end].copy_from_slice(value);
    let checksum = crc32c::crc32c(&dst[..value_end]);
    dst[value_end..value_end + 4].copy_from_slice(&checksum.to_le_bytes());
}

/// A decoded frame borrowing its value from the map
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub key: ContentKey,
    pub value: &'a [u8],
}

impl Frame<'_> {
    pub const fn total_len(&self) -> usize {
        frame_len(self.value.len())
    }
}

/// Decode the frame at the start of `src`
///
/// Returns `None` for a frame that is cut short or fails its checksum,
/// which marks the end of the usable log.
pub fn read_frame(src: &[u8]) -> Option<Frame<'_>> {
    let key = ContentKey::from_slice(src.get(..HASH_SIZE)?)?;
    let len = u32::from_le_bytes(src.get(HASH_SIZE..FRAME_PREFIX)?.try_into().ok()?) as usize;
    let value_end = FRAME_PREFIX.checked_add(len)?;
    let stored = u32::from_le_bytes(src.get(value_end..value_end + 4)?.try_into().ok()?);
    if crc32c::crc32c(&src[..value_end]) != stored {
        return None;
    }
    Some(Frame {
        key,
        value: &src[FRAME_PREFIX..value_end],
    })
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = StoreHeader::new(1 << 20);
        header.used = 8192;
        header.entries = 3;

        let bytes = header.to_bytes();
        assert_eq!(StoreHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_damage() {
        let mut bytes = StoreHeader::new(1 << 20).to_bytes();
        bytes[10] ^= 0xff;
        assert!(matches!(
            StoreHeader::from_bytes(&bytes),
            Err(StoreError::Corrupt(_))
        ));
        assert!(StoreHeader::from_bytes(&[0u8; 36]).is_err());
        assert!(StoreHeader::from_bytes(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_frame_checksum() {
        let key = ContentKey::from_bytes([7; HASH_SIZE]);
        let mut buf = vec![0u8; frame_len(5)];
        write_frame(&mut buf, &key, b"hello");

        let frame = read_frame(&buf).unwrap();
        assert_eq!(frame.key, key);
        assert_eq!(frame.value, b"hello");
        assert_eq!(frame.total_len(), buf.len());

        buf[FRAME_PREFIX] ^= 1;
        assert!(read_frame(&buf).is_none());
        assert!(read_frame(&buf[..buf.len() - 1]).is_none());
    }
}
