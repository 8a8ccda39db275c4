//! File metadata record codec
//!
//! A record is the value stored for one content key. It is a fixed header
//! followed by self-delimiting tagged items:
//!
//! ```text
//! +-------+-----------+--------+--------+-----
//! | Flags | File size | Item 0 | Item 1 | ...
//! | 2B    | 8B        | var    | var    |
//! +-------+-----------+--------+--------+-----
//!
//! Short item (payload <= 255 bytes):  | type   | len u8  | payload |
//! Long item  (payload  > 255 bytes):  | type|80 | len u16 | payload |
//! ```
//!
//! All integers are little-endian. The store only supports whole-value
//! writes, so updating one item rewrites the full record.

/// Size of the fixed record header
pub const RECORD_HEADER_SIZE: usize = 10;

/// Largest payload an item can carry
pub const MAX_ITEM_PAYLOAD: usize = u16::MAX as usize;

/// Largest payload that fits the short item header
const SHORT_PAYLOAD_MAX: usize = u8::MAX as usize;

/// Type byte bit selecting the long item header
const LONG_HEADER_BIT: u8 = 0x80;

/// Known item types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemType {
    /// Concatenated merkle leaf hashes
    TreeLeaves = 1,
    /// Local file path, raw bytes
    LocalPath = 2,
    /// Upload counter, u16 or u32
    UploadCount = 3,
}

impl ItemType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::TreeLeaves),
            2 => Some(Self::LocalPath),
            3 => Some(Self::UploadCount),
            _ => None,
        }
    }
}

impl From<ItemType> for u8 {
    fn from(t: ItemType) -> Self {
        t as Self
    }
}

/// Item header, short or long form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemHeader {
    Short { item_type: u8, len: u8 },
    Long { item_type: u8, len: u16 },
}

impl ItemHeader {
    /// Header for an item of `len` payload bytes
    ///
    /// Returns `None` if the payload is too large for any header form.
    pub fn for_payload(item_type: u8, len: usize) -> Option<Self> {
        let item_type = item_type & !LONG_HEADER_BIT;
        if len <= SHORT_PAYLOAD_MAX {
            Some(Self::Short {
                item_type,
                len: len as u8,
            })
        } else {
            let len = u16::try_from(len).ok()?;
            Some(Self::Long { item_type, len })
        }
    }

    /// Decode a header from the start of `data`
    pub fn decode(data: &[u8]) -> Option<Self> {
        let first = *data.first()?;
        if first & LONG_HEADER_BIT != 0 {
            let len = u16::from_le_bytes(data.get(1..3)?.try_into().ok()?);
            Some(Self::Long {
                item_type: first & !LONG_HEADER_BIT,
                len,
            })
        } else {
            Some(Self::Short {
                item_type: first,
                len: *data.get(1)?,
            })
        }
    }

    pub fn item_type(&self) -> u8 {
        match *self {
            Self::Short { item_type, .. } | Self::Long { item_type, .. } => item_type,
        }
    }

    pub fn payload_len(&self) -> usize {
        match *self {
            Self::Short { len, .. } => usize::from(len),
            Self::Long { len, .. } => usize::from(len),
        }
    }

    pub const fn encoded_len(&self) -> usize {
        match self {
            Self::Short { .. } => 2,
            Self::Long { .. } => 3,
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        match *self {
            Self::Short { item_type, len } => {
                buf.push(item_type);
                buf.push(len);
            }
            Self::Long { item_type, len } => {
                buf.push(item_type | LONG_HEADER_BIT);
                buf.extend_from_slice(&len.to_le_bytes());
            }
        }
    }
}

/// One decoded item, borrowing its payload from the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item<'a> {
    pub item_type: u8,
    pub payload: &'a [u8],
    pub header_size: usize,
}

impl<'a> Item<'a> {
    /// Header and payload bytes exactly as stored
    pub fn raw(&self, record_items: &'a [u8], offset: usize) -> &'a [u8] {
        &record_items[offset..offset + self.header_size + self.payload.len()]
    }
}

/// Sequential parser over the item region of a record
pub struct ItemParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ItemParser<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current cursor position within the item region
    pub const fn position(&self) -> usize {
        self.pos
    }

    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Parse the item at the cursor and advance past it
    ///
    /// Returns `None` at the end of the buffer, and also when the
    /// declared length of the next item runs past the end: a record whose
    /// item framing is broken has no further usable items.
    pub fn next_item(&mut self) -> Option<Item<'a>> {
        let rest = self.data.get(self.pos..)?;
        let header = ItemHeader::decode(rest)?;
        let header_size = header.encoded_len();
        let end = header_size.checked_add(header.payload_len())?;
        if end > rest.len() {
            self.pos = self.data.len();
            return None;
        }
        let payload = &rest[header_size..end];
        self.pos += end;
        Some(Item {
            item_type: header.item_type(),
            payload,
            header_size,
        })
    }
}

impl<'a> Iterator for ItemParser<'a> {
    type Item = Item<'a>;

    fn next(&mut self) -> Option<Item<'a>> {
        self.next_item()
    }
}

/// Append one encoded item to `buf`
///
/// Payloads longer than [`MAX_ITEM_PAYLOAD`] are rejected and nothing is
/// written.
pub fn put_item(buf: &mut Vec<u8>, item_type: u8, payload: &[u8]) -> bool {
    let Some(header) = ItemHeader::for_payload(item_type, payload.len()) else {
        return false;
    };
    buf.reserve(header.encoded_len() + payload.len());
    header.write_to(buf);
    buf.extend_from_slice(payload);
    true
}

/// Encode one item into a fresh buffer of exactly header + payload bytes
pub fn encode_item(item_type: u8, payload: &[u8]) -> Option<Vec<u8>> {
    let header = ItemHeader::for_payload(item_type, payload.len())?;
    let mut buf = Vec::with_capacity(header.encoded_len() + payload.len());
    header.write_to(&mut buf);
    buf.extend_from_slice(payload);
    Some(buf)
}

/// Fixed header of a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordHeader {
    pub flags: u16,
    pub file_size: u64,
}

impl RecordHeader {
    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.flags.to_le_bytes());
        buf[2..10].copy_from_slice(&self.file_size.to_le_bytes());
        buf
    }

    /// Decode the header of a record blob
    ///
    /// Blobs shorter than the header are not valid records.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < RECORD_HEADER_SIZE {
            return None;
        }
        Some(Self {
            flags: u16::from_le_bytes(data[0..2].try_into().ok()?),
            file_size: u64::from_le_bytes(data[2..10].try_into().ok()?),
        })
    }
}

/// Borrowed view of a valid record blob
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub header: RecordHeader,
    items: &'a [u8],
}

impl<'a> RecordView<'a> {
    pub fn parse(blob: &'a [u8]) -> Option<Self> {
        let header = RecordHeader::from_bytes(blob)?;
        Some(Self {
            header,
            items: &blob[RECORD_HEADER_SIZE..],
        })
    }

    pub const fn items(&self) -> ItemParser<'a> {
        ItemParser::new(self.items)
    }

    /// First item of the given type
    pub fn find(&self, item_type: u8) -> Option<Item<'a>> {
        self.items().find(|item| item.item_type == item_type)
    }
}

/// Rebuild a record with one item inserted or replaced
///
/// Items of other types are copied through in their original order. The
/// new item takes the position of the first existing item of the same
/// type, or goes last if there was none; any further items of that type
/// are dropped. A missing or invalid `existing` blob starts from `header`.
/// With an existing record, `header` replaces the stored one.
pub fn upsert(
    existing: Option<&[u8]>,
    header: RecordHeader,
    item_type: u8,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let new_item = ItemHeader::for_payload(item_type, payload.len())?;
    let item_type = new_item.item_type();
    let items = existing
        .and_then(RecordView::parse)
        .map_or(&[][..], |view| view.items);

    let mut buf =
        Vec::with_capacity(RECORD_HEADER_SIZE + items.len() + new_item.encoded_len() + payload.len());
    buf.extend_from_slice(&header.to_bytes());

    let mut placed = false;
    let mut parser = ItemParser::new(items);
    loop {
        let start = parser.position();
        let Some(item) = parser.next_item() else { break };
        if item.item_type == item_type {
            if !placed {
                new_item.write_to(&mut buf);
                buf.extend_from_slice(payload);
                placed = true;
            }
            continue;
        }
        buf.extend_from_slice(item.raw(items, start));
    }
    if !placed {
        new_item.write_to(&mut buf);
        buf.extend_from_slice(payload);
    }
    Some(buf)
}

/// Owned, fully decoded record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub header: RecordHeader,
    pub items: Vec<(u8, Vec<u8>)>,
}

impl Record {
    pub fn decode(blob: &[u8]) -> Option<Self> {
        let view = RecordView::parse(blob)?;
        Some(Self {
            header: view.header,
            items: view
                .items()
                .map(|item| (item.item_type, item.payload.to_vec()))
                .collect(),
        })
    }

    /// Encode the record; `None` if any payload is too large
    pub fn encode(&self) -> Option<Vec<u8>> {
        let body: usize = self.items.iter().map(|(_, p)| p.len() + 3).sum();
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + body);
        buf.extend_from_slice(&self.header.to_bytes());
        for (item_type, payload) in &self.items {
            if !put_item(&mut buf, *item_type, payload) {
                return None;
            }
        }
        Some(buf)
    }
}
