//! Structural payload codec.
//!
//! Frame payloads are nested length-prefixed items. Every item carries a
//! one-byte tag and a four-byte big-endian content length, so the total
//! encoded size of an item is self-describing; the frame layer checks that
//! this self-reported size matches the frame's declared payload length.
//!
//! ## Wire Format
//!
//! ```text
//! [tag:1][content_len:4 BE][content:content_len]
//! ```
//!
//! | Tag  | Kind        | Content                         |
//! |------|-------------|---------------------------------|
//! | 0x00 | Byte string | raw bytes                       |
//! | 0x01 | List        | concatenation of encoded items  |
//!
//! Unsigned integers are byte strings holding the minimal big-endian
//! representation of the value (zero encodes as the empty string).

use std::fmt;
use thiserror::Error;

/// Tag byte for a byte-string item.
pub const TAG_BYTES: u8 = 0x00;

/// Tag byte for a list item.
pub const TAG_LIST: u8 = 0x01;

/// Size of the per-item header (tag + content length).
pub const ITEM_HEADER_SIZE: usize = 5;

/// Maximum nesting depth accepted by the decoder. Deeper structures are
/// rejected rather than recursed into.
const MAX_DEPTH: usize = 32;

/// Errors produced while decoding or interrogating structural items.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("item truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unknown item tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("item length overflow")]
    LengthOverflow,

    #[error("item nesting deeper than {MAX_DEPTH}")]
    DepthExceeded,

    #[error("expected byte string item")]
    ExpectedBytes,

    #[error("expected list item")]
    ExpectedList,

    #[error("missing item at index {0}")]
    MissingItem(usize),

    #[error("integer wider than 8 bytes: {0}")]
    IntegerTooWide(usize),

    #[error("invalid utf-8 in string item")]
    InvalidUtf8,
}

/// A decoded structural item: either a byte string or a list of items.
#[derive(Clone, PartialEq, Eq)]
pub enum Item {
    Bytes(Vec<u8>),
    List(Vec<Item>),
}

impl Item {
    /// Byte-string item from anything byte-like.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Item::Bytes(bytes.into())
    }

    /// Byte-string item holding a UTF-8 string.
    pub fn str(s: &str) -> Self {
        Item::Bytes(s.as_bytes().to_vec())
    }

    /// Byte-string item holding the minimal big-endian form of `value`.
    pub fn uint(value: u64) -> Self {
        let bytes = value.to_be_bytes();
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(8);
        Item::Bytes(bytes[first..].to_vec())
    }

    /// List item.
    pub fn list(items: Vec<Item>) -> Self {
        Item::List(items)
    }

    /// Total encoded size of this item, header included.
    pub fn encoded_len(&self) -> usize {
        match self {
            Item::Bytes(b) => ITEM_HEADER_SIZE + b.len(),
            Item::List(items) => {
                ITEM_HEADER_SIZE + items.iter().map(Item::encoded_len).sum::<usize>()
            }
        }
    }

    /// Append the encoding of this item to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Item::Bytes(b) => {
                out.push(TAG_BYTES);
                out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                out.extend_from_slice(b);
            }
            Item::List(items) => {
                let content_len: usize = items.iter().map(Item::encoded_len).sum();
                out.push(TAG_LIST);
                out.extend_from_slice(&(content_len as u32).to_be_bytes());
                for item in items {
                    item.encode_into(out);
                }
            }
        }
    }

    /// Encode this item into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Decode one item from the front of `buf`.
    ///
    /// Returns the item and the number of bytes it occupied (its
    /// self-reported structural length). Trailing bytes are left for the
    /// caller to judge.
    pub fn decode(buf: &[u8]) -> Result<(Item, usize), CodecError> {
        Self::decode_at(buf, 0)
    }

    fn decode_at(buf: &[u8], depth: usize) -> Result<(Item, usize), CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::DepthExceeded);
        }
        if buf.len() < ITEM_HEADER_SIZE {
            return Err(CodecError::Truncated {
                need: ITEM_HEADER_SIZE,
                have: buf.len(),
            });
        }

        let tag = buf[0];
        let content_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        let total = ITEM_HEADER_SIZE
            .checked_add(content_len)
            .ok_or(CodecError::LengthOverflow)?;
        if buf.len() < total {
            return Err(CodecError::Truncated {
                need: total,
                have: buf.len(),
            });
        }

        match tag {
            TAG_BYTES => Ok((Item::Bytes(buf[ITEM_HEADER_SIZE..total].to_vec()), total)),
            TAG_LIST => {
                let mut items = Vec::new();
                let mut offset = ITEM_HEADER_SIZE;
                while offset < total {
                    let (item, used) = Self::decode_at(&buf[offset..total], depth + 1)?;
                    items.push(item);
                    offset += used;
                }
                Ok((Item::List(items), total))
            }
            tag => Err(CodecError::UnknownTag(tag)),
        }
    }

    // === Accessors ===

    /// Interpret as a byte string.
    pub fn as_bytes(&self) -> Result<&[u8], CodecError> {
        match self {
            Item::Bytes(b) => Ok(b),
            Item::List(_) => Err(CodecError::ExpectedBytes),
        }
    }

    /// Interpret as a list.
    pub fn as_list(&self) -> Result<&[Item], CodecError> {
        match self {
            Item::List(items) => Ok(items),
            Item::Bytes(_) => Err(CodecError::ExpectedList),
        }
    }

    /// Interpret as a big-endian unsigned integer (at most 8 bytes).
    pub fn as_uint(&self) -> Result<u64, CodecError> {
        let bytes = self.as_bytes()?;
        if bytes.len() > 8 {
            return Err(CodecError::IntegerTooWide(bytes.len()));
        }
        let mut value = 0u64;
        for b in bytes {
            value = (value << 8) | u64::from(*b);
        }
        Ok(value)
    }

    /// Interpret as a UTF-8 string.
    pub fn as_str(&self) -> Result<&str, CodecError> {
        std::str::from_utf8(self.as_bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Index into a list item.
    pub fn at(&self, index: usize) -> Result<&Item, CodecError> {
        self.as_list()?
            .get(index)
            .ok_or(CodecError::MissingItem(index))
    }

    /// Number of elements in a list item (zero for byte strings).
    pub fn item_count(&self) -> usize {
        match self {
            Item::List(items) => items.len(),
            Item::Bytes(_) => 0,
        }
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Item::List(items) => f.debug_list().entries(items).finish(),
        }
    }
}
