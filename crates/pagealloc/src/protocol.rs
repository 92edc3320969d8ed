//! Control-file wire formats.
//!
//! The binary structures written to `<id>_read`, `<id>_write` and the top-level
//! `free_pages` file. They cross the user/kernel boundary of a single running
//! kernel, so the layout is fixed little-endian with explicit padding.
//!
//! Page request layout (32 bytes):
//!
//! | offset | size | field         |
//! |--------|------|---------------|
//! | 0      | 8    | `page_number` |
//! | 8      | 2    | `block_id`    |
//! | 10     | 2    | padding       |
//! | 12     | 4    | `pages_span`  |
//! | 16     | 8    | `data_size`   |
//! | 24     | 8    | `data`        |
//!
//! Free request layout: `mem_type: i32` followed by one byte per block id.

use crate::{BlockId, MAX_PAGE_BLOCKS, ZoneId};

/// Size of an encoded [`PageRequest`].
pub const PAGE_REQUEST_SIZE: usize = 32;

/// Size of an encoded [`FreeRequest`].
pub const LIBERATOR_SIZE: usize = 4 + MAX_PAGE_BLOCKS;

/// Errors decoding control-file input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Fewer bytes were written than the structure needs.
    #[error("expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    /// The request names a block id outside the registry.
    #[error("block id {0} is out of range")]
    BadBlockId(u16),
    /// The request names a different block than the file it was written to.
    #[error("request for block {request} written to the file of block {file}")]
    BlockMismatch { file: u16, request: u16 },
    /// `mem_type` names no known zone.
    #[error("unknown memory type {0}")]
    UnknownMemType(i32),
    /// A bitmap byte was neither 0 nor 1.
    #[error("bitmap byte {index} is {value:#x}")]
    BadBitmapByte { index: usize, value: u8 },
}

/// Descriptor written to a block's `<id>_read` or `<id>_write` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// First logical page to access.
    pub page_number: u64,
    /// Block the request is aimed at.
    pub block_id: u16,
    /// Number of consecutive logical pages to access.
    pub pages_span: u32,
    /// Bytes to move per page.
    pub data_size: u64,
    /// User address of the caller's buffer.
    pub data: u64,
}

impl PageRequest {
    /// Decodes a request from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let bytes: &[u8; PAGE_REQUEST_SIZE] = bytes
            .get(..PAGE_REQUEST_SIZE)
            .and_then(|head| head.try_into().ok())
            .ok_or(ProtocolError::Truncated {
                expected: PAGE_REQUEST_SIZE,
                actual: bytes.len(),
            })?;

        Ok(Self {
            page_number: u64::from_le_bytes(field(bytes, 0)),
            block_id: u16::from_le_bytes(field(bytes, 8)),
            pages_span: u32::from_le_bytes(field(bytes, 12)),
            data_size: u64::from_le_bytes(field(bytes, 16)),
            data: u64::from_le_bytes(field(bytes, 24)),
        })
    }

    /// Encodes the request.
    pub fn encode(&self) -> [u8; PAGE_REQUEST_SIZE] {
        let mut bytes = [0u8; PAGE_REQUEST_SIZE];
        bytes[0..8].copy_from_slice(&self.page_number.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.block_id.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.pages_span.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.data_size.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.data.to_le_bytes());
        bytes
    }

    /// Returns the targeted block, if the id is in range.
    pub fn block(&self) -> Result<BlockId, ProtocolError> {
        BlockId::from_wire(self.block_id).ok_or(ProtocolError::BadBlockId(self.block_id))
    }
}

fn field<const N: usize>(bytes: &[u8; PAGE_REQUEST_SIZE], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

/// A set of block ids, one flag per registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockBitmap([bool; MAX_PAGE_BLOCKS]);

impl BlockBitmap {
    /// Creates an empty bitmap.
    pub const fn new() -> Self {
        Self([false; MAX_PAGE_BLOCKS])
    }

    /// Adds `block` to the set.
    pub fn set(&mut self, block: BlockId) {
        self.0[block.as_usize()] = true;
    }

    /// Returns true if `block` is in the set.
    pub fn contains(&self, block: BlockId) -> bool {
        self.0[block.as_usize()]
    }

    /// Iterates over the ids in the set, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = BlockId> + '_ {
        BlockId::all().filter(|block| self.contains(*block))
    }
}

impl Default for BlockBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<BlockId> for BlockBitmap {
    fn from_iter<I: IntoIterator<Item = BlockId>>(iter: I) -> Self {
        let mut bitmap = Self::new();
        for block in iter {
            bitmap.set(block);
        }
        bitmap
    }
}

/// Request written to the top-level `free_pages` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRequest {
    pub zone: ZoneId,
    pub blocks: BlockBitmap,
}

impl FreeRequest {
    /// Decodes a request, rejecting unknown zones and bitmap bytes other than 0 or 1.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < LIBERATOR_SIZE {
            return Err(ProtocolError::Truncated {
                expected: LIBERATOR_SIZE,
                actual: bytes.len(),
            });
        }

        let mem_type = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let zone = ZoneId::from_mem_type(mem_type).ok_or(ProtocolError::UnknownMemType(mem_type))?;

        let mut blocks = BlockBitmap::new();
        for (block, &value) in BlockId::all().zip(&bytes[4..LIBERATOR_SIZE]) {
            match value {
                0 => {}
                1 => blocks.set(block),
                _ => {
                    return Err(ProtocolError::BadBitmapByte {
                        index: block.as_usize(),
                        value,
                    });
                }
            }
        }

        Ok(Self { zone, blocks })
    }

    /// Encodes the request.
    pub fn encode(&self) -> [u8; LIBERATOR_SIZE] {
        let mut bytes = [0u8; LIBERATOR_SIZE];
        bytes[0..4].copy_from_slice(&self.zone.mem_type().to_le_bytes());
        for block in self.blocks.iter() {
            bytes[4 + block.as_usize()] = 1;
        }
        bytes
    }
}

/// Parses the ASCII page count written to `allocate_pages`.
///
/// Surrounding whitespace and trailing NULs are ignored. Returns `None` for anything
/// that is not a positive decimal number.
pub fn parse_page_count(input: &[u8]) -> Option<usize> {
    let text = core::str::from_utf8(input).ok()?;
    let text = text.trim_end_matches('\0').trim();
    match text.parse::<usize>() {
        Ok(0) | Err(_) => None,
        Ok(pages) => Some(pages),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_request_layout() {
        let request = PageRequest {
            page_number: 0x0102_0304_0506_0708,
            block_id: 0x0a0b,
            pages_span: 0x1122_3344,
            data_size: 4096,
            data: 0xdead_beef,
        };
        let bytes = request.encode();

        assert_eq!(bytes[0], 0x08);
        assert_eq!(&bytes[8..10], &[0x0b, 0x0a]);
        assert_eq!(&bytes[10..12], &[0, 0]);
        assert_eq!(&bytes[12..16], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(PageRequest::decode(&bytes), Ok(request));
    }

    #[test]
    fn page_request_rejects_short_input() {
        assert_eq!(
            PageRequest::decode(&[0u8; 31]),
            Err(ProtocolError::Truncated {
                expected: PAGE_REQUEST_SIZE,
                actual: 31
            })
        );
    }

    #[test]
    fn page_request_ignores_trailing_bytes() {
        let request = PageRequest {
            page_number: 3,
            block_id: 1,
            pages_span: 1,
            data_size: 8,
            data: 0x1000,
        };
        let mut bytes = request.encode().to_vec();
        bytes.extend_from_slice(&[0xFF; 8]);
        assert_eq!(PageRequest::decode(&bytes), Ok(request));
    }

    #[test]
    fn page_request_block_bounds() {
        let mut request = PageRequest {
            page_number: 0,
            block_id: 3,
            pages_span: 1,
            data_size: 0,
            data: 0,
        };
        assert_eq!(request.block().map(BlockId::as_usize), Ok(3));

        request.block_id = MAX_PAGE_BLOCKS as u16;
        assert_eq!(
            request.block(),
            Err(ProtocolError::BadBlockId(MAX_PAGE_BLOCKS as u16))
        );
    }

    #[test]
    fn free_request_layout() {
        let blocks: BlockBitmap = [0, 5, MAX_PAGE_BLOCKS - 1]
            .into_iter()
            .filter_map(BlockId::new)
            .collect();
        let request = FreeRequest {
            zone: ZoneId::HighMem,
            blocks,
        };
        let bytes = request.encode();

        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], 0);
        assert_eq!(bytes[9], 1);
        assert_eq!(bytes[LIBERATOR_SIZE - 1], 1);
        assert_eq!(FreeRequest::decode(&bytes), Ok(request));
    }

    #[test]
    fn free_request_rejects_malformed_input() {
        let mut bytes = FreeRequest {
            zone: ZoneId::LowMem,
            blocks: BlockBitmap::new(),
        }
        .encode();

        assert!(matches!(
            FreeRequest::decode(&bytes[..10]),
            Err(ProtocolError::Truncated { .. })
        ));

        bytes[6] = 2;
        assert_eq!(
            FreeRequest::decode(&bytes),
            Err(ProtocolError::BadBitmapByte { index: 2, value: 2 })
        );

        bytes[6] = 0;
        bytes[0..4].copy_from_slice(&7i32.to_le_bytes());
        assert_eq!(
            FreeRequest::decode(&bytes),
            Err(ProtocolError::UnknownMemType(7))
        );
    }

    #[test]
    fn parses_page_counts() {
        assert_eq!(parse_page_count(b"10"), Some(10));
        assert_eq!(parse_page_count(b"10\n"), Some(10));
        assert_eq!(parse_page_count(b" 42 \0\0"), Some(42));
        assert_eq!(parse_page_count(b"0"), None);
        assert_eq!(parse_page_count(b""), None);
        assert_eq!(parse_page_count(b"ten"), None);
        assert_eq!(parse_page_count(b"-5"), None);
        assert_eq!(parse_page_count(&[0xFF, 0xFE]), None);
    }
}
