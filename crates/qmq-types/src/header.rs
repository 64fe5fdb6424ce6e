//! Fixed-size per-record header of the overflow data file.
//!
//! Layout (little-endian, field order fixed):
//! ```text
//! Offset  Size  Description
//!   0       4   channel_id (u32; 0 marks a dummy filler record)
//!   4       8   next_offset (i64; 0 = last record of its channel, otherwise
//!               byte distance from this header's start to the next header)
//!  12       1   parity (XOR of all other header bytes)
//!  13       8   length (usize; payload byte count)
//! ```
//! `length` is last so that `[header][payload]` on disk ends in
//! `[length][bytes]`, matching the memory ring's record framing.

use qmq_error::{QmqError, Result};

/// Magic bytes at the start of the overflow data file.
pub const DATA_FILE_MAGIC: &[u8; 8] = b"QDSKOF01";

const CHANNEL_ID_OFFSET: usize = 0;
const NEXT_OFFSET_OFFSET: usize = 4;
const PARITY_OFFSET: usize = 12;
const LENGTH_OFFSET: usize = 13;

/// One record header as stored in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordHeader {
    /// Owning channel id. Must be > 0 for live records; 0 is the dummy
    /// record installed after head truncation.
    pub channel_id: u32,
    /// 0 for the last record of its channel; otherwise the byte distance
    /// from the start of this header to the start of the next record.
    pub next_offset: i64,
    /// Horizontal parity byte; the XOR of all serialized bytes is 0.
    pub parity: u8,
    /// Payload byte count.
    pub length: usize,
}

impl RecordHeader {
    /// Serialized size in bytes.
    pub const SIZE: usize = LENGTH_OFFSET + std::mem::size_of::<usize>();

    /// Build a header for a new tail record and set its parity.
    #[must_use]
    pub fn new(channel_id: u32, length: usize) -> Self {
        let mut header = Self {
            channel_id,
            next_offset: 0,
            parity: 0,
            length,
        };
        header.set_parity();
        header
    }

    /// Serialize into the on-disk byte layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[CHANNEL_ID_OFFSET..NEXT_OFFSET_OFFSET]
            .copy_from_slice(&self.channel_id.to_le_bytes());
        buf[NEXT_OFFSET_OFFSET..PARITY_OFFSET].copy_from_slice(&self.next_offset.to_le_bytes());
        buf[PARITY_OFFSET] = self.parity;
        buf[LENGTH_OFFSET..].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Parse a header from raw bytes without verifying parity.
    ///
    /// Use [`RecordHeader::read`] for reads off the data file, which also
    /// runs the parity check.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(QmqError::Recovery {
                detail: format!(
                    "record header too small: expected >= {}, got {}",
                    Self::SIZE,
                    buf.len()
                ),
            });
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(&buf[CHANNEL_ID_OFFSET..NEXT_OFFSET_OFFSET]);
        let mut next = [0u8; 8];
        next.copy_from_slice(&buf[NEXT_OFFSET_OFFSET..PARITY_OFFSET]);
        let mut len = [0u8; std::mem::size_of::<usize>()];
        len.copy_from_slice(&buf[LENGTH_OFFSET..Self::SIZE]);
        Ok(Self {
            channel_id: u32::from_le_bytes(id),
            next_offset: i64::from_le_bytes(next),
            parity: buf[PARITY_OFFSET],
            length: usize::from_le_bytes(len),
        })
    }

    /// Parse a header read from `file` at `offset` and verify its parity.
    ///
    /// `file` and `offset` only feed the error; the bytes come from `buf`.
    pub fn read(buf: &[u8], file: &str, offset: u64) -> Result<Self> {
        let header = Self::from_bytes(buf)?;
        if !header.parity_ok() {
            return Err(QmqError::corrupt(file, offset, "header parity mismatch"));
        }
        Ok(header)
    }

    /// Recompute and store the parity byte.
    pub fn set_parity(&mut self) {
        self.parity = 0;
        self.parity = xor_bytes(&self.to_bytes());
    }

    /// Whether the XOR of all serialized bytes is zero.
    #[must_use]
    pub fn parity_ok(&self) -> bool {
        xor_bytes(&self.to_bytes()) == 0
    }

    /// Whether this is the filler record left behind by head truncation.
    #[must_use]
    pub const fn is_dummy(&self) -> bool {
        self.channel_id == 0
    }

    /// Total on-disk footprint of the record (header plus payload).
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        Self::SIZE as u64 + self.length as u64
    }
}

fn xor_bytes(buf: &[u8]) -> u8 {
    buf.iter().fold(0, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_matches_layout() {
        // 4 (channel_id) + 8 (next_offset) + 1 (parity) + usize (length)
        assert_eq!(
            RecordHeader::SIZE,
            4 + 8 + 1 + std::mem::size_of::<usize>()
        );
    }

    #[test]
    fn roundtrip() {
        let mut header = RecordHeader {
            channel_id: 7,
            next_offset: 1234,
            parity: 0,
            length: 99,
        };
        header.set_parity();
        let parsed = RecordHeader::from_bytes(&header.to_bytes()).expect("parse");
        assert_eq!(parsed, header);
        assert!(parsed.parity_ok());
    }

    #[test]
    fn new_sets_parity() {
        let header = RecordHeader::new(3, 512);
        assert!(header.parity_ok());
        assert_eq!(header.next_offset, 0);
    }

    #[test]
    fn parity_detects_any_single_byte_flip() {
        let header = RecordHeader::new(0xDEAD_BEEF, 321);
        let bytes = header.to_bytes();
        for index in 0..RecordHeader::SIZE {
            for bit in 0..8 {
                let mut mutated = bytes;
                mutated[index] ^= 1 << bit;
                let parsed = RecordHeader::from_bytes(&mutated).expect("parse");
                assert!(
                    !parsed.parity_ok(),
                    "flip of byte {index} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn read_rejects_bad_parity() {
        let header = RecordHeader::new(1, 4);
        let mut bytes = header.to_bytes();
        bytes[0] ^= 0xFF;
        let err = RecordHeader::read(&bytes, "overflow.dat", 8).unwrap_err();
        assert!(err.to_string().contains("parity"));
        assert!(err.to_string().contains("overflow.dat"));
    }

    #[test]
    fn from_bytes_rejects_short_buffer() {
        assert!(RecordHeader::from_bytes(&[0u8; RecordHeader::SIZE - 1]).is_err());
    }

    #[test]
    fn dummy_detection() {
        assert!(RecordHeader::new(0, 100).is_dummy());
        assert!(!RecordHeader::new(1, 100).is_dummy());
    }

    #[test]
    fn total_size() {
        let header = RecordHeader::new(1, 100);
        assert_eq!(header.total_size(), RecordHeader::SIZE as u64 + 100);
    }

    #[test]
    fn zero_length_payload_is_valid() {
        let header = RecordHeader::new(9, 0);
        assert!(header.parity_ok());
        assert_eq!(header.total_size(), RecordHeader::SIZE as u64);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn any_header_roundtrips_with_valid_parity(
                channel_id in any::<u32>(),
                next_offset in any::<i64>(),
                length in any::<usize>(),
            ) {
                let mut header = RecordHeader {
                    channel_id,
                    next_offset,
                    parity: 0,
                    length,
                };
                header.set_parity();
                prop_assert!(header.parity_ok());
                let parsed = RecordHeader::from_bytes(&header.to_bytes()).expect("parse");
                prop_assert_eq!(parsed, header);
            }

            #[test]
            fn any_single_bit_flip_is_detected(
                channel_id in 1..u32::MAX,
                length in 0usize..1_000_000,
                index in 0..RecordHeader::SIZE,
                bit in 0u8..8,
            ) {
                let header = RecordHeader::new(channel_id, length);
                let mut bytes = header.to_bytes();
                bytes[index] ^= 1 << bit;
                let parsed = RecordHeader::from_bytes(&bytes).expect("parse");
                prop_assert!(!parsed.parity_ok());
            }
        }
    }
}
