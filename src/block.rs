//! Block codec: one typed, versioned, CRC-protected record.
//!
//! # On-disk layout (little-endian, no padding)
//!
//! ```text
//! Offset  Size  Field
//!  0       2    class_id
//!  2       1    major_version
//!  3       1    minor_version
//!  4       2    data_id
//!  6       4    payload_length
//! 10       N    payload
//! 10+N     4    checksum
//! ```
//!
//! The checksum is the standard reflected CRC-32 (zip/gzip) over
//! `u32(class_id << 16 | major << 8 | minor) ++ u16(data_id) ++ payload`.
//! Note the checksum prefix is *not* the on-disk header order: the block id is
//! serialised as one little-endian `u32`.  `payload_length` is not covered.
//!
//! Everything here is a pure byte transform over `Read`/`Write`; offsets in
//! errors are absolute, computed from the `origin` the caller passes in.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Bytes of fixed header preceding the payload.
pub const HEADER_SIZE: usize = 10;
/// Bytes of trailing checksum.
pub const CHECKSUM_SIZE: usize = 4;
/// Header plus checksum: the size of a zero-payload block.
pub const BLOCK_OVERHEAD: u64 = (HEADER_SIZE + CHECKSUM_SIZE) as u64;
/// Byte offset of `data_id` inside the header.
pub const DATA_ID_OFFSET: u64 = 4;
/// Byte offset of `payload_length` inside the header.
pub const LENGTH_OFFSET: u64 = 6;
/// Upper bound on `payload_length` accepted before allocating (64 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

const PAYLOAD_READ_HINT: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unexpected end of stream at offset {offset}")]
    UnexpectedEof { offset: u64 },
    #[error(
        "checksum mismatch for class {class_id:#06x} v{major_version}.{minor_version} \
         data id {data_id}: stored {expected:#010x}, computed {computed:#010x}"
    )]
    ChecksumMismatch {
        expected:      u32,
        computed:      u32,
        class_id:      u16,
        major_version: u8,
        minor_version: u8,
        data_id:       u16,
    },
    #[error("malformed block at offset {offset}: {reason}")]
    Malformed { offset: u64, reason: String },
    #[error("payload of {len} bytes does not fit the u32 length field")]
    PayloadTooLarge { len: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Record identity ──────────────────────────────────────────────────────────

/// `(class_id, major, minor, data_id)`: identifies a record class version and
/// the sub-type inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub class_id:      u16,
    pub major_version: u8,
    pub minor_version: u8,
    pub data_id:       u16,
}

impl RecordKey {
    pub const fn new(class_id: u16, major_version: u8, minor_version: u8, data_id: u16) -> Self {
        Self { class_id, major_version, minor_version, data_id }
    }

    /// `class_id << 16 | major << 8 | minor`.
    #[inline]
    pub fn block_id(&self) -> u32 {
        (self.class_id as u32) << 16 | (self.major_version as u32) << 8 | self.minor_version as u32
    }

    /// The six header-derived bytes that open the checksum input.
    pub fn checksum_prefix(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        LittleEndian::write_u32(&mut out[0..4], self.block_id());
        LittleEndian::write_u16(&mut out[4..6], self.data_id);
        out
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#06x} v{}.{} data {}",
            self.class_id, self.major_version, self.minor_version, self.data_id
        )
    }
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHeader {
    pub class_id:       u16,
    pub major_version:  u8,
    pub minor_version:  u8,
    pub data_id:        u16,
    pub payload_length: u32,
}

impl BlockHeader {
    pub fn new(key: RecordKey, payload_length: u32) -> Self {
        Self {
            class_id:      key.class_id,
            major_version: key.major_version,
            minor_version: key.minor_version,
            data_id:       key.data_id,
            payload_length,
        }
    }

    #[inline]
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.class_id, self.major_version, self.minor_version, self.data_id)
    }

    /// Total on-disk size of the block this header opens.
    #[inline]
    pub fn block_len(&self) -> u64 {
        BLOCK_OVERHEAD + self.payload_length as u64
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        LittleEndian::write_u16(&mut out[0..2], self.class_id);
        out[2] = self.major_version;
        out[3] = self.minor_version;
        LittleEndian::write_u16(&mut out[4..6], self.data_id);
        LittleEndian::write_u32(&mut out[6..10], self.payload_length);
        out
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            class_id:       LittleEndian::read_u16(&bytes[0..2]),
            major_version:  bytes[2],
            minor_version:  bytes[3],
            data_id:        LittleEndian::read_u16(&bytes[4..6]),
            payload_length: LittleEndian::read_u32(&bytes[6..10]),
        }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u16::<LittleEndian>(self.class_id)?;
        writer.write_u8(self.major_version)?;
        writer.write_u8(self.minor_version)?;
        writer.write_u16::<LittleEndian>(self.data_id)?;
        writer.write_u32::<LittleEndian>(self.payload_length)?;
        Ok(())
    }
}

// ── Block ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header:   BlockHeader,
    pub payload:  Vec<u8>,
    pub checksum: u32,
}

impl Block {
    /// Build a block and compute its checksum.  Fails when `payload` is
    /// longer than the length field can express.
    pub fn try_new(key: RecordKey, payload: Vec<u8>) -> Result<Self, CodecError> {
        let header = BlockHeader::new(key, payload_len(payload.len())?);
        let checksum = checksum(&header, &payload);
        Ok(Self { header, payload, checksum })
    }

    /// [`Block::try_new`] for payloads known to fit, such as fixed-size
    /// records.
    ///
    /// # Panics
    /// If `payload` is longer than `u32::MAX` bytes.
    pub fn new(key: RecordKey, payload: Vec<u8>) -> Self {
        match Self::try_new(key, payload) {
            Ok(block) => block,
            Err(e) => panic!("{e}"),
        }
    }

    #[inline]
    pub fn key(&self) -> RecordKey {
        self.header.key()
    }

    #[inline]
    pub fn encoded_len(&self) -> u64 {
        self.header.block_len()
    }

    /// True when the stored checksum matches the content.
    pub fn verify(&self) -> bool {
        checksum(&self.header, &self.payload) == self.checksum
    }
}

fn payload_len(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::PayloadTooLarge { len })
}

/// A hasher already fed the six header-derived checksum bytes for `key`.
pub fn checksum_hasher(key: &RecordKey) -> Hasher {
    let mut hasher = Hasher::new();
    hasher.update(&key.checksum_prefix());
    hasher
}

pub fn checksum(header: &BlockHeader, payload: &[u8]) -> u32 {
    let mut hasher = checksum_hasher(&header.key());
    hasher.update(payload);
    hasher.finalize()
}

pub fn write_block<W: Write>(mut writer: W, block: &Block) -> io::Result<()> {
    block.header.write(&mut writer)?;
    writer.write_all(&block.payload)?;
    writer.write_u32::<LittleEndian>(block.checksum)?;
    Ok(())
}

pub fn encode_block(block: &Block) -> Vec<u8> {
    let mut out = Vec::with_capacity(block.encoded_len() as usize);
    out.extend_from_slice(&block.header.to_bytes());
    out.extend_from_slice(&block.payload);
    out.extend_from_slice(&block.checksum.to_le_bytes());
    out
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Read into `buf` until it is full or the stream ends; returns bytes read.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read a block header whose first byte sits at absolute offset `origin`.
pub fn read_header<R: Read>(reader: &mut R, origin: u64) -> Result<BlockHeader, CodecError> {
    let mut buf = [0u8; HEADER_SIZE];
    let n = read_full(reader, &mut buf)?;
    if n < HEADER_SIZE {
        return Err(CodecError::UnexpectedEof { offset: origin + n as u64 });
    }
    Ok(BlockHeader::from_bytes(&buf))
}

/// Decode one block starting at absolute offset `origin`, bounding
/// `payload_length` by [`DEFAULT_MAX_PAYLOAD_LEN`].
pub fn decode_block<R: Read>(reader: &mut R, origin: u64) -> Result<Block, CodecError> {
    decode_block_with_limit(reader, origin, DEFAULT_MAX_PAYLOAD_LEN)
}

pub fn decode_block_with_limit<R: Read>(
    reader:          &mut R,
    origin:          u64,
    max_payload_len: u32,
) -> Result<Block, CodecError> {
    let header = read_header(reader, origin)?;
    if header.payload_length > max_payload_len {
        return Err(CodecError::Malformed {
            offset: origin + LENGTH_OFFSET,
            reason: format!(
                "payload length {} exceeds limit {}",
                header.payload_length, max_payload_len
            ),
        });
    }

    // Grow with the bytes that actually arrive; a truncated file must not
    // cost a full `payload_length` allocation.
    let declared = header.payload_length as usize;
    let mut payload = Vec::with_capacity(declared.min(PAYLOAD_READ_HINT));
    let got = (&mut *reader).take(declared as u64).read_to_end(&mut payload)?;
    let payload_start = origin + HEADER_SIZE as u64;
    if got < declared {
        return Err(CodecError::UnexpectedEof { offset: payload_start + got as u64 });
    }

    let mut crc = [0u8; CHECKSUM_SIZE];
    let n = read_full(reader, &mut crc)?;
    let checksum_start = payload_start + declared as u64;
    if n < CHECKSUM_SIZE {
        return Err(CodecError::UnexpectedEof { offset: checksum_start + n as u64 });
    }
    let stored = LittleEndian::read_u32(&crc);

    let computed = checksum(&header, &payload);
    if computed != stored {
        return Err(CodecError::ChecksumMismatch {
            expected:      stored,
            computed,
            class_id:      header.class_id,
            major_version: header.major_version,
            minor_version: header.minor_version,
            data_id:       header.data_id,
        });
    }

    Ok(Block { header, payload, checksum: stored })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> Block {
        Block::new(RecordKey::new(0x0002, 1, 0, 3), b"abc".to_vec())
    }

    #[test]
    fn header_layout_is_little_endian() {
        let bytes = encode_block(&sample());
        assert_eq!(&bytes[..HEADER_SIZE], &[0x02, 0x00, 0x01, 0x00, 0x03, 0x00, 0x03, 0, 0, 0]);
        assert_eq!(&bytes[HEADER_SIZE..HEADER_SIZE + 3], b"abc");
        assert_eq!(bytes.len() as u64, sample().encoded_len());
    }

    #[test]
    fn checksum_prefix_packs_block_id_as_u32() {
        let key = RecordKey::new(0x0002, 1, 0, 3);
        assert_eq!(key.block_id(), 0x0002_0100);
        assert_eq!(key.checksum_prefix(), [0x00, 0x01, 0x02, 0x00, 0x03, 0x00]);

        let mut input = key.checksum_prefix().to_vec();
        input.extend_from_slice(b"abc");
        assert_eq!(sample().checksum, crc32fast::hash(&input));
    }

    #[test]
    fn payload_length_must_fit_u32() {
        assert_eq!(payload_len(3).unwrap(), 3);
        assert_eq!(payload_len(u32::MAX as usize).unwrap(), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            payload_len(u32::MAX as usize + 1),
            Err(CodecError::PayloadTooLarge { .. })
        ));
        assert_eq!(Block::try_new(RecordKey::new(0x0002, 1, 0, 3), b"abc".to_vec()).unwrap(), sample());
    }

    #[test]
    fn empty_payload_still_checksums_header() {
        let key = RecordKey::new(0x0006, 1, 0, 1);
        let block = Block::new(key, Vec::new());
        assert_eq!(block.checksum, crc32fast::hash(&key.checksum_prefix()));
        let decoded = decode_block(&mut Cursor::new(encode_block(&block)), 0).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn decode_roundtrip() {
        let block = sample();
        let decoded = decode_block(&mut Cursor::new(encode_block(&block)), 0).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.verify());
    }

    #[test]
    fn truncated_checksum_reports_offset_reached() {
        let mut bytes = encode_block(&sample());
        let full = bytes.len();
        bytes.truncate(full - 3);
        let err = decode_block(&mut Cursor::new(bytes), 100).unwrap_err();
        match err {
            CodecError::UnexpectedEof { offset } => assert_eq!(offset, 100 + full as u64 - 3),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn truncated_header_reports_offset_reached() {
        let bytes = encode_block(&sample());
        let err = decode_block(&mut Cursor::new(&bytes[..4]), 20).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedEof { offset: 24 }));
    }

    #[test]
    fn oversized_length_is_malformed_not_allocated() {
        let header = BlockHeader::new(RecordKey::new(1, 1, 0, 1), u32::MAX);
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        let err = decode_block(&mut Cursor::new(bytes), 0).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { offset: 6, .. }));
    }

    #[test]
    fn mismatch_surfaces_header_fields() {
        let mut bytes = encode_block(&sample());
        bytes[HEADER_SIZE] ^= 0x01;
        let err = decode_block(&mut Cursor::new(bytes), 0).unwrap_err();
        match err {
            CodecError::ChecksumMismatch { class_id, major_version, minor_version, data_id, expected, computed } => {
                assert_eq!((class_id, major_version, minor_version, data_id), (0x0002, 1, 0, 3));
                assert_eq!(expected, sample().checksum);
                assert_ne!(expected, computed);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
