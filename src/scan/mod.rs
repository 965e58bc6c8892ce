//! Structural scanner: a lazy, finite, restartable walk over a block file.
//!
//! A block file has no header, footer or index, so the scanner simply decodes
//! blocks back-to-back from the current position until the stream is
//! exhausted.  Each item is `(offset, Block)` where `offset` is the absolute
//! position of the block header.
//!
//! On the first codec failure the scanner yields a [`ScanError`] carrying the
//! offset at which the failing block's header began (the recovery anchor) and
//! then stops.  It stays stopped until [`Scanner::resume_at`] re-positions it,
//! which is how the verifier continues after a successful repair.
//!
//! Restarting from scratch is just opening the path again; two scans of the
//! same well-formed file produce identical sequences.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;
use tracing::trace;

use crate::block::{decode_block_with_limit, Block, CodecError, DEFAULT_MAX_PAYLOAD_LEN};

const READ_BUFFER: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("block at offset {block_offset}: {source}")]
    Codec {
        block_offset: u64,
        #[source]
        source:       CodecError,
    },
    #[error("IO error at offset {offset}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: io::Error,
    },
}

impl ScanError {
    /// Offset of the header of the block being decoded when the error hit.
    pub fn block_offset(&self) -> u64 {
        match self {
            ScanError::Codec { block_offset, .. } => *block_offset,
            ScanError::Io { offset, .. }          => *offset,
        }
    }

    /// True for errors caused by file content (candidates for recovery), false
    /// for failures of the underlying device or descriptor.
    pub fn is_content(&self) -> bool {
        matches!(self, ScanError::Codec { .. })
    }

    pub fn codec(&self) -> Option<&CodecError> {
        match self {
            ScanError::Codec { source, .. } => Some(source),
            ScanError::Io { .. }            => None,
        }
    }
}

pub struct Scanner<R> {
    reader:          R,
    position:        u64,
    len:             u64,
    max_payload_len: u32,
    halted:          bool,
}

impl Scanner<BufReader<File>> {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len  = file.metadata()?.len();
        Ok(Self::with_len(BufReader::with_capacity(READ_BUFFER, file), len))
    }
}

impl<R: Read + Seek> Scanner<R> {
    /// Wrap a seekable stream; the stream is rewound to offset 0.
    pub fn new(mut reader: R) -> io::Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(Self::with_len(reader, len))
    }

    fn with_len(reader: R, len: u64) -> Self {
        Self {
            reader,
            position: 0,
            len,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            halted: false,
        }
    }

    pub fn with_max_payload_len(mut self, max_payload_len: u32) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    /// Offset of the next block header to be decoded.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Stream length captured when the scanner was opened.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes consumed as a percentage of the stream (100 for an empty stream).
    pub fn progress_percent(&self) -> u8 {
        if self.len == 0 {
            return 100;
        }
        ((self.position.min(self.len) as u128 * 100) / self.len as u128) as u8
    }

    /// True after an error, until the next `resume_at`.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Continue scanning from `offset` (typically a recovered block boundary).
    pub fn resume_at(&mut self, offset: u64) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        self.halted   = false;
        Ok(())
    }

    /// The underlying stream, for the recovery engine.  Callers that move
    /// the stream must `resume_at` before iterating again.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    fn next_block(&mut self) -> Option<Result<(u64, Block), ScanError>> {
        if self.halted || self.position >= self.len {
            return None;
        }
        let offset = self.position;
        match decode_block_with_limit(&mut self.reader, offset, self.max_payload_len) {
            Ok(block) => {
                self.position += block.encoded_len();
                trace!(offset, key = %block.key(), len = block.header.payload_length, "decoded block");
                Some(Ok((offset, block)))
            }
            Err(CodecError::Io(source)) => {
                self.halted = true;
                Some(Err(ScanError::Io { offset, source }))
            }
            Err(source) => {
                self.halted = true;
                Some(Err(ScanError::Codec { block_offset: offset, source }))
            }
        }
    }
}

impl<R: Read + Seek> Iterator for Scanner<R> {
    type Item = Result<(u64, Block), ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_block()
    }
}
