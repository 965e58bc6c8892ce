use std::io::{self, Read, Seek, SeekFrom};

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use tracing::{debug, error, info, trace};

use crate::block::{
    checksum, checksum_hasher, decode_block_with_limit, BlockHeader, CodecError, RecordKey,
    BLOCK_OVERHEAD, CHECKSUM_SIZE, DATA_ID_OFFSET, HEADER_SIZE,
};
use crate::class_table::{BlockStatus, ClassTable};
use crate::scan::ScanError;

use super::{AnchorKind, RecoveryCandidate, RecoveryOutcome, RecoveryPolicy, RepairAction};

// ── Window ────────────────────────────────────────────────────────────────────

/// The bytes from the anchor up to the end of the search window, held in
/// memory so sliding searches do not seek per candidate.
struct Window {
    start: u64,
    bytes: Vec<u8>,
}

impl Window {
    fn load<R: Read + Seek>(reader: &mut R, start: u64, len: u64) -> io::Result<Self> {
        reader.seek(SeekFrom::Start(start))?;
        let mut bytes = Vec::with_capacity(len as usize);
        (&mut *reader).take(len).read_to_end(&mut bytes)?;
        Ok(Self { start, bytes })
    }

    fn slice(&self, at: u64, len: usize) -> Option<&[u8]> {
        let i = usize::try_from(at.checked_sub(self.start)?).ok()?;
        self.bytes.get(i..i.checked_add(len)?)
    }

    fn byte(&self, at: u64) -> Option<u8> {
        self.slice(at, 1).map(|s| s[0])
    }

    fn u16_at(&self, at: u64) -> Option<u16> {
        self.slice(at, 2).map(LittleEndian::read_u16)
    }

    fn u32_at(&self, at: u64) -> Option<u32> {
        self.slice(at, 4).map(LittleEndian::read_u32)
    }

    fn header_at(&self, at: u64) -> Option<BlockHeader> {
        let raw: &[u8; HEADER_SIZE] = self.slice(at, HEADER_SIZE)?.try_into().ok()?;
        Some(BlockHeader::from_bytes(raw))
    }

    fn hex_at(&self, at: u64, len: usize) -> String {
        let end = self.bytes.len().min(at.saturating_sub(self.start) as usize + len);
        let start = (at.saturating_sub(self.start) as usize).min(end);
        hex::encode(&self.bytes[start..end])
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Stateless search over one damaged stream.  Cheap to build per failure.
pub struct RecoveryEngine<'a> {
    table:  &'a ClassTable,
    policy: &'a RecoveryPolicy,
}

impl<'a> RecoveryEngine<'a> {
    pub fn new(table: &'a ClassTable, policy: &'a RecoveryPolicy) -> Self {
        Self { table, policy }
    }

    /// Attempt to realign after `failure`.  I/O errors met while searching
    /// make the failure unrecoverable; they are never propagated.
    pub fn recover<R: Read + Seek>(
        &self,
        reader:   &mut R,
        file_len: u64,
        failure:  &ScanError,
    ) -> RecoveryOutcome {
        self.recover_at(reader, file_len, failure.block_offset())
    }

    pub fn recover_at<R: Read + Seek>(&self, reader: &mut R, file_len: u64, at: u64) -> RecoveryOutcome {
        match self.search(reader, file_len, at) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(offset = at, error = %e, "I/O failure during recovery");
                RecoveryOutcome::Unrecoverable {
                    status: BlockStatus::BadPayload,
                    reason: format!("I/O failure while searching from offset {at}: {e}"),
                }
            }
        }
    }

    fn search<R: Read + Seek>(&self, reader: &mut R, file_len: u64, at: u64) -> io::Result<RecoveryOutcome> {
        let window_len = file_len
            .saturating_sub(at)
            .min(self.policy.search_window.saturating_add(BLOCK_OVERHEAD));
        let window = Window::load(reader, at, window_len)?;
        let status = self.original_status(reader, &window, at)?;
        debug!(
            offset = at,
            status = status.label(),
            header = %window.hex_at(at, HEADER_SIZE),
            "attempting recovery"
        );

        if status.is_ok() {
            return Ok(RecoveryOutcome::Unrecoverable {
                status,
                reason: format!("block at offset {at} decodes cleanly; the failure was not content damage"),
            });
        }

        for anchor in &self.policy.anchors {
            let found = match anchor {
                AnchorKind::BlockIdStart  => self.reinterpret_block_id(reader, &window, file_len, at, status)?,
                AnchorKind::DataIdStart   => self.header_slip(reader, &window, file_len, at, status)?,
                AnchorKind::PayloadStart  => self.payload_end(reader, &window, file_len, at, status)?,
                AnchorKind::ChecksumStart => self.realign(reader, &window, file_len, at, status)?,
            };
            match found {
                Some(action) => {
                    info!(
                        offset    = at,
                        anchor    = action.anchor().label(),
                        resume_at = action.resume_at,
                        discarded = action.discarded_bytes(),
                        "recovered block framing"
                    );
                    return Ok(RecoveryOutcome::Repaired(action));
                }
                None => debug!(offset = at, anchor = anchor.label(), "anchor exhausted"),
            }
        }

        Ok(RecoveryOutcome::Unrecoverable {
            status,
            reason: format!(
                "no valid block boundary within {} bytes of offset {at} ({})",
                self.policy.search_window,
                status.label()
            ),
        })
    }

    /// How the failing block classifies: header table lookup first, then a
    /// full decode.  A header cut off by end-of-file counts as a bad payload.
    fn original_status<R: Read + Seek>(&self, reader: &mut R, window: &Window, at: u64) -> io::Result<BlockStatus> {
        let Some(header) = window.header_at(at) else {
            return Ok(BlockStatus::BadPayload);
        };
        match self.table.classify_header(&header) {
            BlockStatus::Ok => match self.decode_at(reader, at) {
                Ok(_) => Ok(BlockStatus::Ok),
                Err(CodecError::Io(e)) => Err(e),
                Err(_) => Ok(BlockStatus::BadPayload),
            },
            other => Ok(other),
        }
    }

    // ── Anchors ───────────────────────────────────────────────────────────────

    /// Header bits flipped in place: try the nearest known keys against the
    /// stored checksum, keeping the declared length.
    fn reinterpret_block_id<R: Read + Seek>(
        &self,
        reader:   &mut R,
        window:   &Window,
        file_len: u64,
        at:       u64,
        status:   BlockStatus,
    ) -> io::Result<Option<RepairAction>> {
        let Some(header) = window.header_at(at) else { return Ok(None) };
        if !self.body_fits(at + HEADER_SIZE as u64, header.payload_length, file_len) {
            return Ok(None);
        }
        let candidates = self.table.nearest_keys(&header.key(), self.policy.max_header_bit_errors);
        if candidates.is_empty() {
            return Ok(None);
        }

        let (payload, stored) = self.read_body(reader, at + HEADER_SIZE as u64, header.payload_length)?;
        let mut body = Hasher::new();
        body.update(&payload);

        for key in candidates {
            trace!(offset = at, key = %key, "testing reinterpretation");
            let mut hasher = checksum_hasher(&key);
            hasher.combine(&body);
            if hasher.finalize() == stored {
                return Ok(Some(RepairAction {
                    candidate:        RecoveryCandidate { anchor_kind: AnchorKind::BlockIdStart, byte_offset: at },
                    failed_at:        at,
                    discard:          at..at,
                    resume_at:        at + header.block_len(),
                    recovered_header: Some(BlockHeader::new(key, header.payload_length).into()),
                    original_status:  status,
                }));
            }
        }
        Ok(None)
    }

    /// Bytes inserted after the block id: slide the data-id field start
    /// forward, keeping the four block-id bytes at the anchor.
    fn header_slip<R: Read + Seek>(
        &self,
        reader:   &mut R,
        window:   &Window,
        file_len: u64,
        at:       u64,
        status:   BlockStatus,
    ) -> io::Result<Option<RepairAction>> {
        let (Some(class_id), Some(major), Some(minor)) =
            (window.u16_at(at), window.byte(at + 2), window.byte(at + 3))
        else {
            return Ok(None);
        };
        let limit = at.saturating_add(self.policy.search_window);

        for slip in 1..=self.policy.max_header_slip {
            let p = at + DATA_ID_OFFSET + slip;
            if p > limit {
                break;
            }
            let (Some(data_id), Some(len)) = (window.u16_at(p), window.u32_at(p + 2)) else {
                break;
            };
            trace!(offset = p, data_id, "testing data-id anchor");
            let key = RecordKey::new(class_id, major, minor, data_id);
            let payload_start = p + 6;
            if !self.table.accepts(&key) || !self.body_fits(payload_start, len, file_len) {
                continue;
            }
            let header = BlockHeader::new(key, len);
            let (payload, stored) = self.read_body(reader, payload_start, len)?;
            if checksum(&header, &payload) == stored {
                return Ok(Some(RepairAction {
                    candidate:        RecoveryCandidate { anchor_kind: AnchorKind::DataIdStart, byte_offset: p },
                    failed_at:        at,
                    discard:          at + DATA_ID_OFFSET..p,
                    resume_at:        payload_start + len as u64 + CHECKSUM_SIZE as u64,
                    recovered_header: Some(header.into()),
                    original_status:  status,
                }));
            }
        }
        Ok(None)
    }

    /// Length field corrupt: run the checksum forward from the payload start
    /// and stop where the stored value closes the equation and the next block
    /// (or end-of-file) follows.
    fn payload_end<R: Read + Seek>(
        &self,
        reader:   &mut R,
        window:   &Window,
        file_len: u64,
        at:       u64,
        status:   BlockStatus,
    ) -> io::Result<Option<RepairAction>> {
        let Some(header) = window.header_at(at) else { return Ok(None) };
        let key = header.key();
        if !self.table.accepts(&key) {
            return Ok(None);
        }

        let payload_start = at + HEADER_SIZE as u64;
        let limit = at
            .saturating_add(self.policy.search_window)
            .min(payload_start + self.policy.max_payload_len as u64);
        let mut hasher = checksum_hasher(&key);
        let mut q = payload_start;

        while q <= limit {
            let Some(stored) = window.u32_at(q) else { break };
            if hasher.clone().finalize() == stored && self.continues_at(reader, window, q + 4, file_len)? {
                let len = (q - payload_start) as u32;
                return Ok(Some(RepairAction {
                    candidate:        RecoveryCandidate { anchor_kind: AnchorKind::PayloadStart, byte_offset: payload_start },
                    failed_at:        at,
                    discard:          at..at,
                    resume_at:        q + CHECKSUM_SIZE as u64,
                    recovered_header: Some(BlockHeader::new(key, len).into()),
                    original_status:  status,
                }));
            }
            match window.byte(q) {
                Some(b) => hasher.update(&[b]),
                None => break,
            }
            q += 1;
        }
        Ok(None)
    }

    /// Payload corrupt, framing intact: the block after the damaged block's
    /// checksum, or the first offset that decodes cleanly if one comes
    /// earlier.  The declared length is untrusted, so the probe never skips
    /// over a valid block.
    fn realign<R: Read + Seek>(
        &self,
        reader:   &mut R,
        window:   &Window,
        file_len: u64,
        at:       u64,
        status:   BlockStatus,
    ) -> io::Result<Option<RepairAction>> {
        let dropped = |candidate: RecoveryCandidate, next: u64| RepairAction {
            candidate,
            failed_at:        at,
            discard:          at..next,
            resume_at:        next,
            recovered_header: None,
            original_status:  status,
        };
        let slid = |b: u64| RecoveryCandidate {
            anchor_kind: AnchorKind::ChecksumStart,
            byte_offset: b.saturating_sub(CHECKSUM_SIZE as u64).max(at),
        };

        let last = at
            .saturating_add(self.policy.search_window)
            .min(file_len.saturating_sub(BLOCK_OVERHEAD));
        let probe = window
            .header_at(at)
            .filter(|h| h.payload_length <= self.policy.max_payload_len)
            .map(|h| {
                let checksum_start = at + HEADER_SIZE as u64 + h.payload_length as u64;
                (h, checksum_start, checksum_start + CHECKSUM_SIZE as u64)
            });

        let before_probe = probe.map_or(last, |(_, _, next)| last.min(next.saturating_sub(1)));
        if let Some(b) = self.first_valid_block(reader, window, at + 1, before_probe, file_len)? {
            return Ok(Some(dropped(slid(b), b)));
        }

        if let Some((header, checksum_start, next)) = probe {
            let candidate = RecoveryCandidate { anchor_kind: AnchorKind::ChecksumStart, byte_offset: checksum_start };
            trace!(offset = checksum_start, "testing checksum anchor");
            if next == file_len && self.table.classify_header(&header).is_ok() {
                return Ok(Some(dropped(candidate, next)));
            }
            if next < file_len && self.valid_block_at(reader, window, next, file_len)? {
                return Ok(Some(dropped(candidate, next)));
            }
        }

        let after_probe = before_probe.saturating_add(1).max(at + 1);
        Ok(self
            .first_valid_block(reader, window, after_probe, last, file_len)?
            .map(|b| dropped(slid(b), b)))
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn body_fits(&self, payload_start: u64, len: u32, file_len: u64) -> bool {
        len <= self.policy.max_payload_len
            && payload_start.saturating_add(len as u64 + CHECKSUM_SIZE as u64) <= file_len
    }

    /// Slide a header candidate over `from..=to`.
    fn first_valid_block<R: Read + Seek>(
        &self,
        reader:   &mut R,
        window:   &Window,
        from:     u64,
        to:       u64,
        file_len: u64,
    ) -> io::Result<Option<u64>> {
        let mut b = from;
        while b <= to {
            if self.valid_block_at(reader, window, b, file_len)? {
                return Ok(Some(b));
            }
            b += 1;
        }
        Ok(None)
    }

    fn read_body<R: Read + Seek>(&self, reader: &mut R, payload_start: u64, len: u32) -> io::Result<(Vec<u8>, u32)> {
        reader.seek(SeekFrom::Start(payload_start))?;
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;
        let mut crc = [0u8; CHECKSUM_SIZE];
        reader.read_exact(&mut crc)?;
        Ok((payload, LittleEndian::read_u32(&crc)))
    }

    fn decode_at<R: Read + Seek>(&self, reader: &mut R, at: u64) -> Result<crate::block::Block, CodecError> {
        reader.seek(SeekFrom::Start(at))?;
        decode_block_with_limit(reader, at, self.policy.max_payload_len)
    }

    fn header_near<R: Read + Seek>(
        &self,
        reader:   &mut R,
        window:   &Window,
        at:       u64,
        file_len: u64,
    ) -> io::Result<Option<BlockHeader>> {
        if at + HEADER_SIZE as u64 > file_len {
            return Ok(None);
        }
        if let Some(h) = window.header_at(at) {
            return Ok(Some(h));
        }
        reader.seek(SeekFrom::Start(at))?;
        let mut raw = [0u8; HEADER_SIZE];
        reader.read_exact(&mut raw)?;
        Ok(Some(BlockHeader::from_bytes(&raw)))
    }

    /// A known header whose declared body fits in the file: cheap evidence
    /// that a block boundary lies at `at`.
    fn plausible_header<R: Read + Seek>(
        &self,
        reader:   &mut R,
        window:   &Window,
        at:       u64,
        file_len: u64,
    ) -> io::Result<bool> {
        Ok(match self.header_near(reader, window, at, file_len)? {
            Some(h) => {
                self.table.classify_header(&h).is_ok()
                    && self.body_fits(at + HEADER_SIZE as u64, h.payload_length, file_len)
            }
            None => false,
        })
    }

    fn continues_at<R: Read + Seek>(
        &self,
        reader:   &mut R,
        window:   &Window,
        at:       u64,
        file_len: u64,
    ) -> io::Result<bool> {
        if at == file_len {
            return Ok(true);
        }
        self.plausible_header(reader, window, at, file_len)
    }

    /// Strongest evidence: a known header whose block decodes with a
    /// verified checksum.
    fn valid_block_at<R: Read + Seek>(
        &self,
        reader:   &mut R,
        window:   &Window,
        at:       u64,
        file_len: u64,
    ) -> io::Result<bool> {
        if !self.plausible_header(reader, window, at, file_len)? {
            return Ok(false);
        }
        match self.decode_at(reader, at) {
            Ok(_) => Ok(true),
            Err(CodecError::Io(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }
}
