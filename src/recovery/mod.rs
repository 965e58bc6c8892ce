//! Corruption recovery: re-deriving block framing without an index.
//!
//! # How it works
//!
//! When the scanner stops at a block it cannot decode, the engine is handed
//! the offset of that block's header (the *anchor*) and the raw stream.  It
//! tests a bounded series of hypotheses about which field was damaged, in the
//! order given by [`RecoveryPolicy::anchors`]:
//!
//! | Anchor | Hypothesis | On success |
//! |--------|------------|------------|
//! | `BlockIdStart`  | header bits flipped; the nearest known record key verifies the checksum | block kept under the corrected key |
//! | `DataIdStart`   | bytes inserted between the block id and the data id | inserted span discarded |
//! | `PayloadStart`  | `payload_length` corrupt; a later `u32` closes the checksum equation over the payload seen so far | block kept with the true length |
//! | `ChecksumStart` | payload corrupt: the first offset after the anchor where a block decodes cleanly, normally the one right after the damaged block's checksum | damaged span discarded |
//!
//! Every candidate is accepted only on checksum evidence, so recovery never
//! fabricates payload bytes: it re-establishes framing and names the span it
//! could not attribute to a valid block.  The source file is never modified.
//!
//! All searches are confined to [`RecoveryPolicy::search_window`] bytes past
//! the anchor; exhausting every anchor yields
//! [`RecoveryOutcome::Unrecoverable`] with the original [`BlockStatus`].

mod engine;

use std::fs;
use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::{BlockHeader, DEFAULT_MAX_PAYLOAD_LEN};
use crate::class_table::BlockStatus;

pub use engine::RecoveryEngine;

// ── Types ─────────────────────────────────────────────────────────────────────

/// Which field of a block a recovery hypothesis starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorKind {
    BlockIdStart,
    DataIdStart,
    PayloadStart,
    ChecksumStart,
}

impl AnchorKind {
    pub fn label(self) -> &'static str {
        match self {
            AnchorKind::BlockIdStart  => "block-id start",
            AnchorKind::DataIdStart   => "data-id start",
            AnchorKind::PayloadStart  => "payload start",
            AnchorKind::ChecksumStart => "checksum start",
        }
    }
}

/// A byte-offset hypothesis: "a field of kind `anchor_kind` begins here".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryCandidate {
    pub anchor_kind: AnchorKind,
    pub byte_offset: u64,
}

/// A successful realignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAction {
    /// The hypothesis that produced the realignment.
    pub candidate:        RecoveryCandidate,
    /// Header offset of the block the scanner failed on.
    pub failed_at:        u64,
    /// Bytes that belong to no valid block.  Empty when the failing block
    /// itself was re-read under a corrected header.
    pub discard:          Range<u64>,
    /// Where scanning continues.
    pub resume_at:        u64,
    /// The header under which the failing block verified, when it was kept.
    pub recovered_header: Option<RecoveredHeader>,
    pub original_status:  BlockStatus,
}

impl RepairAction {
    pub fn anchor(&self) -> AnchorKind {
        self.candidate.anchor_kind
    }

    pub fn discarded_bytes(&self) -> u64 {
        self.discard.end.saturating_sub(self.discard.start)
    }

    /// True when the failing block's payload survived the repair.
    pub fn keeps_block(&self) -> bool {
        self.recovered_header.is_some()
    }
}

/// Serialisable copy of a corrected header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredHeader {
    pub class_id:       u16,
    pub major_version:  u8,
    pub minor_version:  u8,
    pub data_id:        u16,
    pub payload_length: u32,
}

impl From<BlockHeader> for RecoveredHeader {
    fn from(h: BlockHeader) -> Self {
        Self {
            class_id:       h.class_id,
            major_version:  h.major_version,
            minor_version:  h.minor_version,
            data_id:        h.data_id,
            payload_length: h.payload_length,
        }
    }
}

impl From<RecoveredHeader> for BlockHeader {
    fn from(h: RecoveredHeader) -> Self {
        Self {
            class_id:       h.class_id,
            major_version:  h.major_version,
            minor_version:  h.minor_version,
            data_id:        h.data_id,
            payload_length: h.payload_length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Repaired(RepairAction),
    Unrecoverable { status: BlockStatus, reason: String },
}

impl RecoveryOutcome {
    pub fn repaired(&self) -> Option<&RepairAction> {
        match self {
            RecoveryOutcome::Repaired(action) => Some(action),
            RecoveryOutcome::Unrecoverable { .. } => None,
        }
    }
}

// ── Policy ────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("policy file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid recovery policy: {0}")]
    Invalid(String),
}

/// Search bounds for the recovery engine.
///
/// Missing fields take their defaults when loaded from JSON, so a policy file
/// may name only what it changes:
///
/// ```json
/// { "search_window": 1048576, "anchors": ["checksum_start"] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Furthest a candidate offset may lie past the failing header.
    pub search_window:         u64,
    /// Most bytes assumed inserted between block id and data id.
    pub max_header_slip:       u64,
    /// Most header bits a relaxed reinterpretation may correct.
    pub max_header_bit_errors: u32,
    /// Largest `payload_length` a candidate may declare.
    pub max_payload_len:       u32,
    /// Anchors to try, in order.
    pub anchors:               Vec<AnchorKind>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            search_window:         4 * 1024 * 1024,
            max_header_slip:       8,
            max_header_bit_errors: 2,
            max_payload_len:       DEFAULT_MAX_PAYLOAD_LEN,
            anchors:               vec![
                AnchorKind::BlockIdStart,
                AnchorKind::DataIdStart,
                AnchorKind::PayloadStart,
                AnchorKind::ChecksumStart,
            ],
        }
    }
}

impl RecoveryPolicy {
    pub fn from_json_file(path: &Path) -> Result<Self, PolicyError> {
        let text = fs::read_to_string(path)?;
        let policy: Self = serde_json::from_str(&text)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.search_window == 0 {
            return Err(PolicyError::Invalid("search_window must be positive".into()));
        }
        if self.max_payload_len == 0 {
            return Err(PolicyError::Invalid("max_payload_len must be positive".into()));
        }
        for (i, anchor) in self.anchors.iter().enumerate() {
            if self.anchors[..i].contains(anchor) {
                return Err(PolicyError::Invalid(format!("anchor {:?} listed twice", anchor)));
            }
        }
        Ok(())
    }
}
