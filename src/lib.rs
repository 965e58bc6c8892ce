//! Integrity verification and recovery for concatenated binary block files.
//!
//! A block file is a flat sequence of typed, versioned, CRC-protected blocks
//! with no index.  This crate decodes them ([`block`]), classifies headers
//! against the known record classes ([`class_table`]), walks files
//! ([`scan`]), realigns after corruption ([`recovery`]), runs per-record
//! range checks ([`validate`]), verifies files in two passes ([`verify`]),
//! and verifies whole directories in parallel with quarantine of failures
//! ([`batch`]).

pub mod batch;
pub mod block;
pub mod class_table;
pub mod logging;
pub mod recovery;
pub mod salvage;
pub mod scan;
pub mod validate;
pub mod verify;

pub use batch::progress::{ConsoleProgress, NoProgress, ProgressObserver};
pub use batch::quarantine::{Quarantine, QuarantineError};
pub use batch::{discover, effective_workers, BatchConfig, BatchError, BatchReport, BatchRunner};
pub use block::{decode_block, encode_block, Block, BlockHeader, CodecError, RecordKey};
pub use class_table::{BlockStatus, ClassTable};
pub use recovery::{AnchorKind, RecoveryEngine, RecoveryOutcome, RecoveryPolicy, RepairAction};
pub use salvage::{salvage, salvage_file, SalvageReport};
pub use scan::{ScanError, Scanner};
pub use validate::{SemanticValidator, ValidationError, ValidatorRegistry};
pub use verify::{FileVerificationResult, Outcome, Verifier};
