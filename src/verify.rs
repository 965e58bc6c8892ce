//! Two-pass integrity verification of one block file.
//!
//! # Passes
//!
//! | Phase | Reads | Decides |
//! |-------|-------|---------|
//! | `Pass 1` | every block; on a structural failure, asks the [`RecoveryEngine`] to realign and keeps going | `FailedStructural` if any failure is unrecoverable |
//! | `Pass 2` | the file again from offset 0; every block goes to its [`SemanticValidator`](crate::validate::SemanticValidator) | `FailedSemantic` if a validator rejects a block or a record was lost to a pass-1 repair |
//!
//! A file that survives both passes untouched is `Passed`.  Pass 2 only
//! tolerates structural failures at offsets pass 1 repaired: it reports the
//! record there as damaged and resumes where the repair resumed.  Any other
//! structural failure in pass 2 means the file changed underneath us and is
//! `FailedStructural`.
//!
//! Nothing here is written to disk.  Errors never escape [`Verifier::verify`]:
//! everything that went wrong is folded into the returned
//! [`FileVerificationResult`].

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::batch::progress::{NoProgress, ProgressObserver};
use crate::class_table::ClassTable;
use crate::recovery::{RecoveryEngine, RecoveryOutcome, RecoveryPolicy, RepairAction};
use crate::scan::{ScanError, Scanner};
use crate::validate::ValidatorRegistry;

// ── Result types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    FailedStructural,
    FailedSemantic,
    CouldNotOpen,
    /// Verification was cancelled before it finished.
    Incomplete,
}

impl Outcome {
    /// Counts toward the batch failure total.
    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::FailedStructural | Outcome::FailedSemantic | Outcome::CouldNotOpen)
    }

    /// Quarantine applies only to files that were actually read.
    pub fn is_quarantinable(self) -> bool {
        matches!(self, Outcome::FailedStructural | Outcome::FailedSemantic)
    }

    pub fn label(self) -> &'static str {
        match self {
            Outcome::Passed           => "passed",
            Outcome::FailedStructural => "failed (structural)",
            Outcome::FailedSemantic   => "failed (semantic)",
            Outcome::CouldNotOpen     => "could not open",
            Outcome::Incomplete       => "incomplete",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where verification of a file stood when it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Pass1,
    Pass2,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Idle  => "Open",
            Phase::Pass1 => "Pass 1",
            Phase::Pass2 => "Pass 2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Io,
    Structural,
    Unrecoverable,
    DamagedRecord,
    Semantic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub phase:  Phase,
    pub kind:   IssueKind,
    pub offset: Option<u64>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVerificationResult {
    pub path:    PathBuf,
    pub outcome: Outcome,
    pub phase:   Phase,
    /// Blocks that decoded cleanly in pass 2.
    pub blocks:  u64,
    /// File length in bytes.
    pub bytes:   u64,
    pub repairs: Vec<RepairAction>,
    pub issues:  Vec<Issue>,
    pub elapsed: Duration,
}

impl FileVerificationResult {
    /// Result for a file that was never started.
    pub fn incomplete(path: &Path) -> Self {
        Self {
            path:    path.to_path_buf(),
            outcome: Outcome::Incomplete,
            phase:   Phase::Idle,
            blocks:  0,
            bytes:   0,
            repairs: Vec::new(),
            issues:  Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn file_name(&self) -> String {
        display_name(&self.path)
    }
}

pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ── Verifier ──────────────────────────────────────────────────────────────────

/// Shared, read-only verification context.  One instance serves every worker
/// of a batch.
#[derive(Debug, Clone)]
pub struct Verifier {
    table:      Arc<ClassTable>,
    validators: Arc<ValidatorRegistry>,
    policy:     RecoveryPolicy,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new(
            Arc::new(ClassTable::builtin()),
            Arc::new(ValidatorRegistry::builtin()),
            RecoveryPolicy::default(),
        )
    }
}

impl Verifier {
    pub fn new(table: Arc<ClassTable>, validators: Arc<ValidatorRegistry>, policy: RecoveryPolicy) -> Self {
        Self { table, validators, policy }
    }

    /// Same table and validators under another recovery policy.
    pub fn with_policy(&self, policy: RecoveryPolicy) -> Self {
        Self {
            table:      Arc::clone(&self.table),
            validators: Arc::clone(&self.validators),
            policy,
        }
    }

    pub fn table(&self) -> &ClassTable {
        &self.table
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Verify one file with no progress reporting and no cancellation.
    pub fn verify_file(&self, path: &Path) -> FileVerificationResult {
        self.verify(path, 0, &NoProgress, &AtomicBool::new(false))
    }

    pub fn verify(
        &self,
        path:     &Path,
        id:       usize,
        observer: &dyn ProgressObserver,
        stop:     &AtomicBool,
    ) -> FileVerificationResult {
        let started = Instant::now();
        let mut run = Run::new(path, id, observer, stop);
        let outcome = self.drive(&mut run);
        debug!(path = %path.display(), outcome = outcome.label(), repairs = run.repairs.len(), "verified");
        FileVerificationResult {
            path:    path.to_path_buf(),
            outcome,
            phase:   run.phase,
            blocks:  run.blocks,
            bytes:   run.bytes,
            repairs: run.repairs,
            issues:  run.issues,
            elapsed: started.elapsed(),
        }
    }

    fn drive(&self, run: &mut Run<'_>) -> Outcome {
        if run.cancelled() {
            return Outcome::Incomplete;
        }
        let mut scanner = match self.open(run.path) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %run.path.display(), error = %e, "could not open file");
                run.note(IssueKind::Io, None, format!("could not open: {e}"));
                return Outcome::CouldNotOpen;
            }
        };
        run.bytes = scanner.len();

        run.enter(Phase::Pass1);
        if let Some(outcome) = self.pass1(&mut scanner, run) {
            return outcome;
        }
        drop(scanner);

        run.enter(Phase::Pass2);
        let mut scanner = match self.open(run.path) {
            Ok(s) => s,
            Err(e) => return run.io_failure(0, &e),
        };
        self.pass2(&mut scanner, run)
    }

    fn open(&self, path: &Path) -> io::Result<Scanner<io::BufReader<std::fs::File>>> {
        Ok(Scanner::open(path)?.with_max_payload_len(self.policy.max_payload_len))
    }

    /// Structural pass.  `Some` ends verification early.
    fn pass1<R: Read + Seek>(&self, scanner: &mut Scanner<R>, run: &mut Run<'_>) -> Option<Outcome> {
        let engine = RecoveryEngine::new(&self.table, &self.policy);
        loop {
            if run.cancelled() {
                return Some(Outcome::Incomplete);
            }
            let Some(item) = scanner.next() else { break };
            if let Err(err) = item {
                let at = err.block_offset();
                if !err.is_content() {
                    return Some(run.scan_io_failure(&err));
                }
                warn!(path = %run.path.display(), phase = "Pass 1", offset = at, error = %err, "structural failure");
                run.note(IssueKind::Structural, Some(at), err.to_string());

                let file_len = scanner.len();
                match engine.recover(scanner.get_mut(), file_len, &err) {
                    RecoveryOutcome::Repaired(action) => {
                        debug_assert!(action.resume_at > at);
                        if let Err(e) = scanner.resume_at(action.resume_at) {
                            return Some(run.io_failure(action.resume_at, &e));
                        }
                        run.repairs.push(action);
                    }
                    RecoveryOutcome::Unrecoverable { status, reason } => {
                        warn!(
                            path   = %run.path.display(),
                            phase  = "Pass 1",
                            offset = at,
                            status = status.label(),
                            reason = %reason,
                            "unrecoverable structural failure"
                        );
                        run.note(IssueKind::Unrecoverable, Some(at), format!("{}: {reason}", status.label()));
                        return Some(Outcome::FailedStructural);
                    }
                }
            }
            run.progress(scanner.progress_percent());
        }
        run.progress(100);
        None
    }

    /// Semantic pass over the same byte sequence, skipping what pass 1
    /// repaired.
    fn pass2<R: Read + Seek>(&self, scanner: &mut Scanner<R>, run: &mut Run<'_>) -> Outcome {
        let repaired: HashMap<u64, u64> = run.repairs.iter().map(|a| (a.failed_at, a.resume_at)).collect();
        let mut damaged = false;
        loop {
            if run.cancelled() {
                return Outcome::Incomplete;
            }
            let Some(item) = scanner.next() else { break };
            match item {
                Ok((offset, block)) => {
                    run.blocks += 1;
                    if let Err(e) = self.validators.validate(&block) {
                        warn!(
                            path   = %run.path.display(),
                            phase  = "Pass 2",
                            offset,
                            key    = %block.key(),
                            error  = %e,
                            "semantic failure"
                        );
                        run.note(IssueKind::Semantic, Some(offset), format!("{}: {e}", block.key()));
                        damaged = true;
                    }
                }
                Err(err) if !err.is_content() => return run.scan_io_failure(&err),
                Err(err) => {
                    let at = err.block_offset();
                    let Some(&resume_at) = repaired.get(&at) else {
                        warn!(
                            path   = %run.path.display(),
                            phase  = "Pass 2",
                            offset = at,
                            error  = %err,
                            "structural failure not seen in pass 1"
                        );
                        run.note(IssueKind::Structural, Some(at), err.to_string());
                        return Outcome::FailedStructural;
                    };
                    warn!(
                        path   = %run.path.display(),
                        phase  = "Pass 2",
                        offset = at,
                        resume_at,
                        "record damaged; data between offsets not trusted"
                    );
                    run.note(IssueKind::DamagedRecord, Some(at), format!("record lost up to offset {resume_at}: {err}"));
                    damaged = true;
                    if let Err(e) = scanner.resume_at(resume_at) {
                        return run.io_failure(resume_at, &e);
                    }
                }
            }
            run.progress(scanner.progress_percent());
        }
        run.progress(100);
        if damaged {
            Outcome::FailedSemantic
        } else {
            Outcome::Passed
        }
    }
}

// ── Per-file state ────────────────────────────────────────────────────────────

struct Run<'a> {
    path:         &'a Path,
    id:           usize,
    observer:     &'a dyn ProgressObserver,
    stop:         &'a AtomicBool,
    phase:        Phase,
    last_percent: Option<u8>,
    blocks:       u64,
    bytes:        u64,
    repairs:      Vec<RepairAction>,
    issues:       Vec<Issue>,
}

impl<'a> Run<'a> {
    fn new(path: &'a Path, id: usize, observer: &'a dyn ProgressObserver, stop: &'a AtomicBool) -> Self {
        Self {
            path,
            id,
            observer,
            stop,
            phase:        Phase::Idle,
            last_percent: None,
            blocks:       0,
            bytes:        0,
            repairs:      Vec::new(),
            issues:       Vec::new(),
        }
    }

    fn cancelled(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.last_percent = None;
        self.progress(0);
    }

    /// Report only when the percentage moves.
    fn progress(&mut self, percent: u8) {
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            self.observer.on_progress(self.id, self.phase.label(), percent);
        }
    }

    fn note(&mut self, kind: IssueKind, offset: Option<u64>, detail: String) {
        self.issues.push(Issue { phase: self.phase, kind, offset, detail });
    }

    fn io_failure(&mut self, offset: u64, e: &io::Error) -> Outcome {
        error!(path = %self.path.display(), phase = self.phase.label(), offset, error = %e, "I/O failure");
        self.note(IssueKind::Io, Some(offset), e.to_string());
        Outcome::FailedStructural
    }

    fn scan_io_failure(&mut self, err: &ScanError) -> Outcome {
        let offset = err.block_offset();
        error!(path = %self.path.display(), phase = self.phase.label(), offset, error = %err, "I/O failure");
        self.note(IssueKind::Io, Some(offset), err.to_string());
        Outcome::FailedStructural
    }
}
