//! Batch verification of every block file in a directory.
//!
//! # Concurrency
//!
//! A fixed rayon pool of [`effective_workers`] threads takes one file per
//! task; a worker owns its file from open to quarantine.  Files share only:
//!
//! * the run's failure counter (`Arc<AtomicUsize>`),
//! * the progress funnel (a channel drained by one sink thread),
//! * the [`Quarantine`] mutex,
//! * the cancel flag.
//!
//! A failed file never stops the others.  Cancellation is cooperative: it is
//! checked before each file and between blocks, and files it interrupts
//! finish as [`Outcome::Incomplete`].  Incomplete files are neither counted
//! as failures nor quarantined.

pub mod progress;
pub mod quarantine;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::recovery::RecoveryPolicy;
use crate::verify::{display_name, FileVerificationResult, Outcome, Verifier};

use self::progress::{spawn_sink, ProgressFunnel, ProgressObserver};
use self::quarantine::Quarantine;

pub const DEFAULT_EXTENSIONS: &[&str] = &["blk"];

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("cannot read directory {}: {source}", path.display())]
    ReadDir {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("cannot start progress sink: {0}")]
    Sink(#[source] io::Error),
    #[error("report serialisation failed: {0}")]
    Report(#[from] serde_json::Error),
}

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub source_dir: PathBuf,
    /// Requested worker count; clamped by [`effective_workers`].
    pub threads:    usize,
    /// File extensions to verify, matched case-insensitively, without dot.
    pub extensions: Vec<String>,
    pub policy:     RecoveryPolicy,
    /// Move failed files to `failed_files/`.
    pub quarantine: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("."),
            threads:    1,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            policy:     RecoveryPolicy::default(),
            quarantine: true,
        }
    }
}

impl BatchConfig {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self { source_dir: source_dir.into(), ..Self::default() }
    }
}

pub fn available_workers() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

pub fn effective_workers(requested: usize) -> usize {
    requested.clamp(1, available_workers())
}

/// Regular files directly inside `dir` whose extension is in `extensions`,
/// sorted by path.
pub fn discover(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, BatchError> {
    let read_err = |source| BatchError::ReadDir { path: dir.to_path_buf(), source };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let path = entry.path();
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| extensions.iter().any(|want| want.trim_start_matches('.').eq_ignore_ascii_case(ext)))
            .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    #[serde(flatten)]
    pub result:           FileVerificationResult,
    pub quarantined_to:   Option<PathBuf>,
    pub quarantine_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub started_at:  DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_dir:  PathBuf,
    pub workers:     usize,
    pub results:     Vec<FileReport>,
    /// Final value of the run's failure counter.
    pub failed:      usize,
}

impl BatchReport {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.results.iter().filter(|r| r.result.outcome == outcome).count()
    }

    pub fn passed(&self) -> usize {
        self.count(Outcome::Passed)
    }

    pub fn incomplete(&self) -> usize {
        self.count(Outcome::Incomplete)
    }

    /// Process exit status: the failure count, saturated to what a shell can see.
    pub fn exit_code(&self) -> i32 {
        self.failed.min(255) as i32
    }

    pub fn summary(&self) -> String {
        format!(
            "{} file(s) with {} worker(s): {} passed, {} failed, {} incomplete in {:.2}s",
            self.results.len(),
            self.workers,
            self.passed(),
            self.failed,
            self.incomplete(),
            (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0,
        )
    }

    pub fn to_json(&self) -> Result<String, BatchError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// ── Runner ────────────────────────────────────────────────────────────────────

/// Runs batches against one class table and validator set; each run's
/// [`BatchConfig::policy`] decides how recovery searches.
pub struct BatchRunner {
    verifier: Verifier,
    stop:     Arc<AtomicBool>,
}

impl BatchRunner {
    pub fn new(verifier: Verifier) -> Self {
        Self { verifier, stop: Arc::new(AtomicBool::new(false)) }
    }

    /// Setting the returned flag cancels this runner's current and future
    /// runs.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn run(&self, config: &BatchConfig, observer: Arc<dyn ProgressObserver>) -> Result<BatchReport, BatchError> {
        let files = discover(&config.source_dir, &config.extensions)?;
        info!(dir = %config.source_dir.display(), files = files.len(), "discovered block files");
        self.run_files(&files, config, observer)
    }

    /// Verify an explicit file list.  Ids passed to the observer are indices
    /// into `files`.
    pub fn run_files(
        &self,
        files:    &[PathBuf],
        config:   &BatchConfig,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<BatchReport, BatchError> {
        let started_at = Utc::now();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(effective_workers(config.threads))
            .thread_name(|i| format!("verify-{i}"))
            .build()?;
        let workers = pool.current_num_threads();

        let verifier = self.verifier.with_policy(config.policy.clone());
        let failed = Arc::new(AtomicUsize::new(0));
        let quarantine = Quarantine::new();
        let (funnel, sink) = spawn_sink(observer).map_err(BatchError::Sink)?;

        let results: Vec<FileReport> = pool.install(|| {
            files
                .par_iter()
                .enumerate()
                .map(|(id, path)| self.process(&verifier, id, path, config, &funnel, &failed, &quarantine))
                .collect()
        });

        drop(funnel);
        if sink.join().is_err() {
            warn!("progress observer panicked; some progress events were lost");
        }

        Ok(BatchReport {
            started_at,
            finished_at: Utc::now(),
            source_dir: config.source_dir.clone(),
            workers,
            results,
            failed: failed.load(Ordering::SeqCst),
        })
    }

    fn process(
        &self,
        verifier:   &Verifier,
        id:         usize,
        path:       &Path,
        config:     &BatchConfig,
        funnel:     &ProgressFunnel,
        failed:     &AtomicUsize,
        quarantine: &Quarantine,
    ) -> FileReport {
        funnel.on_new_file(id, &display_name(path));
        let result = if self.stop.load(Ordering::Relaxed) {
            FileVerificationResult::incomplete(path)
        } else {
            verifier.verify(path, id, funnel, &self.stop)
        };

        let mut report = FileReport { result, quarantined_to: None, quarantine_error: None };
        let outcome = report.result.outcome;
        if outcome.is_failure() {
            failed.fetch_add(1, Ordering::SeqCst);
            if config.quarantine && outcome.is_quarantinable() {
                match quarantine.move_file(path) {
                    Ok(dest) => {
                        info!(path = %path.display(), dest = %dest.display(), "quarantined");
                        report.quarantined_to = Some(dest);
                    }
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "quarantine failed");
                        report.quarantine_error = Some(e.to_string());
                    }
                }
            }
        }

        funnel.on_complete(id, report.result.phase.label(), outcome.label());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.blk", "a.BLK", "c.txt", "noext"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("sub.blk")).unwrap();

        let found = discover(dir.path(), &["blk".to_string()]).unwrap();
        let names: Vec<_> = found.iter().map(|p| display_name(p)).collect();
        assert_eq!(names, ["a.BLK", "b.blk"]);
    }

    #[test]
    fn discover_accepts_dotted_extensions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.dat"), b"").unwrap();
        assert_eq!(discover(dir.path(), &[".dat".to_string()]).unwrap().len(), 1);
    }

    #[test]
    fn discover_missing_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover(&dir.path().join("missing"), &["blk".to_string()]).unwrap_err();
        assert!(matches!(err, BatchError::ReadDir { .. }));
    }

    #[test]
    fn workers_are_clamped() {
        assert_eq!(effective_workers(0), 1);
        assert_eq!(effective_workers(1), 1);
        assert_eq!(effective_workers(usize::MAX), available_workers());
    }
}
