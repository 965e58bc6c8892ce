//! Moves failed files aside for operator review:
//! `<source_dir>/failed_files/<original_file_name>`.
//!
//! Several workers may fail files in the same directory at once.  Creating
//! the directory and claiming a destination name both happen under one
//! mutex, so exactly one worker creates the directory and no two workers can
//! claim the same name.  A destination that already exists is never
//! overwritten; the move fails with [`QuarantineError::Collision`] and the
//! source file stays where it was.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::debug;

pub const QUARANTINE_DIR: &str = "failed_files";

#[derive(Error, Debug)]
pub enum QuarantineError {
    #[error("{} has no file name", path.display())]
    NoFileName { path: PathBuf },
    #[error("refusing to overwrite {}: a quarantined file with that name already exists", dest.display())]
    Collision { dest: PathBuf },
    #[error("IO error quarantining {}: {source}", path.display())]
    Io {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default)]
pub struct Quarantine {
    lock: Mutex<()>,
}

impl Quarantine {
    pub fn new() -> Self {
        Self::default()
    }

    /// `failed_files` next to `path`.
    pub fn dir_for(path: &Path) -> PathBuf {
        path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .join(QUARANTINE_DIR)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move `path` into its quarantine directory and return the new path.
    pub fn move_file(&self, path: &Path) -> Result<PathBuf, QuarantineError> {
        let name = path
            .file_name()
            .ok_or_else(|| QuarantineError::NoFileName { path: path.to_path_buf() })?;
        let dir = Self::dir_for(path);
        let dest = dir.join(name);

        let _held = self.guard();
        if !dir.is_dir() {
            match fs::create_dir(&dir) {
                Ok(()) => debug!(dir = %dir.display(), "created quarantine directory"),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => return Err(QuarantineError::Io { path: dir, source }),
            }
        }
        if dest.exists() {
            return Err(QuarantineError::Collision { dest });
        }
        fs::rename(path, &dest).map_err(|source| QuarantineError::Io { path: path.to_path_buf(), source })?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_into_failed_files_and_reuses_directory() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.blk");
        let b = dir.path().join("b.blk");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        let q = Quarantine::new();
        let dest_a = q.move_file(&a).unwrap();
        let dest_b = q.move_file(&b).unwrap();
        assert_eq!(dest_a, dir.path().join(QUARANTINE_DIR).join("a.blk"));
        assert!(!a.exists());
        assert_eq!(fs::read(dest_b).unwrap(), b"b");
    }

    #[test]
    fn collision_fails_loudly_and_keeps_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let failed = dir.path().join(QUARANTINE_DIR);
        fs::create_dir(&failed).unwrap();
        fs::write(failed.join("a.blk"), b"old").unwrap();
        let a = dir.path().join("a.blk");
        fs::write(&a, b"new").unwrap();

        let err = Quarantine::new().move_file(&a).unwrap_err();
        assert!(matches!(err, QuarantineError::Collision { .. }));
        assert_eq!(fs::read(&a).unwrap(), b"new");
        assert_eq!(fs::read(failed.join("a.blk")).unwrap(), b"old");
    }

    #[test]
    fn concurrent_moves_share_one_directory() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..8)
            .map(|i| {
                let p = dir.path().join(format!("f{i}.blk"));
                fs::write(&p, [i as u8]).unwrap();
                p
            })
            .collect();
        let q = Quarantine::new();
        std::thread::scope(|s| {
            for p in &paths {
                let q = &q;
                s.spawn(move || q.move_file(p).unwrap());
            }
        });
        assert_eq!(fs::read_dir(dir.path().join(QUARANTINE_DIR)).unwrap().count(), 8);
    }
}
