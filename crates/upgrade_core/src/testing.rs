//! Test doubles shared by the workspace's test suites.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::datadir::DirectoryKind;
use crate::fs::{DirOps, LocalFs};
use crate::step::{StatusRecord, StepStore};

/// Create `path` as a genuine data directory holding a `tag` file.
pub fn make_data_dir(path: &Path, tag: &str) {
    make_dir_of_kind(path, DirectoryKind::Data, tag);
}

pub fn make_dir_of_kind(path: &Path, kind: DirectoryKind, tag: &str) {
    std::fs::create_dir_all(path).expect("create test directory");
    for marker in kind.markers() {
        std::fs::write(path.join(marker), "").expect("write marker");
    }
    std::fs::write(path.join("tag"), tag).expect("write tag");
}

/// `LocalFs` that records destructive calls and can be told to fail some paths.
#[derive(Default)]
pub struct RecordingFs {
    renames: Mutex<Vec<(PathBuf, PathBuf)>>,
    removals: Mutex<Vec<PathBuf>>,
    failing: Mutex<HashSet<PathBuf>>,
}

impl RecordingFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every destructive call on `path` fail with `PermissionDenied`.
    pub fn fail_on(&self, path: impl Into<PathBuf>) {
        lock(&self.failing).insert(path.into());
    }

    pub fn renames(&self) -> Vec<(PathBuf, PathBuf)> {
        lock(&self.renames).clone()
    }

    pub fn removals(&self) -> Vec<PathBuf> {
        lock(&self.removals).clone()
    }

    fn check(&self, path: &Path) -> io::Result<()> {
        if lock(&self.failing).contains(path) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        Ok(())
    }
}

impl DirOps for RecordingFs {
    fn exists(&self, path: &Path) -> bool {
        LocalFs.exists(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.check(from)?;
        lock(&self.renames).push((from.to_path_buf(), to.to_path_buf()));
        LocalFs.rename(from, to)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        self.check(path)?;
        lock(&self.removals).push(path.to_path_buf());
        LocalFs.remove_dir_all(path)
    }

    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()> {
        self.check(link)?;
        LocalFs.hard_link(original, link)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
        self.check(to)?;
        LocalFs.copy_file(from, to)
    }
}

/// In-memory `StepStore` whose writes can be made to fail.
#[derive(Default)]
pub struct MemoryStepStore {
    record: Mutex<StatusRecord>,
    fail_writes: AtomicBool,
}

impl MemoryStepStore {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl StepStore for MemoryStepStore {
    fn load(&self) -> anyhow::Result<StatusRecord> {
        Ok(lock(&self.record).clone())
    }

    fn store(&self, record: &StatusRecord) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("status store unavailable");
        }
        *lock(&self.record) = record.clone();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
