//! Filesystem seam used by every destructive operation.
//!
//! Callers receive a `DirOps` at construction time so tests can observe or
//! fail individual calls without touching process-wide state.

use std::io;
use std::path::Path;

/// The filesystem calls the swap, delete, and restore operations rely on.
pub trait DirOps: Send + Sync + 'static {
    /// Whether anything exists at `path` (file, directory, or symlink target).
    fn exists(&self, path: &Path) -> bool;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()>;

    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64>;
}

/// `DirOps` backed by `std::fs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFs;

impl DirOps for LocalFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()> {
        std::fs::hard_link(original, link)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
        std::fs::copy(from, to)
    }
}
