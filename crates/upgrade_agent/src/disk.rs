//! Filesystem usage probing for the disk-space check.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::Disks;

/// Capacity of the filesystem that holds some path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsUsage {
    pub mount_point: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Resolves the filesystem a path lives on.
pub trait DiskProbe: Send + Sync + 'static {
    fn usage(&self, path: &Path) -> io::Result<FsUsage>;
}

/// `DiskProbe` backed by the host's mount table.
#[derive(Clone, Copy, Debug, Default)]
pub struct SysinfoDisks;

impl DiskProbe for SysinfoDisks {
    fn usage(&self, path: &Path) -> io::Result<FsUsage> {
        // Unreadable or missing paths must surface as errors, not as `/`.
        let resolved = std::fs::canonicalize(path)?;
        let disks = Disks::new_with_refreshed_list();
        let mut best: Option<(usize, FsUsage)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if !resolved.starts_with(mount) {
                continue;
            }
            // Deepest mount point wins.
            let depth = mount.components().count();
            match &best {
                Some((best_depth, _)) if depth < *best_depth => {}
                _ => {
                    best = Some((
                        depth,
                        FsUsage {
                            mount_point: mount.to_path_buf(),
                            total_bytes: disk.total_space(),
                            available_bytes: disk.available_space(),
                        },
                    ))
                }
            }
        }
        best.map(|(_, usage)| usage).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no mounted filesystem contains {}", resolved.display()),
            )
        })
    }
}

/// Usage report for one requested directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub directory: PathBuf,
    pub mount_point: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub required_bytes: u64,
    pub sufficient: bool,
}

impl DiskUsage {
    /// Judge `usage` against a required free fraction of the filesystem.
    pub fn evaluate(directory: PathBuf, usage: FsUsage, free_ratio: f64) -> Self {
        let required_bytes = (usage.total_bytes as f64 * free_ratio).ceil() as u64;
        Self {
            directory,
            mount_point: usage.mount_point,
            total_bytes: usage.total_bytes,
            available_bytes: usage.available_bytes,
            required_bytes,
            sufficient: usage.available_bytes >= required_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_bytes_round_up() {
        let usage = FsUsage {
            mount_point: PathBuf::from("/"),
            total_bytes: 1001,
            available_bytes: 100,
        };
        let report = DiskUsage::evaluate(PathBuf::from("/data"), usage, 0.1);
        assert_eq!(report.required_bytes, 101);
        assert!(!report.sufficient);
    }

    #[test]
    fn zero_ratio_is_always_sufficient() {
        let usage = FsUsage {
            mount_point: PathBuf::from("/"),
            total_bytes: 1000,
            available_bytes: 0,
        };
        assert!(DiskUsage::evaluate(PathBuf::from("/data"), usage, 0.0).sufficient);
    }

    #[test]
    fn missing_path_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("does-not-exist");
        assert!(SysinfoDisks.usage(&missing).is_err());
    }
}
