//! Data-directory validation and the idempotent swap of old and new directories.
//!
//! Nothing in this module removes or renames a path unless every marker file
//! of its kind is present directly inside it. The swap is written so that it
//! can be re-run after a crash at any point and converge on the same layout.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AggregateError, ItemError};
use crate::faults::FaultInjector;
use crate::fs::DirOps;
use crate::upgrade_id::UpgradeId;

/// Suffix appended to a target path to form its archive directory.
pub const ARCHIVE_SUFFIX: &str = ".old";

/// Fires between archiving the source and moving the target into place.
pub const RENAME_AFTER_ARCHIVE: &str = "rename_directories.after_archive";

/// What a directory is expected to hold, and so which markers prove it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryKind {
    Data,
    Tablespace,
}

impl DirectoryKind {
    /// Files that must exist directly inside a genuine directory of this kind.
    pub fn markers(self) -> &'static [&'static str] {
        match self {
            Self::Data => &["postgresql.conf", "PG_VERSION"],
            Self::Tablespace => &["PG_VERSION"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Tablespace => "tablespace",
        }
    }
}

/// A pre-upgrade directory and the post-upgrade directory that replaces it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryPair {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Collect one error per missing marker under `path`.
pub fn verify_directory(fs: &dyn DirOps, path: &Path, kind: DirectoryKind) -> AggregateError {
    kind.markers()
        .iter()
        .filter(|marker| !fs.exists(&path.join(marker)))
        .map(|marker| ItemError::invalid(path, *marker))
        .collect()
}

pub fn verify_data_directory(fs: &dyn DirOps, path: &Path) -> AggregateError {
    verify_directory(fs, path, DirectoryKind::Data)
}

/// Validate every path that exists; absent paths are skipped.
pub fn verify_existing(fs: &dyn DirOps, paths: &[&Path], kind: DirectoryKind) -> AggregateError {
    let mut errs = AggregateError::new();
    for path in paths {
        if fs.exists(path) {
            errs.append(verify_directory(fs, path, kind));
        }
    }
    errs
}

/// `target` with [`ARCHIVE_SUFFIX`] appended to its final component.
pub fn archive_directory(target: &Path) -> PathBuf {
    // Going through components drops trailing separators.
    let mut raw: OsString = target.components().as_path().as_os_str().to_owned();
    raw.push(ARCHIVE_SUFFIX);
    PathBuf::from(raw)
}

/// True iff `source` is gone and `target` is present.
pub fn already_renamed(fs: &dyn DirOps, source: &Path, target: &Path) -> bool {
    !fs.exists(source) && fs.exists(target)
}

/// Deterministic sibling path for a directory belonging to upgrade `id`.
///
/// `/d/demoDataDir0` with prefix `demoDataDir` becomes `/d/demoDataDir.<id>.0`,
/// keeping segment numbering intact; any other basename gets `.<id>` appended.
pub fn temp_data_dir(data_dir: &Path, segment_prefix: &str, id: UpgradeId) -> PathBuf {
    let base = data_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = data_dir.parent().unwrap_or_else(|| Path::new(""));

    let name = match base.strip_prefix(segment_prefix) {
        Some(suffix) if !segment_prefix.is_empty() => format!("{segment_prefix}.{id}.{suffix}"),
        _ => format!("{base}.{id}"),
    };
    parent.join(name)
}

/// Swap `target` into `source`'s location, archiving `source` beside `target`.
///
/// Afterwards `source` holds what was `target`, and `archive_directory(target)`
/// holds what was `source`. Calling it again once that layout exists is a
/// no-op that returns success.
pub fn rename_directories(
    fs: &dyn DirOps,
    faults: &FaultInjector,
    source: &Path,
    target: &Path,
) -> Result<(), AggregateError> {
    verify_existing(fs, &[source, target], DirectoryKind::Data).into_result()?;

    let archive = archive_directory(target);
    if already_renamed(fs, target, &archive) {
        tracing::info!(
            source = %source.display(),
            target = %target.display(),
            archive = %archive.display(),
            "directories already renamed; skipping"
        );
        return Ok(());
    }

    // Never archive the source unless a genuine target is ready to replace it.
    verify_data_directory(fs, target).into_result()?;

    if fs.exists(source) {
        rename_data_directory(fs, source, &archive)?;
    } else {
        tracing::info!(
            source = %source.display(),
            archive = %archive.display(),
            "source already archived; skipping archive rename"
        );
    }

    if faults.fire(RENAME_AFTER_ARCHIVE) {
        return Err(ItemError::Injected {
            point: RENAME_AFTER_ARCHIVE.to_string(),
            path: target.to_path_buf(),
        }
        .into());
    }

    rename_data_directory(fs, target, source)
}

/// Re-validate `from` right before renaming it.
fn rename_data_directory(fs: &dyn DirOps, from: &Path, to: &Path) -> Result<(), AggregateError> {
    verify_data_directory(fs, from).into_result()?;
    tracing::info!(from = %from.display(), to = %to.display(), "renaming data directory");
    fs.rename(from, to)
        .map_err(|err| ItemError::io(format!("rename to {}", to.display()), from, err))?;
    Ok(())
}
