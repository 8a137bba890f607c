//! Local operations an agent performs on behalf of the hub.
//!
//! Every operation takes a batch of independent items, runs one task per
//! item and reports every failure. Nothing here stops at the first error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::bail;
use upgrade_core::datadir::{self, DirectoryKind, DirectoryPair};
use upgrade_core::fanout::{fan_out, fan_out_blocking, FanOut};
use upgrade_core::{AggregateError, DirOps, FaultInjector, ItemError};

use crate::disk::{DiskProbe, DiskUsage};
use crate::rsync::{RsyncOptions, RsyncPair, Syncer};

/// Fails one delete item before anything is removed.
pub const DELETE_ITEM: &str = "delete_directories.item";
/// Fails one copy item before rsync is launched.
pub const RSYNC_ITEM: &str = "rsync.item";

const PG_CONTROL: &str = "global/pg_control";
const PG_CONTROL_OLD: &str = "global/pg_control.old";

/// The agent's operation set, wired to its filesystem, disk probe and copier.
#[derive(Clone)]
pub struct AgentOps {
    fs: Arc<dyn DirOps>,
    disks: Arc<dyn DiskProbe>,
    syncer: Arc<dyn Syncer>,
    faults: FaultInjector,
}

impl AgentOps {
    pub fn new(
        fs: Arc<dyn DirOps>,
        disks: Arc<dyn DiskProbe>,
        syncer: Arc<dyn Syncer>,
        faults: FaultInjector,
    ) -> Self {
        Self {
            fs,
            disks,
            syncer,
            faults,
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Report usage of the filesystem under each directory. Read-only.
    ///
    /// A ratio outside `[0, 1]` rejects the whole request.
    pub async fn check_disk_space(
        &self,
        dirs: Vec<PathBuf>,
        free_ratio: f64,
    ) -> anyhow::Result<FanOut<DiskUsage>> {
        if !(0.0..=1.0).contains(&free_ratio) {
            bail!("free ratio {free_ratio} must be within [0, 1]");
        }
        let disks = self.disks.clone();
        let report = fan_out_blocking(dirs, move |dir: PathBuf| {
            let usage = disks
                .usage(&dir)
                .map_err(|err| ItemError::io("stat filesystem of", &dir, err))?;
            Ok(DiskUsage::evaluate(dir, usage, free_ratio))
        })
        .await;
        for usage in report.outputs.iter().filter(|u| !u.sufficient) {
            tracing::warn!(
                directory = %usage.directory.display(),
                mount_point = %usage.mount_point.display(),
                available = usage.available_bytes,
                required = usage.required_bytes,
                "insufficient disk space"
            );
        }
        Ok(report)
    }

    /// Remove each genuine directory of `kind`. Absent directories succeed.
    pub async fn delete_directories(&self, kind: DirectoryKind, dirs: Vec<PathBuf>) -> AggregateError {
        let fs = self.fs.clone();
        let faults = self.faults.clone();
        fan_out_blocking(dirs, move |dir: PathBuf| {
            delete_directory(&*fs, &faults, kind, &dir)
        })
        .await
        .errors
    }

    /// Swap each target into its source location, archiving the source.
    pub async fn rename_data_directories(&self, pairs: Vec<DirectoryPair>) -> AggregateError {
        let fs = self.fs.clone();
        let faults = self.faults.clone();
        fan_out_blocking(pairs, move |pair: DirectoryPair| {
            rename_pair(&*fs, &faults, &pair)
        })
        .await
        .errors
    }

    /// Put `global/pg_control` back from `global/pg_control.old` where it is missing.
    pub async fn restore_pg_control(&self, dirs: Vec<PathBuf>) -> AggregateError {
        let fs = self.fs.clone();
        fan_out_blocking(dirs, move |dir: PathBuf| restore_one_pg_control(&*fs, &dir))
            .await
            .errors
    }

    /// Copy every pair whose local source is a genuine directory of `kind`.
    pub async fn rsync_directories(
        &self,
        kind: DirectoryKind,
        pairs: Vec<RsyncPair>,
        opts: RsyncOptions,
    ) -> AggregateError {
        let opts = Arc::new(opts);
        fan_out(pairs, |pair: RsyncPair| {
            let fs = self.fs.clone();
            let syncer = self.syncer.clone();
            let faults = self.faults.clone();
            let opts = opts.clone();
            async move {
                datadir::verify_directory(&*fs, &pair.source, kind).into_result()?;
                if faults.fire(RSYNC_ITEM) {
                    return Err(ItemError::Injected {
                        point: RSYNC_ITEM.to_string(),
                        path: pair.source.clone(),
                    }
                    .into());
                }
                syncer.sync(&pair, &opts).await?;
                Ok::<(), AggregateError>(())
            }
        })
        .await
        .errors
    }
}

fn delete_directory(
    fs: &dyn DirOps,
    faults: &FaultInjector,
    kind: DirectoryKind,
    dir: &Path,
) -> Result<(), AggregateError> {
    if !fs.exists(dir) {
        tracing::info!(path = %dir.display(), "directory already absent; nothing to delete");
        return Ok(());
    }
    datadir::verify_directory(fs, dir, kind).into_result()?;
    if faults.fire(DELETE_ITEM) {
        return Err(ItemError::Injected {
            point: DELETE_ITEM.to_string(),
            path: dir.to_path_buf(),
        }
        .into());
    }
    tracing::info!(path = %dir.display(), kind = kind.as_str(), "deleting directory");
    fs.remove_dir_all(dir)
        .map_err(|err| ItemError::io("remove", dir, err))?;
    Ok(())
}

fn rename_pair(
    fs: &dyn DirOps,
    faults: &FaultInjector,
    pair: &DirectoryPair,
) -> Result<(), AggregateError> {
    // A side that was never created (for example a mirror) has no target
    // and no archive; there is nothing to swap.
    if !fs.exists(&pair.target) && !fs.exists(&datadir::archive_directory(&pair.target)) {
        datadir::verify_existing(fs, &[&pair.source], DirectoryKind::Data).into_result()?;
        tracing::info!(
            source = %pair.source.display(),
            target = %pair.target.display(),
            "target absent; skipping rename"
        );
        return Ok(());
    }
    datadir::rename_directories(fs, faults, &pair.source, &pair.target)
}

fn restore_one_pg_control(fs: &dyn DirOps, dir: &Path) -> Result<(), AggregateError> {
    let control = dir.join(PG_CONTROL);
    if fs.exists(&control) {
        return Ok(());
    }
    let old = dir.join(PG_CONTROL_OLD);
    if !fs.exists(&old) {
        return Err(ItemError::io(
            "restore pg_control from",
            &old,
            std::io::Error::from(std::io::ErrorKind::NotFound),
        )
        .into());
    }
    if let Err(err) = fs.hard_link(&old, &control) {
        tracing::warn!(
            path = %control.display(),
            error = %err,
            "hard link failed; copying pg_control instead"
        );
        fs.copy_file(&old, &control)
            .map_err(|err| ItemError::io(format!("copy to {}", control.display()), &old, err))?;
    }
    tracing::info!(path = %control.display(), "restored pg_control");
    Ok(())
}
