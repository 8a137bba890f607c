//! Launching `rsync` for cross-host directory copies.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use upgrade_core::ItemError;

/// One local directory to mirror onto a (possibly remote) destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RsyncPair {
    pub source: PathBuf,
    /// Empty means the destination is on this host.
    pub dest_host: String,
    pub destination: PathBuf,
}

impl RsyncPair {
    /// Destination in rsync's `host:path` notation.
    pub fn destination_spec(&self) -> String {
        if self.dest_host.is_empty() {
            self.destination.display().to_string()
        } else {
            format!("{}:{}", self.dest_host, self.destination.display())
        }
    }
}

/// Flags and excludes applied to every pair of one request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RsyncOptions {
    pub options: Vec<String>,
    pub excludes: Vec<String>,
}

/// Copies one pair. Implementations must be safe to re-run on a partial copy.
#[async_trait]
pub trait Syncer: Send + Sync + 'static {
    async fn sync(&self, pair: &RsyncPair, opts: &RsyncOptions) -> Result<(), ItemError>;
}

/// `Syncer` that shells out to an rsync binary.
#[derive(Clone, Debug)]
pub struct RsyncCommand {
    bin: PathBuf,
}

impl RsyncCommand {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn bin(&self) -> &Path {
        &self.bin
    }

    /// Argument vector for one pair. The source gets a trailing slash so its
    /// contents, not the directory itself, land in the destination.
    pub fn args(pair: &RsyncPair, opts: &RsyncOptions) -> Vec<String> {
        let mut args = opts.options.clone();
        args.extend(opts.excludes.iter().map(|e| format!("--exclude={e}")));
        let source = pair.source.display().to_string();
        args.push(format!("{}/", source.trim_end_matches('/')));
        args.push(pair.destination_spec());
        args
    }
}

#[async_trait]
impl Syncer for RsyncCommand {
    async fn sync(&self, pair: &RsyncPair, opts: &RsyncOptions) -> Result<(), ItemError> {
        let args = Self::args(pair, opts);
        tracing::info!(
            source = %pair.source.display(),
            destination = %pair.destination_spec(),
            args = ?args,
            "starting rsync"
        );
        let output = tokio::process::Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| ItemError::io("spawn rsync for", &pair.source, err))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ItemError::Rsync {
                from: pair.source.display().to_string(),
                to: pair.destination_spec(),
                detail: format!("{}: {}", output.status, stderr.trim()),
            });
        }
        tracing::info!(
            source = %pair.source.display(),
            destination = %pair.destination_spec(),
            "rsync finished"
        );
        Ok(())
    }
}
