//! Step/substep progress record and the tracker that drives its transitions.
//!
//! The record is the single source of truth for resumption: every transition
//! is written through a [`StepStore`] before it is announced to observers,
//! and a transition that fails to persist leaves the in-memory record
//! untouched.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::status::{StatusEvent, StatusSender};

/// Top-level phase of the upgrade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Initialize,
    Execute,
    Finalize,
    Revert,
}

impl Step {
    pub const ALL: [Step; 4] = [Step::Initialize, Step::Execute, Step::Finalize, Step::Revert];

    /// Substeps run by this step, in order.
    pub fn substeps(self) -> &'static [Substep] {
        match self {
            Self::Initialize => &[
                Substep::SavingSourceClusterConfig,
                Substep::StartAgents,
                Substep::CheckDiskSpace,
                Substep::GenerateTargetConfig,
            ],
            Self::Execute => &[Substep::CopyCoordinator, Substep::CopyTablespaces],
            Self::Finalize => &[Substep::SwapDataDirectories, Substep::StopAgents],
            Self::Revert => &[
                Substep::DeleteTargetDataDirectories,
                Substep::DeleteTablespaces,
                Substep::RestorePgControl,
                Substep::StopAgents,
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Execute => "execute",
            Self::Finalize => "finalize",
            Self::Revert => "revert",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer-grained unit of progress inside a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Substep {
    SavingSourceClusterConfig,
    StartAgents,
    CheckDiskSpace,
    GenerateTargetConfig,
    CopyCoordinator,
    CopyTablespaces,
    SwapDataDirectories,
    StopAgents,
    DeleteTargetDataDirectories,
    DeleteTablespaces,
    RestorePgControl,
}

impl Substep {
    /// Operator-facing label.
    pub fn description(self) -> &'static str {
        match self {
            Self::SavingSourceClusterConfig => "Saving source cluster configuration",
            Self::StartAgents => "Connecting to upgrade agents",
            Self::CheckDiskSpace => "Checking disk space",
            Self::GenerateTargetConfig => "Generating target cluster configuration",
            Self::CopyCoordinator => "Copying coordinator data directory to segment hosts",
            Self::CopyTablespaces => "Copying tablespace directories",
            Self::SwapDataDirectories => "Swapping data directories",
            Self::StopAgents => "Stopping upgrade agents",
            Self::DeleteTargetDataDirectories => "Deleting target cluster data directories",
            Self::DeleteTablespaces => "Deleting target tablespace directories",
            Self::RestorePgControl => "Restoring source pg_control files",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SavingSourceClusterConfig => "saving_source_cluster_config",
            Self::StartAgents => "start_agents",
            Self::CheckDiskSpace => "check_disk_space",
            Self::GenerateTargetConfig => "generate_target_config",
            Self::CopyCoordinator => "copy_coordinator",
            Self::CopyTablespaces => "copy_tablespaces",
            Self::SwapDataDirectories => "swap_data_directories",
            Self::StopAgents => "stop_agents",
            Self::DeleteTargetDataDirectories => "delete_target_data_directories",
            Self::DeleteTablespaces => "delete_tablespaces",
            Self::RestorePgControl => "restore_pg_control",
        }
    }
}

impl std::fmt::Display for Substep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one substep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Unknown,
    Pending,
    Running,
    Complete,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether moving from `self` to `next` keeps the record monotonic.
    ///
    /// Re-asserting the current status is allowed so that a redelivered
    /// transition is harmless.
    pub fn can_transition_to(self, next: Status) -> bool {
        if self == next {
            return true;
        }
        match self {
            Self::Unknown => true,
            Self::Pending => matches!(next, Self::Running | Self::Complete | Self::Failed),
            Self::Running => next.is_terminal(),
            Self::Complete | Self::Failed => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// Persisted state of one substep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstepRecord {
    pub status: Status,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub updated_unix_ms: u64,
}

/// Persisted state of one step.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub substeps: BTreeMap<Substep, SubstepRecord>,
}

/// Every step of one upgrade attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(default)]
    pub steps: BTreeMap<Step, StepRecord>,
}

impl StatusRecord {
    pub fn status(&self, step: Step, substep: Substep) -> Status {
        self.steps
            .get(&step)
            .and_then(|record| record.substeps.get(&substep))
            .map(|record| record.status)
            .unwrap_or_default()
    }

    /// Whether every substep of `step` has completed.
    pub fn step_complete(&self, step: Step) -> bool {
        step.substeps()
            .iter()
            .all(|substep| self.status(step, *substep) == Status::Complete)
    }
}

/// Durable home of the [`StatusRecord`]. Writes must be all-or-nothing.
pub trait StepStore: Send + Sync + 'static {
    /// Load the record, or an empty one if nothing was stored yet.
    fn load(&self) -> anyhow::Result<StatusRecord>;

    fn store(&self, record: &StatusRecord) -> anyhow::Result<()>;
}

const STATUS_ENVELOPE_VERSION: u32 = 1;

/// On-disk wrapper that lets a torn or hand-edited record be detected.
#[derive(Serialize, Deserialize)]
struct StatusEnvelope {
    version: u32,
    checksum_crc32: u32,
    payload: StatusRecord,
}

fn payload_checksum(record: &StatusRecord) -> anyhow::Result<u32> {
    let payload = serde_json::to_vec(record).context("serialize status payload")?;
    Ok(crc32fast::hash(&payload))
}

/// JSON file store written via temp file, fsync, and rename.
#[derive(Clone, Debug)]
pub struct FileStepStore {
    path: PathBuf,
}

impl FileStepStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StepStore for FileStepStore {
    fn load(&self) -> anyhow::Result<StatusRecord> {
        if !self.path.exists() {
            return Ok(StatusRecord::default());
        }
        let bytes = fs::read(&self.path)
            .with_context(|| format!("read status record: {}", self.path.display()))?;
        let envelope: StatusEnvelope = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse status record: {}", self.path.display()))?;
        if envelope.version != STATUS_ENVELOPE_VERSION {
            anyhow::bail!(
                "unsupported status record version {} at {}",
                envelope.version,
                self.path.display()
            );
        }
        let actual = payload_checksum(&envelope.payload)?;
        if actual != envelope.checksum_crc32 {
            anyhow::bail!(
                "status record checksum mismatch at {} (expected={}, actual={})",
                self.path.display(),
                envelope.checksum_crc32,
                actual
            );
        }
        Ok(envelope.payload)
    }

    fn store(&self, record: &StatusRecord) -> anyhow::Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("invalid status path: {}", self.path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create status dir: {}", parent.display()))?;

        let envelope = StatusEnvelope {
            version: STATUS_ENVELOPE_VERSION,
            checksum_crc32: payload_checksum(record)?,
            payload: record.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope).context("serialize status record")?;
        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("create status temp: {}", tmp_path.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("write status temp: {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync status temp: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "replace status record {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }
}

/// Owner of the status record for one coordinator process.
///
/// All mutation goes through here: each transition is validated, persisted,
/// and only then pushed to the observer.
pub struct StepTracker {
    store: Arc<dyn StepStore>,
    record: StatusRecord,
    events: Option<StatusSender>,
    observer_gone: AtomicBool,
}

impl StepTracker {
    pub fn open(store: Arc<dyn StepStore>, events: Option<StatusSender>) -> anyhow::Result<Self> {
        let record = store.load()?;
        Ok(Self {
            store,
            record,
            events,
            observer_gone: AtomicBool::new(false),
        })
    }

    pub fn record(&self) -> &StatusRecord {
        &self.record
    }

    pub fn status(&self, step: Step, substep: Substep) -> Status {
        self.record.status(step, substep)
    }

    /// Start a new execution of `step`.
    ///
    /// Substeps left `failed` or `running` by an earlier execution go back to
    /// `pending` so they run again; `complete` substeps are kept and will be
    /// skipped.
    pub fn begin(&mut self, step: Step) -> anyhow::Result<()> {
        let mut next = self.record.clone();
        let entry = next.steps.entry(step).or_default();
        entry.attempts += 1;
        for substep in step.substeps() {
            let sub = entry.substeps.entry(*substep).or_default();
            if sub.status != Status::Complete {
                sub.status = Status::Pending;
                sub.updated_unix_ms = unix_time_ms();
            }
        }
        self.store.store(&next)?;
        self.record = next;
        tracing::info!(
            step = %step,
            attempt = self.record.steps[&step].attempts,
            "step started"
        );
        Ok(())
    }

    /// Move `substep` to `status`, persisting before announcing.
    pub fn transition(
        &mut self,
        step: Step,
        substep: Substep,
        status: Status,
        error: Option<String>,
    ) -> anyhow::Result<()> {
        let current = self.status(step, substep);
        anyhow::ensure!(
            current.can_transition_to(status),
            "illegal status transition for {step}/{substep}: {} -> {}",
            current.as_str(),
            status.as_str()
        );

        if current != status {
            let mut next = self.record.clone();
            let sub = next
                .steps
                .entry(step)
                .or_default()
                .substeps
                .entry(substep)
                .or_default();
            sub.status = status;
            sub.error = error;
            sub.updated_unix_ms = unix_time_ms();
            self.store.store(&next)?;
            self.record = next;
        }

        self.announce(step, substep, status);
        Ok(())
    }

    /// Push an event to the observer without touching the record.
    ///
    /// A departed observer does not stop the workflow.
    pub fn announce(&self, step: Step, substep: Substep, status: Status) {
        let Some(events) = &self.events else {
            return;
        };
        let event = StatusEvent {
            step,
            substep,
            status,
        };
        if events.send(event).is_err() && !self.observer_gone.swap(true, Ordering::Relaxed) {
            tracing::debug!(
                step = %step,
                substep = %substep,
                status = status.as_str(),
                "status observer closed; further events are dropped"
            );
        }
    }

    /// Whether an observer is still receiving events.
    pub fn has_observer(&self) -> bool {
        self.events.is_some() && !self.observer_gone.load(Ordering::Relaxed)
    }
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
