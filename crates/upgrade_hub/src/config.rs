//! Hub configuration, cluster layout snapshots and the state directory.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use upgrade_core::datadir::temp_data_dir;
use upgrade_core::step::FileStepStore;
use upgrade_core::UpgradeId;

/// Content id carried by the coordinator instance.
pub const COORDINATOR_CONTENT_ID: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentRole {
    Primary,
    Mirror,
}

/// One database instance of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub content_id: i32,
    pub dbid: i32,
    pub role: SegmentRole,
    pub hostname: String,
    pub port: u16,
    pub data_dir: PathBuf,
}

impl SegmentConfig {
    pub fn is_coordinator(&self) -> bool {
        self.content_id == COORDINATOR_CONTENT_ID && self.role == SegmentRole::Primary
    }

    pub fn is_primary(&self) -> bool {
        self.role == SegmentRole::Primary
    }
}

/// A user tablespace directory belonging to one instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablespaceConfig {
    pub dbid: i32,
    pub oid: u32,
    pub location: PathBuf,
}

/// Layout of one cluster: every instance and its tablespaces.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub segments: Vec<SegmentConfig>,
    #[serde(default)]
    pub tablespaces: Vec<TablespaceConfig>,
}

impl ClusterConfig {
    /// Reject layouts the workflow cannot act on safely.
    pub fn validate(&self) -> anyhow::Result<()> {
        let coordinators = self.segments.iter().filter(|s| s.is_coordinator()).count();
        anyhow::ensure!(
            coordinators == 1,
            "cluster must have exactly one coordinator, found {coordinators}"
        );
        let mut dbids = BTreeSet::new();
        let mut dirs = BTreeSet::new();
        for seg in &self.segments {
            anyhow::ensure!(dbids.insert(seg.dbid), "duplicate dbid {}", seg.dbid);
            anyhow::ensure!(!seg.hostname.is_empty(), "dbid {} has no hostname", seg.dbid);
            anyhow::ensure!(
                seg.data_dir.is_absolute(),
                "dbid {} data directory {} is not absolute",
                seg.dbid,
                seg.data_dir.display()
            );
            anyhow::ensure!(
                dirs.insert((seg.hostname.as_str(), seg.data_dir.as_path())),
                "data directory {} on {} is used twice",
                seg.data_dir.display(),
                seg.hostname
            );
        }
        for ts in &self.tablespaces {
            anyhow::ensure!(
                dbids.contains(&ts.dbid),
                "tablespace {} refers to unknown dbid {}",
                ts.oid,
                ts.dbid
            );
        }
        Ok(())
    }

    pub fn coordinator(&self) -> Option<&SegmentConfig> {
        self.segments.iter().find(|s| s.is_coordinator())
    }

    pub fn segment(&self, dbid: i32) -> Option<&SegmentConfig> {
        self.segments.iter().find(|s| s.dbid == dbid)
    }

    /// Primaries that hold user data, i.e. every primary but the coordinator.
    pub fn data_primaries(&self) -> impl Iterator<Item = &SegmentConfig> {
        self.segments
            .iter()
            .filter(|s| s.is_primary() && !s.is_coordinator())
    }

    pub fn hosts(&self) -> BTreeSet<String> {
        self.segments.iter().map(|s| s.hostname.clone()).collect()
    }

    /// Segments grouped by host, hosts in sorted order.
    pub fn by_host(&self) -> BTreeMap<String, Vec<&SegmentConfig>> {
        let mut out: BTreeMap<String, Vec<&SegmentConfig>> = BTreeMap::new();
        for seg in &self.segments {
            out.entry(seg.hostname.clone()).or_default().push(seg);
        }
        out
    }

    /// Tablespaces grouped by the host of the instance that owns them.
    pub fn tablespaces_by_host(&self) -> BTreeMap<String, Vec<&TablespaceConfig>> {
        let mut out: BTreeMap<String, Vec<&TablespaceConfig>> = BTreeMap::new();
        for ts in &self.tablespaces {
            if let Some(seg) = self.segment(ts.dbid) {
                out.entry(seg.hostname.clone()).or_default().push(ts);
            }
        }
        out
    }

    /// Target layout for upgrade `id`: same topology, every directory moved
    /// to its deterministic temporary sibling.
    pub fn target_for(&self, segment_prefix: &str, id: UpgradeId) -> ClusterConfig {
        ClusterConfig {
            segments: self
                .segments
                .iter()
                .map(|seg| SegmentConfig {
                    data_dir: temp_data_dir(&seg.data_dir, segment_prefix, id),
                    ..seg.clone()
                })
                .collect(),
            tablespaces: self
                .tablespaces
                .iter()
                .map(|ts| TablespaceConfig {
                    location: temp_data_dir(&ts.location, "", id),
                    ..ts.clone()
                })
                .collect(),
        }
    }
}

fn default_rsync_options() -> Vec<String> {
    vec![
        "--archive".into(),
        "--compress".into(),
        "--delete".into(),
        "--stats".into(),
    ]
}

fn default_rsync_excludes() -> Vec<String> {
    vec![
        "pg_log".into(),
        "postmaster.pid".into(),
        "postmaster.opts".into(),
        "internal.auto.conf".into(),
    ]
}

/// Settings fixed when the upgrade is initialized and reused by every later step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    pub upgrade_id: UpgradeId,
    pub agent_port: u16,
    /// Per-call agent timeout; zero waits indefinitely.
    #[serde(default)]
    pub rpc_timeout_ms: u64,
    pub disk_free_ratio: f64,
    pub segment_prefix: String,
    #[serde(default = "default_rsync_options")]
    pub rsync_options: Vec<String>,
    #[serde(default = "default_rsync_excludes")]
    pub rsync_excludes: Vec<String>,
}

impl HubConfig {
    pub fn new(
        upgrade_id: UpgradeId,
        agent_port: u16,
        rpc_timeout_ms: u64,
        disk_free_ratio: f64,
        segment_prefix: impl Into<String>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&disk_free_ratio),
            "disk free ratio {disk_free_ratio} must be within [0, 1]"
        );
        Ok(Self {
            upgrade_id,
            agent_port,
            rpc_timeout_ms,
            disk_free_ratio,
            segment_prefix: segment_prefix.into(),
            rsync_options: default_rsync_options(),
            rsync_excludes: default_rsync_excludes(),
        })
    }
}

/// Files the hub keeps under its state directory.
#[derive(Clone, Debug)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$UPGRADE_STATE_DIR`, else `~/.upgrade`.
    pub fn default_root() -> PathBuf {
        if let Some(dir) = std::env::var_os("UPGRADE_STATE_DIR") {
            return PathBuf::from(dir);
        }
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".upgrade")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn source_cluster_path(&self) -> PathBuf {
        self.root.join("source_cluster.json")
    }

    pub fn target_cluster_path(&self) -> PathBuf {
        self.root.join("target_cluster.json")
    }

    pub fn status_path(&self) -> PathBuf {
        self.root.join("status.json")
    }

    pub fn step_store(&self) -> FileStepStore {
        FileStepStore::new(self.status_path())
    }

    pub fn load_config(&self) -> anyhow::Result<HubConfig> {
        read_json(&self.config_path())
            .context("load hub config; has the upgrade been initialized?")
    }

    pub fn save_config(&self, config: &HubConfig) -> anyhow::Result<()> {
        write_json_atomic(&self.config_path(), config)
    }

    pub fn load_source(&self) -> anyhow::Result<ClusterConfig> {
        read_json(&self.source_cluster_path())
    }

    pub fn save_source(&self, cluster: &ClusterConfig) -> anyhow::Result<()> {
        write_json_atomic(&self.source_cluster_path(), cluster)
    }

    pub fn load_target(&self) -> anyhow::Result<ClusterConfig> {
        read_json(&self.target_cluster_path())
    }

    pub fn save_target(&self, cluster: &ClusterConfig) -> anyhow::Result<()> {
        write_json_atomic(&self.target_cluster_path(), cluster)
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

/// Write `value` as JSON through a synced temp file and a rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid state path: {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("create temp file {}", tmp_path.display()))?;
    file.write_all(&bytes)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace {} -> {}", tmp_path.display(), path.display()))?;
    Ok(())
}
