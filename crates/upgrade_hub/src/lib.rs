//! Coordinator for in-place cluster upgrades.
//!
//! The hub owns the upgrade's durable state (configuration, cluster layouts
//! and the step/substep record) and walks each step by fanning RPCs out to
//! the agents. Every step can be re-run after a failure or a crash; completed
//! substeps are skipped and the rest repeat idempotently.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use upgrade_core::status::StatusSender;
use upgrade_core::step::{Step, StepTracker};
use upgrade_core::FaultInjector;

pub mod agents;
pub mod config;
pub mod steps;
pub mod workflow;

use agents::{AgentConnector, GrpcConnector};
use config::{HubConfig, StateDir};
use steps::HubSteps;

/// A coordinator bound to one state directory.
pub struct Hub {
    state: StateDir,
    config: HubConfig,
    connector: Arc<dyn AgentConnector>,
    faults: FaultInjector,
}

impl Hub {
    /// Create the state directory and persist `config`, or reuse the
    /// configuration already there so the upgrade id stays fixed.
    pub fn initialize_state(state: StateDir, config: HubConfig) -> anyhow::Result<HubConfig> {
        if state.config_path().exists() {
            let existing = state.load_config()?;
            tracing::info!(
                upgrade_id = %existing.upgrade_id,
                "reusing existing upgrade configuration"
            );
            return Ok(existing);
        }
        std::fs::create_dir_all(state.root())
            .with_context(|| format!("create state dir {}", state.root().display()))?;
        state.save_config(&config)?;
        tracing::info!(upgrade_id = %config.upgrade_id, state_dir = %state.root().display(), "created upgrade configuration");
        Ok(config)
    }

    /// Open an initialized state directory and talk to agents over gRPC.
    pub fn open(state: StateDir, faults: FaultInjector) -> anyhow::Result<Self> {
        let config = state.load_config()?;
        let timeout = (config.rpc_timeout_ms > 0).then(|| Duration::from_millis(config.rpc_timeout_ms));
        let connector = Arc::new(GrpcConnector::new(config.agent_port, timeout));
        Ok(Self::with_connector(state, config, connector, faults))
    }

    pub fn with_connector(
        state: StateDir,
        config: HubConfig,
        connector: Arc<dyn AgentConnector>,
        faults: FaultInjector,
    ) -> Self {
        Self {
            state,
            config,
            connector,
            faults,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn state(&self) -> &StateDir {
        &self.state
    }

    /// Run `step`, announcing every substep transition on `events`.
    ///
    /// `source_input` is the cluster layout file; only `initialize` reads it.
    pub async fn run(
        &self,
        step: Step,
        source_input: Option<PathBuf>,
        events: Option<StatusSender>,
    ) -> anyhow::Result<()> {
        let store = Arc::new(self.state.step_store());
        let mut tracker = StepTracker::open(store, events)?;
        check_order(&tracker, step)?;

        let runner = HubSteps::new(
            self.state.clone(),
            self.config.clone(),
            self.connector.clone(),
            source_input,
        );
        workflow::run_step(&mut tracker, &self.faults, step, &runner).await?;
        Ok(())
    }
}

/// Refuse to run a step whose prerequisites are not complete.
fn check_order(tracker: &StepTracker, step: Step) -> anyhow::Result<()> {
    let record = tracker.record();
    match step {
        Step::Initialize => {}
        Step::Execute => anyhow::ensure!(
            record.step_complete(Step::Initialize),
            "execute requires a completed initialize"
        ),
        Step::Finalize => anyhow::ensure!(
            record.step_complete(Step::Execute),
            "finalize requires a completed execute"
        ),
        // Once any swap may have happened the source directories are gone.
        Step::Revert => anyhow::ensure!(
            !record.steps.contains_key(&Step::Finalize),
            "finalize has started; revert is no longer possible"
        ),
    }
    if step != Step::Revert {
        anyhow::ensure!(
            !record.steps.contains_key(&Step::Revert),
            "the upgrade was reverted; initialize a new upgrade with a fresh state directory"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use upgrade_agent::client::TransportError;
    use upgrade_agent::disk::{DiskProbe, DiskUsage, FsUsage};
    use upgrade_agent::ops::AgentOps;
    use upgrade_agent::rsync::{RsyncOptions, RsyncPair, Syncer};
    use upgrade_core::datadir::{archive_directory, DirectoryKind, DirectoryPair};
    use upgrade_core::fanout::FanOut;
    use upgrade_core::status::status_channel;
    use upgrade_core::step::{Status, Substep};
    use upgrade_core::testing::{make_data_dir, make_dir_of_kind};
    use upgrade_core::{AggregateError, ItemError, LocalFs, UpgradeId};

    use crate::agents::{AgentApi, HostFailure, StepError};
    use crate::config::{ClusterConfig, SegmentConfig, SegmentRole, TablespaceConfig};

    struct FixedDisk {
        available: u64,
        unreadable: Vec<PathBuf>,
    }

    impl DiskProbe for FixedDisk {
        fn usage(&self, path: &Path) -> std::io::Result<FsUsage> {
            if self.unreadable.iter().any(|p| p == path) {
                return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
            }
            Ok(FsUsage {
                mount_point: PathBuf::from("/"),
                total_bytes: 1000,
                available_bytes: self.available,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSyncer {
        pairs: Mutex<Vec<RsyncPair>>,
    }

    #[async_trait]
    impl Syncer for RecordingSyncer {
        async fn sync(&self, pair: &RsyncPair, _opts: &RsyncOptions) -> Result<(), ItemError> {
            self.pairs.lock().unwrap().push(pair.clone());
            Ok(())
        }
    }

    /// Agent running in the test process against the local filesystem.
    struct InProcessAgent {
        ops: AgentOps,
        syncer: Arc<RecordingSyncer>,
        stops: AtomicUsize,
    }

    impl InProcessAgent {
        fn new(available: u64) -> Arc<Self> {
            Self::with_disk(FixedDisk {
                available,
                unreadable: Vec::new(),
            })
        }

        fn with_disk(disk: FixedDisk) -> Arc<Self> {
            let syncer = Arc::new(RecordingSyncer::default());
            Arc::new(Self {
                ops: AgentOps::new(
                    Arc::new(LocalFs),
                    Arc::new(disk),
                    syncer.clone(),
                    FaultInjector::disabled(),
                ),
                syncer,
                stops: AtomicUsize::new(0),
            })
        }

        fn synced(&self) -> Vec<RsyncPair> {
            self.syncer.pairs.lock().unwrap().clone()
        }
    }

    fn rejected(method: &'static str, err: anyhow::Error) -> TransportError {
        TransportError::Status {
            target: SocketAddr::from(([127, 0, 0, 1], 0)),
            method,
            status: err.to_string(),
        }
    }

    #[async_trait]
    impl AgentApi for InProcessAgent {
        async fn check_disk_space(
            &self,
            dirs: &[PathBuf],
            free_ratio: f64,
        ) -> Result<FanOut<DiskUsage>, TransportError> {
            self.ops
                .check_disk_space(dirs.to_vec(), free_ratio)
                .await
                .map_err(|err| rejected("check_disk_space", err))
        }

        async fn delete_directories(&self, dirs: &[PathBuf]) -> Result<AggregateError, TransportError> {
            Ok(self.ops.delete_directories(DirectoryKind::Data, dirs.to_vec()).await)
        }

        async fn delete_tablespace_directories(
            &self,
            dirs: &[PathBuf],
        ) -> Result<AggregateError, TransportError> {
            Ok(self
                .ops
                .delete_directories(DirectoryKind::Tablespace, dirs.to_vec())
                .await)
        }

        async fn rename_data_directories(
            &self,
            pairs: &[DirectoryPair],
            _upgrade_id: UpgradeId,
        ) -> Result<AggregateError, TransportError> {
            Ok(self.ops.rename_data_directories(pairs.to_vec()).await)
        }

        async fn rsync_data_directories(
            &self,
            pairs: &[RsyncPair],
            opts: &RsyncOptions,
        ) -> Result<AggregateError, TransportError> {
            Ok(self
                .ops
                .rsync_directories(DirectoryKind::Data, pairs.to_vec(), opts.clone())
                .await)
        }

        async fn rsync_tablespace_directories(
            &self,
            pairs: &[RsyncPair],
            opts: &RsyncOptions,
        ) -> Result<AggregateError, TransportError> {
            Ok(self
                .ops
                .rsync_directories(DirectoryKind::Tablespace, pairs.to_vec(), opts.clone())
                .await)
        }

        async fn restore_primaries_pg_control(
            &self,
            dirs: &[PathBuf],
        ) -> Result<AggregateError, TransportError> {
            Ok(self.ops.restore_pg_control(dirs.to_vec()).await)
        }

        async fn stop(&self) -> Result<(), TransportError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Resolves host names to in-process agents; unknown hosts are unreachable.
    struct FakeConnector {
        agents: HashMap<String, Arc<InProcessAgent>>,
    }

    #[async_trait]
    impl AgentConnector for FakeConnector {
        async fn connect(&self, host: &str) -> Result<Arc<dyn AgentApi>, String> {
            self.agents
                .get(host)
                .map(|agent| agent.clone() as Arc<dyn AgentApi>)
                .ok_or_else(|| format!("connect {host}: connection refused"))
        }
    }

    const PREFIX: &str = "demoDataDir";

    fn id() -> UpgradeId {
        UpgradeId::from_raw(0xabc)
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        cluster_file: PathBuf,
        source: ClusterConfig,
        target: ClusterConfig,
        mdw: Arc<InProcessAgent>,
        sdw1: Arc<InProcessAgent>,
    }

    impl Fixture {
        /// Coordinator on `mdw`; a primary, its mirror and one tablespace on `sdw1`.
        fn new(sdw1_host: &str) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().to_path_buf();
            let seg = |content_id, dbid, role, host: &str, dir: PathBuf| SegmentConfig {
                content_id,
                dbid,
                role,
                hostname: host.to_string(),
                port: 7000 + dbid as u16,
                data_dir: dir,
            };
            let source = ClusterConfig {
                segments: vec![
                    seg(-1, 1, SegmentRole::Primary, "mdw", root.join("qddir/demoDataDir-1")),
                    seg(0, 2, SegmentRole::Primary, sdw1_host, root.join("primary/demoDataDir0")),
                    seg(0, 3, SegmentRole::Mirror, sdw1_host, root.join("mirror/demoDataDir0")),
                ],
                tablespaces: vec![TablespaceConfig {
                    dbid: 2,
                    oid: 16385,
                    location: root.join("ts/16385/2"),
                }],
            };
            for seg in &source.segments {
                make_data_dir(&seg.data_dir, "old");
                std::fs::create_dir_all(seg.data_dir.join("global")).unwrap();
                std::fs::write(seg.data_dir.join("global/pg_control"), "control").unwrap();
            }
            make_dir_of_kind(&source.tablespaces[0].location, DirectoryKind::Tablespace, "old");

            let cluster_file = root.join("cluster.json");
            std::fs::write(&cluster_file, serde_json::to_vec(&source).unwrap()).unwrap();
            let target = source.target_for(PREFIX, id());
            Self {
                _tmp: tmp,
                root,
                cluster_file,
                source,
                target,
                mdw: InProcessAgent::new(1000),
                sdw1: InProcessAgent::new(1000),
            }
        }

        fn hub(&self) -> Hub {
            self.hub_with_faults(FaultInjector::disabled())
        }

        fn hub_with_faults(&self, faults: FaultInjector) -> Hub {
            let state = StateDir::new(self.root.join("state"));
            let config = Hub::initialize_state(
                state.clone(),
                HubConfig::new(id(), 6416, 0, 0.5, PREFIX).unwrap(),
            )
            .unwrap();
            let connector = FakeConnector {
                agents: HashMap::from([
                    ("mdw".to_string(), self.mdw.clone()),
                    ("sdw1".to_string(), self.sdw1.clone()),
                ]),
            };
            Hub::with_connector(state, config, Arc::new(connector), faults)
        }

        fn status(&self, step: Step, substep: Substep) -> Status {
            let store = StateDir::new(self.root.join("state")).step_store();
            StepTracker::open(Arc::new(store), None)
                .unwrap()
                .status(step, substep)
        }
    }

    fn tag(dir: &Path) -> String {
        std::fs::read_to_string(dir.join("tag")).unwrap()
    }

    #[tokio::test]
    async fn full_upgrade_swaps_directories_and_stops_agents() {
        let fx = Fixture::new("sdw1");
        let hub = fx.hub();

        let (tx, mut rx) = status_channel();
        hub.run(Step::Initialize, Some(fx.cluster_file.clone()), Some(tx))
            .await
            .unwrap();
        assert_eq!(hub.state().load_target().unwrap(), fx.target);
        let mut completed = 0;
        while let Ok(event) = rx.try_recv() {
            if event.status == Status::Complete {
                completed += 1;
            }
        }
        assert_eq!(completed, Step::Initialize.substeps().len());

        // The upgraded coordinator exists before its data is copied out.
        let new_coordinator = fx.target.coordinator().unwrap().data_dir.clone();
        make_data_dir(&new_coordinator, "new");
        hub.run(Step::Execute, None, None).await.unwrap();

        let copies = fx.mdw.synced();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].source, new_coordinator);
        assert_eq!(copies[0].dest_host, "sdw1");
        assert_eq!(copies[0].destination, fx.target.segment(2).unwrap().data_dir);
        let ts_copies = fx.sdw1.synced();
        assert_eq!(ts_copies.len(), 1);
        assert_eq!(ts_copies[0].destination, fx.target.tablespaces[0].location);

        // The primary's target now exists; the mirror's never will.
        make_data_dir(&fx.target.segment(2).unwrap().data_dir, "new");
        hub.run(Step::Finalize, None, None).await.unwrap();

        for dbid in [1, 2] {
            let source = &fx.source.segment(dbid).unwrap().data_dir;
            let target = &fx.target.segment(dbid).unwrap().data_dir;
            assert_eq!(tag(source), "new");
            assert_eq!(tag(&archive_directory(target)), "old");
        }
        assert_eq!(tag(&fx.source.segment(3).unwrap().data_dir), "old");
        assert_eq!(fx.mdw.stops.load(Ordering::SeqCst), 1);
        assert_eq!(fx.sdw1.stops.load(Ordering::SeqCst), 1);

        // Finalizing again converges without touching anything.
        hub.run(Step::Finalize, None, None).await.unwrap();
        assert_eq!(tag(&fx.source.segment(2).unwrap().data_dir), "new");
        assert!(hub.run(Step::Revert, None, None).await.is_err());
    }

    #[tokio::test]
    async fn revert_is_refused_once_finalize_has_started() {
        let fx = Fixture::new("sdw1");
        let hub = fx.hub();
        hub.run(Step::Initialize, Some(fx.cluster_file.clone()), None)
            .await
            .unwrap();
        make_data_dir(&fx.target.coordinator().unwrap().data_dir, "new");
        hub.run(Step::Execute, None, None).await.unwrap();
        make_data_dir(&fx.target.segment(2).unwrap().data_dir, "new");

        // The hub dies right after the swap, before recording it.
        let faults = FaultInjector::disabled();
        faults.arm(workflow::AFTER_SUBSTEP, 1);
        let err = fx
            .hub_with_faults(faults)
            .run(Step::Finalize, None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StepError>(),
            Some(StepError::Injected {
                substep: Substep::SwapDataDirectories,
                ..
            })
        ));
        assert_eq!(
            fx.status(Step::Finalize, Substep::SwapDataDirectories),
            Status::Running
        );

        let err = hub.run(Step::Revert, None, None).await.unwrap_err();
        assert!(err.to_string().contains("finalize has started"), "{err}");

        let store = StateDir::new(fx.root.join("state")).step_store();
        let record = StepTracker::open(Arc::new(store), None).unwrap();
        assert!(!record.record().steps.contains_key(&Step::Revert));
        for dbid in [1, 2] {
            let source = &fx.source.segment(dbid).unwrap().data_dir;
            let target = &fx.target.segment(dbid).unwrap().data_dir;
            assert_eq!(tag(source), "new");
            assert_eq!(tag(&archive_directory(target)), "old");
        }
        assert_eq!(fx.sdw1.stops.load(Ordering::SeqCst), 0);

        // Finishing finalize is still possible.
        hub.run(Step::Finalize, None, None).await.unwrap();
        assert_eq!(tag(&fx.source.segment(2).unwrap().data_dir), "new");
        assert_eq!(fx.sdw1.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_host_fails_the_substep_as_a_transport_error() {
        let fx = Fixture::new("sdw9");
        let hub = fx.hub();

        let err = hub
            .run(Step::Initialize, Some(fx.cluster_file.clone()), None)
            .await
            .unwrap_err();
        let step_err = err.downcast_ref::<StepError>().expect("step error");
        let failures = step_err.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].is_transport());
        assert_eq!(failures[0].host(), "sdw9");
        assert!(err.to_string().contains("connection refused"));

        assert_eq!(
            fx.status(Step::Initialize, Substep::SavingSourceClusterConfig),
            Status::Complete
        );
        assert_eq!(fx.status(Step::Initialize, Substep::StartAgents), Status::Failed);
        assert!(!hub.state().target_cluster_path().exists());
    }

    #[tokio::test]
    async fn low_disk_space_lists_every_short_directory() {
        let mut fx = Fixture::new("sdw1");
        fx.sdw1 = InProcessAgent::new(100);
        let hub = fx.hub();

        let err = hub
            .run(Step::Initialize, Some(fx.cluster_file.clone()), None)
            .await
            .unwrap_err();
        let failures = err.downcast_ref::<StepError>().unwrap().failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].host(), "sdw1");
        let rendered = err.to_string();
        assert!(rendered.contains("primary/demoDataDir0"));
        assert!(rendered.contains("mirror/demoDataDir0"));
        assert_eq!(fx.status(Step::Initialize, Substep::CheckDiskSpace), Status::Failed);

        // Freed space: the rerun skips what already completed.
        fx.sdw1 = InProcessAgent::new(1000);
        fx.hub()
            .run(Step::Initialize, None, None)
            .await
            .unwrap();
        assert_eq!(
            fx.status(Step::Initialize, Substep::GenerateTargetConfig),
            Status::Complete
        );
    }

    #[tokio::test]
    async fn unreadable_and_short_directories_are_reported_together() {
        let mut fx = Fixture::new("sdw1");
        let primary = fx.source.segment(2).unwrap().data_dir.clone();
        let mirror = fx.source.segment(3).unwrap().data_dir.clone();
        fx.sdw1 = InProcessAgent::with_disk(FixedDisk {
            available: 100,
            unreadable: vec![mirror.clone()],
        });

        let err = fx
            .hub()
            .run(Step::Initialize, Some(fx.cluster_file.clone()), None)
            .await
            .unwrap_err();
        let failures = err.downcast_ref::<StepError>().unwrap().failures();
        assert_eq!(failures.len(), 1);
        match &failures[0] {
            HostFailure::InsufficientSpace { host, usage, errors } => {
                assert_eq!(host, "sdw1");
                assert_eq!(usage.len(), 1);
                assert_eq!(usage[0].directory, primary);
                assert_eq!(errors.len(), 1);
                assert_eq!(errors.errors()[0].path(), Some(mirror.as_path()));
            }
            other => panic!("unexpected failure: {other}"),
        }
        let rendered = err.to_string();
        assert!(rendered.contains("primary/demoDataDir0"), "{rendered}");
        assert!(rendered.contains("mirror/demoDataDir0"), "{rendered}");
    }

    #[tokio::test]
    async fn revert_removes_target_directories_and_restores_pg_control() {
        let fx = Fixture::new("sdw1");
        let hub = fx.hub();
        hub.run(Step::Initialize, Some(fx.cluster_file.clone()), None)
            .await
            .unwrap();

        for seg in &fx.target.segments {
            make_data_dir(&seg.data_dir, "new");
        }
        make_dir_of_kind(&fx.target.tablespaces[0].location, DirectoryKind::Tablespace, "new");
        // Linking the upgraded cluster renamed the primary's pg_control aside.
        let primary = fx.source.segment(2).unwrap().data_dir.clone();
        std::fs::rename(primary.join("global/pg_control"), primary.join("global/pg_control.old"))
            .unwrap();

        hub.run(Step::Revert, None, None).await.unwrap();

        for seg in &fx.target.segments {
            assert!(!seg.data_dir.exists(), "{}", seg.data_dir.display());
        }
        assert!(!fx.target.tablespaces[0].location.exists());
        assert!(fx.source.tablespaces[0].location.exists());
        assert_eq!(
            std::fs::read_to_string(primary.join("global/pg_control")).unwrap(),
            "control"
        );
        assert_eq!(fx.sdw1.stops.load(Ordering::SeqCst), 1);

        let err = hub.run(Step::Execute, None, None).await.unwrap_err();
        assert!(err.to_string().contains("reverted"));
    }

    #[tokio::test]
    async fn steps_refuse_to_run_out_of_order() {
        let fx = Fixture::new("sdw1");
        let hub = fx.hub();
        assert!(hub.run(Step::Execute, None, None).await.is_err());
        assert!(hub.run(Step::Finalize, None, None).await.is_err());
        assert!(!hub.state().status_path().exists());
    }

    #[test]
    fn initialize_state_keeps_the_first_upgrade_id() {
        let tmp = tempfile::tempdir().unwrap();
        let state = StateDir::new(tmp.path().join("state"));
        let first = HubConfig::new(UpgradeId::from_raw(1), 6416, 0, 0.2, PREFIX).unwrap();
        let second = HubConfig::new(UpgradeId::from_raw(2), 6416, 0, 0.2, PREFIX).unwrap();
        Hub::initialize_state(state.clone(), first.clone()).unwrap();
        assert_eq!(Hub::initialize_state(state, second).unwrap(), first);
    }
}
