//! The work behind each substep of initialize, execute, finalize and revert.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use upgrade_agent::rsync::{RsyncOptions, RsyncPair};
use upgrade_core::datadir::DirectoryPair;
use upgrade_core::step::{Step, Substep};

use crate::agents::{on_hosts, AgentConnector, HostFailure, StepError};
use crate::config::{read_json, ClusterConfig, HubConfig, StateDir};
use crate::workflow::SubstepRunner;

/// Runs substeps against the cluster recorded in the state directory.
pub struct HubSteps {
    state: StateDir,
    config: HubConfig,
    connector: Arc<dyn AgentConnector>,
    /// Cluster layout handed to `initialize`; later steps read the saved copy.
    source_input: Option<PathBuf>,
}

impl HubSteps {
    pub fn new(
        state: StateDir,
        config: HubConfig,
        connector: Arc<dyn AgentConnector>,
        source_input: Option<PathBuf>,
    ) -> Self {
        Self {
            state,
            config,
            connector,
            source_input,
        }
    }

    fn source(&self, substep: Substep) -> Result<ClusterConfig, StepError> {
        self.state
            .load_source()
            .map_err(|err| StepError::local(substep, err))
    }

    fn target(&self, substep: Substep) -> Result<ClusterConfig, StepError> {
        self.state
            .load_target()
            .map_err(|err| StepError::local(substep, err))
    }

    fn rsync_options(&self) -> RsyncOptions {
        RsyncOptions {
            options: self.config.rsync_options.clone(),
            excludes: self.config.rsync_excludes.clone(),
        }
    }

    fn save_source_cluster(&self) -> Result<(), StepError> {
        let substep = Substep::SavingSourceClusterConfig;
        let cluster = match &self.source_input {
            Some(path) => read_json::<ClusterConfig>(path)
                .with_context(|| format!("load source cluster layout {}", path.display())),
            // Resuming without an input file: the saved copy must already exist.
            None => self.state.load_source(),
        }
        .map_err(|err| StepError::local(substep, err))?;
        cluster
            .validate()
            .and_then(|()| self.state.save_source(&cluster))
            .map_err(|err| StepError::local(substep, err))?;
        tracing::info!(
            segments = cluster.segments.len(),
            hosts = cluster.hosts().len(),
            "saved source cluster configuration"
        );
        Ok(())
    }

    async fn start_agents(&self) -> Result<(), StepError> {
        let substep = Substep::StartAgents;
        let work = self
            .source(substep)?
            .hosts()
            .into_iter()
            .map(|host| (host, ()))
            .collect();
        // An empty disk check is the cheapest round trip an agent answers.
        on_hosts(&self.connector, substep, work, |host, agent, ()| async move {
            agent
                .check_disk_space(&[], 0.0)
                .await
                .map(|_| ())
                .map_err(|err| HostFailure::Transport {
                    host,
                    message: err.to_string(),
                })
        })
        .await
    }

    async fn check_disk_space(&self) -> Result<(), StepError> {
        let substep = Substep::CheckDiskSpace;
        let source = self.source(substep)?;
        let work = source
            .by_host()
            .into_iter()
            .map(|(host, segs)| {
                let dirs: Vec<PathBuf> = segs.iter().map(|s| s.data_dir.clone()).collect();
                (host, dirs)
            })
            .collect();
        let ratio = self.config.disk_free_ratio;
        on_hosts(&self.connector, substep, work, move |host, agent, dirs| async move {
            let report = match agent.check_disk_space(&dirs, ratio).await {
                Ok(report) => report,
                Err(err) => {
                    return Err(HostFailure::Transport {
                        host,
                        message: err.to_string(),
                    })
                }
            };
            let short: Vec<_> = report.outputs.into_iter().filter(|u| !u.sufficient).collect();
            match (short.is_empty(), report.errors.is_empty()) {
                (true, true) => Ok(()),
                (true, false) => Err(HostFailure::Items {
                    host,
                    errors: report.errors,
                }),
                (false, _) => Err(HostFailure::InsufficientSpace {
                    host,
                    usage: short,
                    errors: report.errors,
                }),
            }
        })
        .await
    }

    fn generate_target_config(&self) -> Result<(), StepError> {
        let substep = Substep::GenerateTargetConfig;
        let target = self
            .source(substep)?
            .target_for(&self.config.segment_prefix, self.config.upgrade_id);
        self.state
            .save_target(&target)
            .map_err(|err| StepError::local(substep, err))?;
        tracing::info!(upgrade_id = %self.config.upgrade_id, "saved target cluster configuration");
        Ok(())
    }

    /// Mirror the upgraded coordinator's data directory into every primary's
    /// target data directory. The coordinator host's agent does the copying.
    async fn copy_coordinator(&self) -> Result<(), StepError> {
        let substep = Substep::CopyCoordinator;
        let target = self.target(substep)?;
        let coordinator = target.coordinator().cloned().ok_or_else(|| {
            StepError::local(substep, anyhow::anyhow!("target cluster has no coordinator"))
        })?;
        let pairs: Vec<RsyncPair> = target
            .data_primaries()
            .map(|seg| RsyncPair {
                source: coordinator.data_dir.clone(),
                dest_host: seg.hostname.clone(),
                destination: seg.data_dir.clone(),
            })
            .collect();
        let opts = self.rsync_options();
        let work = vec![(coordinator.hostname.clone(), pairs)];
        on_hosts(&self.connector, substep, work, move |host, agent, pairs| {
            let opts = opts.clone();
            async move {
                HostFailure::from_reply(&host, agent.rsync_data_directories(&pairs, &opts).await)
            }
        })
        .await
    }

    /// Copy each primary's tablespaces into the target cluster's locations.
    async fn copy_tablespaces(&self) -> Result<(), StepError> {
        let substep = Substep::CopyTablespaces;
        let source = self.source(substep)?;
        let target = self.target(substep)?;
        let mut work: BTreeMap<String, Vec<RsyncPair>> = BTreeMap::new();
        for (ts, new) in source.tablespaces.iter().zip(&target.tablespaces) {
            let Some(seg) = source.segment(ts.dbid) else {
                continue;
            };
            if !seg.is_primary() {
                continue;
            }
            work.entry(seg.hostname.clone()).or_default().push(RsyncPair {
                source: ts.location.clone(),
                dest_host: String::new(),
                destination: new.location.clone(),
            });
        }
        let opts = self.rsync_options();
        on_hosts(
            &self.connector,
            substep,
            work.into_iter().collect(),
            move |host, agent, pairs| {
                let opts = opts.clone();
                async move {
                    HostFailure::from_reply(
                        &host,
                        agent.rsync_tablespace_directories(&pairs, &opts).await,
                    )
                }
            },
        )
        .await
    }

    async fn swap_data_directories(&self) -> Result<(), StepError> {
        let substep = Substep::SwapDataDirectories;
        let source = self.source(substep)?;
        let target = self.target(substep)?;
        let mut work: BTreeMap<String, Vec<DirectoryPair>> = BTreeMap::new();
        for seg in &source.segments {
            let Some(new) = target.segment(seg.dbid) else {
                continue;
            };
            work.entry(seg.hostname.clone()).or_default().push(DirectoryPair {
                source: seg.data_dir.clone(),
                target: new.data_dir.clone(),
            });
        }
        let id = self.config.upgrade_id;
        on_hosts(
            &self.connector,
            substep,
            work.into_iter().collect(),
            move |host, agent, pairs| async move {
                HostFailure::from_reply(&host, agent.rename_data_directories(&pairs, id).await)
            },
        )
        .await
    }

    async fn stop_agents(&self) -> Result<(), StepError> {
        let substep = Substep::StopAgents;
        let work = self
            .source(substep)?
            .hosts()
            .into_iter()
            .map(|host| (host, ()))
            .collect();
        on_hosts(&self.connector, substep, work, |host, agent, ()| async move {
            agent.stop().await.map_err(|err| HostFailure::Transport {
                host,
                message: err.to_string(),
            })
        })
        .await
    }

    async fn delete_target_data_directories(&self) -> Result<(), StepError> {
        let substep = Substep::DeleteTargetDataDirectories;
        // Nothing was created if the target layout was never generated.
        if !self.state.target_cluster_path().exists() {
            tracing::info!("no target cluster configuration; nothing to delete");
            return Ok(());
        }
        let target = self.target(substep)?;
        let work = target
            .by_host()
            .into_iter()
            .map(|(host, segs)| {
                let dirs: Vec<PathBuf> = segs.iter().map(|s| s.data_dir.clone()).collect();
                (host, dirs)
            })
            .collect();
        on_hosts(&self.connector, substep, work, |host, agent, dirs| async move {
            HostFailure::from_reply(&host, agent.delete_directories(&dirs).await)
        })
        .await
    }

    async fn delete_tablespaces(&self) -> Result<(), StepError> {
        let substep = Substep::DeleteTablespaces;
        if !self.state.target_cluster_path().exists() {
            tracing::info!("no target cluster configuration; no tablespaces to delete");
            return Ok(());
        }
        let target = self.target(substep)?;
        let work: Vec<(String, Vec<PathBuf>)> = target
            .tablespaces_by_host()
            .into_iter()
            .map(|(host, tablespaces)| {
                let dirs = tablespaces.iter().map(|ts| ts.location.clone()).collect();
                (host, dirs)
            })
            .collect();
        on_hosts(&self.connector, substep, work, |host, agent, dirs| async move {
            HostFailure::from_reply(&host, agent.delete_tablespace_directories(&dirs).await)
        })
        .await
    }

    async fn restore_pg_control(&self) -> Result<(), StepError> {
        let substep = Substep::RestorePgControl;
        let source = self.source(substep)?;
        let mut work: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for seg in source.segments.iter().filter(|s| s.is_primary()) {
            work.entry(seg.hostname.clone())
                .or_default()
                .push(seg.data_dir.clone());
        }
        on_hosts(
            &self.connector,
            substep,
            work.into_iter().collect(),
            |host, agent, dirs| async move {
                HostFailure::from_reply(&host, agent.restore_primaries_pg_control(&dirs).await)
            },
        )
        .await
    }
}

#[async_trait]
impl SubstepRunner for HubSteps {
    async fn run(&self, step: Step, substep: Substep) -> Result<(), StepError> {
        tracing::debug!(step = %step, substep = %substep, "dispatching substep");
        match substep {
            Substep::SavingSourceClusterConfig => self.save_source_cluster(),
            Substep::StartAgents => self.start_agents().await,
            Substep::CheckDiskSpace => self.check_disk_space().await,
            Substep::GenerateTargetConfig => self.generate_target_config(),
            Substep::CopyCoordinator => self.copy_coordinator().await,
            Substep::CopyTablespaces => self.copy_tablespaces().await,
            Substep::SwapDataDirectories => self.swap_data_directories().await,
            Substep::StopAgents => self.stop_agents().await,
            Substep::DeleteTargetDataDirectories => self.delete_target_data_directories().await,
            Substep::DeleteTablespaces => self.delete_tablespaces().await,
            Substep::RestorePgControl => self.restore_pg_control().await,
        }
    }
}
