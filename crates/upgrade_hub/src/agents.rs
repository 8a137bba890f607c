//! Reaching agents and fanning work out across hosts.
//!
//! A host either answers (possibly with item failures) or does not. The two
//! outcomes stay separate all the way up to [`StepError`].

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use upgrade_agent::client::{AgentClient, TransportError};
use upgrade_agent::disk::DiskUsage;
use upgrade_agent::rsync::{RsyncOptions, RsyncPair};
use upgrade_core::datadir::DirectoryPair;
use upgrade_core::fanout::{spawn_all, FanOut};
use upgrade_core::step::Substep;
use upgrade_core::{AggregateError, UpgradeId};

/// Operations the hub needs from one agent.
#[async_trait]
pub trait AgentApi: Send + Sync + 'static {
    async fn check_disk_space(
        &self,
        dirs: &[PathBuf],
        free_ratio: f64,
    ) -> Result<FanOut<DiskUsage>, TransportError>;

    async fn delete_directories(&self, dirs: &[PathBuf]) -> Result<AggregateError, TransportError>;

    async fn delete_tablespace_directories(
        &self,
        dirs: &[PathBuf],
    ) -> Result<AggregateError, TransportError>;

    async fn rename_data_directories(
        &self,
        pairs: &[DirectoryPair],
        upgrade_id: UpgradeId,
    ) -> Result<AggregateError, TransportError>;

    async fn rsync_data_directories(
        &self,
        pairs: &[RsyncPair],
        opts: &RsyncOptions,
    ) -> Result<AggregateError, TransportError>;

    async fn rsync_tablespace_directories(
        &self,
        pairs: &[RsyncPair],
        opts: &RsyncOptions,
    ) -> Result<AggregateError, TransportError>;

    async fn restore_primaries_pg_control(
        &self,
        dirs: &[PathBuf],
    ) -> Result<AggregateError, TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;
}

#[async_trait]
impl AgentApi for AgentClient {
    async fn check_disk_space(
        &self,
        dirs: &[PathBuf],
        free_ratio: f64,
    ) -> Result<FanOut<DiskUsage>, TransportError> {
        AgentClient::check_disk_space(self, dirs, free_ratio).await
    }

    async fn delete_directories(&self, dirs: &[PathBuf]) -> Result<AggregateError, TransportError> {
        AgentClient::delete_directories(self, dirs).await
    }

    async fn delete_tablespace_directories(
        &self,
        dirs: &[PathBuf],
    ) -> Result<AggregateError, TransportError> {
        AgentClient::delete_tablespace_directories(self, dirs).await
    }

    async fn rename_data_directories(
        &self,
        pairs: &[DirectoryPair],
        upgrade_id: UpgradeId,
    ) -> Result<AggregateError, TransportError> {
        AgentClient::rename_data_directories(self, pairs, upgrade_id).await
    }

    async fn rsync_data_directories(
        &self,
        pairs: &[RsyncPair],
        opts: &RsyncOptions,
    ) -> Result<AggregateError, TransportError> {
        AgentClient::rsync_data_directories(self, pairs, opts).await
    }

    async fn rsync_tablespace_directories(
        &self,
        pairs: &[RsyncPair],
        opts: &RsyncOptions,
    ) -> Result<AggregateError, TransportError> {
        AgentClient::rsync_tablespace_directories(self, pairs, opts).await
    }

    async fn restore_primaries_pg_control(
        &self,
        dirs: &[PathBuf],
    ) -> Result<AggregateError, TransportError> {
        AgentClient::restore_primaries_pg_control(self, dirs).await
    }

    async fn stop(&self) -> Result<(), TransportError> {
        AgentClient::stop(self).await
    }
}

/// Hands out a handle to the agent on a given host.
#[async_trait]
pub trait AgentConnector: Send + Sync + 'static {
    async fn connect(&self, host: &str) -> Result<Arc<dyn AgentApi>, String>;
}

/// Connects to `host:port` over gRPC.
#[derive(Clone, Debug)]
pub struct GrpcConnector {
    port: u16,
    timeout: Option<Duration>,
}

impl GrpcConnector {
    pub fn new(port: u16, timeout: Option<Duration>) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl AgentConnector for GrpcConnector {
    async fn connect(&self, host: &str) -> Result<Arc<dyn AgentApi>, String> {
        let addr: SocketAddr = tokio::net::lookup_host((host, self.port))
            .await
            .map_err(|err| format!("resolve {host}: {err}"))?
            .next()
            .ok_or_else(|| format!("resolve {host}: no addresses"))?;
        Ok(Arc::new(AgentClient::new(addr, self.timeout)))
    }
}

/// What went wrong on one host during a substep.
#[derive(Debug)]
pub enum HostFailure {
    /// The agent could not be reached or the call did not complete.
    Transport { host: String, message: String },
    /// The agent ran the operation and some items failed.
    Items { host: String, errors: AggregateError },
    /// Filesystems on the host lack the required free space. `errors` holds
    /// the directories on the same host that could not be checked at all.
    InsufficientSpace {
        host: String,
        usage: Vec<DiskUsage>,
        errors: AggregateError,
    },
}

impl HostFailure {
    pub fn host(&self) -> &str {
        match self {
            Self::Transport { host, .. }
            | Self::Items { host, .. }
            | Self::InsufficientSpace { host, .. } => host,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Classify the outcome of one agent call returning item errors.
    pub fn from_reply(
        host: &str,
        reply: Result<AggregateError, TransportError>,
    ) -> Result<(), HostFailure> {
        match reply {
            Ok(errors) if errors.is_empty() => Ok(()),
            Ok(errors) => Err(Self::Items {
                host: host.to_string(),
                errors,
            }),
            Err(err) => Err(Self::Transport {
                host: host.to_string(),
                message: err.to_string(),
            }),
        }
    }
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport { host, message } => write!(f, "{host}: agent unavailable: {message}"),
            Self::Items { host, errors } => write!(f, "{host}: {errors}"),
            Self::InsufficientSpace {
                host,
                usage,
                errors,
            } => {
                write!(f, "{host}: insufficient disk space:")?;
                for u in usage {
                    write!(
                        f,
                        "\n  {} on {}: {} bytes available, {} required",
                        u.directory.display(),
                        u.mount_point.display(),
                        u.available_bytes,
                        u.required_bytes
                    )?;
                }
                if !errors.is_empty() {
                    write!(f, "\n  unchecked: {errors}")?;
                }
                Ok(())
            }
        }
    }
}

/// Why a step stopped.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// One or more hosts failed; every host's failure is listed.
    #[error("{substep} failed on {} host(s):\n{}", .failures.len(), render_failures(.failures))]
    Agents {
        substep: Substep,
        failures: Vec<HostFailure>,
    },

    /// Work done by the hub itself failed.
    #[error("{substep} failed: {error:#}")]
    Local {
        substep: Substep,
        error: anyhow::Error,
    },

    /// A fault injection point interrupted the step.
    #[error("{substep} interrupted at {point}")]
    Injected { substep: Substep, point: String },

    /// The progress record could not be read or written.
    #[error("status record: {0:#}")]
    Store(anyhow::Error),
}

impl StepError {
    pub fn local(substep: Substep, error: anyhow::Error) -> Self {
        Self::Local { substep, error }
    }

    /// Host failures, empty unless this is an `Agents` error.
    pub fn failures(&self) -> &[HostFailure] {
        match self {
            Self::Agents { failures, .. } => failures,
            _ => &[],
        }
    }
}

fn render_failures(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("  {f}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run `op` against the agent of every host concurrently and wait for all.
///
/// Hosts that fail do not stop the others. The returned error lists every
/// failing host in input order.
pub async fn on_hosts<T, F, Fut>(
    connector: &Arc<dyn AgentConnector>,
    substep: Substep,
    work: Vec<(String, T)>,
    op: F,
) -> Result<(), StepError>
where
    T: Send + 'static,
    F: Fn(String, Arc<dyn AgentApi>, T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HostFailure>> + Send + 'static,
{
    let hosts: Vec<String> = work.iter().map(|(host, _)| host.clone()).collect();
    let results = spawn_all(work, |(host, payload)| {
        let connector = connector.clone();
        let op = op.clone();
        async move {
            let agent = connector
                .connect(&host)
                .await
                .map_err(|message| HostFailure::Transport {
                    host: host.clone(),
                    message,
                })?;
            op(host, agent, payload).await
        }
    })
    .await;

    let failures: Vec<HostFailure> = results
        .into_iter()
        .zip(hosts)
        .filter_map(|(res, host)| match res {
            Ok(Ok(())) => None,
            Ok(Err(failure)) => Some(failure),
            Err(join_err) => Some(HostFailure::Transport {
                host,
                message: format!("task failed: {join_err}"),
            }),
        })
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        for failure in &failures {
            tracing::warn!(substep = %substep, host = failure.host(), error = %failure, "host failed");
        }
        Err(StepError::Agents { substep, failures })
    }
}
