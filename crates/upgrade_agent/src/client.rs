//! Typed client for one agent, used by the hub.
//!
//! Calls return `Err(TransportError)` only when the call itself failed.
//! Item failures reported by the agent come back as an [`AggregateError`]
//! inside `Ok`, so the two can never be confused.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use upgrade_core::datadir::DirectoryPair;
use upgrade_core::error::WireParts;
use upgrade_core::fanout::FanOut;
use upgrade_core::{AggregateError, ItemError, UpgradeId};

use crate::disk::DiskUsage;
use crate::rsync::{RsyncOptions, RsyncPair};
use crate::volo_gen::upgrade::agent as rpc;

/// The call to an agent did not complete.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{method} to {target} timed out after {timeout:?}")]
    Timeout {
        target: SocketAddr,
        method: &'static str,
        timeout: Duration,
    },

    #[error("{method} to {target} failed: {status}")]
    Status {
        target: SocketAddr,
        method: &'static str,
        status: String,
    },
}

#[derive(Clone)]
pub struct AgentClient {
    target: SocketAddr,
    timeout: Option<Duration>,
    client: rpc::AgentRpcClient,
}

impl AgentClient {
    /// `timeout` bounds every call; `None` waits as long as the agent takes.
    pub fn new(target: SocketAddr, timeout: Option<Duration>) -> Self {
        let client = rpc::AgentRpcClientBuilder::new("upgrade.agent.AgentRpc")
            .address(volo::net::Address::from(target))
            .build();
        Self {
            target,
            timeout,
            client,
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub async fn check_disk_space(
        &self,
        dirs: &[PathBuf],
        free_ratio: f64,
    ) -> Result<FanOut<DiskUsage>, TransportError> {
        let request = rpc::CheckDiskSpaceRequest {
            dirs: path_strings(dirs),
            free_ratio,
        };
        let resp = self
            .call("check_disk_space", self.client.check_disk_space(request))
            .await?;
        Ok(FanOut {
            outputs: resp.usage.into_iter().map(usage_from_rpc).collect(),
            errors: errors_from_rpc(resp.errors),
        })
    }

    pub async fn delete_directories(&self, dirs: &[PathBuf]) -> Result<AggregateError, TransportError> {
        let request = rpc::DeleteDirectoriesRequest {
            dirs: path_strings(dirs),
        };
        let resp = self
            .call("delete_directories", self.client.delete_directories(request))
            .await?;
        Ok(errors_from_rpc(resp.errors))
    }

    pub async fn delete_tablespace_directories(
        &self,
        dirs: &[PathBuf],
    ) -> Result<AggregateError, TransportError> {
        let request = rpc::DeleteDirectoriesRequest {
            dirs: path_strings(dirs),
        };
        let resp = self
            .call(
                "delete_tablespace_directories",
                self.client.delete_tablespace_directories(request),
            )
            .await?;
        Ok(errors_from_rpc(resp.errors))
    }

    pub async fn rename_data_directories(
        &self,
        pairs: &[DirectoryPair],
        upgrade_id: UpgradeId,
    ) -> Result<AggregateError, TransportError> {
        let request = rpc::RenameDataDirectoriesRequest {
            pairs: pairs
                .iter()
                .map(|p| rpc::RenamePair {
                    source: path_string(&p.source),
                    target: path_string(&p.target),
                })
                .collect(),
            upgrade_id: upgrade_id.to_string().into(),
        };
        let resp = self
            .call(
                "rename_data_directories",
                self.client.rename_data_directories(request),
            )
            .await?;
        Ok(errors_from_rpc(resp.errors))
    }

    pub async fn rsync_data_directories(
        &self,
        pairs: &[RsyncPair],
        opts: &RsyncOptions,
    ) -> Result<AggregateError, TransportError> {
        let resp = self
            .call(
                "rsync_data_directories",
                self.client.rsync_data_directories(rsync_request(pairs, opts)),
            )
            .await?;
        Ok(errors_from_rpc(resp.errors))
    }

    pub async fn rsync_tablespace_directories(
        &self,
        pairs: &[RsyncPair],
        opts: &RsyncOptions,
    ) -> Result<AggregateError, TransportError> {
        let resp = self
            .call(
                "rsync_tablespace_directories",
                self.client
                    .rsync_tablespace_directories(rsync_request(pairs, opts)),
            )
            .await?;
        Ok(errors_from_rpc(resp.errors))
    }

    pub async fn restore_primaries_pg_control(
        &self,
        dirs: &[PathBuf],
    ) -> Result<AggregateError, TransportError> {
        let request = rpc::RestorePgControlRequest {
            dirs: path_strings(dirs),
        };
        let resp = self
            .call(
                "restore_primaries_pg_control",
                self.client.restore_primaries_pg_control(request),
            )
            .await?;
        Ok(errors_from_rpc(resp.errors))
    }

    pub async fn stop(&self) -> Result<(), TransportError> {
        self.call("stop", self.client.stop(rpc::StopRequest {}))
            .await?;
        Ok(())
    }

    async fn call<T, F>(&self, method: &'static str, fut: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<volo_grpc::Response<T>, volo_grpc::Status>>,
    {
        let result = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut).await.map_err(|_| {
                TransportError::Timeout {
                    target: self.target,
                    method,
                    timeout,
                }
            })?,
            None => fut.await,
        };
        result
            .map(volo_grpc::Response::into_inner)
            .map_err(|status| TransportError::Status {
                target: self.target,
                method,
                status: status.to_string(),
            })
    }
}

fn path_string(path: &Path) -> pilota::FastStr {
    path.display().to_string().into()
}

fn path_strings(paths: &[PathBuf]) -> Vec<pilota::FastStr> {
    paths.iter().map(|p| path_string(p)).collect()
}

fn rsync_request(pairs: &[RsyncPair], opts: &RsyncOptions) -> rpc::RsyncRequest {
    rpc::RsyncRequest {
        pairs: pairs
            .iter()
            .map(|p| rpc::RsyncPair {
                source: path_string(&p.source),
                dest_host: p.dest_host.clone().into(),
                destination: path_string(&p.destination),
            })
            .collect(),
        options: opts.options.iter().cloned().map(Into::into).collect(),
        excludes: opts.excludes.iter().cloned().map(Into::into).collect(),
    }
}

fn errors_from_rpc(errors: Vec<rpc::ItemError>) -> AggregateError {
    errors
        .into_iter()
        .map(|e| {
            ItemError::from_parts(WireParts {
                kind: e.kind.to_string(),
                path: e.path.to_string(),
                detail: e.detail.to_string(),
                message: e.message.to_string(),
            })
        })
        .collect()
}

fn usage_from_rpc(usage: rpc::DiskUsage) -> DiskUsage {
    DiskUsage {
        directory: PathBuf::from(usage.directory.as_str()),
        mount_point: PathBuf::from(usage.mount_point.as_str()),
        total_bytes: usage.total_bytes,
        available_bytes: usage.available_bytes,
        required_bytes: usage.required_bytes,
        sufficient: usage.sufficient,
    }
}
