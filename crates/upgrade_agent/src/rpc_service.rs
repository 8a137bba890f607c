//! gRPC handlers translating protobuf requests into [`AgentOps`] calls.
//!
//! Item failures are returned in the reply body. A gRPC status error is only
//! produced when the request itself is unusable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pilota::FastStr;
use tokio::sync::Notify;
use upgrade_core::datadir::{DirectoryKind, DirectoryPair};
use upgrade_core::{AggregateError, ItemError, UpgradeId};

use crate::disk::DiskUsage;
use crate::ops::AgentOps;
use crate::rsync::{RsyncOptions, RsyncPair};
use crate::volo_gen::upgrade::agent as rpc;

/// Grace period between acknowledging `Stop` and shutting the server down.
const STOP_GRACE: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct AgentService {
    pub ops: AgentOps,
    pub stop: Arc<Notify>,
}

impl rpc::AgentRpc for AgentService {
    async fn check_disk_space(
        &self,
        req: volo_grpc::Request<rpc::CheckDiskSpaceRequest>,
    ) -> Result<volo_grpc::Response<rpc::CheckDiskSpaceResponse>, volo_grpc::Status> {
        let req = req.into_inner();
        let report = self
            .ops
            .check_disk_space(paths(&req.dirs), req.free_ratio)
            .await
            .map_err(|err| volo_grpc::Status::invalid_argument(err.to_string()))?;
        Ok(volo_grpc::Response::new(rpc::CheckDiskSpaceResponse {
            usage: report.outputs.into_iter().map(usage_to_rpc).collect(),
            errors: errors_to_rpc(report.errors),
        }))
    }

    async fn delete_directories(
        &self,
        req: volo_grpc::Request<rpc::DeleteDirectoriesRequest>,
    ) -> Result<volo_grpc::Response<rpc::OperationResponse>, volo_grpc::Status> {
        let dirs = paths(&req.into_inner().dirs);
        let errors = self.ops.delete_directories(DirectoryKind::Data, dirs).await;
        Ok(operation_response("delete_directories", errors))
    }

    async fn delete_tablespace_directories(
        &self,
        req: volo_grpc::Request<rpc::DeleteDirectoriesRequest>,
    ) -> Result<volo_grpc::Response<rpc::OperationResponse>, volo_grpc::Status> {
        let dirs = paths(&req.into_inner().dirs);
        let errors = self
            .ops
            .delete_directories(DirectoryKind::Tablespace, dirs)
            .await;
        Ok(operation_response("delete_tablespace_directories", errors))
    }

    async fn rename_data_directories(
        &self,
        req: volo_grpc::Request<rpc::RenameDataDirectoriesRequest>,
    ) -> Result<volo_grpc::Response<rpc::OperationResponse>, volo_grpc::Status> {
        let req = req.into_inner();
        if !req.upgrade_id.is_empty() {
            let id: UpgradeId = req
                .upgrade_id
                .as_str()
                .parse()
                .map_err(|err| volo_grpc::Status::invalid_argument(format!("{err}")))?;
            tracing::info!(upgrade_id = %id, pairs = req.pairs.len(), "renaming data directories");
        }
        let pairs = req
            .pairs
            .iter()
            .map(|p| DirectoryPair {
                source: PathBuf::from(p.source.as_str()),
                target: PathBuf::from(p.target.as_str()),
            })
            .collect();
        let errors = self.ops.rename_data_directories(pairs).await;
        Ok(operation_response("rename_data_directories", errors))
    }

    async fn rsync_data_directories(
        &self,
        req: volo_grpc::Request<rpc::RsyncRequest>,
    ) -> Result<volo_grpc::Response<rpc::OperationResponse>, volo_grpc::Status> {
        let (pairs, opts) = rsync_request(req.into_inner());
        let errors = self
            .ops
            .rsync_directories(DirectoryKind::Data, pairs, opts)
            .await;
        Ok(operation_response("rsync_data_directories", errors))
    }

    async fn rsync_tablespace_directories(
        &self,
        req: volo_grpc::Request<rpc::RsyncRequest>,
    ) -> Result<volo_grpc::Response<rpc::OperationResponse>, volo_grpc::Status> {
        let (pairs, opts) = rsync_request(req.into_inner());
        let errors = self
            .ops
            .rsync_directories(DirectoryKind::Tablespace, pairs, opts)
            .await;
        Ok(operation_response("rsync_tablespace_directories", errors))
    }

    async fn restore_primaries_pg_control(
        &self,
        req: volo_grpc::Request<rpc::RestorePgControlRequest>,
    ) -> Result<volo_grpc::Response<rpc::OperationResponse>, volo_grpc::Status> {
        let dirs = paths(&req.into_inner().dirs);
        let errors = self.ops.restore_pg_control(dirs).await;
        Ok(operation_response("restore_primaries_pg_control", errors))
    }

    async fn stop(
        &self,
        _req: volo_grpc::Request<rpc::StopRequest>,
    ) -> Result<volo_grpc::Response<rpc::StopResponse>, volo_grpc::Status> {
        tracing::info!("stop requested");
        let stop = self.stop.clone();
        // Let the acknowledgement reach the caller before the server goes away.
        tokio::spawn(async move {
            tokio::time::sleep(STOP_GRACE).await;
            stop.notify_one();
        });
        Ok(volo_grpc::Response::new(rpc::StopResponse {}))
    }
}

fn paths(raw: &[FastStr]) -> Vec<PathBuf> {
    raw.iter().map(|p| PathBuf::from(p.as_str())).collect()
}

fn rsync_request(req: rpc::RsyncRequest) -> (Vec<RsyncPair>, RsyncOptions) {
    let pairs = req
        .pairs
        .iter()
        .map(|p| RsyncPair {
            source: PathBuf::from(p.source.as_str()),
            dest_host: p.dest_host.to_string(),
            destination: PathBuf::from(p.destination.as_str()),
        })
        .collect();
    let opts = RsyncOptions {
        options: req.options.iter().map(|o| o.to_string()).collect(),
        excludes: req.excludes.iter().map(|e| e.to_string()).collect(),
    };
    (pairs, opts)
}

fn operation_response(
    op: &'static str,
    errors: AggregateError,
) -> volo_grpc::Response<rpc::OperationResponse> {
    if !errors.is_empty() {
        tracing::warn!(op, failures = errors.len(), error = %errors, "operation finished with failures");
    }
    volo_grpc::Response::new(rpc::OperationResponse {
        errors: errors_to_rpc(errors),
    })
}

pub(crate) fn errors_to_rpc(errors: AggregateError) -> Vec<rpc::ItemError> {
    errors.iter().map(item_error_to_rpc).collect()
}

pub(crate) fn item_error_to_rpc(err: &ItemError) -> rpc::ItemError {
    let parts = err.to_parts();
    rpc::ItemError {
        kind: parts.kind.into(),
        path: parts.path.into(),
        detail: parts.detail.into(),
        message: parts.message.into(),
    }
}

fn usage_to_rpc(usage: DiskUsage) -> rpc::DiskUsage {
    rpc::DiskUsage {
        directory: usage.directory.display().to_string().into(),
        mount_point: usage.mount_point.display().to_string().into(),
        total_bytes: usage.total_bytes,
        available_bytes: usage.available_bytes,
        required_bytes: usage.required_bytes,
        sufficient: usage.sufficient,
    }
}
