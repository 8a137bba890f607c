//! Per-host execution daemon.
//!
//! The agent serves `upgrade.agent.AgentRpc` over gRPC and carries out the
//! hub's filesystem work on its host: disk checks, guarded deletes, the data
//! directory swap, pg_control restore and rsync copies. It keeps no state of
//! its own between calls; every operation is safe to repeat.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::Notify;
use upgrade_core::{FaultInjector, LocalFs};

include!(concat!(env!("OUT_DIR"), "/volo_gen.rs"));

pub mod client;
pub mod disk;
pub mod ops;
pub mod rpc_service;
pub mod rsync;

use disk::SysinfoDisks;
use ops::AgentOps;
use rpc_service::AgentService;
use rsync::RsyncCommand;

/// CLI options for running an agent.
#[derive(Parser, Debug, Clone)]
#[command(name = "upgrade-agent", about = "Per-host upgrade execution daemon")]
pub struct AgentArgs {
    /// Address the gRPC service binds to.
    #[arg(long, env = "UPGRADE_AGENT_LISTEN", default_value = "0.0.0.0:6416")]
    pub listen: SocketAddr,

    /// Where the agent records its runtime info.
    #[arg(long, env = "UPGRADE_STATE_DIR", default_value = ".upgrade-agent")]
    pub state_dir: PathBuf,

    #[arg(long, env = "UPGRADE_RSYNC_BIN", default_value = "rsync")]
    pub rsync_bin: PathBuf,

    /// Comma-separated `name=count` injection points, for example
    /// `rename_directories.after_archive=1,rsync.item=unlimited`.
    #[arg(long, env = "UPGRADE_FAULT_POINTS", default_value = "")]
    pub fault_points: String,
}

#[derive(Serialize)]
struct AgentInfo<'a> {
    pid: u32,
    listen: SocketAddr,
    rsync_bin: &'a std::path::Path,
    faults_enabled: bool,
}

/// Run the agent until ctrl-c or a `Stop` request.
pub async fn run_agent(args: AgentArgs) -> anyhow::Result<()> {
    run_agent_with_shutdown(args, tokio::signal::ctrl_c()).await
}

/// Run the agent until `shutdown` resolves or a `Stop` request arrives.
pub async fn run_agent_with_shutdown<F>(args: AgentArgs, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    let faults = FaultInjector::from_spec(&args.fault_points).context("parse fault points")?;
    if faults.is_enabled() {
        tracing::warn!(spec = %args.fault_points, "fault injection enabled");
    }

    std::fs::create_dir_all(&args.state_dir)
        .with_context(|| format!("create state dir {}", args.state_dir.display()))?;
    let info = AgentInfo {
        pid: std::process::id(),
        listen: args.listen,
        rsync_bin: &args.rsync_bin,
        faults_enabled: faults.is_enabled(),
    };
    let info_path = args.state_dir.join("agent.json");
    let bytes = serde_json::to_vec_pretty(&info).context("encode agent info")?;
    std::fs::write(&info_path, bytes)
        .with_context(|| format!("write {}", info_path.display()))?;

    let ops = AgentOps::new(
        Arc::new(LocalFs),
        Arc::new(SysinfoDisks),
        Arc::new(RsyncCommand::new(args.rsync_bin.clone())),
        faults,
    );
    let stop = Arc::new(Notify::new());
    let service = AgentService {
        ops,
        stop: stop.clone(),
    };

    let listen = args.listen;
    let mut server = tokio::spawn(async move {
        let svc = volo_gen::upgrade::agent::AgentRpcServer::new(service);
        let svc = volo_grpc::server::ServiceBuilder::new(svc).build::<
            volo_gen::upgrade::agent::AgentRpcRequestRecv,
            volo_gen::upgrade::agent::AgentRpcResponseSend,
        >();
        let result = volo_grpc::server::Server::new()
            .add_service(svc)
            .run(volo::net::Address::from(listen))
            .await;
        if let Err(err) = result {
            tracing::error!(error = ?err, "gRPC server failed");
        }
    });
    tracing::info!(listen = %listen, "agent started");

    let outcome = tokio::select! {
        res = shutdown => {
            tracing::info!("shutdown signal received");
            res.context("wait for shutdown signal")
        }
        _ = stop.notified() => {
            tracing::info!("stopping after request");
            Ok(())
        }
        res = &mut server => {
            res.context("gRPC server task")?;
            Err(anyhow::anyhow!("gRPC server on {listen} exited"))
        }
    };

    server.abort();
    let _ = std::fs::remove_file(&info_path);
    tracing::info!("agent stopped");
    outcome
}
