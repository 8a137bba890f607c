//! Command-line front end of the upgrade hub.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use upgrade_core::status::{status_channel, StatusRenderer};
use upgrade_core::step::{Step, StepStore};
use upgrade_core::{FaultInjector, UpgradeId};
use upgrade_hub::config::{HubConfig, StateDir};
use upgrade_hub::Hub;

#[derive(Parser)]
#[command(name = "upgrade-hub")]
#[command(about = "Drive an in-place cluster upgrade across agent hosts", long_about = None)]
struct Args {
    /// Directory holding the upgrade's configuration and progress record.
    #[arg(long, env = "UPGRADE_STATE_DIR", default_value_os_t = StateDir::default_root())]
    state_dir: PathBuf,

    /// Fault points to arm, as `name=count,...`. Test harness only.
    #[arg(long, env = "UPGRADE_FAULT_POINTS", default_value = "", hide = true)]
    fault_points: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record the source cluster, check the hosts and plan the target layout.
    Initialize {
        /// JSON file describing the source cluster's segments and tablespaces.
        #[arg(long)]
        source_cluster: PathBuf,
        #[arg(long, env = "UPGRADE_AGENT_PORT", default_value_t = 6416)]
        agent_port: u16,
        /// Per-call agent timeout in milliseconds; 0 waits indefinitely.
        #[arg(long, default_value_t = 0)]
        rpc_timeout_ms: u64,
        /// Fraction of each filesystem that must be free.
        #[arg(long, default_value_t = 0.6)]
        disk_free_ratio: f64,
        #[arg(long, default_value = "demoDataDir")]
        segment_prefix: String,
    },
    /// Copy the upgraded coordinator and tablespaces to every primary.
    Execute,
    /// Swap the upgraded directories into place and stop the agents.
    Finalize,
    /// Discard the target cluster and restore the source.
    Revert,
    /// Print the recorded status of every step.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,h2=warn,hyper=warn".into()),
        )
        .init();

    let args = Args::parse();
    let state = StateDir::new(args.state_dir);
    let faults = FaultInjector::from_spec(&args.fault_points).context("parse fault points")?;

    let (step, source_input) = match args.command {
        Command::Status => return print_status(&state),
        Command::Initialize {
            source_cluster,
            agent_port,
            rpc_timeout_ms,
            disk_free_ratio,
            segment_prefix,
        } => {
            let config = HubConfig::new(
                UpgradeId::generate(),
                agent_port,
                rpc_timeout_ms,
                disk_free_ratio,
                segment_prefix,
            )?;
            Hub::initialize_state(state.clone(), config)?;
            (Step::Initialize, Some(source_cluster))
        }
        Command::Execute => (Step::Execute, None),
        Command::Finalize => (Step::Finalize, None),
        Command::Revert => (Step::Revert, None),
    };

    let hub = Hub::open(state, faults)?;
    let (tx, mut rx) = status_channel();
    let renderer = tokio::spawn(async move {
        let mut renderer = StatusRenderer::new(std::io::stdout());
        while let Some(event) = rx.recv().await {
            renderer.render(&event)?;
        }
        renderer.finish()
    });

    let outcome = hub.run(step, source_input, Some(tx)).await;
    // The sender went away with the tracker, so the renderer drains and exits.
    renderer.await.context("status renderer")??;

    match outcome {
        Ok(()) => {
            println!("{step} completed successfully (upgrade {})", hub.config().upgrade_id);
            Ok(())
        }
        Err(err) => Err(err.context(format!("{step} failed; fix the problem and run {step} again"))),
    }
}

fn print_status(state: &StateDir) -> anyhow::Result<()> {
    let record = state.step_store().load()?;
    for step in Step::ALL {
        let Some(step_record) = record.steps.get(&step) else {
            continue;
        };
        println!("{step} (attempts: {})", step_record.attempts);
        for &substep in step.substeps() {
            let status = record.status(step, substep);
            println!("  {:<40} {}", substep.description(), status.as_str());
            if let Some(error) = step_record.substeps.get(&substep).and_then(|s| s.error.as_ref()) {
                for line in error.lines() {
                    println!("      {line}");
                }
            }
        }
    }
    Ok(())
}
