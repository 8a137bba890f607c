//! Shared helpers for hub integration tests.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use upgrade_agent::AgentArgs;

pub const IO_TIMEOUT: Duration = Duration::from_secs(20);

/// An agent served from this test process.
pub struct InProcessAgent {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    pub task: JoinHandle<anyhow::Result<()>>,
}

impl InProcessAgent {
    /// Wait for the agent to exit on its own, for example after `Stop`.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> Option<anyhow::Result<()>> {
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(joined) => Some(joined.unwrap_or_else(|err| Err(err.into()))),
            Err(_) => None,
        }
    }
}

impl Drop for InProcessAgent {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Serve an agent on a free local port and wait until it accepts connections.
pub async fn start_agent(state_dir: &Path) -> InProcessAgent {
    let port = pick_free_port().expect("pick port");
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().expect("parse addr");
    let args = AgentArgs {
        listen: addr,
        state_dir: state_dir.to_path_buf(),
        rsync_bin: PathBuf::from("rsync"),
        fault_points: String::new(),
    };
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(upgrade_agent::run_agent_with_shutdown(args, async move {
        let _ = rx.await;
        Ok(())
    }));

    let ready = tokio::task::spawn_blocking(move || wait_for_port(addr, IO_TIMEOUT))
        .await
        .expect("join port wait");
    assert!(ready, "agent did not listen on {addr}");
    InProcessAgent {
        addr,
        shutdown: Some(tx),
        task,
    }
}

/// Run the `upgrade-hub` binary against `state_dir` and capture its output.
pub async fn hub(state_dir: &Path, args: &[&str]) -> Output {
    tokio::process::Command::new(env!("CARGO_BIN_EXE_upgrade-hub"))
        .arg("--state-dir")
        .arg(state_dir)
        .args(args)
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .env_remove("UPGRADE_FAULT_POINTS")
        .stdin(Stdio::null())
        .output()
        .await
        .expect("run upgrade-hub")
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// Wait until a TCP connect to `addr` succeeds.
pub fn wait_for_port(addr: SocketAddr, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(addr).is_ok() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

pub fn pick_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Unique per-test scratch directory under the system temp dir.
pub fn test_dir(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let pid = std::process::id();
    std::env::temp_dir()
        .join("upgrade-tests")
        .join(format!("{name}-{pid}-{ts}"))
}

pub fn cleanup_dir(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}
