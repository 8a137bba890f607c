//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timeout for agent startup and shutdown.
pub const IO_TIMEOUT: Duration = Duration::from_secs(20);

/// A spawned agent process and its captured logs.
pub struct AgentProcess {
    pub child: Child,
    pub addr: SocketAddr,
    stderr_path: PathBuf,
    stdout_path: PathBuf,
}

impl AgentProcess {
    /// Best-effort read of the captured stderr log.
    pub fn read_stderr(&self) -> String {
        std::fs::read_to_string(&self.stderr_path).unwrap_or_default()
    }

    pub fn read_stdout(&self) -> String {
        std::fs::read_to_string(&self.stdout_path).unwrap_or_default()
    }

    /// Wait for the process to exit on its own; `None` on timeout.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> Option<std::process::ExitStatus> {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        None
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Spawn `upgrade-agent` on a free local port and wait until it accepts connections.
pub fn spawn_agent(state_dir: &Path, fault_points: &str) -> AgentProcess {
    std::fs::create_dir_all(state_dir).expect("create state dir");
    let port = pick_free_port().expect("pick port");
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().expect("parse addr");
    let stderr_path = state_dir.join("agent.stderr.log");
    let stdout_path = state_dir.join("agent.stdout.log");
    let stderr = std::fs::File::create(&stderr_path).expect("create stderr log");
    let stdout = std::fs::File::create(&stdout_path).expect("create stdout log");

    let child = Command::new(env!("CARGO_BIN_EXE_upgrade-agent"))
        .arg("--listen")
        .arg(addr.to_string())
        .arg("--state-dir")
        .arg(state_dir)
        .env("UPGRADE_FAULT_POINTS", fault_points)
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .expect("spawn upgrade-agent");

    let mut agent = AgentProcess {
        child,
        addr,
        stderr_path,
        stdout_path,
    };
    if !wait_for_port(addr, IO_TIMEOUT) {
        let _ = agent.child.kill();
        panic!(
            "agent did not listen on {addr}\nstdout:\n{}\nstderr:\n{}",
            agent.read_stdout(),
            agent.read_stderr()
        );
    }
    agent
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

/// Pick an available local port by binding to port 0.
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

/// Best-effort cleanup of a test directory.
pub fn cleanup_dir(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}
