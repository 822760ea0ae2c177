//! Auxiliary daemon supervision: the caching proxy and the optional
//! nested container daemon. Both are optional-degraded: failure disables the
//! feature but never parks the orchestrator.

pub mod container_daemon;
pub mod proxy;
pub mod shutdown;

use std::time::Duration;

use nix::unistd::Pid;
use tokio::time::{sleep, Instant};

use crate::pidfd::PidFd;

/// A running auxiliary process: its pidfd (for async wait/kill) and raw pid
/// (for the process-group-free single-process kill used on shutdown).
pub struct AuxHandle {
    pub name: &'static str,
    pub pid: Pid,
    pub pidfd: PidFd,
}

/// Poll `probe` every 500ms until it succeeds or `timeout` elapses.
pub async fn poll_until_ready<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(500)).await;
    }
}

pub async fn tcp_connect_ready(port: u16) -> bool {
    tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}
