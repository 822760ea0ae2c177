//! Auxiliary shutdown: SIGTERM, wait up to `T_shutdown_aux`, then
//! SIGKILL. Tolerant of "already exited". Proxy stops after the daemon,
//! since auxiliaries are torn down in LIFO order relative to their start.

use std::time::Duration;

use nix::sys::signal::Signal;

use crate::config::T_SHUTDOWN_AUX_SECS;
use crate::supervisor::AuxHandle;

/// Stop a list of auxiliaries in the order given (callers pass them already
/// reversed from start order, e.g. container-daemon then proxy).
pub async fn stop_all(auxiliaries: Vec<AuxHandle>) {
    for aux in auxiliaries {
        stop_one(aux).await;
    }
}

async fn stop_one(aux: AuxHandle) {
    if aux.pidfd.send_signal(Signal::SIGTERM).is_err() {
        tracing::debug!(name = aux.name, "sigterm failed, already exited");
        return;
    }

    let exited = tokio::time::timeout(Duration::from_secs(T_SHUTDOWN_AUX_SECS), aux.pidfd.wait())
        .await
        .is_ok();

    if !exited {
        tracing::warn!(name = aux.name, "auxiliary did not exit within deadline, sending sigkill");
        let _ = aux.pidfd.send_signal(Signal::SIGKILL);
        let _ = aux.pidfd.wait().await;
    }

    tracing::info!(name = aux.name, pid = aux.pid.as_raw(), "auxiliary stopped");
}
