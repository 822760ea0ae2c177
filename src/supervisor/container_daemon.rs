//! Optional nested container daemon. Only started when its binary
//! is on `PATH`; failure at any step disables the feature, never parks.

use std::path::Path;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::Serialize;

use crate::config::{Paths, CONTAINER_DAEMON_BIN, CONTAINER_DAEMON_SOCKET, DAEMON_MTU_MARGIN, MIN_DAEMON_MTU, T_DAEMON_SECS};
use crate::error::InitError;
use crate::pidfd::PidFd;
use crate::platform::{self, SpawnCredentials};
use crate::supervisor::{poll_until_ready, AuxHandle};
use crate::user::UserRecord;

#[derive(Serialize)]
struct DaemonConfig<'a> {
    #[serde(rename = "data-root")]
    data_root: String,
    #[serde(rename = "storage-driver")]
    storage_driver: &'a str,
    mtu: u32,
    #[serde(rename = "hosts")]
    sockets: Vec<String>,
}

pub async fn start(
    paths: &Paths,
    user: &UserRecord,
    proxy_env: Option<&[(String, String)]>,
) -> Result<Option<AuxHandle>, InitError> {
    if which(CONTAINER_DAEMON_BIN).is_none() {
        tracing::debug!("container daemon binary not on PATH, skipping");
        return Ok(None);
    }

    let host_mtu = read_host_mtu().unwrap_or(1500);
    let daemon_mtu = host_mtu.saturating_sub(DAEMON_MTU_MARGIN).max(MIN_DAEMON_MTU);

    let data_root = paths.data_dir.join("container-daemon");
    platform::ensure_dir_owned(&data_root, user.uid, user.gid).map_err(|e| InitError::stage(&data_root, e))?;

    let config = DaemonConfig {
        data_root: data_root.to_string_lossy().to_string(),
        storage_driver: "overlay2",
        mtu: daemon_mtu,
        sockets: vec![format!("unix://{CONTAINER_DAEMON_SOCKET}")],
    };
    let config_path = data_root.join("daemon.json");
    let config_json = serde_json::to_string_pretty(&config).map_err(|e| InitError::Config(e.to_string()))?;
    std::fs::write(&config_path, config_json).map_err(|e| InitError::stage(&config_path, e))?;

    if let Some(parent) = Path::new(CONTAINER_DAEMON_SOCKET).parent() {
        platform::ensure_dir_owned(parent, user.uid, user.gid).map_err(|e| InitError::stage(parent, e))?;
    }

    let mut cmd = std::process::Command::new(CONTAINER_DAEMON_BIN);
    cmd.arg("--config-file").arg(&config_path);
    if let Some(proxy_env) = proxy_env {
        for (k, v) in proxy_env {
            cmd.env(k, v);
        }
    }

    let creds = SpawnCredentials {
        uid: user.uid,
        gid: user.gid,
        supplementary_gids: user.supplementary_gids.clone(),
        pdeathsig: Some(Signal::SIGTERM),
        new_process_group: true,
    };

    let child = platform::spawn_with_credentials(cmd, &creds)
        .map_err(|e| InitError::subprocess(CONTAINER_DAEMON_BIN, e.to_string()))?;
    let pid = Pid::from_raw(child.id() as i32);
    drop(child);

    let pidfd = PidFd::open(pid.as_raw()).map_err(|e| InitError::subprocess(CONTAINER_DAEMON_BIN, e.to_string()))?;

    let ready = poll_until_ready(Duration::from_secs(T_DAEMON_SECS), socket_ready).await;
    if !ready {
        let _ = pidfd.send_signal(Signal::SIGKILL);
        return Err(InitError::Readiness { what: "container daemon", timeout_secs: T_DAEMON_SECS });
    }

    set_socket_mode(0o666)?;

    Ok(Some(AuxHandle { name: "container-daemon", pid, pidfd }))
}

async fn socket_ready() -> bool {
    let path = Path::new(CONTAINER_DAEMON_SOCKET);
    let Ok(meta) = tokio::fs::symlink_metadata(path).await else { return false };
    if !is_socket(&meta) {
        return false;
    }
    tokio::net::UnixStream::connect(path).await.is_ok()
}

#[cfg(unix)]
fn is_socket(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_socket()
}

fn set_socket_mode(mode: u32) -> Result<(), InitError> {
    use std::os::unix::fs::PermissionsExt;
    let path = Path::new(CONTAINER_DAEMON_SOCKET);
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| InitError::stage(path, e))
}

fn which(program: &str) -> Option<std::path::PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn read_host_mtu() -> Option<u32> {
    for iface_entry in std::fs::read_dir("/sys/class/net").ok()? {
        let iface_entry = iface_entry.ok()?;
        let name = iface_entry.file_name();
        if name == "lo" {
            continue;
        }
        let mtu_path = iface_entry.path().join("mtu");
        if let Ok(raw) = std::fs::read_to_string(&mtu_path) {
            if let Ok(mtu) = raw.trim().parse::<u32>() {
                return Some(mtu);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_never_drops_below_floor() {
        let daemon_mtu = 1250u32.saturating_sub(DAEMON_MTU_MARGIN).max(MIN_DAEMON_MTU);
        assert_eq!(daemon_mtu, MIN_DAEMON_MTU);
    }

    #[test]
    fn mtu_subtracts_margin_above_floor() {
        let daemon_mtu = 1500u32.saturating_sub(DAEMON_MTU_MARGIN).max(MIN_DAEMON_MTU);
        assert_eq!(daemon_mtu, 1400);
    }
}
