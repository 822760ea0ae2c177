//! Outbound HTTP/HTTPS caching proxy.

use std::path::Path;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::config::{Paths, PROXY_API_PORT, PROXY_BIN, T_PROXY_SECS};
use crate::error::InitError;
use crate::pidfd::PidFd;
use crate::platform::{self, SpawnCredentials};
use crate::supervisor::{poll_until_ready, tcp_connect_ready, AuxHandle};
use crate::user::UserRecord;

/// The embedded default proxy configuration. Workspace-supplied config is
/// deliberately never consulted here: it would execute untrusted code before
/// the sandbox exists to contain it.
const DEFAULT_CONFIG_YAML: &str = include_str!("../../assets/proxy-config.default.yaml");

pub struct ProxyHandle {
    pub aux: AuxHandle,
    pub ca_cert_path: std::path::PathBuf,
}

pub async fn start(paths: &Paths, user: &UserRecord, ca_cert_path: &Path) -> Result<ProxyHandle, InitError> {
    platform::ensure_dir_owned(&paths.proxy_dir, user.uid, user.gid)
        .map_err(|e| InitError::stage(&paths.proxy_dir, e))?;
    let certs_dir = paths.proxy_dir.join("certs");
    platform::ensure_dir_owned(&certs_dir, user.uid, user.gid).map_err(|e| InitError::stage(&certs_dir, e))?;

    let config_path = paths.proxy_dir.join("config.yaml");
    std::fs::write(&config_path, DEFAULT_CONFIG_YAML).map_err(|e| InitError::stage(&config_path, e))?;
    set_mode(&config_path, 0o644)?;

    let mut cmd = std::process::Command::new(PROXY_BIN);
    cmd.arg("-config").arg(&config_path);

    let creds = SpawnCredentials {
        uid: user.uid,
        gid: user.gid,
        supplementary_gids: user.supplementary_gids.clone(),
        pdeathsig: Some(Signal::SIGTERM),
        new_process_group: true,
    };

    let child = platform::spawn_with_credentials(cmd, &creds)
        .map_err(|e| InitError::subprocess(PROXY_BIN, e.to_string()))?;
    let pid = Pid::from_raw(child.id() as i32);
    drop(child); // reaped by the pid1 loop's wait_any_nonblocking sweep, not Child::wait

    let pidfd = PidFd::open(pid.as_raw()).map_err(|e| InitError::subprocess(PROXY_BIN, e.to_string()))?;

    let ready = poll_until_ready(Duration::from_secs(T_PROXY_SECS), || tcp_connect_ready(PROXY_API_PORT)).await;
    if !ready {
        let _ = pidfd.send_signal(Signal::SIGKILL);
        return Err(InitError::Readiness { what: "proxy", timeout_secs: T_PROXY_SECS });
    }

    write_profile_dropin(ca_cert_path)?;

    Ok(ProxyHandle {
        aux: AuxHandle { name: "proxy", pid, pidfd },
        ca_cert_path: ca_cert_path.to_path_buf(),
    })
}

fn write_profile_dropin(ca_cert_path: &Path) -> Result<(), InitError> {
    let product = crate::config::PRODUCT;
    let exports = format!(
        "export HTTP_PROXY=http://127.0.0.1:{port}\n\
         export HTTPS_PROXY=http://127.0.0.1:{port}\n\
         export http_proxy=http://127.0.0.1:{port}\n\
         export https_proxy=http://127.0.0.1:{port}\n\
         export ALL_PROXY=http://127.0.0.1:{port}\n\
         export NO_PROXY=localhost,127.0.0.1,::1\n\
         export NODE_EXTRA_CA_CERTS={ca}\n",
        port = PROXY_API_PORT,
        ca = ca_cert_path.display(),
    );

    let dropin_dir = Path::new("/etc/profile.d");
    if dropin_dir.is_dir() {
        let path = dropin_dir.join(format!("{product}-proxy.sh"));
        std::fs::write(&path, exports).map_err(|e| InitError::stage(&path, e))?;
    } else {
        let profile = Path::new("/etc/profile");
        let mut contents = std::fs::read_to_string(profile).unwrap_or_default();
        contents.push('\n');
        contents.push_str(&exports);
        std::fs::write(profile, contents).map_err(|e| InitError::stage(profile, e))?;
    }
    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> Result<(), InitError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| InitError::stage(path, e))
}

/// Proxy environment variables propagated to the agent and, if enabled, the
/// container daemon.
pub fn env_vars(ca_cert_path: &Path) -> Vec<(String, String)> {
    let port = PROXY_API_PORT;
    vec![
        ("HTTP_PROXY".into(), format!("http://127.0.0.1:{port}")),
        ("HTTPS_PROXY".into(), format!("http://127.0.0.1:{port}")),
        ("http_proxy".into(), format!("http://127.0.0.1:{port}")),
        ("https_proxy".into(), format!("http://127.0.0.1:{port}")),
        ("ALL_PROXY".into(), format!("http://127.0.0.1:{port}")),
        ("NO_PROXY".into(), "localhost,127.0.0.1,::1".into()),
        ("NODE_EXTRA_CA_CERTS".into(), ca_cert_path.display().to_string()),
    ]
}
