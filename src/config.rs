use std::path::{Path, PathBuf};

use crate::error::InitError;

pub const PRODUCT: &str = "sandboxd";
pub const DEFAULT_USER: &str = "sandbox";
pub const DEFAULT_AGENT_BIN: &str = "/usr/local/bin/agent";
pub const DEFAULT_DATA_DIR: &str = "/var/lib/sandboxd";

pub const T_PROXY_SECS: u64 = 10;
pub const T_DAEMON_SECS: u64 = 30;
pub const T_SHUTDOWN_SECS: u64 = 10;
pub const T_SHUTDOWN_AUX_SECS: u64 = 5;
pub const FUSE_MOUNT_RETRIES: u32 = 10;

pub const PROXY_BIN: &str = "sandboxd-proxy";
pub const PROXY_API_PORT: u16 = 9080;
pub const CONTAINER_DAEMON_BIN: &str = "containerd-nested";
pub const CONTAINER_DAEMON_SOCKET: &str = "/run/sandboxd/containerd.sock";
pub const MIN_DAEMON_MTU: u32 = 1200;
pub const DAEMON_MTU_MARGIN: u32 = 100;

/// Filesystem backend selected for a session's CoW mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsBackend {
    Overlay,
    Fuse,
}

impl FsBackend {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "overlay" => Some(FsBackend::Overlay),
            "fuse" => Some(FsBackend::Fuse),
            _ => None,
        }
    }
}

/// All externally supplied configuration, collected once at startup and never
/// re-read.
#[derive(Debug, Clone)]
pub struct Config {
    pub session_id: String,
    pub workspace_source: Option<String>,
    pub workspace_commit: Option<String>,
    pub agent_bin: PathBuf,
    pub run_as_user: String,
    pub fs_backend_override: Option<FsBackend>,
    pub cache_disabled: bool,
    pub data_dir: PathBuf,
    pub log_json: bool,
}

/// Fixed, invariant paths derived from `Config`.
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub base_home: PathBuf,
    pub workspace: PathBuf,
    pub staging: PathBuf,
    pub overlay_root: PathBuf,
    pub fuse_root: PathBuf,
    pub mount_home: PathBuf,
    pub workspace_link: PathBuf,
    pub proxy_dir: PathBuf,
    pub cache_volume: PathBuf,
    /// Read-only image home template copied into `base_home` on first boot.
    pub image_home: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, InitError> {
        let session_id = std::env::var("SANDBOXD_SESSION_ID")
            .map_err(|_| InitError::Config("SANDBOXD_SESSION_ID is not set".into()))?;
        if session_id.trim().is_empty() {
            return Err(InitError::Config("SANDBOXD_SESSION_ID is empty".into()));
        }

        let workspace_source = non_empty_env("SANDBOXD_WORKSPACE_SOURCE");
        let workspace_commit = non_empty_env("SANDBOXD_WORKSPACE_COMMIT");
        let agent_bin = non_empty_env("SANDBOXD_AGENT_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_AGENT_BIN));
        let run_as_user = non_empty_env("SANDBOXD_USER").unwrap_or_else(|| DEFAULT_USER.to_string());
        let fs_backend_override = non_empty_env("SANDBOXD_FS_BACKEND")
            .and_then(|s| FsBackend::parse(&s));
        let cache_disabled = non_empty_env("SANDBOXD_CACHE_DISABLED")
            .map(|s| s == "true" || s == "1")
            .unwrap_or(false);
        let data_dir = non_empty_env("SANDBOXD_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let log_json = non_empty_env("SANDBOXD_LOG_FORMAT")
            .map(|s| s == "json")
            .unwrap_or(false);

        Ok(Config {
            session_id,
            workspace_source,
            workspace_commit,
            agent_bin,
            run_as_user,
            fs_backend_override,
            cache_disabled,
            data_dir,
            log_json,
        })
    }

    pub fn paths(&self, home_dir: &Path) -> Paths {
        let user_dir_name = home_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.run_as_user.clone());

        let data_dir = self.data_dir.clone();
        let base_home = data_dir.join(&user_dir_name);
        Paths {
            workspace: base_home.join("workspace"),
            staging: base_home.join("workspace.staging"),
            overlay_root: data_dir.join("overlay"),
            fuse_root: data_dir.join("fuse"),
            mount_home: PathBuf::from("/home").join(&user_dir_name),
            workspace_link: PathBuf::from("/workspace"),
            proxy_dir: data_dir.join("proxy"),
            cache_volume: data_dir.join("cache"),
            image_home: home_dir.to_path_buf(),
            data_dir,
            base_home,
        }
    }
}

impl Paths {
    pub fn session_overlay_dir(&self, session_id: &str) -> PathBuf {
        self.overlay_root.join(session_id)
    }

    pub fn session_fuse_db(&self, session_id: &str) -> PathBuf {
        self.fuse_root.join(format!("{session_id}.db"))
    }

    pub fn migrated_marker(&self, session_id: &str) -> PathBuf {
        self.session_overlay_dir(session_id).join(".migrated")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_backend_parse() {
        assert_eq!(FsBackend::parse("overlay"), Some(FsBackend::Overlay));
        assert_eq!(FsBackend::parse("fuse"), Some(FsBackend::Fuse));
        assert_eq!(FsBackend::parse("btrfs"), None);
    }

    #[test]
    fn paths_derive_from_home_dir() {
        let cfg = Config {
            session_id: "s1".into(),
            workspace_source: None,
            workspace_commit: None,
            agent_bin: PathBuf::from(DEFAULT_AGENT_BIN),
            run_as_user: "sandbox".into(),
            fs_backend_override: None,
            cache_disabled: false,
            data_dir: PathBuf::from("/var/lib/sandboxd"),
            log_json: false,
        };
        let paths = cfg.paths(Path::new("/home/image/sandbox"));
        assert_eq!(paths.base_home, PathBuf::from("/var/lib/sandboxd/sandbox"));
        assert_eq!(paths.workspace, PathBuf::from("/var/lib/sandboxd/sandbox/workspace"));
        assert_eq!(paths.mount_home, PathBuf::from("/home/sandbox"));
        assert_eq!(paths.session_fuse_db("s1"), PathBuf::from("/var/lib/sandboxd/fuse/s1.db"));
    }
}
